//! Transaction manager and transaction handles.
//!
//! A transaction is always entered through [`TransactionManager::with_read_only_transaction`]
//! or [`TransactionManager::with_read_write_transaction`], never constructed
//! directly by callers. Both install the active transaction into a
//! `tokio::task_local!` slot for the duration of the block, so nested code
//! (repositories, property lazy-resolvers) reaches it via
//! [`current_transaction`] without having it threaded through every call.
//!
//! The manager is generic over the adapter's handle type `H` rather than
//! over a `dyn TransactionalDatabase` object: async trait methods are not
//! object-safe without boxing every call, and this crate has exactly one
//! storage adapter active per `TransactionManager` instance, so static
//! dispatch costs nothing and keeps the ambient slot's downcast safe and
//! cheap (one `TypeId` compare per lookup, same discipline as
//! [`crate::events`]'s registry keys).

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::error::{PersistenceError, Result};
use crate::events::{DomainEvent, EventSubscriptionManager};
use crate::storage::{Storage, TransactionalDatabase};

tokio::task_local! {
    static CURRENT_TX: Arc<dyn Any + Send + Sync>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Open,
    Committed,
    RolledBack,
    Released,
}

/// A read-only transaction. Exposes the adapter handle for repository
/// reads; `commit`/`rollback` are both legal (a read-only transaction
/// "commits" trivially) but mutating the handle through it is an
/// adapter-level misuse, not something the core can prevent statically.
pub struct ReadOnlyTransaction<H: TransactionalDatabase> {
    handle: Arc<H>,
    state: AsyncMutex<TxState>,
}

impl<H: TransactionalDatabase> ReadOnlyTransaction<H> {
    /// The underlying adapter handle.
    pub fn handle(&self) -> &Arc<H> {
        &self.handle
    }

    /// Finalize with no changes expected. Idempotent with `rollback`/`release`.
    pub async fn commit(&self) -> Result<()> {
        self.finish(TxState::Committed, |h| h.commit()).await
    }

    /// Discard. Idempotent with `commit`/`release`.
    pub async fn rollback(&self) -> Result<()> {
        self.finish(TxState::RolledBack, |h| h.rollback()).await
    }

    /// Release any resources without committing or rolling back
    /// explicitly. Idempotent.
    pub async fn release(&self) -> Result<()> {
        self.finish(TxState::Released, |h| h.release()).await
    }

    async fn finish<F, Fut>(&self, target: TxState, op: F) -> Result<()>
    where
        F: FnOnce(&Arc<H>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut state = self.state.lock().await;
        if *state != TxState::Open {
            return Ok(());
        }
        op(&self.handle).await?;
        *state = target;
        Ok(())
    }
}

/// A read-write transaction. In addition to the adapter handle, carries
/// the event subscription manager so domain code can call
/// [`ReadWriteTransaction::notify`] — events are published only from
/// within a read-write transaction.
pub struct ReadWriteTransaction<H: TransactionalDatabase> {
    handle: Arc<H>,
    state: AsyncMutex<TxState>,
    events: Arc<EventSubscriptionManager<H>>,
}

impl<H: TransactionalDatabase> ReadWriteTransaction<H> {
    /// The underlying adapter handle.
    pub fn handle(&self) -> &Arc<H> {
        &self.handle
    }

    /// Commit accumulated changes.
    pub async fn commit(&self) -> Result<()> {
        self.finish(TxState::Committed, |h| h.commit()).await
    }

    /// Discard accumulated changes.
    pub async fn rollback(&self) -> Result<()> {
        self.finish(TxState::RolledBack, |h| h.rollback()).await
    }

    /// Release without an explicit commit/rollback.
    pub async fn release(&self) -> Result<()> {
        self.finish(TxState::Released, |h| h.release()).await
    }

    /// Publish a domain event to every matching subscriber, sequentially,
    /// within this transaction. Takes `self` as an `Arc` (a stable
    /// receiver on top of the built-in smart pointers) since listener
    /// dispatch needs an owned, `'static` handle to the transaction —
    /// see [`crate::events::Listener`].
    pub async fn notify<E: DomainEvent + 'static>(self: &Arc<Self>, event: E) -> Result<()> {
        self.events.publish(&event, self).await
    }

    async fn finish<F, Fut>(&self, target: TxState, op: F) -> Result<()>
    where
        F: FnOnce(&Arc<H>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut state = self.state.lock().await;
        if *state != TxState::Open {
            return Ok(());
        }
        op(&self.handle).await?;
        *state = target;
        Ok(())
    }
}

/// The ambient transaction, type-erased in the task-local slot as
/// `Arc<dyn Any + Send + Sync>` and recovered via a safe
/// `downcast::<AmbientTx<H>>()` back to the adapter's concrete handle
/// type.
enum AmbientTx<H: TransactionalDatabase> {
    ReadOnly(Arc<ReadOnlyTransaction<H>>),
    ReadWrite(Arc<ReadWriteTransaction<H>>),
}

/// Mints and runs transactions against a single storage adapter `S`.
pub struct TransactionManager<S: Storage> {
    storage: Arc<S>,
    events: Arc<EventSubscriptionManager<S::Handle>>,
}

impl<S: Storage> TransactionManager<S> {
    /// Build a manager over `storage`, dispatching published events
    /// through `events`.
    pub fn new(storage: Arc<S>, events: Arc<EventSubscriptionManager<S::Handle>>) -> Self {
        TransactionManager { storage, events }
    }

    /// Mint a fresh read-only transaction without installing it as ambient.
    pub async fn new_read_only_transaction(&self) -> Result<Arc<ReadOnlyTransaction<S::Handle>>> {
        let handle = Arc::new(S::get_transactional_database(&self.storage).await?);
        Ok(Arc::new(ReadOnlyTransaction {
            handle,
            state: AsyncMutex::new(TxState::Open),
        }))
    }

    /// Mint a fresh read-write transaction without installing it as ambient.
    pub async fn new_read_write_transaction(&self) -> Result<Arc<ReadWriteTransaction<S::Handle>>> {
        let handle = Arc::new(S::get_transactional_database(&self.storage).await?);
        Ok(Arc::new(ReadWriteTransaction {
            handle,
            state: AsyncMutex::new(TxState::Open),
            events: self.events.clone(),
        }))
    }

    /// Run `block` with a fresh read-only transaction installed as
    /// ambient. Commits on success, rolls back if `block` returns an
    /// error, always releases. Fails with [`PersistenceError::ConcurrentTransaction`]
    /// if a transaction is already ambient on this task: nesting is
    /// rejected outright, never merged into the outer transaction.
    pub async fn with_read_only_transaction<F, Fut, T>(&self, block: F) -> Result<T>
    where
        F: FnOnce(Arc<ReadOnlyTransaction<S::Handle>>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if CURRENT_TX.try_with(|_| ()).is_ok() {
            return Err(PersistenceError::ConcurrentTransaction);
        }
        let tx = self.new_read_only_transaction().await?;
        log::debug!("read-only transaction opened");
        let ambient: Arc<dyn Any + Send + Sync> = Arc::new(AmbientTx::ReadOnly(tx.clone()));
        let result = CURRENT_TX.scope(ambient, block(tx.clone())).await;
        match &result {
            Ok(_) => tx.commit().await?,
            Err(_) => tx.rollback().await?,
        }
        if let Err(e) = tx.release().await {
            log::warn!("read-only transaction release failed, suppressing: {e}");
        }
        result
    }

    /// Run `block` with a fresh read-write transaction installed as
    /// ambient, retrying up to `retries` additional times on top of the
    /// first attempt — `block` signals `TransactionRetry` to ask for a
    /// fresh attempt. Each attempt gets its own transaction; a prior
    /// attempt's transaction is always rolled back and released before
    /// the next one begins. Once the retry budget is exhausted, the
    /// `TransactionRetry` wrapper is unwrapped and its `cause` is
    /// returned to the caller directly, rather than the wrapper itself.
    pub async fn with_read_write_transaction<F, Fut, T>(&self, retries: u32, block: F) -> Result<T>
    where
        F: Fn(Arc<ReadWriteTransaction<S::Handle>>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if CURRENT_TX.try_with(|_| ()).is_ok() {
            return Err(PersistenceError::ConcurrentTransaction);
        }

        let mut attempts_left = retries + 1;
        loop {
            attempts_left -= 1;
            let tx = self.new_read_write_transaction().await?;
            log::debug!("read-write transaction opened, {attempts_left} attempt(s) left");
            let ambient: Arc<dyn Any + Send + Sync> = Arc::new(AmbientTx::ReadWrite(tx.clone()));
            let result = CURRENT_TX.scope(ambient, block(tx.clone())).await;
            match result {
                Ok(value) => {
                    tx.commit().await?;
                    if let Err(e) = tx.release().await {
                        log::warn!("read-write transaction release failed, suppressing: {e}");
                    }
                    return Ok(value);
                }
                Err(PersistenceError::TransactionRetry(_)) if attempts_left > 0 => {
                    log::debug!("transaction retry requested, rolling back and retrying");
                    tx.rollback().await?;
                    if let Err(e) = tx.release().await {
                        log::warn!("read-write transaction release failed, suppressing: {e}");
                    }
                    continue;
                }
                Err(PersistenceError::TransactionRetry(cause)) => {
                    log::debug!("transaction retry budget exhausted, re-raising cause");
                    tx.rollback().await?;
                    if let Err(e) = tx.release().await {
                        log::warn!("read-write transaction release failed, suppressing: {e}");
                    }
                    return Err(*cause);
                }
                Err(e) => {
                    tx.rollback().await?;
                    if let Err(e) = tx.release().await {
                        log::warn!("read-write transaction release failed, suppressing: {e}");
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Fetch the ambient transaction, read-only or read-write, failing with
/// [`PersistenceError::CurrentTransactionUnavailable`] if none is active
/// on this task.
pub fn current_transaction<H: TransactionalDatabase>() -> Result<CurrentTx<H>> {
    CURRENT_TX
        .try_with(|ambient| {
            ambient
                .clone()
                .downcast::<AmbientTx<H>>()
                .ok()
                .map(|ambient| match &*ambient {
                    AmbientTx::ReadOnly(tx) => CurrentTx::ReadOnly(tx.clone()),
                    AmbientTx::ReadWrite(tx) => CurrentTx::ReadWrite(tx.clone()),
                })
        })
        .ok()
        .flatten()
        .ok_or(PersistenceError::CurrentTransactionUnavailable)
}

/// Run `block` with the ambient read-write transaction, failing with
/// [`PersistenceError::ReadWriteTransactionRequired`] if the ambient
/// transaction is read-only: mutating operations require a read-write
/// transaction to be ambient.
pub async fn with_current_read_write_transaction<H, F, Fut, T>(block: F) -> Result<T>
where
    H: TransactionalDatabase,
    F: FnOnce(Arc<ReadWriteTransaction<H>>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match current_transaction::<H>()? {
        CurrentTx::ReadWrite(tx) => block(tx).await,
        CurrentTx::ReadOnly(_) => Err(PersistenceError::ReadWriteTransactionRequired),
    }
}

/// The ambient transaction as observed by callers — either variant may be
/// active, and callers that only need to read dispatch on either.
pub enum CurrentTx<H: TransactionalDatabase> {
    ReadOnly(Arc<ReadOnlyTransaction<H>>),
    ReadWrite(Arc<ReadWriteTransaction<H>>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Clone, Default)]
    struct State(i32);

    fn manager() -> TransactionManager<MemoryStorage<State>> {
        let storage = Arc::new(MemoryStorage::<State>::new());
        let events = Arc::new(EventSubscriptionManager::new());
        TransactionManager::new(storage, events)
    }

    #[tokio::test]
    async fn read_write_commits_and_publishes_snapshot() {
        let mgr = manager();
        mgr.with_read_write_transaction(0, |tx| async move {
            tx.handle().update(|s| State(s.0 + 1));
            Ok(())
        })
        .await
        .unwrap();

        let ro = mgr.new_read_only_transaction().await.unwrap();
        assert_eq!(ro.handle().read().0, 1);
    }

    #[tokio::test]
    async fn read_write_rolls_back_on_error() {
        let mgr = manager();
        let outcome: Result<()> = mgr
            .with_read_write_transaction(0, |tx| async move {
                tx.handle().update(|s| State(s.0 + 1));
                Err(PersistenceError::Other(anyhow::anyhow!("boom")))
            })
            .await;
        assert!(outcome.is_err());

        let ro = mgr.new_read_only_transaction().await.unwrap();
        assert_eq!(ro.handle().read().0, 0);
    }

    #[tokio::test]
    async fn retries_on_transaction_retry_until_success() {
        let mgr = manager();
        let attempt = Arc::new(AtomicU32::new(0));
        let attempt2 = attempt.clone();

        mgr.with_read_write_transaction(3, move |tx| {
            let attempt = attempt2.clone();
            async move {
                let n = attempt.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    return Err(PersistenceError::TransactionRetry(Box::new(
                        PersistenceError::Other(anyhow::anyhow!("try again")),
                    )));
                }
                tx.handle().update(|s| State(s.0 + 1));
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(attempt.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retry_budget_reraises_the_unwrapped_cause() {
        let mgr = manager();
        let outcome: Result<()> = mgr
            .with_read_write_transaction(1, |_tx| async {
                Err(PersistenceError::TransactionRetry(Box::new(
                    PersistenceError::Other(anyhow::anyhow!("still broken")),
                )))
            })
            .await;
        match outcome {
            Err(PersistenceError::Other(e)) => assert_eq!(e.to_string(), "still broken"),
            other => panic!("expected the unwrapped cause, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn nested_transaction_is_rejected() {
        let mgr = Arc::new(manager());
        let inner_mgr = mgr.clone();
        let outcome = mgr
            .with_read_write_transaction(0, move |_tx| {
                let inner_mgr = inner_mgr.clone();
                async move {
                    let nested = inner_mgr.with_read_write_transaction(0, |_tx| async { Ok(()) }).await;
                    assert!(matches!(nested, Err(PersistenceError::ConcurrentTransaction)));
                    Ok(())
                }
            })
            .await;
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn current_transaction_unavailable_outside_any_scope() {
        let result = current_transaction::<crate::storage::memory::MemoryHandle<State>>();
        assert!(matches!(
            result,
            Err(PersistenceError::CurrentTransactionUnavailable)
        ));
    }
}
