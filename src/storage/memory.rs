//! The in-memory storage adapter.
//!
//! `MemoryStorage<T>` holds the latest committed snapshot of type `T`
//! behind an [`ArcSwap`], and a single `tokio::sync::Mutex<()>` that both
//! read-only and read-write transactions acquire before returning, giving
//! single-writer/single-reader, linearizable semantics trivially. `T` is
//! typically a typed container of aggregate-root snapshots keyed by
//! external identity, plus association sets; the core places no
//! constraint on its shape beyond `Clone + Default`.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::Result;
use crate::storage::{Storage, TransactionalDatabase};

/// An in-memory, copy-on-write database. Mutation produces a new
/// snapshot; commit atomically replaces the current one.
pub struct MemoryStorage<T: Clone + Send + Sync + Default + 'static> {
    lock: Arc<Mutex<()>>,
    current: ArcSwap<T>,
}

impl<T: Clone + Send + Sync + Default + 'static> Default for MemoryStorage<T> {
    fn default() -> Self {
        MemoryStorage {
            lock: Arc::new(Mutex::new(())),
            current: ArcSwap::from_pointee(T::default()),
        }
    }
}

impl<T: Clone + Send + Sync + Default + 'static> MemoryStorage<T> {
    /// Create a storage backed by an empty/default snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current committed snapshot.
    pub fn current_database(&self) -> Arc<T> {
        self.current.load_full()
    }

    /// Take the storage mutex and replace the current snapshot with a
    /// fresh, empty one.
    pub async fn reset(&self) {
        let _guard = self.lock.clone().lock_owned().await;
        self.current.store(Arc::new(T::default()));
    }
}

#[allow(async_fn_in_trait)]
impl<T: Clone + Send + Sync + Default + 'static> Storage for MemoryStorage<T> {
    type Handle = MemoryHandle<T>;

    async fn get_transactional_database(storage: &Arc<Self>) -> Result<Self::Handle> {
        let guard = storage.lock.clone().lock_owned().await;
        Ok(MemoryHandle {
            storage: storage.clone(),
            snapshot: ArcSwap::new(storage.current_database()),
            guard: parking_lot::Mutex::new(Some(guard)),
        })
    }
}

/// The transaction handle minted by [`MemoryStorage`]. Holds a
/// transaction-local working copy of the snapshot (mutated via
/// [`MemoryHandle::update`]) and the storage mutex, released on
/// commit/rollback/release.
pub struct MemoryHandle<T: Clone + Send + Sync + Default + 'static> {
    storage: Arc<MemoryStorage<T>>,
    snapshot: ArcSwap<T>,
    guard: parking_lot::Mutex<Option<OwnedMutexGuard<()>>>,
}

impl<T: Clone + Send + Sync + Default + 'static> MemoryHandle<T> {
    /// Read the transaction-local snapshot.
    pub fn read(&self) -> Arc<T> {
        self.snapshot.load_full()
    }

    /// Apply a copy-on-write update to the transaction-local snapshot:
    /// the closure maps the current snapshot to the next one, and the
    /// result replaces it atomically.
    pub fn update(&self, f: impl Fn(&T) -> T) {
        self.snapshot.rcu(|cur| f(cur));
    }
}

#[allow(async_fn_in_trait)]
impl<T: Clone + Send + Sync + Default + 'static> TransactionalDatabase for MemoryHandle<T> {
    async fn commit(&self) -> Result<()> {
        let final_snapshot = self.snapshot.load_full();
        self.storage.current.store(final_snapshot);
        log::debug!("in-memory snapshot committed");
        self.release().await
    }

    async fn rollback(&self) -> Result<()> {
        self.release().await
    }

    async fn release(&self) -> Result<()> {
        // Dropping the guard releases the mutex; setting the slot to
        // `None` again on a second call is a harmless no-op, making this
        // idempotent.
        self.guard.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default, PartialEq, Debug)]
    struct Counter(i32);

    #[tokio::test]
    async fn commit_publishes_snapshot() {
        let storage = Arc::new(MemoryStorage::<Counter>::new());
        let handle = MemoryStorage::get_transactional_database(&storage).await.unwrap();
        handle.update(|c| Counter(c.0 + 1));
        handle.commit().await.unwrap();
        assert_eq!(*storage.current_database(), Counter(1));
    }

    #[tokio::test]
    async fn rollback_discards_snapshot() {
        let storage = Arc::new(MemoryStorage::<Counter>::new());
        let handle = MemoryStorage::get_transactional_database(&storage).await.unwrap();
        handle.update(|c| Counter(c.0 + 1));
        handle.rollback().await.unwrap();
        assert_eq!(*storage.current_database(), Counter(0));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let storage = Arc::new(MemoryStorage::<Counter>::new());
        let handle = MemoryStorage::get_transactional_database(&storage).await.unwrap();
        handle.release().await.unwrap();
        handle.release().await.unwrap();
    }

    #[tokio::test]
    async fn serializes_transactions_via_the_mutex() {
        let storage = Arc::new(MemoryStorage::<Counter>::new());
        let first = MemoryStorage::get_transactional_database(&storage).await.unwrap();
        first.update(|c| Counter(c.0 + 1));

        let storage2 = storage.clone();
        let waiter = tokio::spawn(async move {
            let second = MemoryStorage::get_transactional_database(&storage2).await.unwrap();
            second.read().0
        });

        tokio::task::yield_now().await;
        first.commit().await.unwrap();
        let observed = waiter.await.unwrap();
        assert_eq!(observed, 1);
    }
}
