//! The typed in-process event bus.
//!
//! The registry uses the same copy-on-swap, CAS-on-immutable-collection
//! discipline as [`crate::props`] — an [`ArcSwap`] over an `im::HashMap`
//! keyed by event-type identity, with insertion-order-preserving listener
//! lists. `publish` snapshots the registry once at entry (via `load_full`)
//! and dispatches from that snapshot, so a `subscribe` racing with an
//! in-flight `publish` never perturbs it.

use std::any::{Any, TypeId};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use arc_swap::ArcSwap;
use smallvec::SmallVec;

use crate::error::Result;
use crate::storage::TransactionalDatabase;
use crate::tx::ReadWriteTransaction;

/// Implemented by domain event types so the subscription manager can
/// dispatch by type identity and by declared supertype. Each event type
/// declares an explicit `parents()` list at registration, standing in for
/// a runtime class hierarchy this language has no equivalent of.
pub trait DomainEvent: Any + Send + Sync {
    /// The (possibly empty) list of supertypes this event type declares.
    /// A listener registered for any type in this transitive closure (or
    /// for `Self` itself) receives instances of `Self`.
    fn parents() -> &'static [TypeId]
    where
        Self: Sized,
    {
        &[]
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// A subscribed handler: the event type it consumes (used as the registry
/// key and for reference-identity subscribe/unsubscribe) plus a suspending
/// handler function. Generic over the storage adapter's handle type `H`
/// so the handler can reach `tx.handle()` with its concrete type intact.
///
/// The transaction is handed to the handler as an owned `Arc`, not a
/// borrow: a borrowed `&ReadWriteTransaction<H>` would tie the handler's
/// returned future to the borrow's lifetime, which can't be reconciled
/// with the `'static` bound a boxed trait object needs without a
/// higher-ranked signature. Cloning the `Arc` each dispatch is cheap and
/// keeps the handler type ordinary.
pub struct Listener<H: TransactionalDatabase> {
    event_type: TypeId,
    handler: Arc<dyn Fn(&(dyn Any + Send + Sync), Arc<ReadWriteTransaction<H>>) -> HandlerFuture + Send + Sync>,
}

impl<H: TransactionalDatabase> Listener<H> {
    /// Build a listener for the concrete event type `E`.
    pub fn new<E, F, Fut>(handler: F) -> Arc<Listener<H>>
    where
        E: DomainEvent + 'static,
        F: Fn(&E, Arc<ReadWriteTransaction<H>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Arc::new(Listener {
            event_type: TypeId::of::<E>(),
            handler: Arc::new(move |event, tx| {
                let event = event
                    .downcast_ref::<E>()
                    .expect("event type tag matched registry key but downcast failed");
                Box::pin(handler(event, tx))
            }),
        })
    }
}

/// Keyed by `TypeId`, which is already a hash; `FxHasher` skips the extra
/// avalanche `RandomState`'s SipHash does for a key that needs none of its
/// DoS resistance.
type Registry<H> = im::HashMap<
    TypeId,
    im::Vector<Arc<Listener<H>>>,
    std::hash::BuildHasherDefault<rustc_hash::FxHasher>,
>;

/// Type-indexed registry of listeners.
pub struct EventSubscriptionManager<H: TransactionalDatabase> {
    // Keyed by the *declared* event type of each listener. A listener
    // subscribed under `Base` is reached by publishing any event whose
    // `parents()` transitive closure includes `Base`.
    registry: ArcSwap<Registry<H>>,
    _handle: PhantomData<fn() -> H>,
}

impl<H: TransactionalDatabase> Default for EventSubscriptionManager<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: TransactionalDatabase> EventSubscriptionManager<H> {
    /// Create an empty registry.
    pub fn new() -> Self {
        EventSubscriptionManager {
            registry: ArcSwap::from_pointee(Registry::default()),
            _handle: PhantomData,
        }
    }

    /// `subscribe(listener)` — duplicates permitted, insertion order
    /// preserved.
    pub fn subscribe(&self, listener: Arc<Listener<H>>) {
        self.registry.rcu(|map| {
            let mut next = (**map).clone();
            next.entry(listener.event_type)
                .or_insert_with(im::Vector::new)
                .push_back(listener.clone());
            next
        });
    }

    /// `unsubscribe(listener)` — removes all entries referring to that
    /// listener by reference identity (`Arc::ptr_eq`), not value equality.
    pub fn unsubscribe(&self, listener: &Arc<Listener<H>>) {
        self.registry.rcu(|map| {
            let mut next = (**map).clone();
            if let Some(list) = next.get(&listener.event_type) {
                let filtered: im::Vector<Arc<Listener<H>>> = list
                    .iter()
                    .filter(|l| !Arc::ptr_eq(l, listener))
                    .cloned()
                    .collect();
                next.insert(listener.event_type, filtered);
            }
            next
        });
    }

    /// `unsubscribeAll()` — clear the registry.
    pub fn unsubscribe_all(&self) {
        self.registry.store(Arc::new(Registry::default()));
    }

    /// `isSubscribed(listener)` — reference-identity lookup.
    pub fn is_subscribed(&self, listener: &Arc<Listener<H>>) -> bool {
        self.registry
            .load()
            .get(&listener.event_type)
            .map(|list| list.iter().any(|l| Arc::ptr_eq(l, listener)))
            .unwrap_or(false)
    }

    /// `publish(event, eventType, tx)` — dispatch to every listener whose
    /// declared type is `E` or a declared parent of `E`, sequentially, in
    /// insertion order, inside `tx`. A listener raising propagates out of
    /// `publish` immediately (remaining listeners for this `publish` do not
    /// run). No listener runs more than once even if it matches through
    /// more than one path into the parent closure.
    pub async fn publish<E>(&self, event: &E, tx: &Arc<ReadWriteTransaction<H>>) -> Result<()>
    where
        E: DomainEvent + 'static,
    {
        let snapshot = self.registry.load_full();

        let mut keys: Vec<TypeId> = E::parents().to_vec();
        keys.push(TypeId::of::<E>());
        keys.dedup();

        // Most events reach only their own listeners plus a handful of
        // supertypes, so this rarely spills to the heap.
        let mut dispatched: SmallVec<[*const Listener<H>; 8]> = SmallVec::new();
        for key in keys {
            let Some(list) = snapshot.get(&key) else {
                continue;
            };
            for listener in list.iter() {
                let ptr = Arc::as_ptr(listener);
                if dispatched.contains(&ptr) {
                    continue;
                }
                dispatched.push(ptr);
                log::trace!(
                    "dispatching {} to a listener registered for {:?}",
                    std::any::type_name::<E>(),
                    key,
                );
                (listener.handler)(event, tx.clone()).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::tx::TransactionManager;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Base;
    impl DomainEvent for Base {}

    struct Derived;
    impl DomainEvent for Derived {
        fn parents() -> &'static [TypeId] {
            static PARENTS: std::sync::OnceLock<[TypeId; 1]> = std::sync::OnceLock::new();
            PARENTS.get_or_init(|| [TypeId::of::<Base>()])
        }
    }

    type TestHandle = crate::storage::memory::MemoryHandle<()>;

    async fn make_tx() -> (
        Arc<MemoryStorage<()>>,
        Arc<ReadWriteTransaction<TestHandle>>,
    ) {
        let storage = Arc::new(MemoryStorage::<()>::new());
        let subs = Arc::new(EventSubscriptionManager::new());
        let manager = TransactionManager::new(storage.clone(), subs);
        let tx = manager.new_read_write_transaction().await.unwrap();
        (storage, tx)
    }

    #[tokio::test]
    async fn reference_identity_subscribe_unsubscribe() {
        let mgr = EventSubscriptionManager::<TestHandle>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let listener = Listener::new::<Base, _, _>(move |_e: &Base, _tx| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        mgr.subscribe(listener.clone());
        assert!(mgr.is_subscribed(&listener));

        mgr.unsubscribe(&listener);
        assert!(!mgr.is_subscribed(&listener));
    }

    #[tokio::test]
    async fn supertype_dispatch_and_sequential_order() {
        let mgr = EventSubscriptionManager::<TestHandle>::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let o1 = order.clone();
        let base_listener = Listener::new::<Base, _, _>(move |_e: &Base, _tx| {
            let o1 = o1.clone();
            async move {
                o1.lock().push("base");
                Ok(())
            }
        });
        mgr.subscribe(base_listener);

        let (_storage, tx) = make_tx().await;
        mgr.publish(&Derived, &tx).await.unwrap();
        assert_eq!(*order.lock(), vec!["base"]);
    }
}
