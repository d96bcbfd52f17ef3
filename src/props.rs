//! Persistent, per-property lazy containers.
//!
//! A [`PersistentProperties`] is a mapping from property name to a
//! [`PropertyCell`], each of which is either a directly known scalar, an
//! unresolved lazy computation, or a memoized value paired with the
//! computation that produced it. Writes replace the whole map atomically
//! via [`arc_swap::ArcSwap::rcu`], which retries the compare-and-swap
//! indefinitely on contention, the same lock-free discipline used
//! elsewhere in this crate for revision-style counters.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::debug::{DebugEntry, DebugSnapshotValue};
use crate::error::{PersistenceError, Result};

/// A boxed, type-erased future yielding a type-erased, typed value.
type LazyFuture = Pin<Box<dyn Future<Output = Result<TypedValue>> + Send>>;

/// An opaque suspending nullary closure. A bound method reference becomes
/// a closure that captures its receiver, so both unify into this one
/// shape.
type LazyFn = Arc<dyn Fn() -> LazyFuture + Send + Sync>;

/// A value together with enough type information to check reads against
/// it and to render it for [`PersistentProperties::debug_snapshot`].
#[derive(Clone)]
pub struct TypedValue {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
    debug: Arc<dyn Fn() -> DebugEntry + Send + Sync>,
}

impl TypedValue {
    /// Erase `value`'s type, retaining enough to type-check reads and
    /// render debug dumps.
    pub fn new<T>(value: T) -> Self
    where
        T: Any + Send + Sync + Clone + DebugSnapshotValue,
    {
        let for_debug = value.clone();
        TypedValue {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
            debug: Arc::new(move || for_debug.debug_entry()),
        }
    }

    fn downcast<T>(&self, name: &str, lazy: bool) -> Result<T>
    where
        T: Any + Clone,
    {
        match self.value.downcast_ref::<T>() {
            Some(v) => Ok(v.clone()),
            None if lazy => Err(PersistenceError::unexpected_lazy_type(
                name,
                std::any::type_name::<T>(),
                self.type_name,
            )),
            None => Err(PersistenceError::unexpected_type(
                name,
                std::any::type_name::<T>(),
                self.type_name,
            )),
        }
    }

    fn debug_entry(&self) -> DebugEntry {
        (self.debug)()
    }
}

/// A cell's shape never changes once established: `reset` on a
/// `Memoized` cell yields `Unresolved` with the same closure, and `reset`
/// on the other two variants is a no-op.
#[derive(Clone)]
enum PropertyCell {
    Resolved(TypedValue),
    Unresolved(LazyFn),
    Memoized(LazyFn, TypedValue),
}

/// Property lookups are keyed by name on every read and write, so the map
/// uses a fast non-cryptographic hasher rather than the default
/// `RandomState`.
type CellMap = im::HashMap<String, PropertyCell, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;

/// A mutable, thread-safe, per-aggregate bag of properties, each either
/// an eagerly known scalar or a lazily computed, memoized value.
pub struct PersistentProperties {
    cells: ArcSwap<CellMap>,
    order: ArcSwap<im::Vector<String>>,
}

impl Default for PersistentProperties {
    fn default() -> Self {
        PersistentProperties {
            cells: ArcSwap::from_pointee(CellMap::default()),
            order: ArcSwap::from_pointee(im::Vector::new()),
        }
    }
}

impl PersistentProperties {
    /// Create an empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// `set(name, value)` — write-replace the cell as `Resolved(value)`.
    pub fn set<T>(&self, name: impl Into<String>, value: T)
    where
        T: Any + Send + Sync + Clone + DebugSnapshotValue,
    {
        let cell = PropertyCell::Resolved(TypedValue::new(value));
        self.replace_cell(name.into(), Some(cell));
    }

    /// `setLazy(name, f)` — write-replace the cell as `Unresolved(f)`.
    ///
    /// `f` must be side-effect-free with respect to the property it
    /// produces: two concurrent first-reads may both invoke it before
    /// either result is memoized, since resolution never holds a lock
    /// across the `.await`.
    pub fn set_lazy<T, F, Fut>(&self, name: impl Into<String>, f: F)
    where
        T: Any + Send + Sync + Clone + DebugSnapshotValue,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let lazy: LazyFn = Arc::new(move || {
            let fut = f();
            Box::pin(async move { fut.await.map(TypedValue::new) }) as LazyFuture
        });
        self.replace_cell(name.into(), Some(PropertyCell::Unresolved(lazy)));
    }

    /// `remove(name)` — delete the entry.
    pub fn remove(&self, name: &str) {
        self.replace_cell(name.to_string(), None);
    }

    /// `get(name, T)` — return the value if the cell is `Resolved` and of
    /// type `T`; any other shape (missing, `Unresolved`, `Memoized`) is an
    /// error. A lazy cell is reported as a type mismatch against the
    /// sentinel type name `<lazy>`, since `get` never resolves lazily (use
    /// [`PersistentProperties::get_lazy`] for that).
    pub fn get<T>(&self, name: &str) -> Result<T>
    where
        T: Any + Clone,
    {
        match self.load_cell(name) {
            None => Err(PersistenceError::NoSuchProperty(name.to_string())),
            Some(PropertyCell::Resolved(tv)) => tv.downcast::<T>(name, false),
            Some(PropertyCell::Unresolved(_)) | Some(PropertyCell::Memoized(..)) => {
                Err(PersistenceError::unexpected_type(
                    name,
                    std::any::type_name::<T>(),
                    "<lazy>",
                ))
            }
        }
    }

    /// `getLazy(name, T)` — resolve through the cell's state machine (an
    /// `Unresolved` cell invokes and memoizes; a `Memoized` cell returns
    /// its cached value unless a forced refresh is active), then
    /// type-check.
    pub async fn get_lazy<T>(&self, name: &str) -> Result<T>
    where
        T: Any + Send + Sync + Clone + DebugSnapshotValue,
    {
        loop {
            match self.load_cell(name) {
                None => return Err(PersistenceError::NoSuchProperty(name.to_string())),

                Some(PropertyCell::Resolved(tv)) => return tv.downcast::<T>(name, false),

                Some(PropertyCell::Memoized(f, tv)) => {
                    if crate::lazy_refresh::is_lazy_refresh_active() {
                        let reset = f.clone();
                        self.replace_cell(name.to_string(), Some(PropertyCell::Unresolved(reset)));
                        continue;
                    }
                    return tv.downcast::<T>(name, true);
                }

                Some(PropertyCell::Unresolved(f)) => {
                    let tv = f().await?;
                    self.replace_cell(
                        name.to_string(),
                        Some(PropertyCell::Memoized(f.clone(), tv.clone())),
                    );
                    return tv.downcast::<T>(name, true);
                }
            }
        }
    }

    /// `resetLazy(name)` — `Memoized(f,_) → Unresolved(f)`; otherwise a
    /// no-op.
    pub fn reset_lazy(&self, name: &str) {
        if let Some(PropertyCell::Memoized(f, _)) = self.load_cell(name) {
            self.replace_cell(name.to_string(), Some(PropertyCell::Unresolved(f)));
        }
    }

    /// `updateIfResolved(name, T, g)` — if the cell carries a value
    /// (`Resolved` or `Memoized`), replace the value with `g(current)`
    /// without invoking the original lazy function again; a no-op on
    /// `Unresolved` or a missing property.
    pub fn update_if_resolved<T>(&self, name: &str, g: impl FnOnce(T) -> T) -> Result<()>
    where
        T: Any + Send + Sync + Clone + DebugSnapshotValue,
    {
        match self.load_cell(name) {
            None | Some(PropertyCell::Unresolved(_)) => Ok(()),
            Some(PropertyCell::Resolved(tv)) => {
                let current = tv.downcast::<T>(name, false)?;
                self.replace_cell(
                    name.to_string(),
                    Some(PropertyCell::Resolved(TypedValue::new(g(current)))),
                );
                Ok(())
            }
            Some(PropertyCell::Memoized(f, tv)) => {
                let current = tv.downcast::<T>(name, true)?;
                self.replace_cell(
                    name.to_string(),
                    Some(PropertyCell::Memoized(f, TypedValue::new(g(current)))),
                );
                Ok(())
            }
        }
    }

    /// An independent instance observing the current snapshot; later
    /// mutations on either instance do not affect the other.
    pub fn copy(&self) -> PersistentProperties {
        PersistentProperties {
            cells: ArcSwap::new(self.cells.load_full()),
            order: ArcSwap::new(self.order.load_full()),
        }
    }

    /// Record the property name order used by [`Self::debug_snapshot`].
    pub fn set_debug_property_order(&self, order: impl IntoIterator<Item = String>) {
        self.order.store(Arc::new(order.into_iter().collect()));
    }

    /// An ordered debug dump: `Unresolved` properties render as
    /// [`DebugEntry::NotYetResolved`]; everything else renders its current
    /// (possibly memoized) value. Names missing from the recorded order
    /// are omitted; names in the order that are not present are skipped.
    pub fn debug_snapshot(&self) -> Vec<(String, DebugEntry)> {
        let order = self.order.load();
        order
            .iter()
            .filter_map(|name| {
                self.load_cell(name).map(|cell| {
                    let entry = match cell {
                        PropertyCell::Unresolved(_) => DebugEntry::NotYetResolved,
                        PropertyCell::Memoized(_, tv) => tv.debug_entry(),
                        PropertyCell::Resolved(tv) => tv.debug_entry(),
                    };
                    (name.clone(), entry)
                })
            })
            .collect()
    }

    fn load_cell(&self, name: &str) -> Option<PropertyCell> {
        self.cells.load().get(name).cloned()
    }

    fn replace_cell(&self, name: String, cell: Option<PropertyCell>) {
        self.cells.rcu(|map| {
            let mut next = (**map).clone();
            match &cell {
                Some(c) => {
                    next.insert(name.clone(), c.clone());
                }
                None => {
                    next.remove(&name);
                }
            }
            next
        });
    }
}
