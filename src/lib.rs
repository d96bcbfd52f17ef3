#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

//! A lightweight domain-persistence core: lazy/memoized property
//! containers backed by a typed, per-instance cell map, transactions with
//! ambient, dynamically-scoped context and a bounded retry loop, and a
//! typed in-process event bus dispatched by declared type hierarchy.
//!
//! [`props`] holds the per-aggregate property container;
//! [`lazy_refresh`] is the ambient flag that forces memoized properties to
//! recompute; [`tx`] is the transaction manager and ambient transaction
//! context; [`events`] is the subscription registry and publish/dispatch
//! machinery; [`storage`] defines the adapter interfaces plus the
//! in-memory adapter. [`domain`] demonstrates the whole stack against a
//! small `User`/`Group` model.

pub mod debug;
pub mod domain;
pub mod error;
pub mod events;
pub mod lazy_refresh;
pub mod props;
pub mod storage;
pub mod tx;

pub use crate::debug::{DebugEntry, DebugSnapshotValue};
pub use crate::error::{PersistenceError, Result};
pub use crate::events::{DomainEvent, EventSubscriptionManager, Listener};
pub use crate::lazy_refresh::{is_lazy_refresh_active, with_lazy_refresh};
pub use crate::props::PersistentProperties;
pub use crate::storage::{Storage, TransactionalDatabase};
pub use crate::tx::{
    current_transaction, with_current_read_write_transaction, CurrentTx, ReadOnlyTransaction,
    ReadWriteTransaction, TransactionManager,
};
