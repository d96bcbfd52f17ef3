//! Storage interfaces and the in-memory adapter.
//!
//! The core only assumes a storage adapter can mint a
//! [`TransactionalDatabase`] handle and that the handle responds to
//! `commit`/`rollback`/`release`; everything else about the handle is
//! opaque to the core and is a concern between a concrete adapter and the
//! repositories built against it, much like `kvdb`'s abstract
//! `KeyValueDB` trait and `kvdb-memorydb`'s `parking_lot`-backed
//! in-memory implementation of it.

pub mod memory;

use std::sync::Arc;

use crate::error::Result;

/// An opaque capability exposed to repositories by the active
/// transaction. The core only assumes it exists and can be finalized;
/// concrete adapters attach whatever connection/snapshot state
/// repositories need on top of it.
pub trait TransactionalDatabase: Send + Sync + 'static {
    /// Finalize the transaction's changes. For the in-memory adapter this
    /// publishes the transaction's snapshot and releases the storage
    /// mutex; for a SQL-backed adapter this would send the SQL `COMMIT`.
    #[allow(async_fn_in_trait)]
    async fn commit(&self) -> Result<()>;

    /// Discard the transaction's changes and release acquired resources.
    #[allow(async_fn_in_trait)]
    async fn rollback(&self) -> Result<()>;

    /// Idempotent final cleanup; safe to call on an already-finalized
    /// handle.
    #[allow(async_fn_in_trait)]
    async fn release(&self) -> Result<()>;
}

/// A factory that mints [`TransactionalDatabase`] handles.
pub trait Storage: Send + Sync + 'static {
    /// The concrete handle type this storage mints.
    type Handle: TransactionalDatabase;

    /// Acquire whatever resources (connection, in-memory lock) a new
    /// transaction needs and return a handle bound to them.
    #[allow(async_fn_in_trait)]
    async fn get_transactional_database(storage: &Arc<Self>) -> Result<Self::Handle>
    where
        Self: Sized;
}
