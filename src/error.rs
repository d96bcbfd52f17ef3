//! The error surface of the persistence core.
//!
//! `PersistenceError` is the single top-level error category; every
//! fallible operation in this crate returns `Result<T, PersistenceError>`.

use std::fmt;
use thiserror::Error;

/// Errors raised by [`crate::props::PersistentProperties`],
/// [`crate::tx`], and [`crate::events`].
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// A property was read that was never `set` or `setLazy`.
    #[error("no such property `{0}`")]
    NoSuchProperty(String),

    /// A property was read as a type it was never stored as.
    #[error("property `{name}` has unexpected type: expected `{expected}`, found `{actual}`{lazy}")]
    UnexpectedPropertyType {
        /// The property name.
        name: String,
        /// The type name the caller asked for.
        expected: &'static str,
        /// The type name actually stored.
        actual: &'static str,
        /// Whether the mismatch occurred while resolving a lazy value.
        lazy: LazySuffix,
    },

    /// An aggregate exposed both a property and a zero-arg method with the
    /// same name during reflective extraction. This is a domain-layer
    /// concern the core never triggers itself; only builders that choose
    /// to validate against it do.
    #[error("duplicate property `{name}` on `{owner}`: both a field and a method declare it")]
    DuplicateProperty {
        /// The conflicting property name.
        name: String,
        /// The owning aggregate's type name.
        owner: &'static str,
    },

    /// `currentTransaction()` was called outside any `with…Transaction` block.
    #[error("no transaction is active on this task")]
    CurrentTransactionUnavailable,

    /// The ambient transaction exists but is read-only.
    #[error("a read-write transaction is required, but the active transaction is read-only")]
    ReadWriteTransactionRequired,

    /// A `with…Transaction` block was opened while one was already active on
    /// the same ambient slot.
    #[error("a transaction is already open on this task")]
    ConcurrentTransaction,

    /// Signal absorbed by `with_read_write_transaction`'s retry loop; never
    /// observed by callers unless the retry budget is exhausted, in which
    /// case `cause` is re-raised.
    #[error("transaction retry requested: {0}")]
    TransactionRetry(Box<PersistenceError>),

    /// A listener, repository, or storage adapter raised an error not
    /// otherwise represented above.
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Helper formatted as either empty or " (lazy)", so the `Display` impl of
/// `UnexpectedPropertyType` reads naturally either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LazySuffix(pub bool);

impl fmt::Display for LazySuffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 {
            f.write_str(" (while resolving lazy value)")
        } else {
            Ok(())
        }
    }
}

impl PersistenceError {
    /// Construct `UnexpectedPropertyType` for a non-lazy read.
    pub fn unexpected_type(name: impl Into<String>, expected: &'static str, actual: &'static str) -> Self {
        PersistenceError::UnexpectedPropertyType {
            name: name.into(),
            expected,
            actual,
            lazy: LazySuffix(false),
        }
    }

    /// Construct `UnexpectedPropertyType` for a mismatch discovered while
    /// resolving a lazy value.
    pub fn unexpected_lazy_type(name: impl Into<String>, expected: &'static str, actual: &'static str) -> Self {
        PersistenceError::UnexpectedPropertyType {
            name: name.into(),
            expected,
            actual,
            lazy: LazySuffix(true),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;
