//! Debug-view support for [`crate::props::PersistentProperties::debug_snapshot`].
//!
//! Holds the ordered debug-dump representation for property cells: each
//! entry renders either a scalar value or, for an unresolved lazy
//! property, a sentinel marking it as not yet computed.

use std::fmt::Debug;

/// One entry in a [`crate::props::PersistentProperties::debug_snapshot`]
/// dump.
#[derive(Debug, Clone, PartialEq)]
pub enum DebugEntry {
    /// The property is `Unresolved`: `setLazy` was called but no
    /// `getLazy` has run yet.
    NotYetResolved,
    /// A resolved or memoized scalar value, rendered with `{:?}`.
    Value(String),
    /// A value that itself exposes a nested debug view (typically a
    /// domain aggregate backed by its own `PersistentProperties`).
    Nested(Vec<(String, DebugEntry)>),
}

/// Implemented by any type that can be stored in a
/// [`crate::props::PersistentProperties`] cell so that `debugSnapshot` can
/// render it. Values that themselves expose a debug view are recursed
/// into.
///
/// There is no blanket impl over `Debug` on purpose: a type opts in either
/// via [`debug_value`] (for plain scalars) or by implementing
/// [`DebugSnapshotValue::debug_entry`] directly to recurse into a nested
/// container.
pub trait DebugSnapshotValue {
    /// Produce this value's debug-dump entry.
    fn debug_entry(&self) -> DebugEntry;
}

/// Helper for the common case: a scalar that just wants `{:?}` formatting.
pub fn debug_value<T: Debug>(value: &T) -> DebugEntry {
    DebugEntry::Value(format!("{:?}", value))
}

macro_rules! impl_scalar_debug_snapshot {
    ($($ty:ty),* $(,)?) => {
        $(
            impl DebugSnapshotValue for $ty {
                fn debug_entry(&self) -> DebugEntry {
                    debug_value(self)
                }
            }
        )*
    };
}

impl_scalar_debug_snapshot!(
    bool, char, String, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize,
);

impl DebugSnapshotValue for uuid::Uuid {
    fn debug_entry(&self) -> DebugEntry {
        debug_value(self)
    }
}

impl<T: DebugSnapshotValue> DebugSnapshotValue for Vec<T> {
    fn debug_entry(&self) -> DebugEntry {
        DebugEntry::Value(format!(
            "[{}]",
            self.iter()
                .map(|v| format!("{:?}", v.debug_entry()))
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }
}

impl<T: DebugSnapshotValue> DebugSnapshotValue for Option<T> {
    fn debug_entry(&self) -> DebugEntry {
        match self {
            Some(v) => v.debug_entry(),
            None => DebugEntry::Value("None".to_string()),
        }
    }
}
