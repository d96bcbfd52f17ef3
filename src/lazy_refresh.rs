//! The ambient lazy-refresh flag.
//!
//! Code running inside [`with_lazy_refresh`] observes the flag as set
//! regardless of how many `.await` points it crosses; code outside sees it
//! unset. Dynamic scoping via `tokio::task_local!` gives this the same
//! shape as ordinary thread-local dynamic scoping, adapted to an async
//! task-local since lazy computations in this crate are themselves
//! `async fn`.

use std::future::Future;

tokio::task_local! {
    static LAZY_REFRESH: bool;
}

/// Returns `true` if the calling task is currently inside a
/// [`with_lazy_refresh`] scope.
pub fn is_lazy_refresh_active() -> bool {
    LAZY_REFRESH.try_with(|&flag| flag).unwrap_or(false)
}

/// Runs `fut` with the ambient lazy-refresh flag set for its entire
/// dynamic extent, including across every suspension point inside it. The
/// flag is restored (cleared) as soon as `fut` completes, whether it
/// returns normally, returns an error, or panics — `task_local!` scopes
/// unwind cleanly, so no explicit guard is needed here.
pub async fn with_lazy_refresh<F, T>(fut: F) -> T
where
    F: Future<Output = T>,
{
    LAZY_REFRESH.scope(true, fut).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unset_outside_any_scope() {
        assert!(!is_lazy_refresh_active());
    }

    #[tokio::test]
    async fn set_inside_scope_and_restored_after() {
        let observed = with_lazy_refresh(async { is_lazy_refresh_active() }).await;
        assert!(observed);
        assert!(!is_lazy_refresh_active());
    }

    #[tokio::test]
    async fn survives_suspension_points() {
        let observed = with_lazy_refresh(async {
            tokio::task::yield_now().await;
            is_lazy_refresh_active()
        })
        .await;
        assert!(observed);
    }

    #[tokio::test]
    async fn restored_on_early_return() {
        async fn inner() -> Option<bool> {
            with_lazy_refresh(async { Some(is_lazy_refresh_active()) }).await
        }
        assert_eq!(inner().await, Some(true));
        assert!(!is_lazy_refresh_active());
    }
}
