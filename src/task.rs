//! Task spawning with per-task panic containment.

use std::future::Future;
use tokio::task::JoinHandle;
use tracing::error;

/// Spawn `fut` so that a panic inside it is logged instead of lost.
///
/// `on_panic` runs after a panic has been caught, letting the caller put
/// shared state back into a consistent shape. The returned handle finishes
/// only after that cleanup.
pub fn spawn_contained<F, P>(name: &'static str, fut: F, on_panic: P) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
    P: FnOnce() + Send + 'static,
{
    let inner = tokio::spawn(fut);
    tokio::spawn(async move {
        if let Err(e) = inner.await {
            if e.is_panic() {
                error!(task = name, error = %e, "Task panicked");
                on_panic();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_panic_is_contained() {
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cleaned);

        let handle = spawn_contained(
            "test",
            async {
                panic!("boom");
            },
            move || flag.store(true, Ordering::SeqCst),
        );

        handle.await.unwrap();
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_no_cleanup_on_success() {
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cleaned);

        spawn_contained("test", async {}, move || flag.store(true, Ordering::SeqCst))
            .await
            .unwrap();
        assert!(!cleaned.load(Ordering::SeqCst));
    }
}
