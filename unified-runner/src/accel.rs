//! Exclusive access to the shared accelerator.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::model::ModelRegistry;

/// Guard over the accelerator's critical section. Dropping it, on any exit
/// path, hands the accelerator to the next waiter.
pub type AcceleratorGuard = OwnedMutexGuard<ModelRegistry>;

/// The single exclusive-access token for the accelerator.
///
/// The gate owns the [`ModelRegistry`]: holding the guard is the only way to
/// reach the resident model, so every operation that touches loaded weights
/// is serialized for its entire duration, including each incremental step of
/// a streaming generation. Waiters are woken in FIFO order, so every caller
/// eventually acquires the gate.
///
/// Created once at process start and shared by handle; never destroyed
/// before shutdown.
#[derive(Clone)]
pub struct AcceleratorGate {
    registry: Arc<Mutex<ModelRegistry>>,
}

impl AcceleratorGate {
    pub fn new(registry: ModelRegistry) -> Self {
        Self {
            registry: Arc::new(Mutex::new(registry)),
        }
    }

    /// Suspend until no other holder is active, then enter the critical
    /// section. The guard is owned so a streaming producer can carry it into
    /// the task that outlives the request handler.
    pub async fn acquire(&self) -> AcceleratorGuard {
        self.registry.clone().lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::test_util::StubBackend;

    fn gate() -> AcceleratorGate {
        let backend = Arc::new(StubBackend::with_deltas(vec!["x"]));
        let (registry, _watch_rx) = ModelRegistry::new(backend);
        AcceleratorGate::new(registry)
    }

    #[tokio::test]
    async fn test_second_acquire_waits_for_release() {
        let gate = gate();
        let guard = gate.acquire().await;

        let contender = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _guard = gate.acquire().await;
            })
        };

        // The contender cannot finish while the guard is held.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("contender should acquire after release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_guard_reaches_registry() {
        let gate = gate();
        let mut guard = gate.acquire().await;
        guard.ensure_loaded("m1").await.unwrap();
        assert_eq!(guard.current_identity(), Some("m1"));
    }
}
