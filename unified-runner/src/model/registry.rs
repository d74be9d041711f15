//! Registry of the currently loaded generation model.

use std::sync::Arc;

use tokio::sync::watch;

use super::{LoadedModel, ModelBackend};
use crate::error::{Error, Result};

/// Owns the identity and artifacts of the single resident generation model.
///
/// The registry has no concurrency policy of its own: it is only reachable
/// through the accelerator gate's guard, so every mutation happens inside
/// the gate's critical section. The advertised identity is additionally
/// published on a watch channel so the models listing can answer without
/// queueing behind accelerator work.
pub struct ModelRegistry {
    backend: Arc<dyn ModelBackend>,
    current_identity: Option<String>,
    current_model: Option<Box<dyn LoadedModel>>,
    advertised: watch::Sender<Option<String>>,
}

impl ModelRegistry {
    /// Create an empty registry and the receiver for the advertised
    /// identity. The receiver reports `None` until the first load succeeds.
    pub fn new(backend: Arc<dyn ModelBackend>) -> (Self, watch::Receiver<Option<String>>) {
        let (advertised, watch_rx) = watch::channel(None);
        (
            Self {
                backend,
                current_identity: None,
                current_model: None,
                advertised,
            },
            watch_rx,
        )
    }

    /// Make `identity` the resident model, swapping out the previous one if
    /// necessary, and return it.
    ///
    /// The previous model's resources are released before the new load
    /// starts; the accelerator cannot hold both. On a failed load the
    /// registry is left cleared, never with a partially initialized model.
    pub async fn ensure_loaded(&mut self, identity: &str) -> Result<&dyn LoadedModel> {
        if self.current_identity.as_deref() != Some(identity) {
            if let Some(mut old) = self.current_model.take() {
                let old_identity = self.current_identity.take();
                self.advertised.send_replace(None);
                tracing::info!(
                    model = old_identity.as_deref().unwrap_or("<unknown>"),
                    "releasing generation model"
                );
                old.release().await;
            }

            tracing::info!(model = identity, "loading generation model");
            let loaded = self
                .backend
                .load(identity)
                .await
                .map_err(|e| Error::ModelLoad {
                    identity: identity.to_string(),
                    message: e.to_string(),
                })?;

            self.current_model = Some(loaded);
            self.current_identity = Some(identity.to_string());
            self.advertised.send_replace(Some(identity.to_string()));
            tracing::info!(model = identity, "generation model ready");
        }

        // The identity and model options move together, so this is always
        // populated here.
        self.current_model.as_deref().ok_or_else(|| Error::ModelLoad {
            identity: identity.to_string(),
            message: "model not resident".to_string(),
        })
    }

    /// The resident model, if any. Present exactly when an identity is set.
    pub fn current_model(&self) -> Option<&dyn LoadedModel> {
        self.current_model.as_deref()
    }

    pub fn current_identity(&self) -> Option<&str> {
        self.current_identity.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::StubBackend;

    #[tokio::test]
    async fn test_starts_empty_and_advertises_none() {
        let backend = Arc::new(StubBackend::with_deltas(vec!["x"]));
        let (registry, watch_rx) = ModelRegistry::new(backend);
        assert!(registry.current_identity().is_none());
        assert!(registry.current_model().is_none());
        assert!(watch_rx.borrow().is_none());
    }

    #[tokio::test]
    async fn test_repeat_load_is_noop() {
        let backend = Arc::new(StubBackend::with_deltas(vec!["x"]));
        let (mut registry, _watch_rx) = ModelRegistry::new(backend.clone());

        registry.ensure_loaded("m1").await.unwrap();
        registry.ensure_loaded("m1").await.unwrap();

        assert_eq!(backend.loads_of("m1"), 1);
        assert_eq!(registry.current_identity(), Some("m1"));
    }

    #[tokio::test]
    async fn test_swap_releases_old_model_first() {
        let backend = Arc::new(StubBackend::with_deltas(vec!["x"]));
        let (mut registry, watch_rx) = ModelRegistry::new(backend.clone());

        registry.ensure_loaded("m1").await.unwrap();
        registry.ensure_loaded("m2").await.unwrap();

        assert_eq!(backend.releases(), 1);
        assert_eq!(registry.current_identity(), Some("m2"));
        assert_eq!(watch_rx.borrow().as_deref(), Some("m2"));
    }

    #[tokio::test]
    async fn test_a_b_a_loads_a_twice_b_once() {
        let backend = Arc::new(StubBackend::with_deltas(vec!["x"]));
        let (mut registry, _watch_rx) = ModelRegistry::new(backend.clone());

        registry.ensure_loaded("a").await.unwrap();
        registry.ensure_loaded("b").await.unwrap();
        registry.ensure_loaded("a").await.unwrap();

        assert_eq!(backend.loads_of("a"), 2);
        assert_eq!(backend.loads_of("b"), 1);
    }

    #[tokio::test]
    async fn test_failed_load_clears_registry() {
        let backend = Arc::new(StubBackend::failing_loads());
        let (mut registry, watch_rx) = ModelRegistry::new(backend);

        let err = match registry.ensure_loaded("broken").await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::ModelLoad { ref identity, .. } if identity == "broken"));
        assert!(registry.current_identity().is_none());
        assert!(registry.current_model().is_none());
        assert!(watch_rx.borrow().is_none());
    }

    #[tokio::test]
    async fn test_failed_swap_releases_old_and_clears() {
        let good = Arc::new(StubBackend::with_deltas(vec!["x"]));
        let (mut registry, watch_rx) = ModelRegistry::new(good.clone());
        registry.ensure_loaded("m1").await.unwrap();

        good.fail_next_load();
        let err = match registry.ensure_loaded("m2").await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::ModelLoad { .. }));
        assert_eq!(good.releases(), 1);
        assert!(registry.current_identity().is_none());
        assert!(watch_rx.borrow().is_none());
    }
}
