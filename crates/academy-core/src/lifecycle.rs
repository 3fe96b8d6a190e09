//! Ownership of the loaded similarity model.
//!
//! `unloaded -> loading -> loaded`, `loaded -> disposed` on teardown.
//! Concurrent `load_model` calls join the single in-flight load. A failed
//! load returns to `unloaded` so the next call retries; `disposed` is
//! terminal.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::model::{ModelInfo, ModelLoadError, ModelLoader, ModelVariant, SimilarityModel};

type LoadResult = Result<Arc<dyn SimilarityModel>, ModelLoadError>;
type SharedLoad = Shared<BoxFuture<'static, LoadResult>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Unloaded,
    Loading,
    Loaded,
    Disposed,
}

enum Slot {
    Unloaded,
    Loading { generation: u64, load: SharedLoad },
    Loaded(Arc<dyn SimilarityModel>),
    Disposed,
}

struct Inner {
    slot: Slot,
    /// Incremented per load so a stale completion cannot overwrite newer state.
    generation: u64,
}

/// Explicitly constructed model handle. Share it with `Arc`.
pub struct ModelManager {
    loader: Arc<dyn ModelLoader>,
    inner: Mutex<Inner>,
}

impl ModelManager {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            inner: Mutex::new(Inner {
                slot: Slot::Unloaded,
                generation: 0,
            }),
        }
    }

    /// Return the loaded model, loading it first if needed.
    ///
    /// Exactly one underlying load runs at a time; callers arriving while it
    /// is in flight await the same result.
    pub async fn load_model(&self) -> Result<Arc<dyn SimilarityModel>, ModelLoadError> {
        let (generation, load) = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            match &inner.slot {
                Slot::Loaded(model) => return Ok(Arc::clone(model)),
                Slot::Disposed => return Err(ModelLoadError::Disposed),
                Slot::Loading { generation, load } => (*generation, load.clone()),
                Slot::Unloaded => {
                    inner.generation += 1;
                    let generation = inner.generation;
                    let load = self.start_load(generation);
                    inner.slot = Slot::Loading {
                        generation,
                        load: load.clone(),
                    };
                    (generation, load)
                }
            }
        };

        let result = load.await;

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        match &inner.slot {
            Slot::Disposed => return Err(ModelLoadError::Disposed),
            Slot::Loading { generation: current, .. } if *current == generation => {
                inner.slot = match &result {
                    Ok(model) => {
                        tracing::info!(generation, variant = ?model.variant(), "similarity model loaded");
                        Slot::Loaded(Arc::clone(model))
                    }
                    Err(e) => {
                        tracing::warn!(generation, error = %e, "similarity model load failed; will retry on next request");
                        Slot::Unloaded
                    }
                };
            }
            _ => {}
        }

        result
    }

    fn start_load(&self, generation: u64) -> SharedLoad {
        tracing::info!(generation, "loading similarity model");
        let loader = Arc::clone(&self.loader);
        // Runs to completion even if every caller is dropped.
        let task = tokio::task::spawn_blocking(move || loader.load());
        async move {
            task.await
                .map_err(|e| ModelLoadError::TaskFailed(e.to_string()))?
        }
        .boxed()
        .shared()
    }

    /// Release the model. Idempotent; the handle cannot be reloaded afterwards.
    pub async fn dispose(&self) {
        let mut guard = self.inner.lock().await;
        let previous = std::mem::replace(&mut guard.slot, Slot::Disposed);
        match previous {
            Slot::Loaded(model) => {
                tracing::info!(variant = ?model.variant(), "similarity model disposed");
            }
            Slot::Loading { generation, .. } => {
                tracing::info!(generation, "similarity model disposed during load");
            }
            Slot::Unloaded => tracing::debug!("similarity model disposed before load"),
            Slot::Disposed => tracing::debug!("similarity model already disposed"),
        }
    }

    pub async fn state(&self) -> ModelState {
        match self.inner.lock().await.slot {
            Slot::Unloaded => ModelState::Unloaded,
            Slot::Loading { .. } => ModelState::Loading,
            Slot::Loaded(_) => ModelState::Loaded,
            Slot::Disposed => ModelState::Disposed,
        }
    }

    /// Variant of the loaded model, if any.
    pub async fn variant(&self) -> Option<ModelVariant> {
        match &self.inner.lock().await.slot {
            Slot::Loaded(model) => Some(model.variant().clone()),
            _ => None,
        }
    }

    /// Description of the loaded model, if any.
    pub async fn info(&self) -> Option<ModelInfo> {
        match &self.inner.lock().await.slot {
            Slot::Loaded(model) => Some(model.info()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PredictionError;
    use crate::preprocess::FaceTensor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Fixed(ModelVariant);

    impl SimilarityModel for Fixed {
        fn variant(&self) -> &ModelVariant {
            &self.0
        }
        fn score(&self, _: &FaceTensor, _: &FaceTensor) -> Result<f32, PredictionError> {
            Ok(0.5)
        }
        fn info(&self) -> ModelInfo {
            ModelInfo {
                variant: self.0.clone(),
                input_shapes: vec![],
                output_shape: vec![1, 1],
                layers: None,
                parameters: None,
                embedding_dim: None,
            }
        }
    }

    /// Counts load attempts; fails the first `failures` of them.
    struct CountingLoader {
        attempts: Arc<AtomicUsize>,
        failures: usize,
        delay: Duration,
    }

    impl CountingLoader {
        fn new(failures: usize, delay: Duration) -> (Self, Arc<AtomicUsize>) {
            let attempts = Arc::new(AtomicUsize::new(0));
            let loader = Self {
                attempts: Arc::clone(&attempts),
                failures,
                delay,
            };
            (loader, attempts)
        }
    }

    impl ModelLoader for CountingLoader {
        fn load(&self) -> Result<Arc<dyn SimilarityModel>, ModelLoadError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if attempt < self.failures {
                return Err(ModelLoadError::ArtifactNotFound(format!("attempt {attempt}")));
            }
            Ok(Arc::new(Fixed(ModelVariant::UntrainedFallback { seed: attempt as u64 })))
        }
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_attempt() {
        let (loader, attempts) = CountingLoader::new(0, Duration::from_millis(50));
        let manager = Arc::new(ModelManager::new(Arc::new(loader)));

        let calls = (0..8).map(|_| {
            let manager = Arc::clone(&manager);
            async move { manager.load_model().await }
        });
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state().await, ModelState::Loaded);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_loads_across_tasks() {
        let (loader, attempts) = CountingLoader::new(0, Duration::from_millis(50));
        let manager = Arc::new(ModelManager::new(Arc::new(loader)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.load_model().await.is_ok() })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_loaded_is_idempotent() {
        let (loader, attempts) = CountingLoader::new(0, Duration::ZERO);
        let manager = ModelManager::new(Arc::new(loader));

        manager.load_model().await.unwrap();
        manager.load_model().await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(
            manager.variant().await,
            Some(ModelVariant::UntrainedFallback { seed: 0 })
        );
    }

    #[tokio::test]
    async fn test_failed_load_is_retryable() {
        let (loader, attempts) = CountingLoader::new(1, Duration::ZERO);
        let manager = ModelManager::new(Arc::new(loader));

        let err = manager.load_model().await.err().unwrap();
        assert!(matches!(err, ModelLoadError::ArtifactNotFound(_)));
        assert_eq!(manager.state().await, ModelState::Unloaded);

        manager.load_model().await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(manager.state().await, ModelState::Loaded);
    }

    #[tokio::test]
    async fn test_concurrent_waiters_share_failure() {
        let (loader, attempts) = CountingLoader::new(1, Duration::from_millis(30));
        let manager = ModelManager::new(Arc::new(loader));

        let (a, b) = tokio::join!(manager.load_model(), manager.load_model());
        assert!(a.is_err() && b.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispose_is_terminal_and_idempotent() {
        let (loader, attempts) = CountingLoader::new(0, Duration::ZERO);
        let manager = ModelManager::new(Arc::new(loader));

        manager.load_model().await.unwrap();
        manager.dispose().await;
        manager.dispose().await;

        assert_eq!(manager.state().await, ModelState::Disposed);
        assert!(manager.info().await.is_none());
        assert_eq!(manager.load_model().await.err(), Some(ModelLoadError::Disposed));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispose_before_load() {
        let (loader, attempts) = CountingLoader::new(0, Duration::ZERO);
        let manager = ModelManager::new(Arc::new(loader));

        manager.dispose().await;
        assert_eq!(manager.load_model().await.err(), Some(ModelLoadError::Disposed));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_independent_handles() {
        let (first, first_attempts) = CountingLoader::new(0, Duration::ZERO);
        let (second, second_attempts) = CountingLoader::new(0, Duration::ZERO);
        let a = ModelManager::new(Arc::new(first));
        let b = ModelManager::new(Arc::new(second));

        a.load_model().await.unwrap();
        a.dispose().await;
        b.load_model().await.unwrap();

        assert_eq!(b.state().await, ModelState::Loaded);
        assert_eq!(first_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(second_attempts.load(Ordering::SeqCst), 1);
    }
}
