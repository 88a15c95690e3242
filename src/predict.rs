//! Registry of detection and classification providers.
//!
//! Each provider kind has at most one registered implementation. Inference
//! fans one image out to every provider as its own task and waits for all of
//! them; a failure (or panic) is recorded against that kind only.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::FrameImage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionKind {
    ObjectDetection,
    SceneClassification,
    FaceDetection,
    ActionRecognition,
}

impl PredictionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionKind::ObjectDetection => "object_detection",
            PredictionKind::SceneClassification => "scene_classification",
            PredictionKind::FaceDetection => "face_detection",
            PredictionKind::ActionRecognition => "action_recognition",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl Prediction {
    pub fn new(label: impl Into<String>, confidence: f64) -> Self {
        Self {
            label: label.into(),
            confidence,
            bounding_box: None,
            attributes: Map::new(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PredictionError {
    #[error("{kind:?} provider failed: {message}")]
    Failed {
        kind: PredictionKind,
        message: String,
    },

    #[error("{0:?} provider panicked")]
    Panicked(PredictionKind),

    #[error("provider registry lock poisoned")]
    LockPoisoned,
}

#[async_trait]
pub trait PredictionProvider: Send + Sync {
    async fn predict(&self, image: &FrameImage) -> anyhow::Result<Vec<Prediction>>;
}

/// Result of one provider for one image.
#[derive(Debug)]
pub struct ProviderOutcome {
    pub kind: PredictionKind,
    pub result: Result<Vec<Prediction>, PredictionError>,
    pub elapsed: Duration,
}

#[derive(Default)]
pub struct PredictionRegistry {
    providers: RwLock<BTreeMap<PredictionKind, Arc<dyn PredictionProvider>>>,
}

impl PredictionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing any previous one of the same kind.
    pub fn register(
        &self,
        kind: PredictionKind,
        provider: Arc<dyn PredictionProvider>,
    ) -> Result<(), PredictionError> {
        let mut providers = self
            .providers
            .write()
            .map_err(|_| PredictionError::LockPoisoned)?;
        if providers.insert(kind, provider).is_some() {
            log::info!("replaced {} provider", kind.as_str());
        }
        Ok(())
    }

    pub fn kinds(&self) -> Result<Vec<PredictionKind>, PredictionError> {
        let providers = self
            .providers
            .read()
            .map_err(|_| PredictionError::LockPoisoned)?;
        Ok(providers.keys().copied().collect())
    }

    /// Run every registered provider against `image` concurrently.
    ///
    /// Returns one outcome per provider, ordered by kind, once all of them
    /// have finished. An empty registry yields an empty list.
    pub async fn infer(
        &self,
        image: Arc<FrameImage>,
    ) -> Result<Vec<ProviderOutcome>, PredictionError> {
        let providers: Vec<(PredictionKind, Arc<dyn PredictionProvider>)> = {
            let providers = self
                .providers
                .read()
                .map_err(|_| PredictionError::LockPoisoned)?;
            providers
                .iter()
                .map(|(kind, provider)| (*kind, Arc::clone(provider)))
                .collect()
        };

        let tasks = providers.into_iter().map(|(kind, provider)| {
            let image = Arc::clone(&image);
            let handle = tokio::spawn(async move {
                let started = Instant::now();
                let result = provider.predict(&image).await;
                (result, started.elapsed())
            });
            async move { (kind, handle.await) }
        });

        let outcomes = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|(kind, joined)| match joined {
                Ok((Ok(predictions), elapsed)) => {
                    log::debug!(
                        "{} produced {} predictions in {:?}",
                        kind.as_str(),
                        predictions.len(),
                        elapsed
                    );
                    ProviderOutcome {
                        kind,
                        result: Ok(predictions),
                        elapsed,
                    }
                }
                Ok((Err(e), elapsed)) => ProviderOutcome {
                    kind,
                    result: Err(PredictionError::Failed {
                        kind,
                        message: format!("{:#}", e),
                    }),
                    elapsed,
                },
                Err(_) => ProviderOutcome {
                    kind,
                    result: Err(PredictionError::Panicked(kind)),
                    elapsed: Duration::ZERO,
                },
            })
            .collect();

        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed(Vec<Prediction>);

    #[async_trait]
    impl PredictionProvider for Fixed {
        async fn predict(&self, _image: &FrameImage) -> anyhow::Result<Vec<Prediction>> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    #[async_trait]
    impl PredictionProvider for Failing {
        async fn predict(&self, _image: &FrameImage) -> anyhow::Result<Vec<Prediction>> {
            anyhow::bail!("model not loaded")
        }
    }

    struct Panicking;

    #[async_trait]
    impl PredictionProvider for Panicking {
        async fn predict(&self, _image: &FrameImage) -> anyhow::Result<Vec<Prediction>> {
            panic!("boom")
        }
    }

    /// Sleeps, then records that it ran to completion.
    struct Slow(Arc<AtomicUsize>);

    #[async_trait]
    impl PredictionProvider for Slow {
        async fn predict(&self, _image: &FrameImage) -> anyhow::Result<Vec<Prediction>> {
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Prediction::new("walking", 0.7)])
        }
    }

    fn image() -> Arc<FrameImage> {
        Arc::new(FrameImage::new(
            "frame-1.jpg",
            DynamicImage::ImageRgb8(RgbImage::new(4, 4)),
        ))
    }

    #[tokio::test]
    async fn test_empty_registry_yields_nothing() {
        let registry = PredictionRegistry::new();
        assert!(registry.infer(image()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_isolated_per_kind() {
        let registry = PredictionRegistry::new();
        registry
            .register(
                PredictionKind::ObjectDetection,
                Arc::new(Fixed(vec![Prediction::new("car", 0.9)])),
            )
            .unwrap();
        registry
            .register(PredictionKind::FaceDetection, Arc::new(Failing))
            .unwrap();

        let outcomes = registry.infer(image()).await.unwrap();
        assert_eq!(outcomes.len(), 2);

        assert_eq!(outcomes[0].kind, PredictionKind::ObjectDetection);
        assert_eq!(
            outcomes[0].result.as_ref().unwrap(),
            &vec![Prediction::new("car", 0.9)]
        );

        assert_eq!(outcomes[1].kind, PredictionKind::FaceDetection);
        match &outcomes[1].result {
            Err(PredictionError::Failed { kind, message }) => {
                assert_eq!(*kind, PredictionKind::FaceDetection);
                assert!(message.contains("model not loaded"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panic_does_not_cancel_siblings() {
        let finished = Arc::new(AtomicUsize::new(0));
        let registry = PredictionRegistry::new();
        registry
            .register(PredictionKind::SceneClassification, Arc::new(Panicking))
            .unwrap();
        registry
            .register(
                PredictionKind::ActionRecognition,
                Arc::new(Slow(finished.clone())),
            )
            .unwrap();

        let outcomes = registry.infer(image()).await.unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(matches!(
            outcomes[0].result,
            Err(PredictionError::Panicked(PredictionKind::SceneClassification))
        ));
        assert!(outcomes[1].result.is_ok());
    }

    #[tokio::test]
    async fn test_register_replaces_same_kind() {
        let registry = PredictionRegistry::new();
        registry
            .register(PredictionKind::ObjectDetection, Arc::new(Failing))
            .unwrap();
        registry
            .register(PredictionKind::ObjectDetection, Arc::new(Fixed(vec![])))
            .unwrap();

        assert_eq!(registry.kinds().unwrap(), vec![PredictionKind::ObjectDetection]);
        let outcomes = registry.infer(image()).await.unwrap();
        assert!(outcomes[0].result.as_ref().unwrap().is_empty());
    }
}
