use async_trait::async_trait;
use std::sync::{Arc, RwLock};

use crate::error::{AppError, Result};

/// Length of a face descriptor produced by the extraction model.
pub const DESCRIPTOR_LEN: usize = 128;

/// Fixed-length numeric vector representing one face.
pub type Descriptor = Vec<f32>;

/// Compares captured descriptors against stored ones.
#[derive(Debug, Clone, Copy)]
pub struct FaceMatcher {
    threshold: f32,
}

impl Default for FaceMatcher {
    fn default() -> Self {
        Self::new(0.6)
    }
}

impl FaceMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Matches iff both descriptors exist, have equal length, and lie
    /// strictly closer than the threshold.
    pub fn verify(&self, captured: Option<&[f32]>, stored: Option<&[f32]>) -> bool {
        let (Some(captured), Some(stored)) = (captured, stored) else {
            return false;
        };
        match euclidean_distance(captured, stored) {
            Some(distance) => distance < self.threshold,
            None => false,
        }
    }
}

/// Euclidean distance, or `None` when the lengths differ.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    let sum: f32 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
    Some(sum.sqrt())
}

/// Checks that a descriptor has the model's shape.
pub fn validate_descriptor(descriptor: &[f32]) -> Result<()> {
    if descriptor.len() != DESCRIPTOR_LEN {
        return Err(AppError::Validation(format!(
            "Face descriptor must have {} components, got {}",
            DESCRIPTOR_LEN,
            descriptor.len()
        )));
    }
    if descriptor.iter().any(|v| !v.is_finite()) {
        return Err(AppError::Validation(
            "Face descriptor must contain only finite values".to_string(),
        ));
    }
    Ok(())
}

/// Model-bound descriptor extraction. Implementations return
/// `AppError::NoFaceDetected` when the image holds no face.
#[async_trait]
pub trait FaceExtractor: Send + Sync {
    /// Loads model weights. Called once at startup.
    async fn load(&self) -> Result<()>;

    async fn extract(&self, image: &[u8]) -> Result<Descriptor>;
}

/// Readiness of the process-wide extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractorStatus {
    NotReady,
    Ready,
    Failed(String),
}

/// Process-wide handle to the face extractor.
///
/// Extraction is refused until `initialize` has completed successfully.
#[derive(Clone)]
pub struct FaceExtraction {
    extractor: Option<Arc<dyn FaceExtractor>>,
    status: Arc<RwLock<ExtractorStatus>>,
}

impl FaceExtraction {
    /// A handle with no extractor installed. Stays `NotReady` forever.
    pub fn disabled() -> Self {
        Self {
            extractor: None,
            status: Arc::new(RwLock::new(ExtractorStatus::NotReady)),
        }
    }

    pub fn new(extractor: Arc<dyn FaceExtractor>) -> Self {
        Self {
            extractor: Some(extractor),
            status: Arc::new(RwLock::new(ExtractorStatus::NotReady)),
        }
    }

    pub fn status(&self) -> ExtractorStatus {
        self.status.read().map(|s| s.clone()).unwrap_or(ExtractorStatus::NotReady)
    }

    fn set_status(&self, status: ExtractorStatus) {
        if let Ok(mut guard) = self.status.write() {
            *guard = status;
        }
    }

    /// Loads the model and records the outcome.
    pub async fn initialize(&self) -> Result<()> {
        let Some(extractor) = &self.extractor else {
            tracing::warn!("⚠️ No face extractor installed, image verification disabled");
            return Err(AppError::ExtractorNotReady);
        };

        match extractor.load().await {
            Ok(()) => {
                self.set_status(ExtractorStatus::Ready);
                tracing::info!("✅ Face extractor ready");
                Ok(())
            }
            Err(e) => {
                tracing::error!("❌ Face extractor failed to load: {}", e);
                self.set_status(ExtractorStatus::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    pub async fn extract(&self, image: &[u8]) -> Result<Descriptor> {
        let extractor = match (&self.extractor, self.status()) {
            (Some(extractor), ExtractorStatus::Ready) => extractor,
            _ => return Err(AppError::ExtractorNotReady),
        };
        let descriptor = extractor.extract(image).await?;
        validate_descriptor(&descriptor)?;
        Ok(descriptor)
    }
}
