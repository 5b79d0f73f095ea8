use crate::engine::{EngineError, EngineHandle};
use facelens_core::{DetectionModel, FaceEncoding, FaceError, LandmarkModel};
use zbus::interface;

/// D-Bus interface for the FaceLens demo service.
///
/// Bus name: org.facelens.Demo1
/// Object path: /org/facelens/Demo1
pub struct DemoService {
    engine: EngineHandle,
}

impl DemoService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    match err {
        EngineError::Face(
            FaceError::InvalidInput
            | FaceError::Image(_)
            | FaceError::EmptyEncoding
            | FaceError::EncodingLengthMismatch { .. },
        ) => {
            zbus::fdo::Error::InvalidArgs(err.to_string())
        }
        _ => zbus::fdo::Error::Failed(err.to_string()),
    }
}

fn invalid_args(err: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::InvalidArgs(err.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.facelens.Demo1")]
impl DemoService {
    /// Outline every face. Returns whether any was found and the PNG image.
    async fn detect_faces(
        &self,
        image: Vec<u8>,
        upsample: u32,
        model: &str,
    ) -> zbus::fdo::Result<(bool, Vec<u8>)> {
        let model: DetectionModel = model.parse().map_err(invalid_args)?;
        tracing::info!(bytes = image.len(), upsample, %model, "detect requested");
        let result = self.engine.detect(image, upsample, model).await.map_err(to_fdo)?;
        Ok((result.found, result.png))
    }

    /// Dot every landmark. Returns the PNG image.
    async fn draw_landmarks(&self, image: Vec<u8>, model: &str) -> zbus::fdo::Result<Vec<u8>> {
        let model: LandmarkModel = model.parse().map_err(invalid_args)?;
        tracing::info!(bytes = image.len(), %model, "landmarks requested");
        self.engine.landmarks(image, model).await.map_err(to_fdo)
    }

    /// Face locations as a JSON array of {top, right, bottom, left}.
    async fn locate_faces(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(bytes = image.len(), "locate requested");
        to_json(&self.engine.locate(image).await.map_err(to_fdo)?)
    }

    /// Face encodings as a JSON array.
    async fn encode_faces(&self, image: Vec<u8>, jitters: u32) -> zbus::fdo::Result<String> {
        tracing::info!(bytes = image.len(), jitters, "encode requested");
        to_json(&self.engine.encode(image, jitters).await.map_err(to_fdo)?)
    }

    /// Compare a candidate encoding against known ones.
    /// Returns JSON {"matches": [...], "distances": [...]}.
    async fn compare_encodings(
        &self,
        known_json: &str,
        candidate_json: &str,
        tolerance: f64,
    ) -> zbus::fdo::Result<String> {
        let known: Vec<FaceEncoding> = serde_json::from_str(known_json).map_err(invalid_args)?;
        let candidate: FaceEncoding = serde_json::from_str(candidate_json).map_err(invalid_args)?;
        let result = self
            .engine
            .compare(known, candidate, tolerance as f32)
            .await
            .map_err(to_fdo)?;
        Ok(serde_json::json!({
            "matches": result.matches,
            "distances": result.distances,
        })
        .to_string())
    }

    /// Return service status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "cache": self.engine.cache_stats(),
        }))
    }
}
