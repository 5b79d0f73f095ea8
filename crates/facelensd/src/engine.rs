use facelens_core::{
    BoxStyle, CacheStats, Config, DetectionModel, DotStyle, EncodeOptions, FaceCache,
    FaceEncoding, FaceError, FaceLocation, FaceService, ImageInput, LandmarkModel,
    LandmarkOptions, LocateOptions, OnnxBackend, OutputFormat, Rendered,
};
use image::ImageFormat;
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const REQUEST_QUEUE_DEPTH: usize = 8;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Face(#[from] FaceError),
    #[error("png encoding failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Annotated PNG plus whether any face was found.
pub struct DetectResult {
    pub found: bool,
    pub png: Vec<u8>,
}

pub struct CompareResult {
    pub matches: Vec<bool>,
    pub distances: Vec<f32>,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Detect {
        image: Vec<u8>,
        options: LocateOptions,
        reply: oneshot::Sender<Result<DetectResult, EngineError>>,
    },
    Landmarks {
        image: Vec<u8>,
        model: LandmarkModel,
        reply: oneshot::Sender<Result<Vec<u8>, EngineError>>,
    },
    Locate {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<FaceLocation>, EngineError>>,
    },
    Encode {
        image: Vec<u8>,
        jitter_count: u32,
        reply: oneshot::Sender<Result<Vec<FaceEncoding>, EngineError>>,
    },
    Compare {
        known: Vec<FaceEncoding>,
        candidate: FaceEncoding,
        tolerance: f32,
        reply: oneshot::Sender<Result<CompareResult, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    cache: Arc<FaceCache>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Outline faces (retrying harder once) and return the result as PNG.
    pub async fn detect(
        &self,
        image: Vec<u8>,
        upsample_count: u32,
        model: DetectionModel,
    ) -> Result<DetectResult, EngineError> {
        let options = LocateOptions { upsample_count, model };
        self.request(|reply| EngineRequest::Detect { image, options, reply })
            .await?
    }

    pub async fn landmarks(&self, image: Vec<u8>, model: LandmarkModel) -> Result<Vec<u8>, EngineError> {
        self.request(|reply| EngineRequest::Landmarks { image, model, reply })
            .await?
    }

    pub async fn locate(&self, image: Vec<u8>) -> Result<Vec<FaceLocation>, EngineError> {
        self.request(|reply| EngineRequest::Locate { image, reply }).await?
    }

    pub async fn encode(
        &self,
        image: Vec<u8>,
        jitter_count: u32,
    ) -> Result<Vec<FaceEncoding>, EngineError> {
        self.request(|reply| EngineRequest::Encode { image, jitter_count, reply })
            .await?
    }

    pub async fn compare(
        &self,
        known: Vec<FaceEncoding>,
        candidate: FaceEncoding,
        tolerance: f32,
    ) -> Result<CompareResult, EngineError> {
        self.request(|reply| EngineRequest::Compare { known, candidate, tolerance, reply })
            .await?
    }

    /// Cache statistics. Read directly; the cache has its own lock.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Models load lazily on the first request that needs them, so startup
/// succeeds even when some model files are missing.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let cache = Arc::new(FaceCache::new(config.cache_capacity));
    let paths = config.model_paths();
    tracing::info!(
        model_dir = %config.model_dir.display(),
        cache_capacity = config.cache_capacity,
        "engine configured"
    );

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(REQUEST_QUEUE_DEPTH);
    let service = FaceService::new(OnnxBackend::new(paths), cache.clone());

    std::thread::Builder::new()
        .name("facelens-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                handle(&service, req);
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, cache })
}

fn handle(service: &FaceService<OnnxBackend>, req: EngineRequest) {
    match req {
        EngineRequest::Detect { image, options, reply } => {
            let _ = reply.send(run_detect(service, &image, options));
        }
        EngineRequest::Landmarks { image, model, reply } => {
            let _ = reply.send(run_landmarks(service, &image, model));
        }
        EngineRequest::Locate { image, reply } => {
            let result = decode(&image)
                .and_then(|input| Ok(service.locate_faces(Some(&input), LocateOptions::default())?));
            let _ = reply.send(result);
        }
        EngineRequest::Encode { image, jitter_count, reply } => {
            let options = EncodeOptions { jitter_count, ..Default::default() };
            let result =
                decode(&image).and_then(|input| Ok(service.encode_faces(Some(&input), &options)?));
            let _ = reply.send(result);
        }
        EngineRequest::Compare { known, candidate, tolerance, reply } => {
            let result = service
                .compare_encodings(&known, &candidate, tolerance)
                .and_then(|matches| {
                    let distances = service.encoding_distances(&known, &candidate)?;
                    Ok(CompareResult { matches, distances })
                });
            let _ = reply.send(result.map_err(EngineError::from));
        }
    }
}

fn decode(bytes: &[u8]) -> Result<ImageInput, EngineError> {
    Ok(ImageInput::decode(bytes)?)
}

fn to_png(rendered: Rendered) -> Result<Vec<u8>, EngineError> {
    let mut png = Vec::new();
    rendered
        .into_image()
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
    Ok(png)
}

fn run_detect(
    service: &FaceService<OnnxBackend>,
    image: &[u8],
    options: LocateOptions,
) -> Result<DetectResult, EngineError> {
    let input = decode(image)?;
    let annotated =
        service.draw_face_boxes(Some(&input), options, BoxStyle::default(), OutputFormat::Image)?;
    tracing::debug!(faces = annotated.faces, "detect done");
    Ok(DetectResult {
        found: annotated.faces > 0,
        png: to_png(annotated.rendered)?,
    })
}

fn run_landmarks(
    service: &FaceService<OnnxBackend>,
    image: &[u8],
    model: LandmarkModel,
) -> Result<Vec<u8>, EngineError> {
    let input = decode(image)?;
    let options = LandmarkOptions { known_locations: None, model };
    let annotated = service.draw_face_landmarks(
        Some(&input),
        &options,
        DotStyle::LANDMARK_VIEW,
        OutputFormat::Image,
    )?;
    to_png(annotated.rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode(b"not an image").err().unwrap();
        assert!(matches!(err, EngineError::Face(FaceError::Image(_))));
    }

    #[test]
    fn test_png_of_unmodified_image() {
        let array = facelens_core::PixelArray::filled(4, 3, facelens_core::ChannelOrder::Rgb, [9, 9, 9]);
        let png = to_png(Rendered::Array(array)).unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (4, 3));
    }

    #[tokio::test]
    async fn test_compare_round_trip_through_engine() {
        let config = Config {
            model_dir: "/nonexistent".into(),
            ..Config::default()
        };
        let engine = spawn_engine(&config).unwrap();
        let a = FaceEncoding { values: vec![0.0, 0.0], model_version: None };
        let b = FaceEncoding { values: vec![3.0, 4.0], model_version: None };
        let result = engine.compare(vec![a.clone(), b], a, 0.6).await.unwrap();
        assert_eq!(result.matches, vec![true, false]);
        assert!((result.distances[1] - 5.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_compare_mismatched_lengths_is_an_error() {
        let config = Config {
            model_dir: "/nonexistent".into(),
            ..Config::default()
        };
        let engine = spawn_engine(&config).unwrap();
        let short = FaceEncoding { values: vec![0.0], model_version: None };
        let long = FaceEncoding { values: vec![0.0, 0.0], model_version: None };
        let err = engine.compare(vec![short], long, 0.6).await.err().unwrap();
        assert!(matches!(
            err,
            EngineError::Face(FaceError::EncodingLengthMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_model_reported_not_fatal() {
        let config = Config {
            model_dir: "/nonexistent".into(),
            ..Config::default()
        };
        let engine = spawn_engine(&config).unwrap();
        let array = facelens_core::PixelArray::filled(8, 8, facelens_core::ChannelOrder::Rgb, [0, 0, 0]);
        let png = to_png(Rendered::Array(array)).unwrap();
        assert!(engine.locate(png.clone()).await.is_err());
        // Engine is still alive afterwards.
        assert!(engine.locate(png).await.is_err());
        assert_eq!(engine.cache_stats().entries, 0);
    }
}
