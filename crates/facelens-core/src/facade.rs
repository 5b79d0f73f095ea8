//! Detection/encoding facade.
//!
//! [`FaceService`] normalizes each input once, forwards the parameters to the
//! backend, and memoizes every result in the shared [`FaceCache`].

use crate::backend::RecognitionBackend;
use crate::cache::{CacheKey, CachedValue, FaceCache, KeyBuilder};
use crate::error::FaceError;
use crate::pixels::{normalize, ImageInput, PixelArray};
use crate::render::{self, BoxStyle, DotStyle, OutputFormat, Rendered};
use crate::types::{
    self, DetectionModel, FaceEncoding, FaceLandmarks, FaceLocation, FastFaceLocation,
    LandmarkModel, DEFAULT_TOLERANCE,
};
use std::sync::{Arc, Mutex, MutexGuard};

/// Upsample count of the single "try harder" pass in
/// [`FaceService::locate_faces_with_retry`].
pub const RETRY_UPSAMPLE_COUNT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocateOptions {
    pub upsample_count: u32,
    pub model: DetectionModel,
}

impl Default for LocateOptions {
    fn default() -> Self {
        Self { upsample_count: 1, model: DetectionModel::Hog }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeOptions {
    /// Skip detection and encode exactly these faces.
    pub known_locations: Option<Vec<FaceLocation>>,
    pub jitter_count: u32,
    pub model: LandmarkModel,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self { known_locations: None, jitter_count: 1, model: LandmarkModel::Small }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LandmarkOptions {
    pub known_locations: Option<Vec<FaceLocation>>,
    pub model: LandmarkModel,
}

impl Default for LandmarkOptions {
    fn default() -> Self {
        Self { known_locations: None, model: LandmarkModel::Large }
    }
}

/// Rendered output plus how many faces it shows.
#[derive(Debug, Clone)]
pub struct Annotated {
    pub rendered: Rendered,
    pub faces: usize,
}

trait Cacheable: Sized {
    const TAG: &'static str;
    fn into_cached(self) -> CachedValue;
    fn from_cached(value: CachedValue) -> Option<Self>;
}

macro_rules! cacheable {
    ($ty:ty, $variant:ident, $tag:literal) => {
        impl Cacheable for $ty {
            const TAG: &'static str = $tag;

            fn into_cached(self) -> CachedValue {
                CachedValue::$variant(self)
            }

            fn from_cached(value: CachedValue) -> Option<Self> {
                match value {
                    CachedValue::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

cacheable!(Vec<FaceLocation>, Locations, "locate_faces");
cacheable!(Vec<FastFaceLocation>, FastLocations, "locate_faces_fast");
cacheable!(Vec<FaceEncoding>, Encodings, "encode_faces");
cacheable!(Vec<FaceLandmarks>, Landmarks, "extract_landmarks");
cacheable!(Vec<bool>, Matches, "compare_encodings");
cacheable!(Vec<f32>, Distances, "encoding_distances");

/// Memoizing facade over a [`RecognitionBackend`].
///
/// The backend sits behind its own mutex, so inference is serialized while
/// cache hits never wait on it.
pub struct FaceService<B> {
    backend: Mutex<B>,
    cache: Arc<FaceCache>,
}

impl<B: RecognitionBackend> FaceService<B> {
    pub fn new(backend: B, cache: Arc<FaceCache>) -> Self {
        Self {
            backend: Mutex::new(backend),
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<FaceCache> {
        &self.cache
    }

    fn backend(&self) -> MutexGuard<'_, B> {
        self.backend.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn memoized<T: Cacheable + Clone, E>(
        &self,
        key: impl FnOnce(KeyBuilder) -> KeyBuilder,
        compute: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        let key: CacheKey = key(KeyBuilder::new(T::TAG)).finish();
        if let Some(hit) = self.cache.get(&key).and_then(T::from_cached) {
            tracing::debug!(operation = T::TAG, "cache hit");
            return Ok(hit);
        }
        tracing::debug!(operation = T::TAG, "cache miss");
        let value = compute()?;
        self.cache.insert(key, value.clone().into_cached());
        Ok(value)
    }

    /// Face locations in (top, right, bottom, left) order.
    pub fn locate_faces(
        &self,
        image: Option<&ImageInput>,
        options: LocateOptions,
    ) -> Result<Vec<FaceLocation>, FaceError> {
        let array = normalize(image)?;
        self.locate_in(&array, options)
    }

    fn locate_in(
        &self,
        array: &PixelArray,
        options: LocateOptions,
    ) -> Result<Vec<FaceLocation>, FaceError> {
        self.memoized(
            |k| k.image(array).u32(options.upsample_count).str(options.model.as_str()),
            || {
                self.backend()
                    .face_locations(array, options.upsample_count, options.model)
            },
        )
    }

    /// Like [`locate_faces`](Self::locate_faces), but when nothing is found
    /// retries once at [`RETRY_UPSAMPLE_COUNT`].
    pub fn locate_faces_with_retry(
        &self,
        image: Option<&ImageInput>,
        options: LocateOptions,
    ) -> Result<Vec<FaceLocation>, FaceError> {
        let array = normalize(image)?;
        self.locate_with_retry_in(&array, options)
    }

    fn locate_with_retry_in(
        &self,
        array: &PixelArray,
        options: LocateOptions,
    ) -> Result<Vec<FaceLocation>, FaceError> {
        let found = self.locate_in(array, options)?;
        if !found.is_empty() || options.upsample_count >= RETRY_UPSAMPLE_COUNT {
            return Ok(found);
        }
        tracing::info!(
            upsample_count = RETRY_UPSAMPLE_COUNT,
            "no faces found, trying harder"
        );
        self.locate_in(
            array,
            LocateOptions { upsample_count: RETRY_UPSAMPLE_COUNT, ..options },
        )
    }

    /// Cascade detector locations in (x, y, width, height) order.
    pub fn locate_faces_fast(
        &self,
        image: Option<&ImageInput>,
    ) -> Result<Vec<FastFaceLocation>, FaceError> {
        let array = normalize(image)?;
        self.locate_fast_in(&array)
    }

    pub(crate) fn locate_fast_in(
        &self,
        array: &PixelArray,
    ) -> Result<Vec<FastFaceLocation>, FaceError> {
        self.memoized(
            |k| k.image(array),
            || self.backend().face_locations_fast(array),
        )
    }

    pub fn encode_faces(
        &self,
        image: Option<&ImageInput>,
        options: &EncodeOptions,
    ) -> Result<Vec<FaceEncoding>, FaceError> {
        let array = normalize(image)?;
        let known = options.known_locations.as_deref();
        self.memoized(
            |k| {
                k.image(&array)
                    .locations(known)
                    .u32(options.jitter_count)
                    .str(options.model.as_str())
            },
            || {
                self.backend()
                    .face_encodings(&array, known, options.jitter_count, options.model)
            },
        )
    }

    pub fn extract_landmarks(
        &self,
        image: Option<&ImageInput>,
        options: &LandmarkOptions,
    ) -> Result<Vec<FaceLandmarks>, FaceError> {
        let array = normalize(image)?;
        self.landmarks_in(&array, options)
    }

    fn landmarks_in(
        &self,
        array: &PixelArray,
        options: &LandmarkOptions,
    ) -> Result<Vec<FaceLandmarks>, FaceError> {
        let known = options.known_locations.as_deref();
        self.memoized(
            |k| k.image(array).locations(known).str(options.model.as_str()),
            || self.backend().face_landmarks(array, known, options.model),
        )
    }

    /// One boolean per known encoding: distance to `candidate` within `tolerance`.
    ///
    /// Fails when any encoding is empty or differs in length from `candidate`.
    pub fn compare_encodings(
        &self,
        known: &[FaceEncoding],
        candidate: &FaceEncoding,
        tolerance: f32,
    ) -> Result<Vec<bool>, FaceError> {
        self.memoized(
            |k| k.encodings(known).encoding(candidate).f32(tolerance),
            || types::compare_faces(known, candidate, tolerance),
        )
    }

    /// [`compare_encodings`](Self::compare_encodings) at [`DEFAULT_TOLERANCE`].
    pub fn compare_encodings_default(
        &self,
        known: &[FaceEncoding],
        candidate: &FaceEncoding,
    ) -> Result<Vec<bool>, FaceError> {
        self.compare_encodings(known, candidate, DEFAULT_TOLERANCE)
    }

    /// Euclidean distance to `candidate`, parallel to `known`.
    pub fn encoding_distances(
        &self,
        known: &[FaceEncoding],
        candidate: &FaceEncoding,
    ) -> Result<Vec<f32>, FaceError> {
        self.memoized(
            |k| k.encodings(known).encoding(candidate),
            || types::face_distances(known, candidate),
        )
    }

    /// Detect (retrying once when nothing is found) and outline every face.
    ///
    /// With no faces the rendered output is the unmodified input.
    pub fn draw_face_boxes(
        &self,
        image: Option<&ImageInput>,
        options: LocateOptions,
        style: BoxStyle,
        format: OutputFormat,
    ) -> Result<Annotated, FaceError> {
        let array = normalize(image)?;
        let locations = self.locate_with_retry_in(&array, options)?;
        Ok(Annotated {
            rendered: render::draw_bounding_boxes(&array, &locations, style, format),
            faces: locations.len(),
        })
    }

    /// Extract landmarks and dot every point.
    pub fn draw_face_landmarks(
        &self,
        image: Option<&ImageInput>,
        options: &LandmarkOptions,
        style: DotStyle,
        format: OutputFormat,
    ) -> Result<Annotated, FaceError> {
        let array = normalize(image)?;
        let landmarks = self.landmarks_in(&array, options)?;
        Ok(Annotated {
            rendered: render::draw_landmarks(&array, &landmarks, style, format),
            faces: landmarks.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixels::ChannelOrder;
    use crate::types::{FacialFeature, Point};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts backend calls; finds one face only at upsample ≥ `min_upsample`.
    struct CountingBackend {
        calls: Arc<AtomicUsize>,
        min_upsample: u32,
    }

    impl RecognitionBackend for CountingBackend {
        fn face_locations(
            &mut self,
            _image: &PixelArray,
            upsample_count: u32,
            _model: DetectionModel,
        ) -> Result<Vec<FaceLocation>, FaceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if upsample_count >= self.min_upsample {
                Ok(vec![FaceLocation::new(2, 9, 9, 2)])
            } else {
                Ok(Vec::new())
            }
        }

        fn face_locations_fast(
            &mut self,
            _image: &PixelArray,
        ) -> Result<Vec<FastFaceLocation>, FaceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![FastFaceLocation { x: 1, y: 1, width: 4, height: 4 }])
        }

        fn face_landmarks(
            &mut self,
            _image: &PixelArray,
            known_locations: Option<&[FaceLocation]>,
            _model: LandmarkModel,
        ) -> Result<Vec<FaceLandmarks>, FaceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let n = known_locations.map_or(1, <[FaceLocation]>::len);
            let mut lm = FaceLandmarks::new();
            lm.insert(FacialFeature::NoseTip, vec![Point::new(5, 5)]);
            Ok(vec![lm; n])
        }

        fn face_encodings(
            &mut self,
            _image: &PixelArray,
            _known_locations: Option<&[FaceLocation]>,
            jitter_count: u32,
            _model: LandmarkModel,
        ) -> Result<Vec<FaceEncoding>, FaceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![FaceEncoding { values: vec![jitter_count as f32], model_version: None }])
        }
    }

    fn service(min_upsample: u32) -> (FaceService<CountingBackend>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = CountingBackend { calls: calls.clone(), min_upsample };
        (FaceService::new(backend, Arc::new(FaceCache::new(16))), calls)
    }

    fn input(pixel: [u8; 3]) -> ImageInput {
        ImageInput::Array(PixelArray::filled(12, 12, ChannelOrder::Rgb, pixel))
    }

    fn enc(v: f32) -> FaceEncoding {
        FaceEncoding { values: vec![v], model_version: None }
    }

    #[test]
    fn test_absent_image_is_invalid_input() {
        let (service, calls) = service(0);
        assert!(matches!(
            service.locate_faces(None, LocateOptions::default()),
            Err(FaceError::InvalidInput)
        ));
        assert!(matches!(service.locate_faces_fast(None), Err(FaceError::InvalidInput)));
        assert!(matches!(
            service.encode_faces(None, &EncodeOptions::default()),
            Err(FaceError::InvalidInput)
        ));
        assert!(matches!(
            service.extract_landmarks(None, &LandmarkOptions::default()),
            Err(FaceError::InvalidInput)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_repeated_call_hits_cache() {
        let (service, calls) = service(0);
        let image = input([10, 20, 30]);
        let a = service.locate_faces(Some(&image), LocateOptions::default()).unwrap();
        let b = service.locate_faces(Some(&image), LocateOptions::default()).unwrap();
        assert_eq!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.cache().stats().hits, 1);
    }

    #[test]
    fn test_changed_parameters_miss_cache() {
        let (service, calls) = service(0);
        let image = input([10, 20, 30]);
        service.locate_faces(Some(&image), LocateOptions::default()).unwrap();
        service
            .locate_faces(Some(&image), LocateOptions { upsample_count: 2, ..Default::default() })
            .unwrap();
        service
            .locate_faces(Some(&image), LocateOptions { model: DetectionModel::Cnn, ..Default::default() })
            .unwrap();
        service.locate_faces(Some(&input([10, 20, 31])), LocateOptions::default()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_equal_content_shares_entry() {
        let (service, calls) = service(0);
        service.locate_faces_fast(Some(&input([1, 1, 1]))).unwrap();
        service.locate_faces_fast(Some(&input([1, 1, 1]))).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_encode_options_are_part_of_key() {
        let (service, calls) = service(0);
        let image = input([0, 0, 0]);
        let one = service.encode_faces(Some(&image), &EncodeOptions::default()).unwrap();
        let five = service
            .encode_faces(Some(&image), &EncodeOptions { jitter_count: 5, ..Default::default() })
            .unwrap();
        assert_ne!(one, five);
        service
            .encode_faces(
                Some(&image),
                &EncodeOptions { known_locations: Some(vec![]), ..Default::default() },
            )
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_landmarks_known_locations_forwarded() {
        let (service, _) = service(0);
        let options = LandmarkOptions {
            known_locations: Some(vec![FaceLocation::new(0, 5, 5, 0); 3]),
            model: LandmarkModel::Small,
        };
        let lm = service.extract_landmarks(Some(&input([0, 0, 0])), &options).unwrap();
        assert_eq!(lm.len(), 3);
    }

    #[test]
    fn test_compare_agrees_with_distances() {
        let (service, calls) = service(0);
        let known = vec![enc(0.0), enc(0.5), enc(0.55), enc(0.7)];
        let candidate = enc(0.0);
        let distances = service.encoding_distances(&known, &candidate).unwrap();
        let matches = service.compare_encodings_default(&known, &candidate).unwrap();
        assert_eq!(matches.len(), known.len());
        for (m, d) in matches.iter().zip(&distances) {
            assert_eq!(*m, *d <= DEFAULT_TOLERANCE);
        }
        assert_eq!(matches, vec![true, true, true, false]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_tolerance_changes_key() {
        let (service, _) = service(0);
        let known = vec![enc(0.5)];
        assert_eq!(service.compare_encodings(&known, &enc(0.0), 0.6).unwrap(), vec![true]);
        assert_eq!(service.compare_encodings(&known, &enc(0.0), 0.4).unwrap(), vec![false]);
    }

    #[test]
    fn test_mismatched_encodings_fail_and_are_not_cached() {
        let (service, _) = service(0);
        let known = vec![FaceEncoding { values: vec![], model_version: None }];
        let err = service.compare_encodings_default(&known, &enc(0.0)).unwrap_err();
        assert!(matches!(err, FaceError::EmptyEncoding));

        let short = vec![enc(0.1)];
        let long = FaceEncoding { values: vec![0.1, 0.2], model_version: None };
        let err = service.encoding_distances(&short, &long).unwrap_err();
        assert!(matches!(err, FaceError::EncodingLengthMismatch { expected: 1, actual: 2 }));
        assert!(service.cache().is_empty());
    }

    #[test]
    fn test_retry_tries_harder_once() {
        let (service, calls) = service(RETRY_UPSAMPLE_COUNT);
        let found = service
            .locate_faces_with_retry(Some(&input([0, 0, 0])), LocateOptions::default())
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retry_skipped_when_found() {
        let (service, calls) = service(0);
        service
            .locate_faces_with_retry(Some(&input([0, 0, 0])), LocateOptions::default())
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_draw_face_boxes_without_faces_returns_input() {
        let (service, _) = service(u32::MAX);
        let image = input([7, 8, 9]);
        let annotated = service
            .draw_face_boxes(Some(&image), LocateOptions::default(), BoxStyle::default(), OutputFormat::Array)
            .unwrap();
        assert_eq!(annotated.faces, 0);
        match (annotated.rendered, &image) {
            (Rendered::Array(out), ImageInput::Array(original)) => assert_eq!(&out, original),
            _ => panic!("expected array output"),
        }
    }

    #[test]
    fn test_shared_cache_between_services() {
        let cache = Arc::new(FaceCache::new(8));
        let calls = Arc::new(AtomicUsize::new(0));
        let a = FaceService::new(CountingBackend { calls: calls.clone(), min_upsample: 0 }, cache.clone());
        let b = FaceService::new(CountingBackend { calls: calls.clone(), min_upsample: 0 }, cache);
        let image = input([3, 3, 3]);
        a.locate_faces_fast(Some(&image)).unwrap();
        b.locate_faces_fast(Some(&image)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    fn assert_sync<T: Sync>() {}

    #[test]
    fn test_service_is_sync() {
        assert_sync::<FaceService<CountingBackend>>();
        assert_sync::<FaceService<crate::backend::OnnxBackend>>();
        assert_sync::<FaceCache>();
    }

    #[test]
    fn test_concurrent_callers_share_one_cache() {
        const THREADS: usize = 8;
        const CALLS_PER_THREAD: usize = 4;
        let (service, calls) = service(0);
        let image = input([7, 7, 7]);

        let results: Vec<Vec<FaceLocation>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(|| {
                        (0..CALLS_PER_THREAD)
                            .map(|_| {
                                service
                                    .locate_faces(Some(&image), LocateOptions::default())
                                    .unwrap()
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.len(), THREADS * CALLS_PER_THREAD);
        assert!(results.iter().all(|r| r == &results[0]));
        let stats = service.cache().stats();
        assert_eq!(stats.hits + stats.misses, (THREADS * CALLS_PER_THREAD) as u64);
        assert_eq!(stats.misses as usize, calls.load(Ordering::SeqCst));
        assert_eq!(stats.entries, 1);
    }
}
