use crate::error::FaceError;
use crate::pixels::ChannelOrder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Raw detector output in floating-point (x, y, width, height) form, with
/// optional five-point keypoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Round to pixel coordinates and trim to the image bounds.
    pub fn to_location(&self, width: u32, height: u32) -> FaceLocation {
        FaceLocation {
            top: self.y.round() as i32,
            right: (self.x + self.width).round() as i32,
            bottom: (self.y + self.height).round() as i32,
            left: self.x.round() as i32,
        }
        .trimmed(width, height)
    }
}

/// Face rectangle in (top, right, bottom, left) order, as produced by the
/// accurate detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaceLocation {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

impl FaceLocation {
    pub fn new(top: i32, right: i32, bottom: i32, left: i32) -> Self {
        Self { top, right, bottom, left }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    /// Clamp every edge into `[0, width) × [0, height)`.
    pub fn trimmed(&self, width: u32, height: u32) -> FaceLocation {
        let max_x = (width as i32 - 1).max(0);
        let max_y = (height as i32 - 1).max(0);
        FaceLocation {
            top: self.top.clamp(0, max_y),
            right: self.right.clamp(0, max_x),
            bottom: self.bottom.clamp(0, max_y),
            left: self.left.clamp(0, max_x),
        }
    }
}

/// Face rectangle in (x, y, width, height) order, as produced by the fast
/// cascade detector. Convert explicitly before mixing with [`FaceLocation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FastFaceLocation {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl From<FastFaceLocation> for FaceLocation {
    fn from(f: FastFaceLocation) -> Self {
        FaceLocation {
            top: f.y,
            right: f.x + f.width,
            bottom: f.y + f.height,
            left: f.x,
        }
    }
}

impl From<FaceLocation> for FastFaceLocation {
    fn from(l: FaceLocation) -> Self {
        FastFaceLocation {
            x: l.left,
            y: l.top,
            width: l.width(),
            height: l.height(),
        }
    }
}

/// Face encoding vector (128-dimensional for the bundled encoder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEncoding {
    pub values: Vec<f32>,
    /// Model version that produced this encoding. Encodings from different
    /// models are not comparable.
    pub model_version: Option<String>,
}

impl FaceEncoding {
    /// Euclidean distance between two encodings.
    ///
    /// Both must be non-empty and of equal length.
    pub fn distance(&self, other: &FaceEncoding) -> Result<f32, FaceError> {
        if self.values.is_empty() || other.values.is_empty() {
            return Err(FaceError::EmptyEncoding);
        }
        if self.values.len() != other.values.len() {
            return Err(FaceError::EncodingLengthMismatch {
                expected: self.values.len(),
                actual: other.values.len(),
            });
        }
        Ok(self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt())
    }
}

/// Default match tolerance. Lower is stricter.
pub const DEFAULT_TOLERANCE: f32 = 0.6;

/// Distance from `candidate` to every known encoding, in the order of `known`.
pub fn face_distances(
    known: &[FaceEncoding],
    candidate: &FaceEncoding,
) -> Result<Vec<f32>, FaceError> {
    known.iter().map(|k| k.distance(candidate)).collect()
}

/// One boolean per known encoding: true when its distance is within `tolerance`.
///
/// Derived from [`face_distances`] so the two can never disagree.
pub fn compare_faces(
    known: &[FaceEncoding],
    candidate: &FaceEncoding,
    tolerance: f32,
) -> Result<Vec<bool>, FaceError> {
    Ok(face_distances(known, candidate)?
        .into_iter()
        .map(|d| d <= tolerance)
        .collect())
}

/// Integer pixel coordinate of a landmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub(crate) fn from_f32((x, y): (f32, f32)) -> Self {
        Self {
            x: x.round() as i32,
            y: y.round() as i32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacialFeature {
    Chin,
    LeftEyebrow,
    RightEyebrow,
    NoseBridge,
    NoseTip,
    LeftEye,
    RightEye,
    TopLip,
    BottomLip,
}

/// Named facial features of one face, each an ordered run of points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceLandmarks {
    features: BTreeMap<FacialFeature, Vec<Point>>,
}

impl FaceLandmarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, feature: FacialFeature, points: Vec<Point>) {
        self.features.insert(feature, points);
    }

    pub fn get(&self, feature: FacialFeature) -> Option<&[Point]> {
        self.features.get(&feature).map(Vec::as_slice)
    }

    pub fn features(&self) -> impl Iterator<Item = (FacialFeature, &[Point])> {
        self.features.iter().map(|(f, p)| (*f, p.as_slice()))
    }

    /// Every point of every feature.
    pub fn points(&self) -> impl Iterator<Item = Point> + '_ {
        self.features.values().flatten().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

#[derive(Debug, Error)]
#[error("unknown {kind} model: {value:?} (expected one of {expected})")]
pub struct ParseModelError {
    kind: &'static str,
    value: String,
    expected: &'static str,
}

/// Detector network used by `locate_faces`.
///
/// `Hog` keeps the historical name of the fast CPU choice and selects the
/// light network; `Cnn` selects the heavier, more accurate one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionModel {
    #[default]
    Hog,
    Cnn,
}

impl DetectionModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionModel::Hog => "hog",
            DetectionModel::Cnn => "cnn",
        }
    }
}

impl FromStr for DetectionModel {
    type Err = ParseModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hog" => Ok(DetectionModel::Hog),
            "cnn" => Ok(DetectionModel::Cnn),
            _ => Err(ParseModelError {
                kind: "detection",
                value: s.to_string(),
                expected: "hog, cnn",
            }),
        }
    }
}

impl fmt::Display for DetectionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Landmark model: 68 points (`Large`) or 5 points (`Small`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LandmarkModel {
    Large,
    Small,
}

impl LandmarkModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LandmarkModel::Large => "large",
            LandmarkModel::Small => "small",
        }
    }
}

impl FromStr for LandmarkModel {
    type Err = ParseModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "large" => Ok(LandmarkModel::Large),
            "small" => Ok(LandmarkModel::Small),
            _ => Err(ParseModelError {
                kind: "landmark",
                value: s.to_string(),
                expected: "large, small",
            }),
        }
    }
}

impl fmt::Display for LandmarkModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drawing color, always given as RGB regardless of the target array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const GREEN: Color = Color::rgb(0, 255, 0);
    pub const BLUE: Color = Color::rgb(0, 0, 255);
    pub const RED: Color = Color::rgb(255, 0, 0);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Channel triple laid out for an array in `order`.
    pub fn in_order(self, order: ChannelOrder) -> [u8; 3] {
        match order {
            ChannelOrder::Rgb => [self.r, self.g, self.b],
            ChannelOrder::Bgr => [self.b, self.g, self.r],
        }
    }
}

#[derive(Debug, Error)]
#[error("invalid color {0:?} (expected \"r,g,b\" with values 0-255)")]
pub struct ParseColorError(String);

impl FromStr for Color {
    type Err = ParseColorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<u8> = s
            .split(',')
            .map(|p| p.trim().parse::<u8>())
            .collect::<Result<_, _>>()
            .map_err(|_| ParseColorError(s.to_string()))?;
        match parts.as_slice() {
            [r, g, b] => Ok(Color::rgb(*r, *g, *b)),
            _ => Err(ParseColorError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(values: &[f32]) -> FaceEncoding {
        FaceEncoding { values: values.to_vec(), model_version: None }
    }

    #[test]
    fn test_distance_identical_is_zero() {
        let a = enc(&[0.1, 0.2, 0.3]);
        assert!(a.distance(&a).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_distance_euclidean() {
        let a = enc(&[0.0, 0.0]);
        let b = enc(&[3.0, 4.0]);
        assert!((a.distance(&b).unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_distances_parallel_to_known() {
        let known = vec![enc(&[0.0, 0.0]), enc(&[1.0, 0.0]), enc(&[0.0, 2.0])];
        let d = face_distances(&known, &enc(&[0.0, 0.0])).unwrap();
        assert_eq!(d.len(), 3);
        assert!((d[0] - 0.0).abs() < 1e-6);
        assert!((d[1] - 1.0).abs() < 1e-6);
        assert!((d[2] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_compare_agrees_with_distances() {
        let known = vec![enc(&[0.0]), enc(&[0.59]), enc(&[0.6]), enc(&[0.61]), enc(&[5.0])];
        let candidate = enc(&[0.0]);
        for tolerance in [0.0, 0.3, 0.6, 1.0] {
            let matches = compare_faces(&known, &candidate, tolerance).unwrap();
            let distances = face_distances(&known, &candidate).unwrap();
            for (m, d) in matches.iter().zip(distances.iter()) {
                assert_eq!(*m, *d <= tolerance);
            }
        }
    }

    #[test]
    fn test_compare_empty_known() {
        assert!(compare_faces(&[], &enc(&[1.0]), DEFAULT_TOLERANCE).unwrap().is_empty());
    }

    #[test]
    fn test_empty_encoding_never_matches() {
        let err = compare_faces(&[enc(&[])], &enc(&[0.3, 0.4]), DEFAULT_TOLERANCE).unwrap_err();
        assert!(matches!(err, FaceError::EmptyEncoding));
        assert!(matches!(enc(&[0.1]).distance(&enc(&[])), Err(FaceError::EmptyEncoding)));
    }

    #[test]
    fn test_shorter_encoding_rejected_not_prefix_matched() {
        let mut long = vec![0.1, 0.2];
        long.extend(std::iter::repeat(0.9).take(126));
        let err = face_distances(&[enc(&[0.1, 0.2])], &enc(&long)).unwrap_err();
        assert!(matches!(
            err,
            FaceError::EncodingLengthMismatch { expected: 2, actual: 128 }
        ));
    }

    #[test]
    fn test_fast_location_conversion() {
        let fast = FastFaceLocation { x: 10, y: 20, width: 30, height: 40 };
        let css = FaceLocation::from(fast);
        assert_eq!(css, FaceLocation::new(20, 40, 60, 10));
        assert_eq!(FastFaceLocation::from(css), fast);
    }

    #[test]
    fn test_bounding_box_to_location_trims() {
        let bbox = BoundingBox {
            x: -5.4,
            y: 10.6,
            width: 200.0,
            height: 50.0,
            confidence: 0.9,
            landmarks: None,
        };
        let loc = bbox.to_location(100, 100);
        assert_eq!(loc, FaceLocation::new(11, 99, 61, 0));
    }

    #[test]
    fn test_model_parsing() {
        assert_eq!("hog".parse::<DetectionModel>().unwrap(), DetectionModel::Hog);
        assert_eq!("CNN".parse::<DetectionModel>().unwrap(), DetectionModel::Cnn);
        assert!("dlib".parse::<DetectionModel>().is_err());
        assert_eq!("small".parse::<LandmarkModel>().unwrap(), LandmarkModel::Small);
        assert!("medium".parse::<LandmarkModel>().is_err());
    }

    #[test]
    fn test_color_parsing_and_order() {
        let c: Color = "255, 0, 10".parse().unwrap();
        assert_eq!(c, Color::rgb(255, 0, 10));
        assert_eq!(c.in_order(ChannelOrder::Bgr), [10, 0, 255]);
        assert!("1,2".parse::<Color>().is_err());
        assert!("1,2,300".parse::<Color>().is_err());
    }

    #[test]
    fn test_landmarks_serialize_as_feature_map() {
        let mut lm = FaceLandmarks::new();
        lm.insert(FacialFeature::NoseTip, vec![Point::new(1, 2)]);
        let json = serde_json::to_string(&lm).unwrap();
        assert_eq!(json, r#"{"nose_tip":[{"x":1,"y":2}]}"#);
    }
}
