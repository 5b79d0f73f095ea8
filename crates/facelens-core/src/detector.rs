//! SCRFD face detector via ONNX Runtime.
//!
//! Implements the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) model with 3-stride anchor-free decoding and NMS post-processing.
//! The network input is square; its side grows with the upsample count so
//! smaller faces survive the letterbox resize.

use crate::pixels::PixelArray;
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const SCRFD_BASE_INPUT_SIZE: usize = 320;
const SCRFD_MAX_UPSAMPLE: u32 = 4;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download from insightface and place it in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// Square network input side for a given upsample count: 320 · 2ⁿ, n ≤ 4.
pub fn input_size_for(upsample_count: u32) -> usize {
    SCRFD_BASE_INPUT_SIZE << upsample_count.min(SCRFD_MAX_UPSAMPLE)
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    /// Per-stride output indices [(score, bbox, kps)] for strides [8, 16, 32].
    /// Discovered by name at load time; falls back to positional ordering.
    stride_indices: [StrideOutputIndices; 3],
}

impl FaceDetector {
    /// Load a SCRFD ONNX model from the given path.
    ///
    /// The model must accept a dynamic input side (all insightface exports do).
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if num_outputs < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {num_outputs}"
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            stride_indices,
        })
    }

    /// Detect faces, returning boxes in image coordinates sorted by confidence.
    pub fn detect(
        &mut self,
        image: &PixelArray,
        upsample_count: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let input_size = input_size_for(upsample_count);
        let (input, letterbox) = preprocess(image, input_size);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all_detections = Vec::new();

        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

            let dets = decode_stride(
                scores,
                bboxes,
                kps,
                stride,
                input_size,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            );
            all_detections.extend(dets);
        }

        // nms keeps confidence order
        let result = nms(all_detections, SCRFD_NMS_THRESHOLD);

        tracing::debug!(faces = result.len(), input_size, "SCRFD detection done");
        Ok(result)
    }
}

fn letterbox_for(width: usize, height: usize, input_size: usize) -> (LetterboxInfo, usize, usize) {
    let scale_w = input_size as f32 / width as f32;
    let scale_h = input_size as f32 / height as f32;
    let scale = scale_w.min(scale_h);

    let new_w = ((width as f32 * scale).round() as usize).clamp(1, input_size);
    let new_h = ((height as f32 * scale).round() as usize).clamp(1, input_size);
    let pad_x = (input_size - new_w) as f32 / 2.0;
    let pad_y = (input_size - new_h) as f32 / 2.0;

    (LetterboxInfo { scale, pad_x, pad_y }, new_w, new_h)
}

/// Letterbox an image into a square NCHW RGB float tensor.
fn preprocess(image: &PixelArray, input_size: usize) -> (Array4<f32>, LetterboxInfo) {
    let (letterbox, new_w, new_h) =
        letterbox_for(image.width() as usize, image.height() as usize, input_size);

    let rgb = image.to_rgb_image();
    let resized = imageops::resize(&rgb, new_w as u32, new_h as u32, FilterType::Triangle);

    let pad_x_start = letterbox.pad_x.floor() as usize;
    let pad_y_start = letterbox.pad_y.floor() as usize;

    // Pad value SCRFD_MEAN normalizes to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, input_size, input_size));

    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = x as usize + pad_x_start;
        let ty = y as usize + pad_y_start;
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, letterbox)
}

/// Discover output tensor ordering by name.
///
/// SCRFD models may export tensors with named outputs ("score_8", "bbox_16", ...) or
/// generic numeric names. If the named pattern is present, maps them to stride slots.
/// Otherwise falls back to the standard positional ordering:
///   [0-2] = scores (strides 8, 16, 32)
///   [3-5] = bboxes (strides 8, 16, 32)
///   [6-8] = kps    (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match named {
        Some(indices) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [indices[0], indices[1], indices[2]]
        }
        None => {
            tracing::info!(
                ?names,
                "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes, [6-8]=kps"
            );
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Decode detections for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = input_size / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let unmap = |x: f32, y: f32| -> (f32, f32) {
        (
            (x - letterbox.pad_x) / letterbox.scale,
            (y - letterbox.pad_y) / letterbox.scale,
        )
    };

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid) as f32 * s;
        let anchor_cy = (anchor_idx / grid) as f32 * s;

        // bbox: [left, top, right, bottom] distances from the anchor, in strides
        let bbox_off = idx * 4;
        if bbox_off + 3 >= bboxes.len() {
            continue;
        }
        let (x1, y1) = unmap(
            anchor_cx - bboxes[bbox_off] * s,
            anchor_cy - bboxes[bbox_off + 1] * s,
        );
        let (x2, y2) = unmap(
            anchor_cx + bboxes[bbox_off + 2] * s,
            anchor_cy + bboxes[bbox_off + 3] * s,
        );

        let kps_off = idx * 10;
        let landmarks = if kps_off + 9 < kps.len() {
            let mut lms = [(0.0f32, 0.0f32); 5];
            for (i, lm) in lms.iter_mut().enumerate() {
                *lm = unmap(
                    anchor_cx + kps[kps_off + i * 2] * s,
                    anchor_cy + kps[kps_off + i * 2 + 1] * s,
                );
            }
            Some(lms)
        } else {
            None
        };

        detections.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }

    detections
}

/// Non-Maximum Suppression: remove overlapping detections.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());

        for j in (i + 1)..detections.len() {
            if !suppressed[j] && iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Intersection-over-Union between two bounding boxes.
pub(crate) fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union_area = a.width * a.height + b.width * b.height - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
