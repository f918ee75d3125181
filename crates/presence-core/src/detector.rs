//! SCRFD face detector via ONNX Runtime.
//!
//! Runs the 3-stride anchor-free SCRFD head on an RGB photo and keeps only
//! the single most confident face. Images are resized to fit the 640×640
//! input, anchored at the top-left corner, and the rest is mean-padded.

use crate::types::FaceDetection;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("image has zero width or height")]
    EmptyImage,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

pub struct FaceDetector {
    session: Session,
    stride_outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD with keypoints needs 9 outputs, model has {}",
                output_names.len()
            )));
        }

        let stride_outputs = map_outputs(&output_names);
        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            ?stride_outputs,
            "loaded SCRFD model"
        );

        Ok(Self {
            session,
            stride_outputs,
        })
    }

    /// Detect the most confident face, if any scores above the threshold.
    pub fn detect_best(&mut self, image: &RgbImage) -> Result<Option<FaceDetection>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectorError::EmptyImage);
        }

        let (input, scale) = preprocess(image);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut best: Option<FaceDetection> = None;
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_outputs[pos];
            let tensor = |idx: usize, what: &'static str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                    })
            };
            let heads = StrideHeads {
                scores: tensor(score_idx, "scores")?,
                bboxes: tensor(bbox_idx, "bboxes")?,
                kps: tensor(kps_idx, "kps")?,
            };

            if let Some(face) = best_in_stride(&heads, stride, scale) {
                if best.as_ref().map_or(true, |b| face.confidence > b.confidence) {
                    best = Some(face);
                }
            }
        }

        Ok(best)
    }
}

/// Resize to fit the model input, keeping aspect ratio.
///
/// Returns the NCHW tensor and the factor from original to model coordinates.
fn preprocess(image: &RgbImage) -> (Array4<f32>, f32) {
    let size = SCRFD_INPUT_SIZE as usize;
    let scale = (SCRFD_INPUT_SIZE as f32 / image.width() as f32)
        .min(SCRFD_INPUT_SIZE as f32 / image.height() as f32);
    let new_w = ((image.width() as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let new_h = ((image.height() as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    // Padding stays at 0.0, i.e. the mean after normalization.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, scale)
}

/// Map output tensors to stride slots, by name when the export names them
/// (`score_8`, `bbox_16`, `kps_32`, ...), otherwise by the standard position
/// order: scores 0-2, bboxes 3-5, keypoints 6-8.
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |head: &str, stride: usize| {
        let wanted = format!("{head}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let by_name: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match by_name {
        Some(v) => [v[0], v[1], v[2]],
        None => [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
    }
}

struct StrideHeads<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// Highest-scoring anchor of one stride, decoded into original image coordinates.
fn best_in_stride(heads: &StrideHeads<'_>, stride: usize, scale: f32) -> Option<FaceDetection> {
    let grid_w = SCRFD_INPUT_SIZE as usize / stride;
    let grid_h = SCRFD_INPUT_SIZE as usize / stride;
    let anchors = (grid_w * grid_h * SCRFD_ANCHORS_PER_CELL).min(heads.scores.len());

    let (idx, score) = heads.scores[..anchors]
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, s)| *s > SCRFD_CONFIDENCE_THRESHOLD)
        .fold(None::<(usize, f32)>, |best, (i, s)| match best {
            Some((_, bs)) if bs >= s => best,
            _ => Some((i, s)),
        })?;

    let bbox = heads.bboxes.get(idx * 4..idx * 4 + 4)?;
    let kps = heads.kps.get(idx * 10..idx * 10 + 10)?;

    let cell = idx / SCRFD_ANCHORS_PER_CELL;
    let stride_f = stride as f32;
    let anchor_x = (cell % grid_w) as f32 * stride_f;
    let anchor_y = (cell / grid_w) as f32 * stride_f;
    let to_image = |v: f32| v / scale;

    let x1 = to_image(anchor_x - bbox[0] * stride_f);
    let y1 = to_image(anchor_y - bbox[1] * stride_f);
    let x2 = to_image(anchor_x + bbox[2] * stride_f);
    let y2 = to_image(anchor_y + bbox[3] * stride_f);

    let landmarks = std::array::from_fn(|i| {
        (
            to_image(anchor_x + kps[i * 2] * stride_f),
            to_image(anchor_y + kps[i * 2 + 1] * stride_f),
        )
    });

    Some(FaceDetection {
        x: x1,
        y: y1,
        width: x2 - x1,
        height: y2 - y1,
        confidence: score,
        landmarks,
    })
}
