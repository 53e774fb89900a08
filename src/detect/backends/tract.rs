#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use tract_onnx::prelude::*;

use crate::config::DetectorSettings;
use crate::detect::backend::DetectorBackend;
use crate::frame::Frame;
use crate::scene::{BoundingBox, Detection};

/// Tract-based backend for YOLO-style ONNX object detectors.
///
/// Accepts the two common export layouts:
/// - v5: `[1, N, 5 + C]` rows of `cx, cy, w, h, objectness, class scores...`
/// - v8: `[1, 4 + C, N]` columns of `cx, cy, w, h, class scores...`
///
/// Frames are resized to the model input, and boxes are scaled back to frame
/// pixels. The backend does no network I/O and writes nothing to disk.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    labels: Vec<String>,
    width: u32,
    height: u32,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        log::info!(
            "TractBackend: loaded {} ({}x{} input)",
            model_path.display(),
            width,
            height
        );
        Ok(Self {
            model,
            labels: Vec::new(),
            width,
            height,
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
        })
    }

    pub fn from_settings(settings: &DetectorSettings) -> Result<Self> {
        let model_path = settings
            .model_path
            .as_ref()
            .ok_or_else(|| anyhow!("the tract detector requires a model path"))?;
        let mut backend = Self::new(model_path, settings.input_width, settings.input_height)?
            .with_thresholds(settings.confidence_threshold, settings.iou_threshold);
        if let Some(labels_path) = &settings.labels_path {
            backend = backend.with_labels(load_labels(labels_path)?);
        }
        Ok(backend)
    }

    /// Override the default confidence and overlap thresholds.
    pub fn with_thresholds(mut self, confidence: f32, iou: f32) -> Self {
        self.confidence_threshold = confidence;
        self.iou_threshold = iou;
        self
    }

    /// Class names indexed by class id.
    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let rgb = image::RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match {}", frame.resolution()))?;
        let resized = if frame.width == self.width && frame.height == self.height {
            rgb
        } else {
            image::imageops::resize(&rgb, self.width, self.height, FilterType::Triangle)
        };

        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        );

        Ok(input.into_tensor())
    }

    fn label_for(&self, class_id: usize) -> String {
        self.labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let scores = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output is not rank 3")?;

        let candidates = decode_yolo(&scores, self.confidence_threshold)?;
        let kept = non_max_suppression(candidates, self.iou_threshold);

        let scale_x = frame.width as f32 / self.width as f32;
        let scale_y = frame.height as f32 / self.height as f32;
        let max_x = frame.width as f64;
        let max_y = frame.height as f64;

        let mut detections = Vec::with_capacity(kept.len());
        for candidate in kept {
            let [x_min, y_min, x_max, y_max] = candidate.corners;
            let bbox = BoundingBox::new(
                ((x_min * scale_x) as f64).clamp(0.0, max_x),
                ((y_min * scale_y) as f64).clamp(0.0, max_y),
                ((x_max * scale_x) as f64).clamp(0.0, max_x),
                ((y_max * scale_y) as f64).clamp(0.0, max_y),
            );
            // Boxes entirely outside the frame collapse when clamped.
            let Ok(bbox) = bbox else {
                log::debug!("TractBackend: dropped degenerate box {:?}", candidate.corners);
                continue;
            };
            let confidence = (candidate.score as f64).clamp(0.0, 1.0);
            detections.push(Detection::new(
                self.label_for(candidate.class_id),
                confidence,
                bbox,
            )?);
        }
        Ok(detections)
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Candidate {
    class_id: usize,
    score: f32,
    /// x_min, y_min, x_max, y_max in model input pixels.
    corners: [f32; 4],
}

fn decode_yolo(output: &tract_ndarray::ArrayView3<f32>, threshold: f32) -> Result<Vec<Candidate>> {
    let (_, rows, cols) = output.dim();
    // v8 exports put the attributes first and the anchors last.
    let attributes_first = rows < cols;
    let (anchors, attributes) = if attributes_first {
        (cols, rows)
    } else {
        (rows, cols)
    };
    let v5 = !attributes_first;
    let class_offset = if v5 { 5 } else { 4 };
    if attributes <= class_offset {
        return Err(anyhow!(
            "model output has {} attributes per anchor, expected more than {}",
            attributes,
            class_offset
        ));
    }

    let at = |anchor: usize, attribute: usize| -> f32 {
        if attributes_first {
            output[[0, attribute, anchor]]
        } else {
            output[[0, anchor, attribute]]
        }
    };

    let mut candidates = Vec::new();
    for anchor in 0..anchors {
        let objectness = if v5 { at(anchor, 4) } else { 1.0 };
        let (class_id, class_score) = (class_offset..attributes)
            .map(|attribute| (attribute - class_offset, at(anchor, attribute)))
            .fold((0, f32::NEG_INFINITY), |best, next| {
                if next.1 > best.1 {
                    next
                } else {
                    best
                }
            });
        let score = objectness * class_score;
        if !score.is_finite() || score < threshold {
            continue;
        }
        let (cx, cy, w, h) = (at(anchor, 0), at(anchor, 1), at(anchor, 2), at(anchor, 3));
        candidates.push(Candidate {
            class_id,
            score,
            corners: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
        });
    }
    Ok(candidates)
}

/// Greedy per-class suppression, highest score first.
fn non_max_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && iou(&k.corners, &candidate.corners) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let intersection = ix * iy;
    let union = (a[2] - a[0]) * (a[3] - a[1]) + (b[2] - b[0]) * (b[3] - b[1]) - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

fn load_labels(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read labels file {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}
