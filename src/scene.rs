//! Scene and detection records.
//!
//! A `Scene` is one capture session. A `Detection` is one recognized object in a frame
//! of that session. Field domains are checked where values enter the crate, so a
//! `Detection` that exists always satisfies `0 <= confidence <= 1`, `x_min < x_max`
//! and `y_min < y_max`.

use std::sync::OnceLock;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub type SceneId = i64;
pub type DetectionId = i64;

/// Allowed: "webcam", "cam_002", "rtsp_stream", "lobby.north:1"
/// Disallowed: empty, whitespace, slashes, anything over 64 characters.
pub fn validate_camera_id(camera_id: &str) -> Result<(), ValidationError> {
    static CAMERA_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = CAMERA_ID_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9_.:-]{1,64}$").expect("camera id pattern is valid")
    });
    if !re.is_match(camera_id) {
        return Err(ValidationError::new(
            "camera_id must match ^[A-Za-z0-9_.:-]{1,64}$",
        ));
    }
    Ok(())
}

/// Resolution strings are `<width>x<height>`, e.g. "1920x1080".
pub fn validate_resolution(resolution: &str) -> Result<(), ValidationError> {
    static RESOLUTION_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RESOLUTION_RE.get_or_init(|| {
        regex::Regex::new(r"^[1-9][0-9]{0,5}x[1-9][0-9]{0,5}$").expect("resolution pattern is valid")
    });
    if !re.is_match(resolution) {
        return Err(ValidationError::new(format!(
            "resolution '{}' must look like 1920x1080",
            resolution
        )));
    }
    Ok(())
}

pub fn validate_latitude(latitude: f64) -> Result<(), ValidationError> {
    if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
        return Err(ValidationError::new("latitude must be within [-90, 90]"));
    }
    Ok(())
}

pub fn validate_longitude(longitude: f64) -> Result<(), ValidationError> {
    if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
        return Err(ValidationError::new("longitude must be within [-180, 180]"));
    }
    Ok(())
}

/// Timestamps are stored with a fixed width so text order equals time order.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| ValidationError::new(format!("invalid timestamp '{}': {}", raw, e)))
}

// -------------------- Scenes --------------------

/// Optional, caller-supplied metadata for a new scene.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneMetadata {
    pub camera_id: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub resolution: Option<String>,
}

impl SceneMetadata {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(camera_id) = &self.camera_id {
            validate_camera_id(camera_id)?;
        }
        if let Some(latitude) = self.latitude {
            validate_latitude(latitude)?;
        }
        if let Some(longitude) = self.longitude {
            validate_longitude(longitude)?;
        }
        if let Some(resolution) = &self.resolution {
            validate_resolution(resolution)?;
        }
        Ok(())
    }
}

/// Fields of a scene before the store assigns its identifier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewScene {
    pub timestamp: DateTime<Utc>,
    pub camera_id: String,
    /// File path, synthesized stream tag, or source URL.
    pub media_path: String,
    pub resolution: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl NewScene {
    pub fn new(camera_id: impl Into<String>, media_path: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            camera_id: camera_id.into(),
            media_path: media_path.into(),
            resolution: None,
            latitude: None,
            longitude: None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_camera_id(&self.camera_id)?;
        if self.media_path.trim().is_empty() {
            return Err(ValidationError::new("media_path must not be empty"));
        }
        if let Some(resolution) = &self.resolution {
            validate_resolution(resolution)?;
        }
        if let Some(latitude) = self.latitude {
            validate_latitude(latitude)?;
        }
        if let Some(longitude) = self.longitude {
            validate_longitude(longitude)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub id: SceneId,
    pub timestamp: DateTime<Utc>,
    pub camera_id: String,
    pub media_path: String,
    pub resolution: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Partial update of scene metadata. `None` leaves the column untouched.
///
/// Timestamp, camera id and media reference are set once at creation and are not
/// part of this type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneUpdate {
    pub resolution: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl SceneUpdate {
    pub fn is_empty(&self) -> bool {
        self.resolution.is_none() && self.latitude.is_none() && self.longitude.is_none()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(resolution) = &self.resolution {
            validate_resolution(resolution)?;
        }
        if let Some(latitude) = self.latitude {
            validate_latitude(latitude)?;
        }
        if let Some(longitude) = self.longitude {
            validate_longitude(longitude)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SceneFilter {
    /// Inclusive lower bound on capture time.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on capture time.
    pub until: Option<DateTime<Utc>>,
    pub camera_id: Option<String>,
    pub limit: Option<usize>,
}

// -------------------- Detections --------------------

/// Axis-aligned box in pixel coordinates of the source frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawBox")]
pub struct BoundingBox {
    x_min: f64,
    y_min: f64,
    x_max: f64,
    y_max: f64,
}

#[derive(Deserialize)]
struct RawBox {
    x_min: f64,
    y_min: f64,
    x_max: f64,
    y_max: f64,
}

impl TryFrom<RawBox> for BoundingBox {
    type Error = ValidationError;

    fn try_from(raw: RawBox) -> Result<Self, Self::Error> {
        BoundingBox::new(raw.x_min, raw.y_min, raw.x_max, raw.y_max)
    }
}

impl BoundingBox {
    pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Result<Self, ValidationError> {
        if ![x_min, y_min, x_max, y_max].iter().all(|v| v.is_finite()) {
            return Err(ValidationError::new("bounding box coordinates must be finite"));
        }
        if x_min >= x_max || y_min >= y_max {
            return Err(ValidationError::new(format!(
                "bounding box [{}, {}, {}, {}] must have x_min < x_max and y_min < y_max",
                x_min, y_min, x_max, y_max
            )));
        }
        Ok(Self {
            x_min,
            y_min,
            x_max,
            y_max,
        })
    }

    pub fn x_min(&self) -> f64 {
        self.x_min
    }

    pub fn y_min(&self) -> f64 {
        self.y_min
    }

    pub fn x_max(&self) -> f64 {
        self.x_max
    }

    pub fn y_max(&self) -> f64 {
        self.y_max
    }

    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> f64 {
        self.y_max - self.y_min
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let ix = (self.x_max.min(other.x_max) - self.x_min.max(other.x_min)).max(0.0);
        let iy = (self.y_max.min(other.y_max) - self.y_min.max(other.y_min)).max(0.0);
        let inter = ix * iy;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.x_min, self.y_min, self.x_max, self.y_max]
    }
}

fn validate_confidence(confidence: f64) -> Result<(), ValidationError> {
    if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
        return Err(ValidationError::new(format!(
            "confidence {} must be within [0, 1]",
            confidence
        )));
    }
    Ok(())
}

fn validate_label(label: &str) -> Result<(), ValidationError> {
    if label.trim().is_empty() {
        return Err(ValidationError::new("class label must not be empty"));
    }
    Ok(())
}

/// One detection produced by the detection adapter, not yet persisted.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    #[serde(rename = "class")]
    label: String,
    confidence: f64,
    #[serde(flatten)]
    bbox: BoundingBox,
}

impl Detection {
    pub fn new(
        label: impl Into<String>,
        confidence: f64,
        bbox: BoundingBox,
    ) -> Result<Self, ValidationError> {
        let label = label.into();
        validate_label(&label)?;
        validate_confidence(confidence)?;
        Ok(Self {
            label,
            confidence,
            bbox,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }
}

/// A persisted detection row.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StoredDetection {
    pub id: DetectionId,
    pub scene_id: SceneId,
    #[serde(flatten)]
    pub detection: Detection,
}

/// Partial administrative update of a detection. The merged record is re-validated.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionUpdate {
    pub label: Option<String>,
    pub confidence: Option<f64>,
    pub bbox: Option<BoundingBox>,
}

impl DetectionUpdate {
    pub fn is_empty(&self) -> bool {
        self.label.is_none() && self.confidence.is_none() && self.bbox.is_none()
    }

    pub(crate) fn apply(&self, current: &Detection) -> Result<Detection, ValidationError> {
        Detection::new(
            self.label.clone().unwrap_or_else(|| current.label.clone()),
            self.confidence.unwrap_or(current.confidence),
            self.bbox.unwrap_or(current.bbox),
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionFilter {
    pub scene_id: Option<SceneId>,
    pub class_label: Option<String>,
    /// Inclusive.
    pub min_confidence: Option<f64>,
    pub limit: Option<usize>,
}
