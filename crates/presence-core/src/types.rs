use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Storage tag for the only element encoding we write: little-endian IEEE-754 f32.
pub const EMBEDDING_DTYPE_F32LE: &str = "f32le";

/// Role assigned when enrollment does not name one.
pub const DEFAULT_ROLE: &str = "employee";

/// Department assigned when enrollment does not name one.
pub const DEFAULT_DEPARTMENT: &str = "General";

/// Bounding box for a detected face, with the five alignment landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceDetection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: [(f32, f32); 5],
}

/// Face embedding vector (512-dimensional for ArcFace w600k_r50).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>, model_version: impl Into<String>) -> Self {
        Self {
            values,
            model_version: Some(model_version.into()),
        }
    }

    /// An embedding with no declared model version.
    pub fn untagged(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean norm, accumulated in f64.
    pub fn norm(&self) -> f64 {
        self.values
            .iter()
            .map(|v| f64::from(*v) * f64::from(*v))
            .sum::<f64>()
            .sqrt()
    }

    /// Whether two embeddings live in the same vector space.
    ///
    /// Requires equal, non-zero dimension. When both sides declare a model
    /// version the versions must agree; an untagged side is accepted.
    pub fn is_comparable(&self, other: &Embedding) -> bool {
        if self.is_empty() || self.dim() != other.dim() {
            return false;
        }
        match (&self.model_version, &other.model_version) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// Attendance direction. Serialized as the wire strings `IN` / `OUT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "IN")]
    Entry,
    #[serde(rename = "OUT")]
    Exit,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Entry => "IN",
            EventKind::Exit => "OUT",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event kind: {0:?} (expected IN or OUT)")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    /// Accepts `IN`/`OUT` as well as `entry`/`exit`, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "IN" | "ENTRY" => Ok(EventKind::Entry),
            "OUT" | "EXIT" => Ok(EventKind::Exit),
            _ => Err(UnknownEventKind(s.to_string())),
        }
    }
}

/// Metadata supplied at enrollment. The embedding comes from the extractor.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub display_name: String,
    /// Natural key; unique across the gallery.
    pub email: String,
    pub role: String,
    pub department: String,
}

impl NewIdentity {
    /// Build enrollment metadata, substituting defaults for blank role/department.
    pub fn new(display_name: &str, email: &str, role: &str, department: &str) -> Self {
        let or_default = |v: &str, default: &str| {
            let v = v.trim();
            if v.is_empty() {
                default.to_string()
            } else {
                v.to_string()
            }
        };
        Self {
            display_name: display_name.trim().to_string(),
            email: email.trim().to_string(),
            role: or_default(role, DEFAULT_ROLE),
            department: or_default(department, DEFAULT_DEPARTMENT),
        }
    }
}

/// An enrolled person holding exactly one embedding.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    pub email: String,
    pub role: String,
    pub department: String,
    pub embedding: Embedding,
    pub enrolled_at: DateTime<Utc>,
}

impl Identity {
    /// Caller-visible fields. Never includes the embedding.
    pub fn summary(&self) -> IdentitySummary {
        IdentitySummary {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            email: self.email.clone(),
            role: self.role.clone(),
            department: self.department.clone(),
            model_version: self.embedding.model_version.clone(),
            enrolled_at: self.enrolled_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub id: String,
    pub display_name: String,
    pub email: String,
    pub role: String,
    pub department: String,
    pub model_version: Option<String>,
    pub enrolled_at: DateTime<Utc>,
}

/// Mutable metadata of an identity. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct IdentityPatch {
    pub display_name: Option<String>,
    pub role: Option<String>,
    pub department: Option<String>,
}

impl IdentityPatch {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none() && self.role.is_none() && self.department.is_none()
    }
}

/// Immutable, timestamped record of one recognition outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub id: String,
    pub identity_id: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

/// An attendance event enriched with the owning identity's name and department.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    #[serde(flatten)]
    pub event: AttendanceEvent,
    pub display_name: Option<String>,
    pub department: Option<String>,
}

/// Gallery and attendance counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub total_identities: u64,
    pub total_events: u64,
    pub events_today: u64,
    pub identities_by_role: BTreeMap<String, u64>,
    pub identities_by_department: BTreeMap<String, u64>,
}
