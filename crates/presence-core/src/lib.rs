//! Identity matching for face-recognition attendance.
//!
//! Holds the data model, the cosine-distance matcher, and the embedding
//! extraction boundary with its ONNX implementation (SCRFD + ArcFace).

pub mod alignment;
pub mod detector;
pub mod extractor;
pub mod matcher;
pub mod recognizer;
pub mod types;

pub use extractor::{EmbeddingExtractor, ExtractError, OnnxExtractor};
pub use matcher::{cosine_distance, CosineMatcher, Match, Matcher, ARCFACE_DISTANCE_THRESHOLD};
pub use types::{
    AttendanceEvent, AttendanceRecord, Embedding, EventKind, Identity, IdentityPatch,
    IdentitySummary, NewIdentity, Stats,
};

/// Default directory for ONNX model files.
pub fn default_model_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/usr/share/presence/models")
}
