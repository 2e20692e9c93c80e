//! Error types for the measurement pipeline

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Hash mismatch for {artifact}: expected {expected}, got {actual}")]
    HashMismatch {
        artifact: String,
        expected: String,
        actual: String,
    },

    #[error("No valid attestation for {subject}: {}", format_rejections(.rejections))]
    NoValidAttestation {
        subject: String,
        rejections: Vec<CandidateRejection>,
    },

    #[error("Manifest fetch failed: {0}")]
    ManifestFetch(String),

    #[error("Manifest {manifest} is not trusted: {reason}")]
    ManifestTrust { manifest: String, reason: String },

    #[error("{document} is missing field '{field}' (available: {})", .available.join(", "))]
    ManifestSchema {
        document: String,
        field: String,
        available: Vec<String>,
    },

    #[error("Measurement tool failed: {0}")]
    MeasurementTool(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{} lineage(s) failed: {}", .0.len(), format_failures(.0))]
    LineagesFailed(Vec<LineageFailure>),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why a single attestation candidate was rejected.
///
/// Only carries human-readable reasons, never bundle or certificate bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRejection {
    /// Position of the candidate in the list supplied to the verifier
    pub index: usize,
    pub reason: String,
}

impl fmt::Display for CandidateRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "candidate #{}: {}", self.index, self.reason)
    }
}

/// A lineage that terminated before its measurements were produced.
#[derive(Debug)]
pub struct LineageFailure {
    pub lineage: String,
    pub error: Error,
}

impl fmt::Display for LineageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.lineage, self.error)
    }
}

fn format_rejections(rejections: &[CandidateRejection]) -> String {
    if rejections.is_empty() {
        return "no candidates".to_string();
    }
    rejections
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_failures(failures: &[LineageFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
