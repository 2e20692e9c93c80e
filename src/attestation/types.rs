//! Core types for provenance verification

use std::path::Path;

use crate::error::CandidateRejection;
use crate::sigstore::{Bundle, CertificateIdentity};

/// The artifact whose provenance is being established
#[derive(Debug, Clone, Copy)]
pub struct Subject<'a> {
    /// Logical artifact name, used in diagnostics
    pub name: &'a str,
    /// Local copy of the artifact
    pub path: &'a Path,
    /// Hex-encoded SHA-256 of the local copy
    pub digest: &'a str,
}

impl Subject<'_> {
    /// Label used in errors, e.g. `kernel (sha256:ab12…)`
    pub fn label(&self) -> String {
        format!("{} (sha256:{})", self.name, self.digest)
    }
}

/// Which provenance back-end a lineage's artifacts are checked with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvenanceKind {
    /// Delegate to a local verification tool run against the file
    LocalTool,
    /// Fetch candidate bundles by digest and verify them in-process
    Index,
}

/// Successful verification of a candidate list
#[derive(Debug)]
pub struct Attested<'a> {
    /// The first candidate that satisfied the policy
    pub bundle: &'a Bundle,
    /// Its position in the candidate list
    pub index: usize,
    pub identity: CertificateIdentity,
    /// Reasons earlier candidates were passed over, kept for diagnostics
    pub rejected: Vec<CandidateRejection>,
}
