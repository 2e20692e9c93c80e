//! Provenance via the GitHub CLI (`gh attestation verify`)

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use super::{ProvenanceBackend, Subject};
use crate::error::{CandidateRejection, Error, Result};

/// Runs `gh attestation verify <file> -R <repo> --deny-self-hosted-runners`.
///
/// Signature, certificate and issuer checks are left entirely to the tool.
#[derive(Debug, Clone)]
pub struct GhAttestationTool {
    program: PathBuf,
}

impl GhAttestationTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }
}

#[async_trait]
impl ProvenanceBackend for GhAttestationTool {
    async fn attest(&self, subject: &Subject<'_>, repository: &str) -> Result<()> {
        let rejected = |reason: String| Error::NoValidAttestation {
            subject: subject.label(),
            rejections: vec![CandidateRejection { index: 0, reason }],
        };

        let output = tokio::process::Command::new(&self.program)
            .arg("attestation")
            .arg("verify")
            .arg(subject.path)
            .arg("-R")
            .arg(repository)
            .arg("--deny-self-hosted-runners")
            .output()
            .await
            .map_err(|e| rejected(format!("failed to run {}: {}", self.program.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(rejected(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim_end()
            )));
        }

        info!(artifact = subject.name, repository, "attestation verified");
        Ok(())
    }
}
