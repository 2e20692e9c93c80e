//! Provenance via a digest-addressed attestation index
//!
//! The GitHub attestations API (or a proxy serving the same shape) returns
//! every bundle recorded for a content digest:
//!
//! ```text
//! GET {base}/repos/{owner}/{repo}/attestations/sha256:{digest}
//! { "attestations": [ { "bundle": { ... } }, ... ] }
//! ```
//!
//! Entries are decoded one at a time. A bundle in a shape this crate does not
//! understand is a rejected candidate, not a failed lookup.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{AttestationVerifier, ProvenanceBackend, Subject};
use crate::error::{Error, Result};
use crate::policy::TrustPolicy;
use crate::sigstore::Bundle;
use crate::transport::Transport;

/// Public GitHub REST endpoint
pub const GITHUB_API: &str = "https://api.github.com";

#[derive(Debug, Deserialize)]
struct AttestationResponse {
    attestations: Vec<Value>,
}

/// A candidate bundle, or why its entry could not be decoded
pub type Candidate = std::result::Result<Bundle, String>;

fn decode_entry(entry: Value) -> Candidate {
    let bundle = match entry {
        Value::Object(mut fields) => fields.remove("bundle").ok_or("attestation entry has no bundle")?,
        _ => return Err("attestation entry is not an object".to_string()),
    };
    serde_json::from_value(bundle).map_err(|e| format!("unrecognised bundle: {}", e))
}

pub struct ProvenanceIndex {
    transport: Arc<dyn Transport>,
    base_url: String,
    verifier: AttestationVerifier,
}

impl ProvenanceIndex {
    pub fn new(transport: Arc<dyn Transport>, base_url: impl Into<String>, verifier: AttestationVerifier) -> Self {
        Self {
            transport,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            verifier,
        }
    }

    /// Fetch every candidate bundle recorded for `digest`, most recent first
    pub async fn candidates(&self, repository: &str, digest: &str) -> Result<Vec<Candidate>> {
        let url = format!("{}/repos/{}/attestations/sha256:{}", self.base_url, repository, digest);
        let body = self.transport.get(&url).await?;

        let response: AttestationResponse = serde_json::from_slice(&body).map_err(|e| Error::Fetch {
            url: url.clone(),
            reason: format!("malformed attestation response: {}", e),
        })?;

        debug!(url, candidates = response.attestations.len(), "fetched attestation candidates");
        Ok(response.attestations.into_iter().map(decode_entry).collect())
    }
}

#[async_trait]
impl ProvenanceBackend for ProvenanceIndex {
    async fn attest(&self, subject: &Subject<'_>, repository: &str) -> Result<()> {
        let candidates = self.candidates(repository, subject.digest).await?;
        let policy = TrustPolicy::github_actions(repository);
        let attested = self.verifier.verify_decoded(subject, &candidates, &policy)?;

        info!(
            artifact = subject.name,
            repository,
            candidate = attested.index,
            "attestation verified"
        );
        Ok(())
    }
}
