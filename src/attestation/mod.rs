//! Provenance verification
//!
//! Every artifact that enters a measurement must be traceable to a build in
//! its source repository. Two back-ends establish that:
//!
//! ## Local tool
//! The file is handed to `gh attestation verify` which performs the
//! Sigstore checks itself and refuses self-hosted runners.
//!
//! ## Provenance index
//! Candidate bundles are looked up by content digest and checked in-process
//! by [`AttestationVerifier`]: the first candidate whose signature covers the
//! digest and whose signer satisfies the [`TrustPolicy`] wins. Candidates are
//! tried in the order the index returns them.

pub mod gh;
pub mod index;
pub mod types;

pub use gh::GhAttestationTool;
pub use index::ProvenanceIndex;
pub use types::{Attested, ProvenanceKind, Subject};

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{CandidateRejection, Error, Result};
use crate::policy::TrustPolicy;
use crate::sigstore::{Bundle, BundleVerifier, DsseVerifier, TrustRoot};

/// Establishes that an artifact was built from `repository`
#[async_trait]
pub trait ProvenanceBackend: Send + Sync {
    /// Fails with [`Error::NoValidAttestation`] when no proof is found
    async fn attest(&self, subject: &Subject<'_>, repository: &str) -> Result<()>;
}

/// The provenance back-ends available to a run, selected per lineage.
///
/// The index back-end only exists when a Fulcio trust root was configured.
#[derive(Clone)]
pub struct Backends {
    pub local_tool: Arc<dyn ProvenanceBackend>,
    pub index: Option<Arc<dyn ProvenanceBackend>>,
}

impl Backends {
    pub fn select(&self, kind: ProvenanceKind) -> Result<&dyn ProvenanceBackend> {
        match kind {
            ProvenanceKind::LocalTool => Ok(self.local_tool.as_ref()),
            ProvenanceKind::Index => self.index.as_deref().ok_or_else(|| {
                Error::Config("index provenance needs a Fulcio trust root (--fulcio-roots)".to_string())
            }),
        }
    }
}

/// Back-end that accepts or rejects everything and records what it saw
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct StaticBackend {
    reject: std::collections::HashSet<String>,
    seen: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl StaticBackend {
    /// Reject subjects with this name
    pub(crate) fn rejecting(mut self, name: &str) -> Self {
        self.reject.insert(name.to_string());
        self
    }

    pub(crate) fn seen(&self) -> Vec<String> {
        let mut seen = self.seen.lock().unwrap().clone();
        seen.sort();
        seen
    }
}

#[cfg(test)]
#[async_trait]
impl ProvenanceBackend for StaticBackend {
    async fn attest(&self, subject: &Subject<'_>, repository: &str) -> Result<()> {
        self.seen.lock().unwrap().push(format!("{}@{}", subject.name, repository));
        if self.reject.contains(subject.name) {
            return Err(Error::NoValidAttestation {
                subject: subject.label(),
                rejections: vec![CandidateRejection { index: 0, reason: "rejected by fixture".into() }],
            });
        }
        Ok(())
    }
}

/// Checks a list of candidate bundles against a trust policy
#[derive(Clone)]
pub struct AttestationVerifier {
    bundle_verifier: Arc<dyn BundleVerifier>,
}

impl AttestationVerifier {
    pub fn new(bundle_verifier: Arc<dyn BundleVerifier>) -> Self {
        Self { bundle_verifier }
    }

    /// Verifier that chains every leaf to `trust_root`
    pub fn with_trust_root(trust_root: TrustRoot) -> Self {
        Self::new(Arc::new(DsseVerifier::new(trust_root)))
    }

    /// Return the first candidate that proves `subject`.
    ///
    /// A candidate proves the subject when its signature covers the subject
    /// digest AND its signer satisfies every predicate of `policy`. Failing
    /// candidates are skipped; their reasons are returned alongside the match,
    /// or aggregated into the error when nothing matches.
    pub fn verify<'a>(
        &self,
        subject: &Subject<'_>,
        candidates: &'a [Bundle],
        policy: &TrustPolicy,
    ) -> Result<Attested<'a>> {
        self.verify_each(subject, candidates.iter().map(Ok), policy)
    }

    /// Same as [`verify`](Self::verify) for candidates decoded one by one.
    ///
    /// An entry that failed to decode counts as a rejected candidate at its
    /// position; later entries are still tried.
    pub fn verify_decoded<'a>(
        &self,
        subject: &Subject<'_>,
        candidates: &'a [std::result::Result<Bundle, String>],
        policy: &TrustPolicy,
    ) -> Result<Attested<'a>> {
        self.verify_each(subject, candidates.iter().map(|c| c.as_ref().map_err(Clone::clone)), policy)
    }

    fn verify_each<'a>(
        &self,
        subject: &Subject<'_>,
        candidates: impl Iterator<Item = std::result::Result<&'a Bundle, String>>,
        policy: &TrustPolicy,
    ) -> Result<Attested<'a>> {
        let mut rejected = Vec::new();

        for (index, candidate) in candidates.enumerate() {
            let outcome = candidate.and_then(|bundle| {
                let identity = self.bundle_verifier.verify(subject.digest, bundle)?;
                policy.check(&identity).map_err(|v| v.to_string())?;
                Ok((bundle, identity))
            });

            match outcome {
                Ok((bundle, identity)) => {
                    for rejection in &rejected {
                        debug!(subject = subject.name, %rejection, "skipped attestation candidate");
                    }
                    return Ok(Attested { bundle, index, identity, rejected });
                }
                Err(reason) => rejected.push(CandidateRejection { index, reason }),
            }
        }

        Err(Error::NoValidAttestation {
            subject: subject.label(),
            rejections: rejected,
        })
    }
}
