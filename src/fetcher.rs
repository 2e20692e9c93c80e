//! Artifact download and verification
//!
//! Each artifact a lineage needs is fetched through the content store,
//! hashed, cross-checked against the manifest and (for per-artifact lineages,
//! or artifacts naming their own attesting repository) attested on its own. Artifacts of one lineage are processed concurrently;
//! the first failure aborts the rest.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::attestation::{Backends, Subject};
use crate::error::{Error, Result};
use crate::hash;
use crate::lineage::{ArtifactRole, ArtifactSpec, Lineage, TrustMode};
use crate::manifest::{Manifest, ManifestTrust};
use crate::store::ContentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustOutcome {
    Unverified,
    Verified,
    Rejected,
}

/// A fetched artifact. Frozen once verified.
#[derive(Debug, Clone)]
pub struct Artifact {
    spec: ArtifactSpec,
    path: PathBuf,
    digest: Option<String>,
    expected: Option<String>,
    attested: bool,
    outcome: TrustOutcome,
}

impl Artifact {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn role(&self) -> ArtifactRole {
        self.spec.role
    }

    pub fn url(&self) -> &str {
        &self.spec.url
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hex SHA-256 of the local copy
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Digest the manifest pins this artifact to, if any
    pub fn expected(&self) -> Option<&str> {
        self.expected.as_deref()
    }

    /// Whether the artifact's own attestation was verified
    pub fn attested(&self) -> bool {
        self.attested
    }

    pub fn outcome(&self) -> TrustOutcome {
        self.outcome
    }

    fn reject(&mut self, err: Error) -> Error {
        warn!(artifact = self.spec.name, error = %err, "artifact rejected");
        self.outcome = TrustOutcome::Rejected;
        err
    }
}

/// Verified artifacts of one lineage, keyed by role
#[derive(Debug, Clone, Default)]
pub struct ArtifactSet {
    artifacts: BTreeMap<ArtifactRole, Artifact>,
}

impl ArtifactSet {
    pub fn get(&self, role: ArtifactRole) -> Option<&Artifact> {
        self.artifacts.get(&role)
    }

    /// Path of a verified artifact that the caller cannot proceed without
    pub fn require(&self, role: ArtifactRole) -> Result<&Path> {
        self.get(role)
            .map(Artifact::path)
            .ok_or_else(|| Error::Config(format!("no verified {:?} artifact", role)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts.values()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

pub struct ArtifactFetcher {
    store: Arc<ContentStore>,
    backends: Backends,
}

impl ArtifactFetcher {
    pub fn new(store: Arc<ContentStore>, backends: Backends) -> Self {
        Self { store, backends }
    }

    /// Fetch and verify one artifact.
    ///
    /// The hash cross-check runs whenever the manifest pins the artifact. In
    /// manifest-attestation lineages that check is the only source of trust,
    /// so it is refused unless the manifest itself was attested.
    pub async fn fetch(&self, lineage: &Lineage, manifest: &Manifest, spec: &ArtifactSpec) -> Result<Artifact> {
        let path = self.store.resolve(&spec.url).await?;
        let mut artifact = Artifact {
            spec: spec.clone(),
            path,
            digest: None,
            expected: None,
            attested: false,
            outcome: TrustOutcome::Unverified,
        };

        let digest = match digest_file(artifact.path.clone()).await {
            Ok(digest) => digest,
            Err(e) => return Err(artifact.reject(e)),
        };
        debug!(artifact = spec.name, digest, "hashed");
        artifact.digest = Some(digest.clone());

        if let Some(key) = &spec.manifest_key {
            if lineage.trust_mode == TrustMode::ManifestAttestation && manifest.trust() != ManifestTrust::Attested {
                let err = Error::ManifestTrust {
                    manifest: manifest.url().to_string(),
                    reason: "hashes of an unattested manifest cannot vouch for artifacts".into(),
                };
                return Err(artifact.reject(err));
            }
            let expected = match manifest.get(key) {
                Ok(expected) => expected.to_string(),
                Err(e) => return Err(artifact.reject(e)),
            };
            artifact.expected = Some(expected.clone());
            if let Err(e) = hash::ensure_equal(&spec.name, &expected, &digest) {
                return Err(artifact.reject(e));
            }
        }

        let attesting_repository = match (&spec.attested_by, lineage.trust_mode) {
            (Some(repository), _) => Some(repository.as_str()),
            (None, TrustMode::PerArtifact) => Some(lineage.repository.as_str()),
            (None, TrustMode::ManifestAttestation) => None,
        };
        if let Some(repository) = attesting_repository {
            let subject = Subject {
                name: &spec.name,
                path: &artifact.path,
                digest: &digest,
            };
            let backend = self.backends.select(lineage.provenance)?;
            let attested = backend.attest(&subject, repository).await;
            if let Err(e) = attested {
                return Err(artifact.reject(e));
            }
            artifact.attested = true;
        }

        artifact.outcome = TrustOutcome::Verified;
        info!(
            lineage = %lineage.name,
            artifact = spec.name,
            hash_checked = artifact.expected.is_some(),
            attested = artifact.attested,
            "artifact verified"
        );
        Ok(artifact)
    }

    /// Fetch and verify `specs` concurrently.
    ///
    /// Returns on the first failure; outstanding downloads are aborted.
    pub async fn fetch_all(
        self: Arc<Self>,
        lineage: Arc<Lineage>,
        manifest: Arc<Manifest>,
        specs: Vec<ArtifactSpec>,
    ) -> Result<ArtifactSet> {
        let mut tasks = JoinSet::new();
        for spec in specs {
            let fetcher = self.clone();
            let lineage = lineage.clone();
            let manifest = manifest.clone();
            tasks.spawn(async move { fetcher.fetch(&lineage, &manifest, &spec).await });
        }

        let mut set = ArtifactSet::default();
        while let Some(joined) = tasks.join_next().await {
            let artifact = joined.map_err(|e| Error::Io(std::io::Error::other(format!("artifact task failed: {}", e))))??;
            if set.artifacts.insert(artifact.role(), artifact).is_some() {
                return Err(Error::Config(format!("lineage {} lists a role twice", lineage.name)));
            }
        }
        Ok(set)
    }
}

async fn digest_file(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || hash::digest_file(&path))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(format!("hashing task failed: {}", e))))?
}
