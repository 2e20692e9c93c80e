//! Release manifests and platform-measurement tables
//!
//! A manifest is a flat JSON object published with each image release that
//! pins the digests of the release's artifacts and the dm-verity root hash.
//! Depending on the lineage it is either the trust anchor (attested itself)
//! or a cross-check for artifacts that carry their own attestations.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::attestation::{Backends, Subject};
use crate::error::{Error, Result};
use crate::hash;
use crate::lineage::{Lineage, PlatformTableSource, TrustMode};
use crate::store::ContentStore;
use crate::transport::Transport;

/// How far a manifest's contents can be relied on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestTrust {
    /// The manifest's own attestation was verified
    Attested,
    /// Unattested; only used to cross-check attested artifacts
    CrossCheckOnly,
}

#[derive(Debug, Clone)]
pub struct Manifest {
    url: String,
    entries: Map<String, Value>,
    digest: String,
    trust: ManifestTrust,
}

impl Manifest {
    /// Parse manifest bytes fetched from `url`
    pub fn parse(url: &str, raw: &[u8], trust: ManifestTrust) -> Result<Self> {
        let entries = match serde_json::from_slice::<Value>(raw) {
            Ok(Value::Object(entries)) => entries,
            Ok(_) => return Err(Error::ManifestFetch(format!("{} is not a JSON object", url))),
            Err(e) => return Err(Error::ManifestFetch(format!("{} is not valid JSON: {}", url, e))),
        };
        Ok(Self {
            url: url.to_string(),
            entries,
            digest: hash::digest_bytes(raw),
            trust,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// SHA-256 of the manifest bytes
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn trust(&self) -> ManifestTrust {
        self.trust
    }

    /// Entries in document order
    pub fn entries(&self) -> &Map<String, Value> {
        &self.entries
    }

    /// String value stored under `key`.
    ///
    /// Missing keys and non-string values are both schema errors.
    pub fn get(&self, key: &str) -> Result<&str> {
        self.entries
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::ManifestSchema {
                document: self.url.clone(),
                field: key.to_string(),
                available: sorted_keys(&self.entries),
            })
    }
}

/// Fetches and authenticates manifests and platform-measurement tables
pub struct ManifestResolver {
    store: Arc<ContentStore>,
    transport: Arc<dyn Transport>,
    backends: Backends,
    api_base: String,
}

impl ManifestResolver {
    pub fn new(
        store: Arc<ContentStore>,
        transport: Arc<dyn Transport>,
        backends: Backends,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            store,
            transport,
            backends,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    /// Fetch a lineage's manifest and establish how far it can be trusted.
    ///
    /// Every key the lineage will read is checked here so schema problems
    /// surface before any artifact is downloaded.
    pub async fn resolve(&self, lineage: &Lineage) -> Result<Manifest> {
        let url = &lineage.manifest_url;
        let path = self
            .store
            .resolve(url)
            .await
            .map_err(|e| Error::ManifestFetch(e.to_string()))?;
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::ManifestFetch(format!("failed to read {}: {}", path.display(), e)))?;

        let trust = match lineage.trust_mode {
            TrustMode::ManifestAttestation => ManifestTrust::Attested,
            TrustMode::PerArtifact => ManifestTrust::CrossCheckOnly,
        };
        let manifest = Manifest::parse(url, &raw, trust)?;

        if trust == ManifestTrust::Attested {
            self.attest(lineage, &path, &manifest).await?;
        }

        manifest.get(&lineage.root_hash_key)?;
        for key in lineage.artifacts.iter().filter_map(|a| a.manifest_key.as_deref()) {
            manifest.get(key)?;
        }

        info!(lineage = %lineage.name, digest = manifest.digest(), ?trust, "manifest resolved");
        Ok(manifest)
    }

    async fn attest(&self, lineage: &Lineage, path: &Path, manifest: &Manifest) -> Result<()> {
        let subject = Subject {
            name: "manifest",
            path,
            digest: manifest.digest(),
        };
        self.backends
            .select(lineage.provenance)?
            .attest(&subject, &lineage.repository)
            .await
            .map_err(|e| Error::ManifestTrust {
                manifest: manifest.url().to_string(),
                reason: e.to_string(),
            })
    }

    /// Download URL of the newest platform-measurements document.
    ///
    /// Releases are listed newest first; the first whose tag starts with the
    /// configured prefix is used. The listing is never cached.
    pub async fn platform_table_url(&self, repository: &str, source: &PlatformTableSource) -> Result<String> {
        let listing = format!("{}/repos/{}/releases", self.api_base, repository);
        let body = self
            .transport
            .get(&listing)
            .await
            .map_err(|e| Error::ManifestFetch(e.to_string()))?;
        let releases: Vec<Release> = serde_json::from_slice(&body)
            .map_err(|e| Error::ManifestFetch(format!("malformed release listing from {}: {}", listing, e)))?;

        let tag = releases
            .iter()
            .map(|r| r.tag_name.as_str())
            .find(|tag| tag.starts_with(&source.tag_prefix))
            .ok_or_else(|| {
                Error::ManifestFetch(format!(
                    "no release of {} has a tag starting with {}",
                    repository, source.tag_prefix
                ))
            })?;

        debug!(repository, tag, "selected platform measurements release");
        Ok(format!(
            "https://github.com/{}/releases/download/{}/{}",
            repository, tag, source.file_name
        ))
    }
}

/// Keys for diagnostics, sorted independently of document order
fn sorted_keys(map: &Map<String, Value>) -> Vec<String> {
    let mut keys: Vec<String> = map.keys().cloned().collect();
    keys.sort();
    keys
}

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
}

/// Look up the ACPI table digest for `platform` in a platform-measurements
/// document of the form `{"<platform>": {"acpi": "<hex>", ...}, ...}`
pub fn acpi_hash(document: &str, raw: &[u8], platform: &str) -> Result<String> {
    let table: Map<String, Value> = match serde_json::from_slice(raw) {
        Ok(Value::Object(table)) => table,
        _ => return Err(Error::ManifestFetch(format!("{} is not a JSON object", document))),
    };

    let entry = table
        .get(platform)
        .and_then(Value::as_object)
        .ok_or_else(|| Error::ManifestSchema {
            document: document.to_string(),
            field: platform.to_string(),
            available: sorted_keys(&table),
        })?;

    entry
        .get("acpi")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::ManifestSchema {
            document: document.to_string(),
            field: format!("{}.acpi", platform),
            available: sorted_keys(entry),
        })
}
