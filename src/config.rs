//! Deployment configuration and run options
//!
//! The deployment config is the YAML file that is also shipped to the CVM.
//! Its exact bytes are part of the measured surface (`tinfoil-config-hash`)
//! and are embedded in the descriptor, so they are kept alongside the parsed
//! fields.

use std::path::{Path, PathBuf};

use base64::Engine;
use serde::Deserialize;

use crate::attestation::ProvenanceKind;
use crate::error::{Error, Result};
use crate::hash;

/// Fields the pipeline reads from the deployment config.
///
/// Other keys configure the runtime and are ignored here. Which keys are
/// required depends on the [`ReleaseLayout`] the config selects.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeployConfig {
    pub cpus: u32,
    /// Guest memory in GiB, passed to the TDX measurement tool
    pub memory: u32,
    /// Key into the platform-measurements document
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub stage0_version: String,
    /// cvmimage release without the leading `v`
    pub cvm_version: String,
    /// tf-core cvmimage release tag (SEV-SNP lineage)
    #[serde(default)]
    pub cvmimage_version: String,
    /// OVMF release without the leading `v`
    #[serde(default)]
    pub ovmf_version: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

/// Which set of lineages a deployment is measured from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseLayout {
    /// tf-core for SEV-SNP alongside cvmimage for TDX
    Dual,
    /// A single inference image booted through OVMF, SEV-SNP only.
    /// Selected by `ovmf-version`.
    Firmware,
}

impl DeployConfig {
    pub fn release_layout(&self) -> ReleaseLayout {
        match self.ovmf_version {
            Some(_) => ReleaseLayout::Firmware,
            None => ReleaseLayout::Dual,
        }
    }
}

/// A parsed deployment config together with the bytes it was parsed from
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub settings: DeployConfig,
    raw: Vec<u8>,
}

impl LoadedConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_bytes(raw)
    }

    pub fn from_bytes(raw: Vec<u8>) -> Result<Self> {
        let settings: DeployConfig = serde_yaml::from_slice(&raw)
            .map_err(|e| Error::Config(format!("failed to parse deployment config: {}", e)))?;
        validate(&settings)?;
        Ok(Self { settings, raw })
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Digest bound into the kernel command line as `tinfoil-config-hash`
    pub fn config_hash(&self) -> String {
        hash::digest_bytes(&self.raw)
    }

    /// Config bytes as embedded in the deployment descriptor
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.raw)
    }
}

fn validate(config: &DeployConfig) -> Result<()> {
    if config.cpus == 0 {
        return Err(Error::Config("cpus must be at least 1".into()));
    }
    if config.memory == 0 {
        return Err(Error::Config("memory must be at least 1 GiB".into()));
    }

    let required: Vec<(&str, &str)> = match config.release_layout() {
        ReleaseLayout::Dual => vec![
            ("platform", config.platform.as_str()),
            ("stage0-version", config.stage0_version.as_str()),
            ("cvm-version", config.cvm_version.as_str()),
            ("cvmimage-version", config.cvmimage_version.as_str()),
        ],
        ReleaseLayout::Firmware => vec![
            ("cvm-version", config.cvm_version.as_str()),
            ("ovmf-version", config.ovmf_version.as_deref().unwrap_or_default()),
            ("model", config.model.as_deref().unwrap_or_default()),
            ("domain", config.domain.as_deref().unwrap_or_default()),
        ],
    };
    for (key, value) in required {
        if value.trim().is_empty() {
            return Err(Error::Config(format!("{} must not be empty", key)));
        }
        if value.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(Error::Config(format!("{} contains invalid characters: {:?}", key, value)));
        }
    }
    Ok(())
}

/// Process-level options, normally taken from the command line
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config_path: PathBuf,
    pub cache_dir: PathBuf,
    pub output_dir: PathBuf,
    /// `tdx-measure` executable
    pub tdx_measure: PathBuf,
    /// `gh` executable used by the local-tool provenance back-end
    pub gh: PathBuf,
    /// Base URL of the attestation index
    pub attestation_index: String,
    /// Overrides every lineage's provenance back-end when set
    pub provenance: Option<ProvenanceKind>,
    /// PEM bundle of Fulcio certificate authorities; the attestation index
    /// is unavailable without it
    pub fulcio_roots: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("/config.yml"),
            cache_dir: PathBuf::from("/cache"),
            output_dir: PathBuf::from("/output"),
            tdx_measure: PathBuf::from("/app/tdx-measure"),
            gh: PathBuf::from("gh"),
            attestation_index: crate::attestation::index::GITHUB_API.to_string(),
            provenance: None,
            fulcio_roots: None,
        }
    }
}
