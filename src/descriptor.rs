//! Deployment descriptor and release summary output
//!
//! The descriptor's shape follows the lineages it was assembled from:
//!
//! ## Dual
//! One SEV-SNP and one TDX lineage, measured side by side.
//!
//! ## Firmware
//! A single SEV-SNP inference image booted through OVMF, with the served
//! model and domain and the guest resources recorded next to the measurement.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::{Error, Result};

pub const DESCRIPTOR_FILE: &str = "tinfoil-deployment.json";
pub const SUMMARY_FILE: &str = "release.md";

/// Everything a verifier needs to check a running deployment
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentDescriptor {
    pub body: DescriptorBody,
    /// Releases linked from the summary, in lineage order
    pub releases: Vec<ReleaseLink>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DescriptorBody {
    Dual(DualDescriptor),
    Firmware(FirmwareDescriptor),
}

/// Field order is the serialization order and must not change between
/// releases.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DualDescriptor {
    pub snp_measurement: String,
    pub tdx_measurement: Value,
    /// TDX kernel command line
    pub cmdline: String,
    pub cmdline_snp: String,
    /// TDX lineage manifest
    pub hashes: Map<String, Value>,
    pub hashes_snp: Map<String, Value>,
    /// Deployment config, base64
    pub config: String,
    /// Lineage name to version identifier
    pub versions: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FirmwareDescriptor {
    pub config: ServedModel,
    /// Hex launch digest
    pub measurement: String,
    pub deployment: Deployment,
    /// Lineage manifest, in document order
    pub hashes: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServedModel {
    pub model: String,
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Deployment {
    pub cmdline: String,
    pub cpus: u32,
    /// GiB
    pub memory: u32,
    /// Release name to version, own release first
    #[serde(flatten)]
    pub versions: Map<String, Value>,
}

/// A versioned release linked from the summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseLink {
    pub title: String,
    pub version: String,
    pub url: String,
}

impl DeploymentDescriptor {
    /// The SEV-SNP launch digest
    pub fn snp_measurement(&self) -> &str {
        match &self.body {
            DescriptorBody::Dual(dual) => &dual.snp_measurement,
            DescriptorBody::Firmware(firmware) => &firmware.measurement,
        }
    }

    /// JSON encoding with 4-space indentation
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.body.serialize(&mut ser)?;
        Ok(out)
    }

    /// Markdown summary for release notes
    pub fn summary(&self) -> String {
        let mut md = match &self.body {
            DescriptorBody::Dual(dual) => format!(
                "SEV-SNP Measurement: `{}`\nTDX Measurement: `{}`\n",
                dual.snp_measurement, dual.tdx_measurement
            ),
            DescriptorBody::Firmware(firmware) => format!(
                "Model: `{model}`\nDomain: [{domain}](https://{domain}/.well-known/tinfoil-attestation)\n\
                 SEV-SNP Measurement: `{measurement}`\n",
                model = firmware.config.model,
                domain = firmware.config.domain,
                measurement = firmware.measurement,
            ),
        };
        for release in &self.releases {
            md.push_str(&format!(
                "{} Version: [`{}`]({})\n",
                release.title, release.version, release.url
            ));
        }
        if let DescriptorBody::Firmware(firmware) = &self.body {
            md.push_str(&format!(
                "Resources: {} vCPUs / {}GB RAM\n",
                firmware.deployment.cpus, firmware.deployment.memory
            ));
        }
        md
    }

    /// Write the descriptor and summary into `dir`.
    ///
    /// Both files are staged in `dir` first. The summary is moved into place
    /// before the descriptor, so a descriptor on disk always comes from a
    /// complete write; if the descriptor cannot be moved into place the new
    /// summary is removed again.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;

        let descriptor = stage(dir, &self.to_json()?)?;
        let summary = stage(dir, self.summary().as_bytes())?;

        let summary_path = dir.join(SUMMARY_FILE);
        summary.persist(&summary_path).map_err(|e| Error::Io(e.error))?;

        let path = dir.join(DESCRIPTOR_FILE);
        if let Err(e) = descriptor.persist(&path) {
            warn!(path = %path.display(), error = %e.error, "descriptor not written, removing summary");
            if let Err(cleanup) = std::fs::remove_file(&summary_path) {
                warn!(path = %summary_path.display(), error = %cleanup, "failed to remove summary");
            }
            return Err(Error::Io(e.error));
        }

        info!(path = %path.display(), "wrote deployment descriptor");
        Ok(path)
    }
}

fn stage(dir: &Path, contents: &[u8]) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new().prefix(".staging-").tempfile_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    Ok(file)
}
