//! Release lineages
//!
//! A lineage is one generation of the CVM image release format: where its
//! manifest lives, which artifacts it ships, how those artifacts are trusted
//! and what kernel command line boots them. Lineages are plain data; the
//! pipeline treats them all the same way.

use std::collections::HashSet;
use std::fmt;

use crate::attestation::ProvenanceKind;
use crate::cmdline::{CmdlineTemplate, Preamble};
use crate::config::DeployConfig;
use crate::error::{Error, Result};

const IMAGE_HOST: &str = "https://images.tinfoil.sh/cvm";

/// Legacy image repository, measured for Intel TDX
pub const CVMIMAGE_REPO: &str = "tinfoilsh/cvmimage";

/// Current image repository, measured for AMD SEV-SNP
pub const TF_CORE_REPO: &str = "tinfoilsh/tf-core";

/// Inference images booted through OVMF, measured for AMD SEV-SNP
pub const INFERENCE_REPO: &str = "tinfoilanalytics/cvmimage";

/// OVMF firmware builds
pub const EDK2_REPO: &str = "tinfoilanalytics/edk2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    SevSnp,
    Tdx,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SevSnp => write!(f, "SEV-SNP"),
            Self::Tdx => write!(f, "TDX"),
        }
    }
}

/// How a lineage's artifacts earn trust
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustMode {
    /// Only the manifest is attested; artifacts are trusted through hash
    /// equality with it
    ManifestAttestation,
    /// Every artifact is attested on its own; the manifest is a cross-check
    PerArtifact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactRole {
    Kernel,
    Initrd,
    /// Full firmware image (OVMF)
    Firmware,
    /// Minimal first-stage boot payload used instead of firmware
    StageLoader,
    /// Platform-measurements document (ACPI table digests)
    PlatformMeasurements,
}

/// One artifact a lineage requires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSpec {
    pub name: String,
    pub role: ArtifactRole,
    pub url: String,
    /// Manifest key holding the expected digest, if the manifest covers it
    pub manifest_key: Option<String>,
    /// Repository whose attestation vouches for this artifact on its own,
    /// for artifacts published outside the lineage's repository
    pub attested_by: Option<String>,
}

/// A versioned release, linked from the summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRef {
    /// Key under which the version is recorded in the descriptor
    pub name: String,
    pub title: String,
    /// `owner/name` on GitHub
    pub repository: String,
    pub version: String,
    pub release_tag: String,
}

impl ReleaseRef {
    pub fn url(&self) -> String {
        format!("https://github.com/{}/releases/tag/{}", self.repository, self.release_tag)
    }
}

/// Where to discover the platform-measurements document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformTableSource {
    /// Release tags carrying the document start with this prefix
    pub tag_prefix: String,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lineage {
    pub name: String,
    /// Human-readable name used in the release summary
    pub title: String,
    pub platform: Platform,
    /// `owner/name` on GitHub
    pub repository: String,
    pub version: String,
    /// Git tag of the release, used for links in the summary
    pub release_tag: String,
    pub trust_mode: TrustMode,
    pub provenance: ProvenanceKind,
    pub manifest_url: String,
    /// Manifest key holding the dm-verity root hash
    pub root_hash_key: String,
    pub artifacts: Vec<ArtifactSpec>,
    pub cmdline: CmdlineTemplate,
    pub platform_table: Option<PlatformTableSource>,
    /// Releases of other repositories this lineage takes artifacts from
    pub companions: Vec<ReleaseRef>,
}

impl Lineage {
    /// Legacy `tinfoilsh/cvmimage` release, measured for TDX.
    ///
    /// Only the manifest is attested; kernel and initrd are pinned by it.
    pub fn cvmimage(version: &str) -> Self {
        let release = format!("https://github.com/{}/releases/download/v{}", CVMIMAGE_REPO, version);
        Self {
            name: "cvmimage".to_string(),
            title: "Inference Image".to_string(),
            platform: Platform::Tdx,
            repository: CVMIMAGE_REPO.to_string(),
            version: version.to_string(),
            release_tag: format!("v{}", version),
            trust_mode: TrustMode::ManifestAttestation,
            provenance: ProvenanceKind::LocalTool,
            manifest_url: format!("{}/tinfoil-inference-v{}-manifest.json", release, version),
            root_hash_key: "root".to_string(),
            artifacts: vec![
                ArtifactSpec {
                    name: "kernel".to_string(),
                    role: ArtifactRole::Kernel,
                    url: format!("{}/tinfoil-inference-v{}.vmlinuz", IMAGE_HOST, version),
                    manifest_key: Some("kernel".to_string()),
                    attested_by: None,
                },
                ArtifactSpec {
                    name: "initrd".to_string(),
                    role: ArtifactRole::Initrd,
                    url: format!("{}/tinfoil-inference-v{}.initrd", IMAGE_HOST, version),
                    manifest_key: Some("initrd".to_string()),
                    attested_by: None,
                },
            ],
            cmdline: CmdlineTemplate {
                preamble: Preamble::GpuPci,
                config_hash: true,
                model_domain: false,
                acpi_hash: false,
            },
            platform_table: None,
            companions: Vec::new(),
        }
    }

    /// Current `tinfoilsh/tf-core` release booted by stage0, measured for
    /// SEV-SNP. Every artifact carries its own attestation.
    pub fn tf_core(version: &str, stage0_version: &str) -> Self {
        Self {
            name: "tf-core".to_string(),
            title: "Core Image".to_string(),
            platform: Platform::SevSnp,
            repository: TF_CORE_REPO.to_string(),
            version: version.to_string(),
            release_tag: version.to_string(),
            trust_mode: TrustMode::PerArtifact,
            provenance: ProvenanceKind::LocalTool,
            manifest_url: format!(
                "https://github.com/{}/releases/download/{}/manifest.json",
                TF_CORE_REPO, version
            ),
            root_hash_key: "disk_sha256".to_string(),
            artifacts: vec![
                ArtifactSpec {
                    name: "kernel".to_string(),
                    role: ArtifactRole::Kernel,
                    url: format!("{}/tinfoilcvm.vmlinuz", IMAGE_HOST),
                    manifest_key: Some("vmlinuz_sha256".to_string()),
                    attested_by: None,
                },
                ArtifactSpec {
                    name: "initrd".to_string(),
                    role: ArtifactRole::Initrd,
                    url: format!("{}/tinfoilcvm.initrd", IMAGE_HOST),
                    manifest_key: Some("initrd_sha256".to_string()),
                    attested_by: None,
                },
                ArtifactSpec {
                    name: "stage0".to_string(),
                    role: ArtifactRole::StageLoader,
                    url: format!(
                        "https://github.com/{}/releases/download/{}/stage0_bin",
                        TF_CORE_REPO, stage0_version
                    ),
                    manifest_key: None,
                    attested_by: None,
                },
            ],
            cmdline: CmdlineTemplate {
                preamble: Preamble::GpuPci,
                config_hash: true,
                model_domain: false,
                acpi_hash: true,
            },
            platform_table: Some(PlatformTableSource {
                tag_prefix: "plt-msr-v".to_string(),
                file_name: "platform-measurements.json".to_string(),
            }),
            companions: Vec::new(),
        }
    }

    /// `tinfoilanalytics/cvmimage` inference image booted through OVMF,
    /// measured for SEV-SNP with a serial console and the served model and
    /// domain on the command line.
    ///
    /// The manifest is attested and pins kernel and initrd. OVMF comes from
    /// a separate edk2 release and carries its own attestation.
    pub fn inference_ovmf(version: &str, ovmf_version: &str) -> Self {
        let release = format!("https://github.com/{}/releases/download/v{}", INFERENCE_REPO, version);
        Self {
            name: "inference_image".to_string(),
            title: "Inference Image".to_string(),
            platform: Platform::SevSnp,
            repository: INFERENCE_REPO.to_string(),
            version: version.to_string(),
            release_tag: format!("v{}", version),
            trust_mode: TrustMode::ManifestAttestation,
            provenance: ProvenanceKind::LocalTool,
            manifest_url: format!("{}/tinfoil-inference-v{}-manifest.json", release, version),
            root_hash_key: "root".to_string(),
            artifacts: vec![
                ArtifactSpec {
                    name: "kernel".to_string(),
                    role: ArtifactRole::Kernel,
                    url: format!("{}/tinfoil-inference-v{}.vmlinuz", IMAGE_HOST, version),
                    manifest_key: Some("kernel".to_string()),
                    attested_by: None,
                },
                ArtifactSpec {
                    name: "initrd".to_string(),
                    role: ArtifactRole::Initrd,
                    url: format!("{}/tinfoil-inference-v{}.initrd", IMAGE_HOST, version),
                    manifest_key: Some("initrd".to_string()),
                    attested_by: None,
                },
                ArtifactSpec {
                    name: "OVMF.fd".to_string(),
                    role: ArtifactRole::Firmware,
                    url: format!(
                        "https://github.com/{}/releases/download/v{}/OVMF.fd",
                        EDK2_REPO, ovmf_version
                    ),
                    manifest_key: None,
                    attested_by: Some(EDK2_REPO.to_string()),
                },
            ],
            cmdline: CmdlineTemplate {
                preamble: Preamble::Console,
                config_hash: false,
                model_domain: true,
                acpi_hash: false,
            },
            platform_table: None,
            companions: vec![ReleaseRef {
                name: "ovmf".to_string(),
                title: "OVMF".to_string(),
                repository: EDK2_REPO.to_string(),
                version: ovmf_version.to_string(),
                release_tag: format!("v{}", ovmf_version),
            }],
        }
    }

    /// The lineages a deployment descriptor is assembled from
    pub fn from_config(config: &DeployConfig) -> Vec<Self> {
        match &config.ovmf_version {
            Some(ovmf_version) => vec![Self::inference_ovmf(&config.cvm_version, ovmf_version)],
            None => vec![
                Self::tf_core(&config.cvmimage_version, &config.stage0_version),
                Self::cvmimage(&config.cvm_version),
            ],
        }
    }

    /// This lineage's own release
    pub fn release(&self) -> ReleaseRef {
        ReleaseRef {
            name: self.name.clone(),
            title: self.title.clone(),
            repository: self.repository.clone(),
            version: self.version.clone(),
            release_tag: self.release_tag.clone(),
        }
    }

    /// Own release first, then companions
    pub fn releases(&self) -> Vec<ReleaseRef> {
        std::iter::once(self.release()).chain(self.companions.iter().cloned()).collect()
    }

    pub fn release_url(&self) -> String {
        self.release().url()
    }

    pub fn artifact(&self, role: ArtifactRole) -> Option<&ArtifactSpec> {
        self.artifacts.iter().find(|a| a.role == role)
    }

    /// Reject lineage definitions the pipeline cannot verify soundly
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::Config(format!("lineage {}: {}", self.name, reason));

        if self.name.is_empty() || self.repository.is_empty() || self.version.is_empty() {
            return Err(invalid("name, repository and version are required".into()));
        }

        let mut names = HashSet::new();
        for artifact in &self.artifacts {
            if !names.insert(artifact.name.as_str()) {
                return Err(invalid(format!("duplicate artifact {}", artifact.name)));
            }
            if artifact.role == ArtifactRole::PlatformMeasurements {
                return Err(invalid("platform measurements are discovered, not listed".into()));
            }
        }

        for role in [ArtifactRole::Kernel, ArtifactRole::Initrd] {
            if self.artifact(role).is_none() {
                return Err(invalid(format!("missing {:?} artifact", role)));
            }
        }

        if self.platform == Platform::SevSnp {
            let loaders = self
                .artifacts
                .iter()
                .filter(|a| matches!(a.role, ArtifactRole::Firmware | ArtifactRole::StageLoader))
                .count();
            if loaders != 1 {
                return Err(invalid("SEV-SNP needs exactly one firmware or stage-loader artifact".into()));
            }
        }

        // Manifest-attestation trust only reaches artifacts pinned by the
        // manifest; anything else needs its own attestation
        if self.trust_mode == TrustMode::ManifestAttestation {
            if let Some(unpinned) = self
                .artifacts
                .iter()
                .find(|a| a.manifest_key.is_none() && a.attested_by.is_none())
            {
                return Err(invalid(format!(
                    "artifact {} has no manifest hash but the lineage only attests its manifest",
                    unpinned.name
                )));
            }
            if self.platform_table.is_some() {
                return Err(invalid("platform measurements require per-artifact attestation".into()));
            }
        }

        if let Some(artifact) = self.artifacts.iter().find(|a| a.attested_by.as_deref() == Some("")) {
            return Err(invalid(format!("artifact {} names an empty attesting repository", artifact.name)));
        }

        if self.cmdline.acpi_hash != self.platform_table.is_some() {
            return Err(invalid("acpi_hash token and platform measurements must be configured together".into()));
        }

        Ok(())
    }
}

impl fmt::Display for Lineage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.name, self.version, self.platform)
    }
}
