//! Measurement pipeline
//!
//! Each lineage moves through a fixed sequence of stages:
//!
//! ```text
//! Init -> ManifestResolved -> ArtifactsVerified -> Measured -> DescriptorAssembled
//! ```
//!
//! Lineages run concurrently and independently. Once every lineage reached
//! `Measured` their outputs are merged into one [`DeploymentDescriptor`]; if
//! any lineage failed, no descriptor is assembled and every failure is
//! reported by lineage name.
//!
//! The lineage set decides the descriptor layout: one SEV-SNP and one TDX
//! lineage give the dual layout, a lone SEV-SNP lineage the firmware layout.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::attestation::{AttestationVerifier, Backends, GhAttestationTool, ProvenanceBackend, ProvenanceIndex};
use crate::attestation::index::GITHUB_API;
use crate::cmdline::CmdlineParams;
use crate::config::{LoadedConfig, RunOptions};
use crate::descriptor::{
    DeploymentDescriptor, Deployment, DescriptorBody, DualDescriptor, FirmwareDescriptor, ReleaseLink, ServedModel,
};
use crate::error::{Error, LineageFailure, Result};
use crate::fetcher::{ArtifactFetcher, ArtifactSet, TrustOutcome};
use crate::lineage::{ArtifactRole, ArtifactSpec, Lineage, Platform};
use crate::manifest::{self, Manifest, ManifestResolver};
use crate::measure::{LocalMeasurer, PlatformMeasurer};
use crate::sigstore::TrustRoot;
use crate::store::ContentStore;
use crate::transport::{HttpTransport, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Init,
    ManifestResolved,
    ArtifactsVerified,
    Measured,
    DescriptorAssembled,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::ManifestResolved => "manifest-resolved",
            Self::ArtifactsVerified => "artifacts-verified",
            Self::Measured => "measured",
            Self::DescriptorAssembled => "descriptor-assembled",
        };
        f.write_str(name)
    }
}

/// A platform measurement produced for one lineage
#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    /// Hex launch digest
    Snp(String),
    /// Measurement record from `tdx-measure`
    Tdx(Value),
}

/// Result of a lineage that reached [`Stage::Measured`]
#[derive(Debug, Clone)]
pub struct LineageOutput {
    pub lineage: Arc<Lineage>,
    pub stage: Stage,
    pub manifest: Arc<Manifest>,
    pub artifacts: ArtifactSet,
    pub cmdline: String,
    pub measurement: Measurement,
}

/// External collaborators of a run
#[derive(Clone)]
pub struct Services {
    pub transport: Arc<dyn Transport>,
    pub backends: Backends,
    pub measurer: Arc<dyn PlatformMeasurer>,
    /// GitHub REST API base, used to list releases
    pub api_base: String,
}

/// Descriptor layout implied by a lineage set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Dual,
    Firmware,
}

impl Shape {
    fn of(lineages: &[Lineage]) -> Result<Self> {
        let count = |platform: Platform| lineages.iter().filter(|l| l.platform == platform).count();
        match (count(Platform::SevSnp), count(Platform::Tdx)) {
            (1, 1) => Ok(Self::Dual),
            (1, 0) => Ok(Self::Firmware),
            (snp, tdx) => Err(Error::Config(format!(
                "no descriptor layout for {} SEV-SNP and {} TDX lineages",
                snp, tdx
            ))),
        }
    }
}

pub struct Pipeline {
    stages: Arc<Stages>,
    lineages: Vec<Arc<Lineage>>,
    shape: Shape,
}

/// Shared state every lineage task works against
struct Stages {
    config: LoadedConfig,
    resolver: ManifestResolver,
    fetcher: Arc<ArtifactFetcher>,
    measurer: Arc<dyn PlatformMeasurer>,
}

impl Pipeline {
    /// Production pipeline: HTTP transport, on-disk cache under
    /// `options.cache_dir`, local tools for provenance and TDX measurement.
    ///
    /// The attestation index is only available when `options.fulcio_roots`
    /// names a trust root.
    pub fn new(options: &RunOptions, config: LoadedConfig) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new()?);
        let index = match &options.fulcio_roots {
            Some(path) => {
                let trust_root = load_trust_root(path)?;
                info!(path = %path.display(), authorities = trust_root.len(), "loaded Fulcio trust root");
                let index = ProvenanceIndex::new(
                    transport.clone(),
                    options.attestation_index.clone(),
                    AttestationVerifier::with_trust_root(trust_root),
                );
                Some(Arc::new(index) as Arc<dyn ProvenanceBackend>)
            }
            None => None,
        };
        let services = Services {
            transport,
            backends: Backends {
                local_tool: Arc::new(GhAttestationTool::new(&options.gh)),
                index,
            },
            measurer: Arc::new(LocalMeasurer::new(&options.tdx_measure)),
            api_base: GITHUB_API.to_string(),
        };

        let mut lineages = Lineage::from_config(&config.settings);
        if let Some(kind) = options.provenance {
            for lineage in &mut lineages {
                lineage.provenance = kind;
            }
        }

        Self::with_services(config, lineages, &options.cache_dir, services)
    }

    /// Pipeline over explicit lineages and collaborators.
    ///
    /// Lineage definitions, their provenance back-ends and the descriptor
    /// layout are validated here, before any network access.
    pub fn with_services(
        config: LoadedConfig,
        lineages: Vec<Lineage>,
        cache_dir: &Path,
        services: Services,
    ) -> Result<Self> {
        for lineage in &lineages {
            lineage.validate()?;
            services.backends.select(lineage.provenance)?;
        }
        let shape = Shape::of(&lineages)?;
        if shape == Shape::Firmware && (config.settings.model.is_none() || config.settings.domain.is_none()) {
            return Err(Error::Config("the firmware layout records model and domain; both are required".into()));
        }

        let store = Arc::new(ContentStore::new(cache_dir, services.transport.clone()));
        let resolver = ManifestResolver::new(
            store.clone(),
            services.transport,
            services.backends.clone(),
            services.api_base,
        );
        let fetcher = Arc::new(ArtifactFetcher::new(store, services.backends));

        Ok(Self {
            stages: Arc::new(Stages {
                config,
                resolver,
                fetcher,
                measurer: services.measurer,
            }),
            lineages: lineages.into_iter().map(Arc::new).collect(),
            shape,
        })
    }

    pub fn lineages(&self) -> impl Iterator<Item = &Lineage> {
        self.lineages.iter().map(AsRef::as_ref)
    }

    /// Run every lineage and assemble the descriptor
    pub async fn run(&self) -> Result<DeploymentDescriptor> {
        let mut outputs = self.run_lineages().await?;
        let descriptor = self.assemble(&mut outputs)?;
        info!(lineages = outputs.len(), "deployment descriptor assembled");
        Ok(descriptor)
    }

    /// Run every lineage to completion, in parallel.
    ///
    /// Outputs are returned in lineage order.
    pub async fn run_lineages(&self) -> Result<Vec<LineageOutput>> {
        let mut tasks = JoinSet::new();
        for (position, lineage) in self.lineages.iter().enumerate() {
            let stages = self.stages.clone();
            let lineage = lineage.clone();
            tasks.spawn(async move { (position, stages.run(lineage).await) });
        }

        let mut outputs: Vec<Option<LineageOutput>> = vec![None; self.lineages.len()];
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((position, Ok(output))) => outputs[position] = Some(output),
                Ok((position, Err(error))) => failures.push((position, error)),
                Err(e) => {
                    return Err(Error::Io(std::io::Error::other(format!("lineage task failed: {}", e))));
                }
            }
        }

        if !failures.is_empty() {
            failures.sort_by_key(|(position, _)| *position);
            return Err(Error::LineagesFailed(
                failures
                    .into_iter()
                    .map(|(position, error)| LineageFailure {
                        lineage: self.lineages[position].name.clone(),
                        error,
                    })
                    .collect(),
            ));
        }

        Ok(outputs.into_iter().flatten().collect())
    }

    /// Merge measured lineages into one descriptor.
    ///
    /// Each output moves to [`Stage::DescriptorAssembled`] once the
    /// descriptor exists.
    pub fn assemble(&self, outputs: &mut [LineageOutput]) -> Result<DeploymentDescriptor> {
        let body = match self.shape {
            Shape::Dual => DescriptorBody::Dual(self.dual(outputs)?),
            Shape::Firmware => DescriptorBody::Firmware(self.firmware(outputs)?),
        };
        let releases = outputs
            .iter()
            .flat_map(|o| o.lineage.releases())
            .map(|release| ReleaseLink {
                url: release.url(),
                title: release.title,
                version: release.version,
            })
            .collect();

        for output in outputs.iter_mut() {
            enter(&output.lineage, &mut output.stage, Stage::DescriptorAssembled);
        }
        Ok(DeploymentDescriptor { body, releases })
    }

    fn dual(&self, outputs: &[LineageOutput]) -> Result<DualDescriptor> {
        let (snp, snp_digest) = snp_output(outputs)?;
        let (tdx, tdx_record) = tdx_output(outputs)?;

        Ok(DualDescriptor {
            snp_measurement: snp_digest.to_string(),
            tdx_measurement: tdx_record.clone(),
            cmdline: tdx.cmdline.clone(),
            cmdline_snp: snp.cmdline.clone(),
            hashes: tdx.manifest.entries().clone(),
            hashes_snp: snp.manifest.entries().clone(),
            config: self.stages.config.to_base64(),
            versions: outputs
                .iter()
                .flat_map(|o| o.lineage.releases())
                .map(|release| (release.name, release.version))
                .collect(),
        })
    }

    fn firmware(&self, outputs: &[LineageOutput]) -> Result<FirmwareDescriptor> {
        let (output, digest) = snp_output(outputs)?;
        let settings = &self.stages.config.settings;
        let (model, domain) = match (&settings.model, &settings.domain) {
            (Some(model), Some(domain)) => (model.clone(), domain.clone()),
            _ => return Err(Error::Config("model and domain are required for the firmware layout".into())),
        };
        let versions: Map<String, Value> = output
            .lineage
            .releases()
            .into_iter()
            .map(|release| (release.name, Value::String(release.version)))
            .collect();

        Ok(FirmwareDescriptor {
            config: ServedModel { model, domain },
            measurement: digest.to_string(),
            deployment: Deployment {
                cmdline: output.cmdline.clone(),
                cpus: settings.cpus,
                memory: settings.memory,
                versions,
            },
            hashes: output.manifest.entries().clone(),
        })
    }
}

/// The SEV-SNP lineage output and its launch digest
fn snp_output(outputs: &[LineageOutput]) -> Result<(&LineageOutput, &str)> {
    outputs
        .iter()
        .find(|o| o.lineage.platform == Platform::SevSnp)
        .ok_or_else(|| Error::Config("no SEV-SNP measurement".into()))
        .and_then(|output| match &output.measurement {
            Measurement::Snp(digest) => Ok((output, digest.as_str())),
            Measurement::Tdx(_) => Err(wrong_platform(output)),
        })
}

/// The TDX lineage output and its measurement record
fn tdx_output(outputs: &[LineageOutput]) -> Result<(&LineageOutput, &Value)> {
    outputs
        .iter()
        .find(|o| o.lineage.platform == Platform::Tdx)
        .ok_or_else(|| Error::Config("no TDX measurement".into()))
        .and_then(|output| match &output.measurement {
            Measurement::Tdx(record) => Ok((output, record)),
            Measurement::Snp(_) => Err(wrong_platform(output)),
        })
}

fn wrong_platform(output: &LineageOutput) -> Error {
    Error::Config(format!(
        "lineage {} produced a measurement for the wrong platform",
        output.lineage.name
    ))
}

fn load_trust_root(path: &Path) -> Result<TrustRoot> {
    let pem = std::fs::read(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
    TrustRoot::from_pem(&pem).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
}

impl Stages {
    async fn run(&self, lineage: Arc<Lineage>) -> Result<LineageOutput> {
        let mut stage = Stage::Init;
        let result = self.advance(&lineage, &mut stage).await;
        if let Err(error) = &result {
            warn!(lineage = %lineage.name, %stage, %error, "lineage failed");
        }
        result
    }

    async fn advance(&self, lineage: &Arc<Lineage>, stage: &mut Stage) -> Result<LineageOutput> {
        info!(lineage = %lineage, "starting");

        // 1. Fetch the manifest and, where the lineage relies on it, attest it
        let manifest = Arc::new(self.resolver.resolve(lineage).await?);
        enter(lineage, stage, Stage::ManifestResolved);

        // 2. Fetch, hash-check and attest every artifact
        let specs = self.artifact_specs(lineage).await?;
        let artifacts = self
            .fetcher
            .clone()
            .fetch_all(lineage.clone(), manifest.clone(), specs)
            .await?;
        if let Some(unverified) = artifacts.iter().find(|a| a.outcome() != TrustOutcome::Verified) {
            return Err(Error::Config(format!("artifact {} was not verified", unverified.name())));
        }
        enter(lineage, stage, Stage::ArtifactsVerified);

        // 3. Build the command line and measure
        let cmdline = self.cmdline(lineage, &manifest, &artifacts).await?;
        debug!(lineage = %lineage.name, cmdline, "kernel command line");
        let measurement = self.measure(lineage, &artifacts, &cmdline).await?;
        enter(lineage, stage, Stage::Measured);

        Ok(LineageOutput {
            lineage: lineage.clone(),
            stage: *stage,
            manifest,
            artifacts,
            cmdline,
            measurement,
        })
    }

    /// Listed artifacts plus the discovered platform-measurements document
    async fn artifact_specs(&self, lineage: &Lineage) -> Result<Vec<ArtifactSpec>> {
        let mut specs = lineage.artifacts.clone();
        if let Some(source) = &lineage.platform_table {
            let url = self.resolver.platform_table_url(&lineage.repository, source).await?;
            specs.push(ArtifactSpec {
                name: source.file_name.clone(),
                role: ArtifactRole::PlatformMeasurements,
                url,
                manifest_key: None,
                attested_by: None,
            });
        }
        Ok(specs)
    }

    async fn cmdline(&self, lineage: &Lineage, manifest: &Manifest, artifacts: &ArtifactSet) -> Result<String> {
        let acpi = match &lineage.platform_table {
            Some(source) => {
                let raw = tokio::fs::read(artifacts.require(ArtifactRole::PlatformMeasurements)?).await?;
                Some(manifest::acpi_hash(&source.file_name, &raw, &self.config.settings.platform)?)
            }
            None => None,
        };

        let config_hash = self.config.config_hash();
        let params = CmdlineParams {
            root_hash: manifest.get(&lineage.root_hash_key)?,
            config_hash: Some(&config_hash),
            model: self.config.settings.model.as_deref(),
            domain: self.config.settings.domain.as_deref(),
            acpi_hash: acpi.as_deref(),
        };
        lineage.cmdline.render(&params)
    }

    async fn measure(&self, lineage: &Lineage, artifacts: &ArtifactSet, cmdline: &str) -> Result<Measurement> {
        let settings = &self.config.settings;
        let kernel = artifacts.require(ArtifactRole::Kernel)?;
        let initrd = artifacts.require(ArtifactRole::Initrd)?;

        match lineage.platform {
            Platform::SevSnp => {
                let firmware = artifacts
                    .require(ArtifactRole::Firmware)
                    .or_else(|_| artifacts.require(ArtifactRole::StageLoader))?;
                let digest = self
                    .measurer
                    .compute_snp_digest(settings.cpus, firmware, kernel, initrd, cmdline)
                    .await?;
                info!(lineage = %lineage.name, digest, "SEV-SNP measurement");
                Ok(Measurement::Snp(digest))
            }
            Platform::Tdx => {
                let record = self
                    .measurer
                    .compute_tdx_measurement(settings.cpus, settings.memory, kernel, initrd, cmdline)
                    .await?;
                info!(lineage = %lineage.name, "TDX measurement");
                Ok(Measurement::Tdx(record))
            }
        }
    }
}

fn enter(lineage: &Lineage, stage: &mut Stage, next: Stage) {
    debug_assert!(next > *stage, "stage {} cannot follow {}", next, stage);
    *stage = next;
    info!(lineage = %lineage.name, stage = %next, "stage reached");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::StaticBackend;
    use crate::config::tests::{FIRMWARE_SAMPLE, SAMPLE};
    use crate::hash;
    use crate::attestation::ProvenanceKind;
    use crate::sigstore::tests::TestAuthority;
    use crate::transport::FixtureTransport;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Measurer that derives its output from the inputs it was given
    #[derive(Default)]
    struct EchoMeasurer {
        cmdlines: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PlatformMeasurer for EchoMeasurer {
        async fn compute_snp_digest(
            &self,
            cpus: u32,
            firmware: &Path,
            _kernel: &Path,
            _initrd: &Path,
            cmdline: &str,
        ) -> Result<String> {
            self.cmdlines.lock().unwrap().push(cmdline.to_string());
            let firmware = std::fs::read(firmware)?;
            Ok(hash::digest_bytes(format!("{}:{}:{}", cpus, firmware.len(), cmdline).as_bytes()))
        }

        async fn compute_tdx_measurement(
            &self,
            cpus: u32,
            memory_gib: u32,
            _kernel: &Path,
            _initrd: &Path,
            cmdline: &str,
        ) -> Result<Value> {
            self.cmdlines.lock().unwrap().push(cmdline.to_string());
            Ok(serde_json::json!({ "cpus": cpus, "memory": memory_gib, "rtmr2": hash::digest_bytes(cmdline.as_bytes()) }))
        }
    }

    const PLATFORM_JSON: &str = r#"{"h200-8x": {"acpi": "dd44"}}"#;

    fn fixtures(lineages: &[Lineage]) -> FixtureTransport {
        let mut transport = FixtureTransport::default().with(
            "https://api.github.com/repos/tinfoilsh/tf-core/releases",
            r#"[{"tag_name": "v0.0.9"}, {"tag_name": "plt-msr-v0.0.1"}]"#,
        );
        transport = transport.with(
            "https://github.com/tinfoilsh/tf-core/releases/download/plt-msr-v0.0.1/platform-measurements.json",
            PLATFORM_JSON,
        );
        for lineage in lineages {
            let mut entries = serde_json::Map::new();
            entries.insert(lineage.root_hash_key.clone(), "ee".repeat(32).into());
            for spec in &lineage.artifacts {
                let body = format!("{}/{}", lineage.name, spec.name);
                if let Some(key) = &spec.manifest_key {
                    entries.insert(key.clone(), hash::digest_bytes(body.as_bytes()).into());
                }
                transport = transport.with(&spec.url, body);
            }
            transport = transport.with(&lineage.manifest_url, Value::Object(entries).to_string());
        }
        transport
    }

    fn services(transport: FixtureTransport, backend: Arc<StaticBackend>, measurer: Arc<EchoMeasurer>) -> Services {
        Services {
            transport: Arc::new(transport),
            backends: Backends { local_tool: backend.clone(), index: Some(backend) },
            measurer,
            api_base: GITHUB_API.to_string(),
        }
    }

    fn pipeline(
        dir: &Path,
        transport: FixtureTransport,
        backend: Arc<StaticBackend>,
        measurer: Arc<EchoMeasurer>,
    ) -> Pipeline {
        let config = LoadedConfig::from_bytes(SAMPLE.as_bytes().to_vec()).unwrap();
        let lineages = Lineage::from_config(&config.settings);
        Pipeline::with_services(config, lineages, dir, services(transport, backend, measurer)).unwrap()
    }

    fn sample_lineages() -> Vec<Lineage> {
        let config = LoadedConfig::from_bytes(SAMPLE.as_bytes().to_vec()).unwrap();
        Lineage::from_config(&config.settings)
    }

    fn dual(descriptor: &DeploymentDescriptor) -> &DualDescriptor {
        match &descriptor.body {
            DescriptorBody::Dual(body) => body,
            DescriptorBody::Firmware(_) => panic!("expected the dual layout"),
        }
    }

    #[tokio::test]
    async fn test_full_run_assembles_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(StaticBackend::default());
        let measurer = Arc::new(EchoMeasurer::default());
        let pipeline = pipeline(dir.path(), fixtures(&sample_lineages()), backend.clone(), measurer.clone());

        let descriptor = pipeline.run().await.unwrap();
        let body = dual(&descriptor);

        let config_hash = hash::digest_bytes(SAMPLE.as_bytes());
        let root = "ee".repeat(32);
        assert_eq!(
            body.cmdline,
            format!(
                "readonly=on pci=realloc,nocrs modprobe.blacklist=nouveau nouveau.modeset=0 \
                 root=/dev/mapper/root roothash={} tinfoil-config-hash={}",
                root, config_hash
            )
        );
        assert_eq!(body.cmdline_snp, format!("{} acpi_hash=dd44", body.cmdline));
        assert_eq!(body.tdx_measurement["memory"], 64);
        assert_eq!(body.hashes["root"], Value::String(root.clone()));
        assert_eq!(body.hashes_snp["disk_sha256"], Value::String(root));
        assert_eq!(body.versions["cvmimage"], "0.4.2");
        assert_eq!(body.versions["tf-core"], "v0.0.9");
        assert_eq!(descriptor.releases.len(), 2);

        assert_eq!(
            backend.seen(),
            vec![
                "initrd@tinfoilsh/tf-core".to_string(),
                "kernel@tinfoilsh/tf-core".to_string(),
                "manifest@tinfoilsh/cvmimage".to_string(),
                "platform-measurements.json@tinfoilsh/tf-core".to_string(),
                "stage0@tinfoilsh/tf-core".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_firmware_layout_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoadedConfig::from_bytes(FIRMWARE_SAMPLE.as_bytes().to_vec()).unwrap();
        let lineages = Lineage::from_config(&config.settings);
        let backend = Arc::new(StaticBackend::default());
        let measurer = Arc::new(EchoMeasurer::default());
        let services = services(fixtures(&lineages), backend.clone(), measurer.clone());
        let pipeline = Pipeline::with_services(config, lineages, dir.path(), services).unwrap();

        let descriptor = pipeline.run().await.unwrap();
        let body = match &descriptor.body {
            DescriptorBody::Firmware(body) => body,
            DescriptorBody::Dual(_) => panic!("expected the firmware layout"),
        };

        let expected = format!(
            "readonly=on console=ttyS0 earlyprintk=serial root=/dev/mapper/root roothash={} \
             tinfoil-model=llama3.2:1b tinfoil-domain=llama.tinfoil.sh",
            "ee".repeat(32)
        );
        assert_eq!(body.deployment.cmdline, expected);
        assert!(!body.deployment.cmdline.contains("tinfoil-config-hash"));
        assert_eq!(*measurer.cmdlines.lock().unwrap(), vec![expected]);
        assert_eq!(body.config.model, "llama3.2:1b");
        assert_eq!(body.config.domain, "llama.tinfoil.sh");
        assert_eq!(body.deployment.cpus, 8);
        assert_eq!(body.deployment.memory, 26);
        assert_eq!(body.deployment.versions["inference_image"], "0.0.17");
        assert_eq!(body.deployment.versions["ovmf"], "0.0.2");
        assert_eq!(descriptor.snp_measurement(), body.measurement);

        let titles: Vec<&str> = descriptor.releases.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["Inference Image", "OVMF"]);
        assert_eq!(
            backend.seen(),
            vec![
                "OVMF.fd@tinfoilanalytics/edk2".to_string(),
                "manifest@tinfoilanalytics/cvmimage".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_assembly_advances_every_lineage() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(
            dir.path(),
            fixtures(&sample_lineages()),
            Arc::new(StaticBackend::default()),
            Arc::new(EchoMeasurer::default()),
        );

        let mut outputs = pipeline.run_lineages().await.unwrap();
        assert!(outputs.iter().all(|o| o.stage == Stage::Measured));

        pipeline.assemble(&mut outputs).unwrap();
        assert!(outputs.iter().all(|o| o.stage == Stage::DescriptorAssembled));
        assert_eq!(Stage::DescriptorAssembled.to_string(), "descriptor-assembled");
    }

    #[tokio::test]
    async fn test_failed_assembly_keeps_measured_stage() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(
            dir.path(),
            fixtures(&sample_lineages()),
            Arc::new(StaticBackend::default()),
            Arc::new(EchoMeasurer::default()),
        );

        let mut outputs = pipeline.run_lineages().await.unwrap();
        // Only the TDX output left: the dual layout cannot be built
        outputs.retain(|o| o.lineage.platform == Platform::Tdx);
        assert!(matches!(pipeline.assemble(&mut outputs), Err(Error::Config(_))));
        assert_eq!(outputs[0].stage, Stage::Measured);
    }

    #[tokio::test]
    async fn test_second_run_reuses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let lineages = sample_lineages();

        let first = pipeline(
            dir.path(),
            fixtures(&lineages),
            Arc::new(StaticBackend::default()),
            Arc::new(EchoMeasurer::default()),
        )
        .run()
        .await
        .unwrap();

        // Only the release listing may be fetched again
        let transport = FixtureTransport::default().with(
            "https://api.github.com/repos/tinfoilsh/tf-core/releases",
            r#"[{"tag_name": "plt-msr-v0.0.1"}]"#,
        );
        let second = pipeline(
            dir.path(),
            transport,
            Arc::new(StaticBackend::default()),
            Arc::new(EchoMeasurer::default()),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
    }

    #[tokio::test]
    async fn test_failures_are_reported_per_lineage() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(StaticBackend::default().rejecting("stage0"));
        let pipeline = pipeline(
            dir.path(),
            fixtures(&sample_lineages()),
            backend,
            Arc::new(EchoMeasurer::default()),
        );

        match pipeline.run().await.unwrap_err() {
            Error::LineagesFailed(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].lineage, "tf-core");
                assert!(matches!(failures[0].error, Error::NoValidAttestation { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_platform_fails_before_measuring() {
        let dir = tempfile::tempdir().unwrap();
        let measurer = Arc::new(EchoMeasurer::default());
        let config = LoadedConfig::from_bytes(SAMPLE.replace("h200-8x", "b200-8x").into_bytes()).unwrap();
        let lineages = Lineage::from_config(&config.settings);
        let services = services(fixtures(&lineages), Arc::new(StaticBackend::default()), measurer.clone());
        let pipeline = Pipeline::with_services(config, lineages, dir.path(), services).unwrap();

        let err = pipeline.run().await.unwrap_err();
        assert!(err.to_string().contains("'b200-8x'"), "{err}");
        assert!(err.to_string().contains("h200-8x"), "{err}");
        // The TDX lineage still measured; the SEV-SNP one never got there
        assert_eq!(measurer.cmdlines.lock().unwrap().len(), 1);
    }

    fn empty_services() -> Services {
        services(
            FixtureTransport::default(),
            Arc::new(StaticBackend::default()),
            Arc::new(EchoMeasurer::default()),
        )
    }

    #[test]
    fn test_lineage_set_without_layout_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = || LoadedConfig::from_bytes(SAMPLE.as_bytes().to_vec()).unwrap();

        let tdx_only = vec![Lineage::cvmimage("0.4.2")];
        let err = Pipeline::with_services(config(), tdx_only, dir.path(), empty_services()).err().unwrap();
        assert!(err.to_string().contains("0 SEV-SNP and 1 TDX"), "{err}");

        let two_snp = vec![
            Lineage::tf_core("v0.0.9", "v0.2.1"),
            Lineage::inference_ovmf("0.0.17", "0.0.2"),
        ];
        let err = Pipeline::with_services(config(), two_snp, dir.path(), empty_services()).err().unwrap();
        assert!(err.to_string().contains("2 SEV-SNP and 0 TDX"), "{err}");
    }

    #[test]
    fn test_firmware_layout_needs_model_and_domain() {
        let dir = tempfile::tempdir().unwrap();
        // Valid for the dual layout, but carries no model or domain
        let config = LoadedConfig::from_bytes(SAMPLE.as_bytes().to_vec()).unwrap();
        let lineages = vec![Lineage::inference_ovmf("0.0.17", "0.0.2")];
        assert!(matches!(
            Pipeline::with_services(config, lineages, dir.path(), empty_services()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_index_provenance_without_backend_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoadedConfig::from_bytes(SAMPLE.as_bytes().to_vec()).unwrap();
        let mut lineages = Lineage::from_config(&config.settings);
        for lineage in &mut lineages {
            lineage.provenance = ProvenanceKind::Index;
        }
        let mut services = empty_services();
        services.backends.index = None;

        let err = Pipeline::with_services(config, lineages, dir.path(), services).err().unwrap();
        assert!(err.to_string().contains("--fulcio-roots"), "{err}");
    }

    #[test]
    fn test_index_provenance_requires_trust_root() {
        let dir = tempfile::tempdir().unwrap();
        let options = RunOptions {
            cache_dir: dir.path().to_path_buf(),
            provenance: Some(ProvenanceKind::Index),
            ..RunOptions::default()
        };
        let config = LoadedConfig::from_bytes(SAMPLE.as_bytes().to_vec()).unwrap();
        assert!(matches!(Pipeline::new(&options, config), Err(Error::Config(_))));
    }

    #[test]
    fn test_trust_root_enables_index_provenance() {
        let dir = tempfile::tempdir().unwrap();
        let roots = dir.path().join("fulcio.pem");
        std::fs::write(&roots, TestAuthority::new().pem()).unwrap();
        let options = RunOptions {
            cache_dir: dir.path().to_path_buf(),
            provenance: Some(ProvenanceKind::Index),
            fulcio_roots: Some(roots),
            ..RunOptions::default()
        };
        let config = LoadedConfig::from_bytes(SAMPLE.as_bytes().to_vec()).unwrap();
        assert!(Pipeline::new(&options, config).is_ok());
    }

    #[test]
    fn test_unreadable_trust_root_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let roots = dir.path().join("fulcio.pem");
        std::fs::write(&roots, "not a certificate").unwrap();
        let options = RunOptions {
            cache_dir: dir.path().to_path_buf(),
            fulcio_roots: Some(roots),
            ..RunOptions::default()
        };
        let config = LoadedConfig::from_bytes(SAMPLE.as_bytes().to_vec()).unwrap();
        let err = Pipeline::new(&options, config).err().unwrap();
        assert!(matches!(err, Error::Config(_)), "{err}");
        assert!(err.to_string().contains("fulcio.pem"), "{err}");

        let options = RunOptions {
            cache_dir: dir.path().to_path_buf(),
            fulcio_roots: Some(dir.path().join("missing.pem")),
            ..RunOptions::default()
        };
        let config = LoadedConfig::from_bytes(SAMPLE.as_bytes().to_vec()).unwrap();
        assert!(matches!(Pipeline::new(&options, config), Err(Error::Config(_))));
    }
}
