//! Intel TDX runtime measurement via the external `tdx-measure` tool

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Boot metadata consumed by `tdx-measure`.
///
/// Only direct boot is measured, so every firmware-side entry is left empty.
#[derive(Debug, Serialize)]
pub struct TdxMetadata {
    pub boot_info: BootInfo,
    pub direct: DirectBoot,
}

#[derive(Debug, Default, Serialize)]
pub struct BootInfo {
    pub bios: String,
    pub acpi_tables: String,
    pub rsdp: String,
    pub table_loader: String,
    pub boot_order: String,
    pub boot_0000: String,
    pub boot_0001: String,
    pub boot_0006: String,
    pub boot_0007: String,
}

#[derive(Debug, Serialize)]
pub struct DirectBoot {
    pub kernel: String,
    pub initrd: String,
    pub cmdline: String,
}

impl TdxMetadata {
    pub fn direct_boot(kernel: &Path, initrd: &Path, cmdline: &str) -> Self {
        Self {
            boot_info: BootInfo::default(),
            direct: DirectBoot {
                kernel: kernel.display().to_string(),
                initrd: initrd.display().to_string(),
                cmdline: cmdline.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct TdxMeasureTool {
    program: PathBuf,
}

impl TdxMeasureTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    /// Run the tool against a freshly generated metadata file.
    ///
    /// Scratch files live in a private temporary directory, so concurrent
    /// measurements never share them.
    pub async fn measure(
        &self,
        cpus: u32,
        memory_gib: u32,
        kernel: &Path,
        initrd: &Path,
        cmdline: &str,
    ) -> Result<Value> {
        let scratch = tempfile::tempdir()?;
        let metadata_path = scratch.path().join("metadata.json");
        let output_path = scratch.path().join("measurement.json");

        let metadata = TdxMetadata::direct_boot(kernel, initrd, cmdline);
        tokio::fs::write(&metadata_path, serde_json::to_vec(&metadata)?).await?;

        let memory = format!("{}G", memory_gib);
        debug!(program = %self.program.display(), cpus, memory, "running tdx-measure");

        let output = tokio::process::Command::new(&self.program)
            .arg(&metadata_path)
            .arg("--runtime-only")
            .arg("--cpu")
            .arg(cpus.to_string())
            .arg("--memory")
            .arg(&memory)
            .arg("--direct-boot=true")
            .arg("--json-file")
            .arg(&output_path)
            .current_dir(scratch.path())
            .output()
            .await
            .map_err(|e| Error::MeasurementTool(format!("failed to run {}: {}", self.program.display(), e)))?;

        if !output.status.success() {
            return Err(Error::MeasurementTool(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let raw = tokio::fs::read(&output_path).await.map_err(|e| {
            Error::MeasurementTool(format!("{} produced no output file: {}", self.program.display(), e))
        })?;
        let measurement = serde_json::from_slice(&raw)
            .map_err(|e| Error::MeasurementTool(format!("unreadable measurement output: {}", e)))?;

        info!(cpus, memory, "computed TDX measurement");
        Ok(measurement)
    }
}
