//! Launch measurement computation
//!
//! Both platform measurements are treated as opaque functions of the verified
//! boot artifacts and the kernel command line. The pipeline only talks to the
//! [`PlatformMeasurer`] trait so tests can substitute their own.

pub mod snp;
pub mod tdx;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};

pub use tdx::TdxMeasureTool;

#[async_trait]
pub trait PlatformMeasurer: Send + Sync {
    /// AMD SEV-SNP launch digest as lowercase hex.
    ///
    /// `firmware` is either a full OVMF image or a stage0 binary.
    async fn compute_snp_digest(
        &self,
        cpus: u32,
        firmware: &Path,
        kernel: &Path,
        initrd: &Path,
        cmdline: &str,
    ) -> Result<String>;

    /// Intel TDX runtime measurement record, as produced by the tool
    async fn compute_tdx_measurement(
        &self,
        cpus: u32,
        memory_gib: u32,
        kernel: &Path,
        initrd: &Path,
        cmdline: &str,
    ) -> Result<Value>;
}

/// Computes SEV-SNP digests in-process and TDX measurements with `tdx-measure`
#[derive(Debug, Clone)]
pub struct LocalMeasurer {
    tdx: TdxMeasureTool,
}

impl LocalMeasurer {
    pub fn new(tdx_measure: impl Into<PathBuf>) -> Self {
        Self { tdx: TdxMeasureTool::new(tdx_measure) }
    }
}

#[async_trait]
impl PlatformMeasurer for LocalMeasurer {
    async fn compute_snp_digest(
        &self,
        cpus: u32,
        firmware: &Path,
        kernel: &Path,
        initrd: &Path,
        cmdline: &str,
    ) -> Result<String> {
        let inputs = snp::SnpInputs {
            vcpus: cpus,
            firmware: firmware.to_path_buf(),
            kernel: kernel.to_path_buf(),
            initrd: initrd.to_path_buf(),
            cmdline: cmdline.to_string(),
        };
        tokio::task::spawn_blocking(move || snp::launch_digest(&inputs))
            .await
            .map_err(|e| Error::MeasurementTool(format!("SEV-SNP digest task failed: {}", e)))?
    }

    async fn compute_tdx_measurement(
        &self,
        cpus: u32,
        memory_gib: u32,
        kernel: &Path,
        initrd: &Path,
        cmdline: &str,
    ) -> Result<Value> {
        self.tdx.measure(cpus, memory_gib, kernel, initrd, cmdline).await
    }
}
