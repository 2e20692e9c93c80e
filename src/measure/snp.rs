//! AMD SEV-SNP launch digest

use std::path::PathBuf;

use sev::measurement::{
    snp::{snp_calc_launch_digest, SnpMeasurementArgs},
    vcpu_types::CpuType,
    vmsa::{GuestFeatures, VMMType},
};
use tracing::debug;

use crate::error::{Error, Result};

/// Guest features the CVMs are launched with (SNPActive only)
const GUEST_FEATURES: u64 = 0x1;

/// Inputs to a direct-boot launch digest
#[derive(Debug, Clone)]
pub struct SnpInputs {
    pub vcpus: u32,
    /// OVMF image or stage0 binary
    pub firmware: PathBuf,
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub cmdline: String,
}

/// Compute the launch digest of an EPYC-v4 QEMU guest booting `inputs`.
///
/// Reads every input file, so callers on an async runtime should run this on
/// a blocking thread.
pub fn launch_digest(inputs: &SnpInputs) -> Result<String> {
    let args = SnpMeasurementArgs {
        vcpus: inputs.vcpus,
        vcpu_type: CpuType::EpycV4,
        ovmf_file: inputs.firmware.clone(),
        guest_features: GuestFeatures(GUEST_FEATURES),
        kernel_file: Some(inputs.kernel.clone()),
        initrd_file: Some(inputs.initrd.clone()),
        append: Some(&inputs.cmdline),
        ovmf_hash_str: None,
        vmm_type: Some(VMMType::QEMU),
    };

    let digest = snp_calc_launch_digest(args)
        .map_err(|e| Error::MeasurementTool(format!("SEV-SNP launch digest: {:?}", e)))?
        .get_hex_ld();

    debug!(vcpus = inputs.vcpus, digest, "computed SEV-SNP launch digest");
    Ok(digest)
}
