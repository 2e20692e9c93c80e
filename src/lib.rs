//! # Tinfoil Deployment Measurements
//!
//! Builds the reproducible measurement record of a Tinfoil confidential VM
//! deployment from published release artifacts.
//!
//! ## Pipeline
//!
//! Every release lineage (the legacy TDX `cvmimage`, the stage0-based
//! SEV-SNP `tf-core` image, or the OVMF-booted inference image) goes through
//! the same steps:
//!
//! ### Step 1: Manifest
//! - Fetches the release manifest (artifact digests plus dm-verity root hash)
//! - For manifest-attested lineages, verifies the manifest's own build provenance
//!
//! ### Step 2: Artifacts
//! - Fetches kernel, initrd and firmware/stage0 through a local cache
//! - Checks every digest the manifest pins
//! - For per-artifact lineages, verifies each artifact's Sigstore attestation
//!   (GitHub Actions issuer, source repository, hosted runner)
//!
//! ### Step 3: Measurement
//! - Renders the kernel command line, binding the deployment config hash or
//!   the served model and domain
//! - Computes the SEV-SNP launch digest and the TDX runtime measurement
//!
//! The per-lineage results are merged into a [`DeploymentDescriptor`] whose
//! layout follows the lineage set. Nothing is written unless every lineage
//! verified completely.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tinfoil_measure::{LoadedConfig, Pipeline, RunOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = RunOptions::default();
//!     let config = LoadedConfig::load(&options.config_path)?;
//!
//!     let descriptor = Pipeline::new(&options, config)?.run().await?;
//!     descriptor.write(&options.output_dir)?;
//!
//!     Ok(())
//! }
//! ```

pub mod attestation;
pub mod cmdline;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod fetcher;
pub mod hash;
pub mod lineage;
pub mod manifest;
pub mod measure;
pub mod pipeline;
pub mod policy;
pub mod sigstore;
pub mod store;
pub mod transport;

pub use config::{LoadedConfig, RunOptions};
pub use descriptor::DeploymentDescriptor;
pub use error::{Error, Result};
pub use lineage::Lineage;
pub use pipeline::{Pipeline, Services};
