//! Kernel command line construction
//!
//! The command line is measured, so its tokens and their order must be
//! reproduced exactly:
//!
//! ```text
//! readonly=on <preamble> root=/dev/mapper/root roothash=<hex> [tinfoil-config-hash=<hex>]
//!     [tinfoil-model=<name> tinfoil-domain=<host>] [acpi_hash=<hex>]
//! ```
//!
//! Images that predate the deployment config boot without the config hash.

use crate::error::{Error, Result};

/// Boot-time console/PCI options, which differ between image generations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preamble {
    /// Serial console, used by CPU-only images
    Console,
    /// PCI reallocation and nouveau blacklisting for GPU passthrough
    GpuPci,
}

impl Preamble {
    fn tokens(self) -> &'static str {
        match self {
            Self::Console => "console=ttyS0 earlyprintk=serial",
            Self::GpuPci => "pci=realloc,nocrs modprobe.blacklist=nouveau nouveau.modeset=0",
        }
    }
}

/// Which optional tokens a lineage's command line carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdlineTemplate {
    pub preamble: Preamble,
    pub config_hash: bool,
    pub model_domain: bool,
    pub acpi_hash: bool,
}

/// Values substituted into a template
#[derive(Debug, Clone, Copy, Default)]
pub struct CmdlineParams<'a> {
    pub root_hash: &'a str,
    pub config_hash: Option<&'a str>,
    pub model: Option<&'a str>,
    pub domain: Option<&'a str>,
    pub acpi_hash: Option<&'a str>,
}

impl CmdlineTemplate {
    pub fn render(&self, params: &CmdlineParams<'_>) -> Result<String> {
        let mut tokens = vec![
            "readonly=on".to_string(),
            self.preamble.tokens().to_string(),
            "root=/dev/mapper/root".to_string(),
            format!("roothash={}", hex_value("roothash", params.root_hash)?),
        ];

        if self.config_hash {
            let config_hash = params
                .config_hash
                .ok_or_else(|| Error::Config("tinfoil-config-hash is required for this lineage".into()))?;
            tokens.push(format!("tinfoil-config-hash={}", hex_value("tinfoil-config-hash", config_hash)?));
        }

        if self.model_domain {
            let model = params.model.ok_or_else(|| Error::Config("model is required for this lineage".into()))?;
            let domain = params.domain.ok_or_else(|| Error::Config("domain is required for this lineage".into()))?;
            tokens.push(format!("tinfoil-model={}", token_value("tinfoil-model", model)?));
            tokens.push(format!("tinfoil-domain={}", token_value("tinfoil-domain", domain)?));
        }

        if self.acpi_hash {
            let acpi = params
                .acpi_hash
                .ok_or_else(|| Error::Config("acpi_hash is required for this lineage".into()))?;
            tokens.push(format!("acpi_hash={}", hex_value("acpi_hash", acpi)?));
        }

        Ok(tokens.join(" "))
    }
}

fn token_value<'a>(name: &str, value: &'a str) -> Result<&'a str> {
    if value.is_empty() || value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::Config(format!("invalid value for {}: {:?}", name, value)));
    }
    Ok(value)
}

fn hex_value<'a>(name: &str, value: &'a str) -> Result<&'a str> {
    let value = token_value(name, value)?;
    if !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::Config(format!("{} is not a hex digest: {:?}", name, value)));
    }
    Ok(value)
}
