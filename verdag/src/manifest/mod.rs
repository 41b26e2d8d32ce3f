//! Workspace manifest (`verdag.toml`)
//!
//! ```toml
//! [toolchain]
//! path = "toolchain"
//! version = "1.93.0"
//! platform = "x86_64-linux"
//!
//! [[unit]]
//! name = "foundation"
//! srcs = ["foundation/src/lib.rs"]
//!
//! [[unit]]
//! name = "runtime"
//! srcs = ["runtime/src/lib.rs"]
//! deps = ["foundation"]
//! ```
//!
//! Relative paths are resolved against the manifest's directory.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, VerifyError};
use crate::platform::Platform;
use crate::task::{DEFAULT_EDITION, TaskOptions};
use crate::unit::UnitSpec;

/// Default manifest file name
pub const MANIFEST_FILE: &str = "verdag.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub toolchain: ToolchainConfig,
    #[serde(default, rename = "unit")]
    pub units: Vec<UnitConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolchainConfig {
    /// Extracted toolchain bundle directory
    pub path: PathBuf,
    /// Pinned compiler toolchain version
    pub version: String,
    /// Platform identifier; the host platform when absent
    pub platform: Option<String>,
    #[serde(default = "default_edition")]
    pub edition: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitConfig {
    pub name: String,
    #[serde(default)]
    pub srcs: Vec<PathBuf>,
    pub crate_root: Option<PathBuf>,
    pub crate_name: Option<String>,
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_edition() -> String {
    DEFAULT_EDITION.to_string()
}

impl Manifest {
    /// Parse manifest text; errors carry the offending byte span
    pub fn parse(source: &str) -> Result<Manifest> {
        toml::from_str(source)
            .map_err(|e| VerifyError::manifest_error(e.message().to_string(), e.span()))
    }

    /// Read and parse a manifest, resolving relative paths against its directory
    ///
    /// Returns the source text alongside, for diagnostics.
    pub fn load(path: &Path) -> Result<(Manifest, String)> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            VerifyError::io_error(format!("failed to read manifest {}", path.display()), e)
        })?;
        let mut manifest = Self::parse(&source)?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        manifest.resolve_paths(base);
        Ok((manifest, source))
    }

    /// Make every relative path absolute with respect to `base`
    pub fn resolve_paths(&mut self, base: &Path) {
        let rebase = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };

        rebase(&mut self.toolchain.path);
        for unit in &mut self.units {
            unit.srcs.iter_mut().for_each(rebase);
            if let Some(root) = unit.crate_root.as_mut() {
                rebase(root);
            }
        }
    }

    /// Configured platform, or the host's
    pub fn platform(&self) -> Result<Platform> {
        match &self.toolchain.platform {
            Some(id) => Platform::parse(id),
            None => Platform::host(),
        }
    }

    pub fn task_options(&self) -> TaskOptions {
        TaskOptions {
            edition: self.toolchain.edition.clone(),
        }
    }

    /// Unit declarations paired with their dependency names
    pub fn unit_specs(&self) -> Vec<(UnitSpec, Vec<String>)> {
        self.units
            .iter()
            .map(|u| {
                let spec = UnitSpec {
                    name: u.name.clone(),
                    sources: u.srcs.clone(),
                    entry_override: u.crate_root.clone(),
                    identity_override: u.crate_name.clone(),
                    extra_arguments: u.extra_args.clone(),
                };
                (spec, u.deps.clone())
            })
            .collect()
    }
}
