//! Supported host platforms
//!
//! Verifier releases are published for a fixed set of OS/architecture
//! combinations. Every platform-dependent decision (release artifact name,
//! dynamic-library search variable, execution constraints) is an exhaustive
//! match on [`Platform`], so adding a platform is a compile error until each
//! mapping is filled in.

use std::fmt;

use serde::Serialize;

use crate::error::{Result, VerifyError};

/// Host platform the toolchain bundle was built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    #[serde(rename = "x86_64-linux")]
    X86_64Linux,
    Aarch64Linux,
    #[serde(rename = "x86_64-macos")]
    X86_64Macos,
    Aarch64Macos,
}

/// Constraints the host scheduler must honour when running a verification task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecRequirements {
    /// The task reads host state (real home directory, installed compilers)
    /// and cannot run inside a sandbox.
    pub no_sandbox: bool,
    /// The task must run on the local machine, not a remote executor.
    pub local: bool,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::X86_64Linux,
        Platform::Aarch64Linux,
        Platform::X86_64Macos,
        Platform::Aarch64Macos,
    ];

    /// Parse a platform identifier
    ///
    /// Accepts the canonical `arch-os` spelling as well as the usual target
    /// triples. Anything else is a configuration error.
    pub fn parse(s: &str) -> Result<Platform> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x86_64-linux" | "x86_64-unknown-linux-gnu" | "linux-x86_64" => {
                Ok(Platform::X86_64Linux)
            }
            "aarch64-linux" | "arm64-linux" | "aarch64-unknown-linux-gnu" | "linux-aarch64" => {
                Ok(Platform::Aarch64Linux)
            }
            "x86_64-macos" | "x86_64-apple-darwin" | "macos-x86_64" => Ok(Platform::X86_64Macos),
            "aarch64-macos" | "arm64-macos" | "aarch64-apple-darwin" | "macos-arm64" => {
                Ok(Platform::Aarch64Macos)
            }
            other => Err(VerifyError::config_error(format!(
                "unsupported platform '{}' (expected one of: {})",
                other,
                Platform::ALL
                    .iter()
                    .map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    /// Platform of the running process
    pub fn host() -> Result<Platform> {
        Platform::from_parts(std::env::consts::ARCH, std::env::consts::OS)
    }

    fn from_parts(arch: &str, os: &str) -> Result<Platform> {
        match (arch, os) {
            ("x86_64", "linux") => Ok(Platform::X86_64Linux),
            ("aarch64", "linux") => Ok(Platform::Aarch64Linux),
            ("x86_64", "macos") => Ok(Platform::X86_64Macos),
            ("aarch64", "macos") => Ok(Platform::Aarch64Macos),
            _ => Err(VerifyError::config_error(format!(
                "host platform {arch}-{os} has no verifier release"
            ))),
        }
    }

    /// Canonical identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::X86_64Linux => "x86_64-linux",
            Platform::Aarch64Linux => "aarch64-linux",
            Platform::X86_64Macos => "x86_64-macos",
            Platform::Aarch64Macos => "aarch64-macos",
        }
    }

    /// Release archive stem for this platform
    pub fn artifact_name(&self) -> &'static str {
        match self {
            Platform::X86_64Linux => "verus-x86-linux",
            Platform::Aarch64Linux => "verus-arm64-linux",
            Platform::X86_64Macos => "verus-x86-macos",
            Platform::Aarch64Macos => "verus-arm64-macos",
        }
    }

    /// Environment variable the dynamic loader consults for shared libraries
    pub fn dylib_path_var(&self) -> &'static str {
        match self {
            Platform::X86_64Linux | Platform::Aarch64Linux => "LD_LIBRARY_PATH",
            Platform::X86_64Macos | Platform::Aarch64Macos => "DYLD_LIBRARY_PATH",
        }
    }

    /// Extension of the compiler's proc-macro shared objects
    pub fn dylib_extension(&self) -> &'static str {
        match self {
            Platform::X86_64Linux | Platform::Aarch64Linux => "so",
            Platform::X86_64Macos | Platform::Aarch64Macos => "dylib",
        }
    }

    /// Separator between entries of `PATH`-like variables
    pub fn path_separator(&self) -> char {
        ':'
    }

    /// Execution constraints for verification tasks on this platform
    ///
    /// The environment synthesizer probes host state on every platform, so
    /// the task is never sandboxable.
    pub fn exec_requirements(&self) -> ExecRequirements {
        match self {
            Platform::X86_64Linux
            | Platform::Aarch64Linux
            | Platform::X86_64Macos
            | Platform::Aarch64Macos => ExecRequirements {
                no_sandbox: true,
                local: true,
            },
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical() {
        for platform in Platform::ALL {
            assert_eq!(Platform::parse(platform.as_str()).unwrap(), platform);
        }
    }

    #[test]
    fn test_parse_triples() {
        assert_eq!(
            Platform::parse("aarch64-apple-darwin").unwrap(),
            Platform::Aarch64Macos
        );
        assert_eq!(
            Platform::parse("x86_64-unknown-linux-gnu").unwrap(),
            Platform::X86_64Linux
        );
        assert_eq!(Platform::parse(" ARM64-Linux ").unwrap(), Platform::Aarch64Linux);
    }

    #[test]
    fn test_parse_unknown_is_config_error() {
        let err = Platform::parse("riscv64-linux").unwrap_err();
        assert!(err.is_fatal_config());
        assert!(err.to_string().contains("riscv64-linux"));
        assert!(err.to_string().contains("x86_64-linux"));
    }

    #[test]
    fn test_from_parts() {
        assert_eq!(
            Platform::from_parts("aarch64", "macos").unwrap(),
            Platform::Aarch64Macos
        );
        assert!(Platform::from_parts("x86_64", "windows").is_err());
    }

    #[test]
    fn test_dylib_var() {
        assert_eq!(Platform::X86_64Linux.dylib_path_var(), "LD_LIBRARY_PATH");
        assert_eq!(Platform::Aarch64Macos.dylib_path_var(), "DYLD_LIBRARY_PATH");
        assert_eq!(Platform::X86_64Macos.dylib_extension(), "dylib");
    }

    #[test]
    fn test_artifact_names_distinct() {
        let mut names: Vec<_> = Platform::ALL.iter().map(|p| p.artifact_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), Platform::ALL.len());
    }

    #[test]
    fn test_never_sandboxed() {
        for platform in Platform::ALL {
            let req = platform.exec_requirements();
            assert!(req.no_sandbox);
            assert!(req.local);
        }
    }

    #[test]
    fn test_serde_kebab_case() {
        for platform in Platform::ALL {
            let json = serde_json::to_string(&platform).unwrap();
            assert_eq!(json, format!("\"{}\"", platform.as_str()));
        }
    }
}
