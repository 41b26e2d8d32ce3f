//! Toolchain Bundle
//!
//! An immutable handle to everything the verifier needs that is not part of
//! the crate under verification: the verifier driver, the SMT solver, the
//! precompiled foundational libraries, and the compiler toolchain version
//! the driver was built against.
//!
//! Acquisition (download, checksum, extraction) is somebody else's job;
//! [`ArtifactSource`] is the seam it plugs into. [`LocalBundle`] covers the
//! common case of an already-extracted release directory.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::error::{Result, VerifyError};
use crate::platform::Platform;

/// File name of the verifier driver inside a release
pub const VERIFIER_BINARY: &str = "rust_verify";

/// File name of the SMT solver inside a release
pub const SOLVER_BINARY: &str = "z3";

/// How a library artifact is bound on the verifier command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LibraryKind {
    /// Compiled crate, bound with `--extern name=path`
    Extern,
    /// Verifier summary (`.vir`), bound with `--import name=path`
    Import,
}

impl LibraryKind {
    pub fn flag(&self) -> &'static str {
        match self {
            LibraryKind::Extern => "--extern",
            LibraryKind::Import => "--import",
        }
    }
}

/// A named precompiled artifact shipped with the toolchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LibraryArtifact {
    /// Crate name the artifact is bound to
    pub name: String,
    pub path: PathBuf,
    pub kind: LibraryKind,
}

impl LibraryArtifact {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, kind: LibraryKind) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind,
        }
    }

    /// Command-line binding for this artifact
    pub fn binding_args(&self) -> [String; 2] {
        [
            self.kind.flag().to_string(),
            format!("{}={}", self.name, self.path.display()),
        ]
    }
}

/// Verifier, solver and foundational libraries for one build
#[derive(Debug, Clone, Serialize)]
pub struct ToolchainBundle {
    pub verifier: PathBuf,
    pub solver: PathBuf,
    pub libraries: Vec<LibraryArtifact>,
    /// Compiler toolchain the verifier was built against, e.g. "1.93.0"
    pub toolchain_version: String,
    pub platform: Platform,
}

impl ToolchainBundle {
    /// Every file the bundle contributes to a task's declared inputs
    pub fn artifacts(&self) -> Vec<PathBuf> {
        let mut files = vec![self.verifier.clone(), self.solver.clone()];
        files.extend(self.libraries.iter().map(|lib| lib.path.clone()));
        files
    }

    /// Bindings for the foundational libraries, in bundle order
    pub fn library_args(&self) -> Vec<String> {
        self.libraries
            .iter()
            .flat_map(|lib| lib.binding_args())
            .collect()
    }

    /// Directory holding the verifier (and its companion shared libraries)
    pub fn verifier_dir(&self) -> Option<&Path> {
        self.verifier.parent()
    }

    pub fn solver_dir(&self) -> Option<&Path> {
        self.solver.parent()
    }
}

/// Source of toolchain bundles
///
/// Given a verifier release version and a platform, yield a bundle whose
/// files are present and executable.
pub trait ArtifactSource {
    fn acquire(&self, toolchain_version: &str, platform: Platform) -> Result<ToolchainBundle>;
}

/// An already-extracted release directory
///
/// The directory is used as-is, or its `<artifact_name>` subdirectory when
/// one exists (release archives unpack into a platform-named folder).
#[derive(Debug, Clone)]
pub struct LocalBundle {
    root: PathBuf,
}

impl LocalBundle {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn release_dir(&self, platform: Platform) -> PathBuf {
        let nested = self.root.join(platform.artifact_name());
        if nested.is_dir() { nested } else { self.root.clone() }
    }

    /// Optional foundational libraries; whichever are missing are skipped
    fn discover_libraries(dir: &Path, platform: Platform) -> Vec<LibraryArtifact> {
        let candidates = [
            ("builtin", "libbuiltin.rlib".to_string(), LibraryKind::Extern),
            (
                "builtin_macros",
                format!("libbuiltin_macros.{}", platform.dylib_extension()),
                LibraryKind::Extern,
            ),
            ("vstd", "libvstd.rlib".to_string(), LibraryKind::Extern),
            ("vstd", "vstd.vir".to_string(), LibraryKind::Import),
        ];

        candidates
            .into_iter()
            .filter_map(|(name, file, kind)| {
                let path = dir.join(&file);
                if path.is_file() {
                    Some(LibraryArtifact::new(name, path, kind))
                } else {
                    debug!(library = name, file = %file, "foundational library not in bundle");
                    None
                }
            })
            .collect()
    }
}

impl ArtifactSource for LocalBundle {
    fn acquire(&self, toolchain_version: &str, platform: Platform) -> Result<ToolchainBundle> {
        let dir = self.release_dir(platform);
        let verifier = dir.join(VERIFIER_BINARY);

        if !is_executable(&verifier) {
            return Err(VerifyError::toolchain_error(
                "verifier",
                format!("{} is missing or not executable", verifier.display()),
                toolchain_version,
            ));
        }

        let bundle = ToolchainBundle {
            verifier,
            solver: dir.join(SOLVER_BINARY),
            libraries: Self::discover_libraries(&dir, platform),
            toolchain_version: toolchain_version.to_string(),
            platform,
        };

        debug!(
            dir = %dir.display(),
            libraries = bundle.libraries.len(),
            "acquired toolchain bundle"
        );
        Ok(bundle)
    }
}

/// Whether `path` is a regular file the current user could execute
pub fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        true
    }
}
