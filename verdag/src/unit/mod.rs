//! Verification units and crate identity resolution
//!
//! A [`VerificationUnit`] is one crate's verification job: its sources, the
//! resolved entry file and crate identity, the upstream units it verifies
//! against, and the path of the success marker it produces.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexSet;
use tracing::debug;

use crate::deps;
use crate::error::{Result, VerifyError};

/// File name that marks a crate's entry point when no override is given
pub const CONVENTIONAL_ENTRY: &str = "lib.rs";

/// Extension of success marker files
pub const MARKER_EXTENSION: &str = "success";

/// Declared configuration of a unit, before resolution
#[derive(Debug, Clone, Default)]
pub struct UnitSpec {
    /// Declared unit name (may contain hyphens)
    pub name: String,
    /// Source files in declaration order
    pub sources: Vec<PathBuf>,
    /// Explicit entry file override
    pub entry_override: Option<PathBuf>,
    /// Explicit crate identity override, used verbatim
    pub identity_override: Option<String>,
    /// Flags forwarded verbatim to the verifier
    pub extra_arguments: Vec<String>,
}

impl UnitSpec {
    pub fn new(name: impl Into<String>, sources: Vec<PathBuf>) -> Self {
        Self {
            name: name.into(),
            sources,
            ..Self::default()
        }
    }

    pub fn entry(mut self, path: impl Into<PathBuf>) -> Self {
        self.entry_override = Some(path.into());
        self
    }

    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity_override = Some(identity.into());
        self
    }

    pub fn extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_arguments = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Pick the entry source
///
/// Priority: explicit override, then the first source named
/// [`CONVENTIONAL_ENTRY`], then the first declared source.
pub fn resolve_entry(sources: &[PathBuf], entry_override: Option<&Path>) -> Result<PathBuf> {
    let Some(first) = sources.first() else {
        return Err(VerifyError::config_error(
            "verification unit declares no source files",
        ));
    };

    if let Some(entry) = entry_override {
        return if sources.iter().any(|s| s == entry) {
            Ok(entry.to_path_buf())
        } else {
            Err(VerifyError::config_error(format!(
                "entry file {} is not among the declared sources",
                entry.display()
            )))
        };
    }

    let conventional = sources
        .iter()
        .find(|s| s.file_name().is_some_and(|n| n == CONVENTIONAL_ENTRY));

    Ok(conventional.unwrap_or(first).clone())
}

/// Resolve the crate identity
///
/// An override is returned verbatim. Otherwise hyphens in the declared name
/// become underscores so the result is a valid crate name.
pub fn resolve_identity(name: &str, identity_override: Option<&str>) -> String {
    match identity_override {
        Some(identity) => identity.to_string(),
        None => name.replace('-', "_"),
    }
}

/// Resolve `(entry_source, identity)` for a declared unit
pub fn resolve(spec: &UnitSpec) -> Result<(PathBuf, String)> {
    let entry = resolve_entry(&spec.sources, spec.entry_override.as_deref()).map_err(|e| {
        match e {
            VerifyError::Config { message } => {
                VerifyError::config_error(format!("unit '{}': {}", spec.name, message))
            }
            other => other,
        }
    })?;
    let identity = resolve_identity(&spec.name, spec.identity_override.as_deref());
    Ok((entry, identity))
}

/// One crate's verification job, immutable once constructed
#[derive(Debug)]
pub struct VerificationUnit {
    name: String,
    identity: String,
    entry_source: PathBuf,
    sources: Vec<PathBuf>,
    extra_arguments: Vec<String>,
    dependencies: Vec<Arc<VerificationUnit>>,
    success_marker: PathBuf,
    /// Own marker plus every upstream marker, computed once at construction
    transitive_markers: IndexSet<PathBuf>,
}

impl VerificationUnit {
    /// Construct a unit whose marker will live in `marker_dir`
    ///
    /// `dependencies` must already be constructed; the host graph guarantees
    /// there are no forward references.
    pub fn new(
        spec: UnitSpec,
        dependencies: Vec<Arc<VerificationUnit>>,
        marker_dir: &Path,
    ) -> Result<Self> {
        let (entry_source, identity) = resolve(&spec)?;
        let success_marker = marker_dir.join(format!("{}.{}", spec.name, MARKER_EXTENSION));
        let transitive_markers = deps::transitive_markers(&success_marker, &dependencies);

        debug!(
            unit = %spec.name,
            identity = %identity,
            entry = %entry_source.display(),
            deps = dependencies.len(),
            "resolved verification unit"
        );

        Ok(Self {
            name: spec.name,
            identity,
            entry_source,
            sources: spec.sources,
            extra_arguments: spec.extra_arguments,
            dependencies,
            success_marker,
            transitive_markers,
        })
    }

    /// Declared name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Crate identity passed to the verifier
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn entry_source(&self) -> &Path {
        &self.entry_source
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    pub fn extra_arguments(&self) -> &[String] {
        &self.extra_arguments
    }

    pub fn dependencies(&self) -> &[Arc<VerificationUnit>] {
        &self.dependencies
    }

    pub fn success_marker(&self) -> &Path {
        &self.success_marker
    }

    pub fn transitive_markers(&self) -> &IndexSet<PathBuf> {
        &self.transitive_markers
    }

    /// Whether this unit has verified (marker existence is the only signal)
    pub fn is_verified(&self) -> bool {
        self.success_marker.exists()
    }
}
