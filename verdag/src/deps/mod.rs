//! Dependency Collector
//!
//! Turns a unit's direct upstream units into verifier symbol bindings and
//! the transitive closure of upstream success markers.
//!
//! Upstream crates are bound to their success marker path. A verification
//! unit produces no compiled artifact, so the marker is the one file every
//! upstream unit is guaranteed to have; bindings never mix the two kinds.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexSet;

use crate::unit::VerificationUnit;

/// `--extern identity=path` directive for one upstream unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolBinding {
    pub identity: String,
    pub target: PathBuf,
}

impl SymbolBinding {
    pub fn args(&self) -> [String; 2] {
        [
            "--extern".to_string(),
            format!("{}={}", self.identity, self.target.display()),
        ]
    }
}

/// Output of [`collect`]
#[derive(Debug, Clone, Default)]
pub struct DependencyInfo {
    /// One binding per direct dependency, in declaration order
    pub symbol_flags: Vec<SymbolBinding>,
    /// Markers of every upstream unit, each exactly once
    pub transitive_markers: IndexSet<PathBuf>,
}

impl DependencyInfo {
    /// Flattened command-line form of `symbol_flags`
    pub fn symbol_args(&self) -> Vec<String> {
        self.symbol_flags.iter().flat_map(|b| b.args()).collect()
    }
}

/// Collect bindings and upstream markers for a unit's direct dependencies
///
/// A dependency listed twice is bound once, at its first position.
pub fn collect(dependencies: &[Arc<VerificationUnit>]) -> DependencyInfo {
    let mut info = DependencyInfo::default();
    let mut seen = IndexSet::new();

    for dep in dependencies {
        if !seen.insert(dep.identity()) {
            continue;
        }
        info.symbol_flags.push(SymbolBinding {
            identity: dep.identity().to_string(),
            target: dep.success_marker().to_path_buf(),
        });
        info.transitive_markers
            .extend(dep.transitive_markers().iter().cloned());
    }

    info
}

/// Own marker followed by the union of the dependencies' transitive sets
///
/// Each dependency already carries its own closure, so this is a single
/// merge per unit; diamonds collapse through set membership.
pub fn transitive_markers(
    own_marker: &Path,
    dependencies: &[Arc<VerificationUnit>],
) -> IndexSet<PathBuf> {
    let mut markers = IndexSet::new();
    markers.insert(own_marker.to_path_buf());
    for dep in dependencies {
        markers.extend(dep.transitive_markers().iter().cloned());
    }
    markers
}
