//! Host build graph
//!
//! The minimal host that lets the CLI drive verification without an
//! external build system: it constructs every unit once in dependency
//! order, rejects graphs the core relies on the host to rule out
//! (cycles, duplicate identities, dangling dependencies), and executes
//! units one at a time, never starting a unit whose upstream markers are
//! missing.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::cache::{self, ActionCache, CacheStats};
use crate::deps;
use crate::error::{Result, VerifyError};
use crate::task::{self, TaskContext};
use crate::unit::{UnitSpec, VerificationUnit};

/// What happened to one unit during a build
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Verifier ran and exited 0
    Verified,
    /// Marker and fingerprint were already current
    Cached,
    /// Verifier failed, or the task could not run
    Failed(String),
    /// Never started: these direct dependencies have no marker
    Blocked(Vec<String>),
}

impl UnitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Verified | Self::Cached)
    }
}

impl fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Verified => f.write_str("verified"),
            Self::Cached => f.write_str("cached"),
            Self::Failed(reason) => write!(f, "FAILED: {reason}"),
            Self::Blocked(deps) => write!(f, "blocked on {}", deps.join(", ")),
        }
    }
}

/// Per-unit outcomes in execution order
#[derive(Debug, Default)]
pub struct BuildReport {
    pub outcomes: Vec<(String, UnitOutcome)>,
    /// Cache lookups made by this build
    pub cache: CacheStats,
}

impl BuildReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|(_, o)| o.is_success())
    }

    pub fn outcome(&self, name: &str) -> Option<&UnitOutcome> {
        self.outcomes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, o)| o)
    }

    /// (verified, cached, failed, blocked)
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        self.outcomes
            .iter()
            .fold((0, 0, 0, 0), |(v, c, f, b), (_, o)| match o {
                UnitOutcome::Verified => (v + 1, c, f, b),
                UnitOutcome::Cached => (v, c + 1, f, b),
                UnitOutcome::Failed(_) => (v, c, f + 1, b),
                UnitOutcome::Blocked(_) => (v, c, f, b + 1),
            })
    }
}

/// All units of a workspace, in a valid execution order
#[derive(Debug)]
pub struct BuildGraph {
    units: IndexMap<String, Arc<VerificationUnit>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl BuildGraph {
    /// Construct units from `(spec, dependency names)` declarations
    ///
    /// Declaration order does not matter; each unit is built after its
    /// dependencies. Markers are placed in `marker_dir`.
    pub fn from_specs(specs: Vec<(UnitSpec, Vec<String>)>, marker_dir: &Path) -> Result<Self> {
        let mut declared: IndexMap<String, (UnitSpec, Vec<String>)> = IndexMap::new();
        for (spec, deps) in specs {
            if declared.contains_key(&spec.name) {
                return Err(VerifyError::graph_error(format!(
                    "unit '{}' is declared more than once",
                    spec.name
                )));
            }
            declared.insert(spec.name.clone(), (spec, deps));
        }

        for (name, (_, deps)) in &declared {
            if let Some(missing) = deps.iter().find(|d| !declared.contains_key(*d)) {
                return Err(VerifyError::graph_error(format!(
                    "unit '{name}' depends on unknown unit '{missing}'"
                )));
            }
        }

        let order = topological_order(&declared)?;

        let mut units: IndexMap<String, Arc<VerificationUnit>> = IndexMap::new();
        let mut identities: HashMap<String, String> = HashMap::new();
        for name in order {
            let Some((spec, dep_names)) = declared.swap_remove(&name) else {
                continue;
            };
            let dependencies = dep_names
                .iter()
                .filter_map(|d| units.get(d).cloned())
                .collect();
            let unit = VerificationUnit::new(spec, dependencies, marker_dir)?;

            if let Some(other) = identities.insert(unit.identity().to_string(), name.clone()) {
                return Err(VerifyError::graph_error(format!(
                    "units '{}' and '{}' both resolve to crate identity '{}'",
                    other,
                    name,
                    unit.identity()
                )));
            }
            units.insert(name, Arc::new(unit));
        }

        Ok(Self { units })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<VerificationUnit>> {
        self.units.get(name)
    }

    /// Units in execution order
    pub fn units(&self) -> impl Iterator<Item = &Arc<VerificationUnit>> {
        self.units.values()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Requested units plus everything they depend on, in execution order
    ///
    /// An empty request selects the whole graph.
    pub fn closure(&self, names: &[String]) -> Result<Vec<Arc<VerificationUnit>>> {
        if names.is_empty() {
            return Ok(self.units.values().cloned().collect());
        }

        let mut wanted: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&VerificationUnit> = Vec::new();
        for name in names {
            let unit = self
                .units
                .get(name)
                .ok_or_else(|| VerifyError::config_error(format!("no unit named '{name}'")))?;
            stack.push(unit);
        }
        while let Some(unit) = stack.pop() {
            if wanted.insert(unit.name()) {
                stack.extend(unit.dependencies().iter().map(|d| d.as_ref()));
            }
        }

        Ok(self
            .units
            .values()
            .filter(|u| wanted.contains(u.name()))
            .cloned()
            .collect())
    }

    /// Verify `selected` (from [`closure`](Self::closure)) in order
    ///
    /// A failing unit stops only its dependents; unrelated units still run.
    pub fn build(
        &self,
        selected: &[Arc<VerificationUnit>],
        ctx: &TaskContext<'_>,
        cache: &mut ActionCache,
    ) -> BuildReport {
        let mut report = BuildReport::default();
        let stats_before = cache.stats();

        for unit in selected {
            let missing: Vec<String> = unit
                .dependencies()
                .iter()
                .filter(|d| !d.is_verified())
                .map(|d| d.name().to_string())
                .collect();
            if !missing.is_empty() {
                warn!(unit = unit.name(), blocked_on = ?missing, "not scheduled");
                Self::discard(unit, cache);
                report
                    .outcomes
                    .push((unit.name().to_string(), UnitOutcome::Blocked(missing)));
                continue;
            }

            let outcome = match Self::run_unit(unit, ctx, cache) {
                Ok(outcome) => outcome,
                Err(e) => {
                    Self::discard(unit, cache);
                    UnitOutcome::Failed(e.to_string())
                }
            };
            info!(unit = unit.name(), outcome = %outcome, "unit finished");
            report.outcomes.push((unit.name().to_string(), outcome));
        }

        report.cache = cache.stats().since(stats_before);
        report
    }

    /// A unit that did not verify this round keeps no marker
    fn discard(unit: &VerificationUnit, cache: &mut ActionCache) {
        cache.invalidate(unit.name());
        if let Err(e) = task::remove_marker(unit.success_marker()) {
            warn!("{}", e);
        }
    }

    fn run_unit(
        unit: &VerificationUnit,
        ctx: &TaskContext<'_>,
        cache: &mut ActionCache,
    ) -> Result<UnitOutcome> {
        let prepared = ctx.prepare(unit)?;
        let declaration = task::declare(unit, ctx.bundle, &deps::collect(unit.dependencies()));
        let upstream: Vec<Option<&str>> = unit
            .dependencies()
            .iter()
            .map(|d| cache.entry(d.name()))
            .collect();
        let fingerprint = cache::fingerprint(&prepared.invocation, &declaration, &upstream)?;

        if cache.is_fresh(unit.name(), unit.success_marker(), &fingerprint) {
            debug!(unit = unit.name(), "marker is current");
            return Ok(UnitOutcome::Cached);
        }

        cache.invalidate(unit.name());
        ctx.execute(unit, &prepared.invocation)?;
        cache.record(unit.name(), fingerprint);
        Ok(UnitOutcome::Verified)
    }
}

/// Depth-first post-order over declared units; reports the first cycle found
fn topological_order(declared: &IndexMap<String, (UnitSpec, Vec<String>)>) -> Result<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut order = Vec::with_capacity(declared.len());

    fn visit<'a>(
        name: &'a str,
        declared: &'a IndexMap<String, (UnitSpec, Vec<String>)>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = path.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle: Vec<&str> = path[start..].to_vec();
                cycle.push(name);
                return Err(VerifyError::graph_error(format!(
                    "dependency cycle: {}",
                    cycle.join(" -> ")
                )));
            }
            None => {}
        }

        marks.insert(name, Mark::Visiting);
        path.push(name);
        if let Some((_, deps)) = declared.get(name) {
            for dep in deps {
                visit(dep, declared, marks, path, order)?;
            }
        }
        path.pop();
        marks.insert(name, Mark::Done);
        order.push(name.to_string());
        Ok(())
    }

    for name in declared.keys() {
        let mut path = Vec::new();
        visit(name, declared, &mut marks, &mut path, &mut order)?;
    }

    Ok(order)
}
