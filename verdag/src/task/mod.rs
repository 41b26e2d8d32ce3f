//! Verification Task
//!
//! Combines a unit, the toolchain bundle, its collected dependencies and a
//! synthesized environment into one verifier invocation, and turns the
//! verifier's exit status into a success marker (or no marker at all).
//!
//! Building the invocation is a pure function ([`build_invocation`]);
//! running it goes through [`Runner`] so the process boundary can be
//! replaced in tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;
use tracing::{debug, info};

use crate::deps::{self, DependencyInfo};
use crate::env::{Environment, EnvironmentSynthesizer};
use crate::error::{Result, VerifyError};
use crate::platform::ExecRequirements;
use crate::toolchain::ToolchainBundle;
use crate::unit::VerificationUnit;

/// Action mnemonic reported to the host scheduler
pub const MNEMONIC: &str = "VerusVerify";

/// Default language edition passed to the verifier
pub const DEFAULT_EDITION: &str = "2021";

/// Per-build knobs shared by every task
#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub edition: String,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            edition: DEFAULT_EDITION.to_string(),
        }
    }
}

/// A fully-determined verifier process: program, arguments, environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Variables set on top of the inherited environment
    pub env: BTreeMap<String, String>,
}

impl Invocation {
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).envs(&self.env);
        cmd
    }
}

/// Inputs, outputs and constraints of a task, as the host scheduler sees them
#[derive(Debug, Clone, Serialize)]
pub struct ActionDeclaration {
    pub mnemonic: &'static str,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub requirements: ExecRequirements,
}

/// Build the verifier argument vector and environment
///
/// Order: crate type, edition, sysroot, foundational library bindings,
/// upstream bindings, extra arguments, crate name, entry file. The order is
/// fixed so identical inputs always give an identical command line.
pub fn build_invocation(
    unit: &VerificationUnit,
    bundle: &ToolchainBundle,
    deps: &DependencyInfo,
    env: &Environment,
    options: &TaskOptions,
) -> Invocation {
    let mut args = vec![
        "--crate-type=lib".to_string(),
        format!("--edition={}", options.edition),
        "--sysroot".to_string(),
        env.sysroot.display().to_string(),
    ];
    args.extend(bundle.library_args());
    args.extend(deps.symbol_args());
    args.extend(unit.extra_arguments().iter().cloned());
    args.push("--crate-name".to_string());
    args.push(unit.identity().to_string());
    args.push(unit.entry_source().display().to_string());

    Invocation {
        program: bundle.verifier.clone(),
        args,
        env: env.vars.clone(),
    }
}

/// Declare what the task reads and writes
pub fn declare(
    unit: &VerificationUnit,
    bundle: &ToolchainBundle,
    deps: &DependencyInfo,
) -> ActionDeclaration {
    let mut inputs = unit.sources().to_vec();
    inputs.extend(bundle.artifacts());
    inputs.extend(deps.transitive_markers.iter().cloned());

    ActionDeclaration {
        mnemonic: MNEMONIC,
        inputs,
        outputs: vec![unit.success_marker().to_path_buf()],
        requirements: bundle.platform.exec_requirements(),
    }
}

/// Captured result of a verifier run
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    /// Exit code; `None` when the process was killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Executes an invocation synchronously
pub trait Runner {
    fn run(&self, invocation: &Invocation) -> Result<RunOutput>;
}

/// [`Runner`] that spawns the verifier as a child process
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl Runner for ProcessRunner {
    fn run(&self, invocation: &Invocation) -> Result<RunOutput> {
        let output = invocation.command().output().map_err(|e| {
            VerifyError::io_error(
                format!("failed to run {}", invocation.program.display()),
                e,
            )
        })?;

        Ok(RunOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// A task ready to execute, with the environment it was built from
#[derive(Debug, Clone)]
pub struct PreparedTask {
    pub invocation: Invocation,
    pub environment: Environment,
}

/// Everything a task needs besides the unit itself
pub struct TaskContext<'a> {
    pub bundle: &'a ToolchainBundle,
    pub synthesizer: &'a dyn EnvironmentSynthesizer,
    pub runner: &'a dyn Runner,
    pub options: &'a TaskOptions,
}

impl<'a> TaskContext<'a> {
    /// Resolve dependencies and environment into the invocation for `unit`
    ///
    /// Fails if any direct dependency has no success marker yet.
    pub fn prepare(&self, unit: &VerificationUnit) -> Result<PreparedTask> {
        if let Some(dep) = unit.dependencies().iter().find(|d| !d.is_verified()) {
            return Err(VerifyError::graph_error(format!(
                "unit '{}' cannot start: upstream '{}' has no success marker",
                unit.name(),
                dep.name()
            )));
        }

        let deps = deps::collect(unit.dependencies());
        let environment = self.synthesizer.synthesize(self.bundle)?;
        let invocation = build_invocation(unit, self.bundle, &deps, &environment, self.options);
        Ok(PreparedTask {
            invocation,
            environment,
        })
    }

    /// Verify `unit`, producing its success marker on exit status 0
    ///
    /// Any existing marker is removed first, so a run that fails (or cannot
    /// start) never leaves a marker behind.
    pub fn run(&self, unit: &VerificationUnit) -> Result<PathBuf> {
        remove_marker(unit.success_marker())?;
        let prepared = self.prepare(unit)?;
        self.spawn(unit, &prepared.invocation)
    }

    /// Run an already-prepared invocation and write the marker on success
    ///
    /// Any existing marker is removed before the verifier starts.
    pub fn execute(&self, unit: &VerificationUnit, invocation: &Invocation) -> Result<PathBuf> {
        remove_marker(unit.success_marker())?;
        self.spawn(unit, invocation)
    }

    /// Invoke the verifier; the marker must already be absent
    fn spawn(&self, unit: &VerificationUnit, invocation: &Invocation) -> Result<PathBuf> {
        let marker = unit.success_marker();
        debug!(unit = unit.name(), args = ?invocation.args, "invoking verifier");

        let output = self.runner.run(invocation)?;
        if !output.success() {
            if !output.stdout.is_empty() {
                eprint!("{}", output.stdout);
            }
            if !output.stderr.is_empty() {
                eprint!("{}", output.stderr);
            }
            return Err(VerifyError::Verification {
                identity: unit.identity().to_string(),
                code: output.code,
            });
        }

        write_marker(marker)?;
        info!(unit = unit.name(), marker = %marker.display(), "verified");
        Ok(marker.to_path_buf())
    }
}

/// Delete a marker if present
pub fn remove_marker(marker: &Path) -> Result<()> {
    match std::fs::remove_file(marker) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(VerifyError::io_error(
            format!("failed to remove stale marker {}", marker.display()),
            e,
        )),
    }
}

/// Create the zero-content marker via write-then-rename
fn write_marker(marker: &Path) -> Result<()> {
    let io_err = |e| VerifyError::io_error(format!("failed to write {}", marker.display()), e);

    if let Some(parent) = marker.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut tmp = marker.as_os_str().to_owned();
    tmp.push(format!(".tmp{}", std::process::id()));
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, b"").map_err(io_err)?;
    std::fs::rename(&tmp, marker).map_err(io_err)
}
