//! verdag CLI

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use verdag::cache::ActionCache;
use verdag::env::{EnvironmentSynthesizer, HostEnvironment};
use verdag::error::report_error;
use verdag::manifest::{MANIFEST_FILE, Manifest};
use verdag::task::{self, ActionDeclaration, Invocation, ProcessRunner, TaskContext, TaskOptions};
use verdag::testing::run_test;
use verdag::{
    ArtifactSource, BuildGraph, BuildReport, LocalBundle, Result, ToolchainBundle,
    VerificationUnit, VerifyError,
};

/// Default output directory, relative to the manifest
const OUT_DIR: &str = "verdag-out";

#[derive(Parser)]
#[command(name = "verdag", version, about = "Dependency-aware crate verification")]
struct Cli {
    /// Workspace manifest
    #[arg(long, global = true, default_value = MANIFEST_FILE)]
    manifest: PathBuf,

    /// Directory for success markers and the action cache
    #[arg(long, global = true)]
    out: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify units (all when none are named) and their dependencies
    Build {
        /// Units to verify
        units: Vec<String>,
    },
    /// Verify one unit in test mode: report pass/fail, write no marker
    Test {
        /// Unit to verify
        unit: String,
    },
    /// Print the verifier invocation for a unit (dry run)
    Args {
        /// Unit to inspect
        unit: String,

        /// Print the invocation, action declaration and bundle as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the synthesized verifier environment
    Env,
    /// Remove success markers and the action cache
    Clean,
}

/// Everything loaded from the manifest
struct Workspace {
    manifest: Manifest,
    graph: BuildGraph,
    options: TaskOptions,
    out_dir: PathBuf,
}

impl Workspace {
    /// Acquire the toolchain; only commands that run or describe the verifier need it
    fn bundle(&self) -> Result<ToolchainBundle> {
        let platform = self.manifest.platform()?;
        LocalBundle::new(&self.manifest.toolchain.path)
            .acquire(&self.manifest.toolchain.version, platform)
    }
}

/// `args --json` output
#[derive(Serialize)]
struct DryRun<'a> {
    unit: &'a str,
    identity: &'a str,
    invocation: &'a Invocation,
    declaration: &'a ActionDeclaration,
    bundle: &'a ToolchainBundle,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            if matches!(e, VerifyError::Manifest { .. }) {
                let source = std::fs::read_to_string(&cli.manifest).unwrap_or_default();
                report_error(&cli.manifest.display().to_string(), &source, &e);
            } else {
                eprintln!("Error: {e}");
            }
            e.exit_code()
        }
    };

    std::process::exit(code);
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: &Cli) -> Result<i32> {
    let ws = load_workspace(&cli.manifest, cli.out.as_deref())?;

    match &cli.command {
        Command::Build { units } => build(&ws, units),
        Command::Test { unit } => test(&ws, unit),
        Command::Args { unit, json } => print_args(&ws, unit, *json),
        Command::Env => print_env(&ws),
        Command::Clean => clean(&ws),
    }
}

fn load_workspace(manifest_path: &Path, out: Option<&Path>) -> Result<Workspace> {
    let (manifest, _source) = Manifest::load(manifest_path)?;

    let out_dir = match out {
        Some(dir) => dir.to_path_buf(),
        None => manifest_path
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(OUT_DIR),
    };

    let graph = BuildGraph::from_specs(manifest.unit_specs(), &out_dir)?;

    Ok(Workspace {
        options: manifest.task_options(),
        manifest,
        graph,
        out_dir,
    })
}

fn build(ws: &Workspace, units: &[String]) -> Result<i32> {
    let selected = ws.graph.closure(units)?;
    let bundle = ws.bundle()?;
    let report = run_build(ws, &bundle, &selected)?;
    print_report(&report);
    Ok(if report.is_success() { 0 } else { 1 })
}

fn run_build(
    ws: &Workspace,
    bundle: &ToolchainBundle,
    selected: &[Arc<VerificationUnit>],
) -> Result<BuildReport> {
    let mut cache = ActionCache::load(&ws.out_dir)?;
    let synthesizer = HostEnvironment::system();
    let ctx = TaskContext {
        bundle,
        synthesizer: &synthesizer,
        runner: &ProcessRunner,
        options: &ws.options,
    };

    let report = ws.graph.build(selected, &ctx, &mut cache);
    cache.save(&ws.out_dir)?;
    Ok(report)
}

fn print_report(report: &BuildReport) {
    for (name, outcome) in &report.outcomes {
        println!("  {:<24} {}", name, outcome);
    }
    let (verified, cached, failed, blocked) = report.counts();
    println!(
        "{} verified, {} cached, {} failed, {} blocked ({} cache hits, {} misses)",
        verified, cached, failed, blocked, report.cache.hits, report.cache.misses
    );
}

fn test(ws: &Workspace, name: &str) -> Result<i32> {
    let unit = ws
        .graph
        .get(name)
        .ok_or_else(|| VerifyError::config_error(format!("no unit named '{name}'")))?;

    // Upstream units are built normally; only the unit under test skips the marker
    let upstream: Vec<_> = ws
        .graph
        .closure(&[name.to_string()])?
        .into_iter()
        .filter(|u| u.name() != name)
        .collect();
    let bundle = ws.bundle()?;
    if !upstream.is_empty() {
        let report = run_build(ws, &bundle, &upstream)?;
        if !report.is_success() {
            print_report(&report);
            return Ok(1);
        }
    }

    let synthesizer = HostEnvironment::system();
    let ctx = TaskContext {
        bundle: &bundle,
        synthesizer: &synthesizer,
        runner: &ProcessRunner,
        options: &ws.options,
    };

    let stdout = std::io::stdout();
    let outcome = run_test(&ctx, unit, &mut stdout.lock())?;
    Ok(outcome.exit_code())
}

fn print_args(ws: &Workspace, name: &str, json: bool) -> Result<i32> {
    let unit = ws
        .graph
        .get(name)
        .ok_or_else(|| VerifyError::config_error(format!("no unit named '{name}'")))?;

    let bundle = ws.bundle()?;
    let env = HostEnvironment::system().synthesize(&bundle)?;
    let deps = verdag::deps::collect(unit.dependencies());
    let invocation = task::build_invocation(unit, &bundle, &deps, &env, &ws.options);

    let mut out = std::io::stdout().lock();
    if json {
        let dry_run = DryRun {
            unit: unit.name(),
            identity: unit.identity(),
            invocation: &invocation,
            declaration: &task::declare(unit, &bundle, &deps),
            bundle: &bundle,
        };
        serde_json::to_writer_pretty(&mut out, &dry_run)
            .map_err(std::io::Error::other)
            .and_then(|()| writeln!(out))
            .map_err(|e| VerifyError::io_error("failed to write stdout", e))?;
        return Ok(0);
    }

    let write = |out: &mut std::io::StdoutLock<'_>, line: &str| {
        writeln!(out, "{line}").map_err(|e| VerifyError::io_error("failed to write stdout", e))
    };
    write(&mut out, &invocation.program.display().to_string())?;
    for arg in &invocation.args {
        write(&mut out, arg)?;
    }
    Ok(0)
}

fn print_env(ws: &Workspace) -> Result<i32> {
    let env = HostEnvironment::system().synthesize(&ws.bundle()?)?;
    println!("# sysroot: {}", env.sysroot.display());
    for (key, value) in &env.vars {
        println!("{key}={value}");
    }
    Ok(0)
}

fn clean(ws: &Workspace) -> Result<i32> {
    for unit in ws.graph.units() {
        task::remove_marker(unit.success_marker())?;
    }
    let cache = ActionCache::path_in(&ws.out_dir);
    match std::fs::remove_file(&cache) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(VerifyError::io_error(
                format!("failed to remove {}", cache.display()),
                e,
            ));
        }
    }
    println!("Removed markers for {} units", ws.graph.len());
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace_without_toolchain(dir: &Path) -> PathBuf {
        std::fs::write(dir.join("lib.rs"), "// a\n").unwrap();
        let manifest = dir.join(MANIFEST_FILE);
        std::fs::write(
            &manifest,
            "[toolchain]\npath = \"gone\"\nversion = \"1.93.0\"\nplatform = \"x86_64-linux\"\n\n\
             [[unit]]\nname = \"a\"\nsrcs = [\"lib.rs\"]\n",
        )
        .unwrap();
        manifest
    }

    #[test]
    fn test_clean_without_toolchain() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = workspace_without_toolchain(dir.path());
        let ws = load_workspace(&manifest, None).unwrap();

        std::fs::create_dir_all(&ws.out_dir).unwrap();
        let marker = ws.out_dir.join("a.success");
        std::fs::write(&marker, b"").unwrap();
        ActionCache::new().save(&ws.out_dir).unwrap();

        assert_eq!(clean(&ws).unwrap(), 0);
        assert!(!marker.exists());
        assert!(!ActionCache::path_in(&ws.out_dir).exists());
    }

    #[test]
    fn test_dry_run_json() {
        use verdag::env::FixedEnvironment;
        use verdag::platform::Platform;

        let dir = tempfile::tempdir().unwrap();
        let manifest = workspace_without_toolchain(dir.path());
        let ws = load_workspace(&manifest, None).unwrap();
        let unit = ws.graph.get("a").unwrap();
        let bundle = ToolchainBundle {
            verifier: PathBuf::from("/vb/rust_verify"),
            solver: PathBuf::from("/vb/z3"),
            libraries: vec![],
            toolchain_version: "1.93.0".to_string(),
            platform: Platform::X86_64Linux,
        };
        let env = FixedEnvironment {
            sysroot: PathBuf::from("/sysroot"),
            base_path: None,
        }
        .synthesize(&bundle)
        .unwrap();
        let deps = verdag::deps::collect(unit.dependencies());
        let invocation = task::build_invocation(unit, &bundle, &deps, &env, &ws.options);

        let json = serde_json::to_value(DryRun {
            unit: unit.name(),
            identity: unit.identity(),
            invocation: &invocation,
            declaration: &task::declare(unit, &bundle, &deps),
            bundle: &bundle,
        })
        .unwrap();
        assert_eq!(json["identity"], "a");
        assert_eq!(json["declaration"]["mnemonic"], task::MNEMONIC);
        assert_eq!(json["declaration"]["requirements"]["no_sandbox"], true);
        assert_eq!(json["bundle"]["platform"], "x86_64-linux");
        assert_eq!(json["invocation"]["args"][0], "--crate-type=lib");
    }

    #[test]
    fn test_build_without_toolchain_is_toolchain_error() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = workspace_without_toolchain(dir.path());
        let ws = load_workspace(&manifest, None).unwrap();

        let err = build(&ws, &[]).unwrap_err();
        assert!(matches!(err, VerifyError::Toolchain { .. }));
    }
}
