//! Environment Synthesizer
//!
//! The verifier is a modified compiler driver: it needs the runtime
//! libraries of the exact compiler toolchain it was built against, its own
//! companion shared libraries, and the SMT solver on `PATH`. None of that
//! is a declared build input, so it is reconstructed from host state right
//! before the verifier runs.
//!
//! All host probing goes through [`HostProbe`]; the synthesis strategy sits
//! behind [`EnvironmentSynthesizer`] so a hermetic, bundled-compiler
//! implementation ([`FixedEnvironment`]) can replace host discovery without
//! touching task construction.
//!
//! Because [`HostEnvironment`] reads the real home directory and installed
//! compilers, tasks using it must run unsandboxed
//! ([`crate::platform::ExecRequirements`]).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

use crate::error::{Result, VerifyError};
use crate::toolchain::ToolchainBundle;

/// Binary directories of toolchain managers, relative to the home directory
const MANAGER_BIN_DIRS: &[&str] = &[".cargo/bin"];

/// State directory whose presence means a toolchain manager is installed
const MANAGER_STATE_DIR: &str = ".rustup";

/// Process environment prepared for one verifier invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    /// Variables to set on the verifier process (on top of the inherited ones)
    pub vars: BTreeMap<String, String>,
    /// Compiler system root passed to the verifier as `--sysroot`
    pub sysroot: PathBuf,
}

impl Environment {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

/// Read-only access to host state
///
/// Implementations must not write anything; many verification tasks probe
/// the host concurrently.
pub trait HostProbe {
    /// Home directory from the user database, ignoring any `HOME` override
    fn real_home(&self) -> Option<PathBuf>;

    /// Value of an inherited environment variable
    fn var(&self, key: &str) -> Option<String>;

    fn is_dir(&self, path: &Path) -> bool;

    fn is_file(&self, path: &Path) -> bool;

    /// Ask the compiler for its sysroot
    ///
    /// `toolchain` selects a specific installed version (`rustc +<version>`);
    /// `None` asks the default compiler. `env` is applied to the query so
    /// manager proxies resolve against the real home.
    fn compiler_sysroot(
        &self,
        toolchain: Option<&str>,
        env: &BTreeMap<String, String>,
    ) -> Option<PathBuf>;
}

/// [`HostProbe`] backed by the running system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl HostProbe for SystemProbe {
    #[cfg(unix)]
    fn real_home(&self) -> Option<PathBuf> {
        use nix::unistd::{Uid, User};

        match User::from_uid(Uid::current()) {
            Ok(Some(user)) => Some(user.dir),
            Ok(None) => None,
            Err(e) => {
                warn!("user database lookup failed: {}", e);
                None
            }
        }
    }

    #[cfg(not(unix))]
    fn real_home(&self) -> Option<PathBuf> {
        std::env::var_os("USERPROFILE").map(PathBuf::from)
    }

    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn compiler_sysroot(
        &self,
        toolchain: Option<&str>,
        env: &BTreeMap<String, String>,
    ) -> Option<PathBuf> {
        let mut cmd = Command::new("rustc");
        if let Some(version) = toolchain {
            cmd.arg(format!("+{version}"));
        }
        cmd.args(["--print", "sysroot"]).envs(env);

        let output = match cmd.output() {
            Ok(output) => output,
            Err(e) => {
                debug!("rustc not runnable: {}", e);
                return None;
            }
        };

        if !output.status.success() {
            debug!(
                toolchain = toolchain.unwrap_or("default"),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "sysroot query failed"
            );
            return None;
        }

        let sysroot = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if sysroot.is_empty() {
            None
        } else {
            Some(PathBuf::from(sysroot))
        }
    }
}

/// Strategy producing the verifier's environment
pub trait EnvironmentSynthesizer {
    fn synthesize(&self, bundle: &ToolchainBundle) -> Result<Environment>;
}

/// Reconstructs the environment from host state
#[derive(Debug, Clone, Default)]
pub struct HostEnvironment<P: HostProbe = SystemProbe> {
    probe: P,
}

impl HostEnvironment<SystemProbe> {
    pub fn system() -> Self {
        Self { probe: SystemProbe }
    }
}

impl<P: HostProbe> HostEnvironment<P> {
    pub fn with_probe(probe: P) -> Self {
        Self { probe }
    }

    /// Prefer an installed toolchain manager under the real home directory
    ///
    /// Returns the manager binary directories that exist, to be prepended
    /// to `PATH`, and records `HOME` in `vars` when a manager is found.
    fn locate_manager(&self, vars: &mut BTreeMap<String, String>) -> Vec<PathBuf> {
        let Some(home) = self.probe.real_home() else {
            warn!("could not determine the real home directory");
            return Vec::new();
        };

        if self.probe.var("HOME").as_deref() != Some(&*home.to_string_lossy()) {
            debug!(real_home = %home.display(), "HOME is redirected");
        }

        if !self.probe.is_dir(&home.join(MANAGER_STATE_DIR)) {
            debug!(home = %home.display(), "no toolchain manager under real home");
            return Vec::new();
        }

        vars.insert("HOME".to_string(), home.display().to_string());
        MANAGER_BIN_DIRS
            .iter()
            .map(|dir| home.join(dir))
            .filter(|dir| self.probe.is_dir(dir))
            .collect()
    }

    /// Sysroot of the pinned toolchain, else the default compiler's
    fn resolve_sysroot(
        &self,
        pinned: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<PathBuf> {
        if let Some(sysroot) = self.probe.compiler_sysroot(Some(pinned), vars) {
            debug!(toolchain = pinned, sysroot = %sysroot.display(), "pinned toolchain found");
            return Ok(sysroot);
        }

        warn!(
            "toolchain {} is not installed; falling back to the default compiler (ABI mismatch likely)",
            pinned
        );

        if let Some(sysroot) = self.probe.compiler_sysroot(None, vars) {
            info!(sysroot = %sysroot.display(), "using default compiler sysroot");
            return Ok(sysroot);
        }

        Err(VerifyError::toolchain_error(
            "compiler sysroot",
            format!(
                "no Rust compiler found; a compiler must be installed, e.g. `rustup toolchain install {pinned}`"
            ),
            pinned,
        ))
    }
}

impl<P: HostProbe> EnvironmentSynthesizer for HostEnvironment<P> {
    fn synthesize(&self, bundle: &ToolchainBundle) -> Result<Environment> {
        let mut vars = BTreeMap::new();
        let sep = bundle.platform.path_separator();
        let inherited_path = self.probe.var("PATH");

        let manager_dirs = self.locate_manager(&mut vars);
        if !manager_dirs.is_empty() {
            vars.insert(
                "PATH".to_string(),
                join_paths(manager_dirs.iter().map(|p| p.as_path()), inherited_path.as_deref(), sep),
            );
        }

        let sysroot = self.resolve_sysroot(&bundle.toolchain_version, &vars)?;

        let dylib_var = bundle.platform.dylib_path_var();
        let sysroot_lib = sysroot.join("lib");
        let mut lib_dirs = vec![sysroot_lib.as_path()];
        lib_dirs.extend(bundle.verifier_dir());
        vars.insert(
            dylib_var.to_string(),
            join_paths(lib_dirs, self.probe.var(dylib_var).as_deref(), sep),
        );

        if !self.probe.is_file(&bundle.solver) {
            return Err(VerifyError::toolchain_error(
                "solver",
                format!("{} not found", bundle.solver.display()),
                &bundle.toolchain_version,
            ));
        }
        let base_path = vars.get("PATH").cloned().or(inherited_path);
        vars.insert(
            "PATH".to_string(),
            join_paths(bundle.solver_dir(), base_path.as_deref(), sep),
        );

        Ok(Environment { vars, sysroot })
    }
}

/// Hermetic environment with a known sysroot; no host probing
#[derive(Debug, Clone)]
pub struct FixedEnvironment {
    pub sysroot: PathBuf,
    /// Inherited `PATH`, if any, to append after the solver directory
    pub base_path: Option<String>,
}

impl EnvironmentSynthesizer for FixedEnvironment {
    fn synthesize(&self, bundle: &ToolchainBundle) -> Result<Environment> {
        let sep = bundle.platform.path_separator();
        let sysroot_lib = self.sysroot.join("lib");
        let mut lib_dirs = vec![sysroot_lib.as_path()];
        lib_dirs.extend(bundle.verifier_dir());

        let mut vars = BTreeMap::new();
        vars.insert(
            bundle.platform.dylib_path_var().to_string(),
            join_paths(lib_dirs, None, sep),
        );
        vars.insert(
            "PATH".to_string(),
            join_paths(bundle.solver_dir(), self.base_path.as_deref(), sep),
        );

        Ok(Environment {
            vars,
            sysroot: self.sysroot.clone(),
        })
    }
}

/// `front` entries followed by an existing search-path value
fn join_paths<'a, I>(front: I, existing: Option<&str>, sep: char) -> String
where
    I: IntoIterator<Item = &'a Path>,
{
    let mut parts: Vec<String> = front
        .into_iter()
        .map(|p| p.display().to_string())
        .collect();
    if let Some(rest) = existing.filter(|s| !s.is_empty()) {
        parts.push(rest.to_string());
    }
    parts.join(&sep.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Platform;
    use std::collections::{HashMap, HashSet};

    #[derive(Default)]
    struct FakeProbe {
        home: Option<PathBuf>,
        vars: HashMap<String, String>,
        dirs: HashSet<PathBuf>,
        files: HashSet<PathBuf>,
        pinned_sysroot: Option<(String, PathBuf)>,
        default_sysroot: Option<PathBuf>,
    }

    impl HostProbe for FakeProbe {
        fn real_home(&self) -> Option<PathBuf> {
            self.home.clone()
        }

        fn var(&self, key: &str) -> Option<String> {
            self.vars.get(key).cloned()
        }

        fn is_dir(&self, path: &Path) -> bool {
            self.dirs.contains(path)
        }

        fn is_file(&self, path: &Path) -> bool {
            self.files.contains(path)
        }

        fn compiler_sysroot(
            &self,
            toolchain: Option<&str>,
            _env: &BTreeMap<String, String>,
        ) -> Option<PathBuf> {
            match toolchain {
                Some(v) => self
                    .pinned_sysroot
                    .as_ref()
                    .filter(|(pin, _)| pin == v)
                    .map(|(_, p)| p.clone()),
                None => self.default_sysroot.clone(),
            }
        }
    }

    fn bundle(platform: Platform) -> ToolchainBundle {
        ToolchainBundle {
            verifier: PathBuf::from("/bundle/rust_verify"),
            solver: PathBuf::from("/bundle/solver/z3"),
            libraries: vec![],
            toolchain_version: "1.93.0".to_string(),
            platform,
        }
    }

    fn probe_with_solver() -> FakeProbe {
        let mut probe = FakeProbe::default();
        probe.files.insert(PathBuf::from("/bundle/solver/z3"));
        probe.vars.insert("PATH".to_string(), "/usr/bin".to_string());
        probe
    }

    #[test]
    fn test_pinned_sysroot_preferred() {
        let mut probe = probe_with_solver();
        probe.pinned_sysroot = Some(("1.93.0".to_string(), PathBuf::from("/tc/1.93.0")));
        probe.default_sysroot = Some(PathBuf::from("/tc/stable"));

        let env = HostEnvironment::with_probe(probe)
            .synthesize(&bundle(Platform::X86_64Linux))
            .unwrap();
        assert_eq!(env.sysroot, PathBuf::from("/tc/1.93.0"));
        assert_eq!(env.get("LD_LIBRARY_PATH"), Some("/tc/1.93.0/lib:/bundle"));
    }

    #[test]
    fn test_falls_back_to_default_compiler() {
        let mut probe = probe_with_solver();
        probe.default_sysroot = Some(PathBuf::from("/tc/stable"));

        let env = HostEnvironment::with_probe(probe)
            .synthesize(&bundle(Platform::X86_64Linux))
            .unwrap();
        assert_eq!(env.sysroot, PathBuf::from("/tc/stable"));
    }

    #[test]
    fn test_no_compiler_names_pinned_version() {
        let probe = probe_with_solver();
        let err = HostEnvironment::with_probe(probe)
            .synthesize(&bundle(Platform::X86_64Linux))
            .unwrap_err();

        let msg = err.to_string();
        assert!(matches!(err, VerifyError::Toolchain { .. }));
        assert!(msg.contains("1.93.0"));
        assert!(msg.contains("must be installed"));
    }

    #[test]
    fn test_solver_dir_prepended_to_path() {
        let mut probe = probe_with_solver();
        probe.default_sysroot = Some(PathBuf::from("/tc/stable"));

        let env = HostEnvironment::with_probe(probe)
            .synthesize(&bundle(Platform::X86_64Linux))
            .unwrap();
        assert_eq!(env.get("PATH"), Some("/bundle/solver:/usr/bin"));
        assert_eq!(env.get("HOME"), None);
    }

    #[test]
    fn test_missing_solver_is_toolchain_error() {
        let mut probe = FakeProbe::default();
        probe.default_sysroot = Some(PathBuf::from("/tc/stable"));

        let err = HostEnvironment::with_probe(probe)
            .synthesize(&bundle(Platform::X86_64Linux))
            .unwrap_err();
        assert!(err.to_string().contains("solver"));
        assert!(err.to_string().contains("1.93.0"));
    }

    #[test]
    fn test_manager_under_real_home_is_preferred() {
        let mut probe = probe_with_solver();
        probe.home = Some(PathBuf::from("/home/alice"));
        probe.vars.insert("HOME".to_string(), "/sandbox/home".to_string());
        probe.dirs.insert(PathBuf::from("/home/alice/.rustup"));
        probe.dirs.insert(PathBuf::from("/home/alice/.cargo/bin"));
        probe.default_sysroot = Some(PathBuf::from("/tc/stable"));

        let env = HostEnvironment::with_probe(probe)
            .synthesize(&bundle(Platform::X86_64Linux))
            .unwrap();
        assert_eq!(env.get("HOME"), Some("/home/alice"));
        assert_eq!(
            env.get("PATH"),
            Some("/bundle/solver:/home/alice/.cargo/bin:/usr/bin")
        );
    }

    #[test]
    fn test_home_without_manager_left_alone() {
        let mut probe = probe_with_solver();
        probe.home = Some(PathBuf::from("/home/bob"));
        probe.default_sysroot = Some(PathBuf::from("/tc/stable"));

        let env = HostEnvironment::with_probe(probe)
            .synthesize(&bundle(Platform::X86_64Linux))
            .unwrap();
        assert_eq!(env.get("HOME"), None);
        assert_eq!(env.get("PATH"), Some("/bundle/solver:/usr/bin"));
    }

    #[test]
    fn test_macos_uses_dyld_and_keeps_existing() {
        let mut probe = probe_with_solver();
        probe.default_sysroot = Some(PathBuf::from("/tc/stable"));
        probe
            .vars
            .insert("DYLD_LIBRARY_PATH".to_string(), "/opt/lib".to_string());

        let env = HostEnvironment::with_probe(probe)
            .synthesize(&bundle(Platform::Aarch64Macos))
            .unwrap();
        assert_eq!(
            env.get("DYLD_LIBRARY_PATH"),
            Some("/tc/stable/lib:/bundle:/opt/lib")
        );
        assert_eq!(env.get("LD_LIBRARY_PATH"), None);
    }

    #[test]
    fn test_fixed_environment() {
        let env = FixedEnvironment {
            sysroot: PathBuf::from("/hermetic/rust"),
            base_path: None,
        }
        .synthesize(&bundle(Platform::X86_64Linux))
        .unwrap();
        assert_eq!(env.sysroot, PathBuf::from("/hermetic/rust"));
        assert_eq!(env.get("PATH"), Some("/bundle/solver"));
        assert_eq!(env.get("LD_LIBRARY_PATH"), Some("/hermetic/rust/lib:/bundle"));
    }

    #[test]
    fn test_join_paths_skips_empty_existing() {
        let joined = join_paths([Path::new("/a"), Path::new("/b")], Some(""), ':');
        assert_eq!(joined, "/a:/b");
    }
}
