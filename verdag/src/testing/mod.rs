//! Verification Test Wrapper
//!
//! Test-mode counterpart of [`crate::task`]: same invocation, but the result
//! is reported as a process exit code with a readable header and footer, and
//! no marker is written. Every call re-runs the verifier.

use std::io::Write;

use tracing::debug;

use crate::error::{Result, VerifyError};
use crate::task::TaskContext;
use crate::unit::VerificationUnit;

/// Outcome of one verification test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestOutcome {
    /// Verifier exit code, `None` if it was killed
    pub code: Option<i32>,
}

impl TestOutcome {
    pub fn passed(&self) -> bool {
        self.code == Some(0)
    }

    /// Exit code for the wrapper process
    pub fn exit_code(&self) -> i32 {
        self.code.unwrap_or(1)
    }
}

/// Verify `unit` and report to `out`
///
/// The verifier's own stdout and stderr are copied to `out` between the
/// header and the footer.
pub fn run_test(
    ctx: &TaskContext<'_>,
    unit: &VerificationUnit,
    out: &mut dyn Write,
) -> Result<TestOutcome> {
    let prepared = ctx.prepare(unit)?;
    let io_err = |e| VerifyError::io_error("failed to write test report", e);

    writeln!(out, "==> verifying crate '{}'", unit.identity()).map_err(io_err)?;
    writeln!(out, "    entry:    {}", unit.entry_source().display()).map_err(io_err)?;
    writeln!(out, "    verifier: {}", ctx.bundle.verifier.display()).map_err(io_err)?;
    writeln!(out, "    sysroot:  {}", prepared.environment.sysroot.display()).map_err(io_err)?;
    writeln!(out).map_err(io_err)?;

    debug!(unit = unit.name(), "running verification test");
    let output = ctx.runner.run(&prepared.invocation)?;

    out.write_all(output.stdout.as_bytes()).map_err(io_err)?;
    out.write_all(output.stderr.as_bytes()).map_err(io_err)?;

    let outcome = TestOutcome { code: output.code };
    if outcome.passed() {
        writeln!(out, "PASS: crate '{}' verified", unit.identity()).map_err(io_err)?;
    } else {
        let reason = match output.code {
            Some(code) => format!("verifier exit code {code}"),
            None => "verifier terminated by signal".to_string(),
        };
        writeln!(out, "FAIL: crate '{}' ({})", unit.identity(), reason).map_err(io_err)?;
    }

    Ok(outcome)
}
