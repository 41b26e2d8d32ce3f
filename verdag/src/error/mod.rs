//! Error types and reporting

use std::ops::Range;

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, VerifyError>;

/// Verification orchestration error
#[derive(Debug, Error)]
pub enum VerifyError {
    /// Fatal before any task is scheduled (empty sources, unknown platform, ...)
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Manifest could not be parsed; `span` is a byte range into the manifest source
    #[error("Manifest error: {message}")]
    Manifest {
        message: String,
        span: Option<Range<usize>>,
    },

    /// Host graph rejected (cycle, duplicate identity, unknown dependency)
    #[error("Graph error: {message}")]
    Graph { message: String },

    /// A component the verifier needs at run time could not be located
    #[error("Toolchain error: {component}: {message} (pinned toolchain {pinned_version})")]
    Toolchain {
        component: String,
        message: String,
        pinned_version: String,
    },

    /// Verifier exited non-zero (or was killed, `code == None`)
    #[error("Verification failed for crate '{identity}': {}", describe_exit(.code))]
    Verification { identity: String, code: Option<i32> },

    #[error("IO error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("verifier exited with code {code}"),
        None => "verifier terminated by signal".to_string(),
    }
}

impl VerifyError {
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn manifest_error(message: impl Into<String>, span: Option<Range<usize>>) -> Self {
        Self::Manifest {
            message: message.into(),
            span,
        }
    }

    pub fn graph_error(message: impl Into<String>) -> Self {
        Self::Graph {
            message: message.into(),
        }
    }

    pub fn toolchain_error(
        component: impl Into<String>,
        message: impl Into<String>,
        pinned_version: impl Into<String>,
    ) -> Self {
        Self::Toolchain {
            component: component.into(),
            message: message.into(),
            pinned_version: pinned_version.into(),
        }
    }

    pub fn io_error(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Configuration-class errors stop the run before anything executes.
    pub fn is_fatal_config(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::Manifest { .. } | Self::Graph { .. }
        )
    }

    /// Process exit code the CLI uses for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Verification { code: Some(code), .. } if *code != 0 => *code,
            Self::Config { .. } | Self::Manifest { .. } | Self::Graph { .. } => 2,
            _ => 1,
        }
    }

    pub fn span(&self) -> Option<Range<usize>> {
        match self {
            Self::Manifest { span, .. } => span.clone(),
            _ => None,
        }
    }
}

/// Report error with ariadne
///
/// Manifest errors with a span are rendered against the manifest source;
/// everything else gets a span-less report.
pub fn report_error(filename: &str, source: &str, error: &VerifyError) {
    use ariadne::{Color, Label, Report, ReportKind, Source};

    let kind = match error {
        VerifyError::Config { .. } => "Configuration",
        VerifyError::Manifest { .. } => "Manifest",
        VerifyError::Graph { .. } => "Graph",
        VerifyError::Toolchain { .. } => "Toolchain",
        VerifyError::Verification { .. } => "Verification",
        VerifyError::Io { .. } => "IO",
    };

    let printed = if let (Some(span), VerifyError::Manifest { message, .. }) = (error.span(), error)
    {
        Report::build(ReportKind::Error, (filename, span.clone()))
            .with_message(format!("{kind} error"))
            .with_label(
                Label::new((filename, span))
                    .with_message(message)
                    .with_color(Color::Red),
            )
            .finish()
            .eprint((filename, Source::from(source)))
    } else {
        Report::build(ReportKind::Error, (filename, 0..0))
            .with_message(error.to_string())
            .finish()
            .eprint((filename, Source::from(source)))
    };

    if printed.is_err() {
        eprintln!("Error: {error}");
    }
}
