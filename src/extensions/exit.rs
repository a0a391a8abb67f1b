//! Classification of worker process exits.

use std::fmt;
use std::process::ExitStatus;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

/// Module name of the worker SDK. An import failure on it means the worker
/// environment is broken rather than the extension itself.
pub const SDK_MODULE: &str = "nova";

/// Workers that die sooner than this never got to do useful work.
pub const MIN_HEALTHY_UPTIME: Duration = Duration::from_secs(1);

static MISSING_MODULE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"No module named ['"]?([A-Za-z_][A-Za-z0-9_.]*)['"]?"#)
        .expect("static regex is valid")
});

/// Why a worker stopped running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitCause {
    /// Stopped on request.
    Stopped,
    /// Died before it could produce anything.
    Terminated { message: String },
    /// Regular process exit.
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
        message: String,
    },
    /// A dependency of the extension is not installed.
    MissingModule { module: String, message: String },
    /// The worker SDK itself could not be imported.
    MissingInternals { message: String },
    /// The manifest requires a host API this build does not provide.
    Incompatible { message: String },
    /// The manifest is malformed.
    Invalid { message: String },
}

impl ExitCause {
    pub fn message(&self) -> &str {
        match self {
            ExitCause::Stopped => "Extension was stopped",
            ExitCause::Terminated { message }
            | ExitCause::Exited { message, .. }
            | ExitCause::MissingModule { message, .. }
            | ExitCause::MissingInternals { message }
            | ExitCause::Incompatible { message }
            | ExitCause::Invalid { message } => message,
        }
    }

    /// Short machine-readable name.
    pub fn kind(&self) -> &'static str {
        match self {
            ExitCause::Stopped => "stopped",
            ExitCause::Terminated { .. } => "terminated",
            ExitCause::Exited { .. } => "exited",
            ExitCause::MissingModule { .. } => "missing_module",
            ExitCause::MissingInternals { .. } => "missing_internals",
            ExitCause::Incompatible { .. } => "incompatible",
            ExitCause::Invalid { .. } => "invalid",
        }
    }

    /// Whether the exit was an error worth surfacing to the user.
    pub fn is_error(&self) -> bool {
        !matches!(self, ExitCause::Stopped)
    }
}

impl fmt::Display for ExitCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Exit status reduced to what classification needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Classify a worker exit. Pure: the same inputs always give the same cause.
pub fn classify_exit(
    ext_id: &str,
    stopped: bool,
    uptime: Duration,
    exit: ProcessExit,
    stderr: &str,
) -> ExitCause {
    if stopped {
        return ExitCause::Stopped;
    }

    let stderr = stderr.trim();

    if let Some(module) = missing_module(stderr) {
        if module == SDK_MODULE || module.starts_with(&format!("{}.", SDK_MODULE)) {
            return ExitCause::MissingInternals {
                message: format!(
                    "Extension \"{}\" could not load the extension SDK (module \"{}\" not found)",
                    ext_id, module
                ),
            };
        }
        return ExitCause::MissingModule {
            message: format!(
                "Extension \"{}\" requires module \"{}\", which is not installed",
                ext_id, module
            ),
            module,
        };
    }

    if uptime < MIN_HEALTHY_UPTIME {
        let message = if stderr.is_empty() {
            format!("Extension \"{}\" terminated before it could start", ext_id)
        } else {
            stderr.to_string()
        };
        return ExitCause::Terminated { message };
    }

    let message = if stderr.is_empty() {
        format!(
            "Extension \"{}\" exited with {} after {} seconds",
            ext_id,
            exit,
            uptime.as_secs()
        )
    } else {
        stderr.to_string()
    };

    ExitCause::Exited {
        code: exit.code,
        signal: exit.signal,
        message,
    }
}

fn missing_module(stderr: &str) -> Option<String> {
    MISSING_MODULE
        .captures(stderr)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim_end_matches('.').to_string())
}
