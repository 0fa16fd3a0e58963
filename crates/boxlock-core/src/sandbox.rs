//! Invocations of the external `isolate` sandbox tool.
//!
//! The broker treats the tool as opaque: a one-shot `--version` probe at
//! startup to learn the host layout, `--init` after a grant, `--cleanup`
//! before a release. Commands are always built argv-style; the pass-through
//! option validator is defence in depth on top of that.

use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::debug;

use crate::config::SANDBOX_TOOL_ENV;

/// Default sandbox tool command, resolved through `PATH`.
pub const DEFAULT_TOOL: &str = "isolate";

/// Stdout label preceding the sandbox working directory.
const DIRECTORY_KEY: &str = "Sandbox directory: ";

/// Stdout label preceding the UID/GID ranges.
const CREDENTIALS_KEY: &str = "Sandbox credentials: ";

/// The host probe could not establish a usable sandbox configuration.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The tool could not be spawned at all.
    #[error("could not run `{command} --version`: {source}")]
    Spawn {
        /// The command that failed to spawn.
        command: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// No `Sandbox directory:` line in the version output.
    #[error("isolate directory could not be detected.")]
    DirectoryMissing,

    /// No usable credentials line, or inconsistent UID/GID spans.
    #[error("Number of isolate boxes allocated is zero, re-install with a non-zero number of boxes.")]
    NoBoxes,
}

/// A rejected pass-through option.
#[derive(Debug, Error)]
#[error("`{0}` is an invalid option.")]
pub struct InvalidOption(pub String);

/// Host layout reported by the probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxInfo {
    /// Sandbox working directory.
    pub directory: PathBuf,
    /// Number of boxes, derived from the UID span.
    pub box_count: u32,
}

/// Handle on the sandbox tool command.
#[derive(Debug, Clone)]
pub struct SandboxTool {
    command: String,
}

impl SandboxTool {
    /// Resolves the tool command: the environment override when set and
    /// non-empty, `isolate` otherwise.
    #[must_use]
    pub fn resolve() -> Self {
        match std::env::var(SANDBOX_TOOL_ENV) {
            Ok(command) if !command.trim().is_empty() => Self::with_command(command),
            _ => Self::with_command(DEFAULT_TOOL),
        }
    }

    /// Uses an explicit command instead of the resolved one.
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Runs the version query and extracts the sandbox directory and box
    /// count from its labelled output lines.
    pub fn probe(&self) -> Result<SandboxInfo, ProbeError> {
        let output = Command::new(&self.command)
            .arg("--version")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|source| ProbeError::Spawn {
                command: self.command.clone(),
                source,
            })?;
        let info = parse_probe_output(&String::from_utf8_lossy(&output.stdout))?;
        debug!(directory = %info.directory.display(), boxes = info.box_count, "probed sandbox tool");
        Ok(info)
    }

    /// Initialises a freshly granted box: `isolate <opts> -b<b> --init`.
    /// All output is discarded; a non-zero status is surfaced.
    pub fn init_box(&self, box_id: u32, opts: &[String]) -> io::Result<bool> {
        let status = self.box_command(box_id, opts, "--init").status()?;
        Ok(status.success())
    }

    /// Tears a box down before release: `isolate <opts> -b<b> --cleanup`.
    /// Best-effort by contract: the box may never have been initialised, so
    /// both spawn failures and non-zero statuses are ignored.
    pub fn cleanup_box(&self, box_id: u32, opts: &[String]) {
        if let Err(error) = self.box_command(box_id, opts, "--cleanup").status() {
            debug!(box_id, %error, "cleanup could not run");
        }
    }

    /// Renders the init invocation for diagnostics.
    #[must_use]
    pub fn render_init_invocation(&self, box_id: u32, opts: &[String]) -> String {
        let mut rendered = self.command.clone();
        for opt in opts {
            rendered.push(' ');
            rendered.push_str(opt);
        }
        rendered.push_str(&format!(" -b{box_id} --init"));
        rendered
    }

    fn box_command(&self, box_id: u32, opts: &[String], action: &str) -> Command {
        let mut command = Command::new(&self.command);
        command
            .args(opts)
            .arg(format!("-b{box_id}"))
            .arg(action)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }
}

fn parse_probe_output(stdout: &str) -> Result<SandboxInfo, ProbeError> {
    let mut directory = None;
    let mut box_count = 0u32;

    for line in stdout.lines() {
        if let Some(rest) = line.strip_prefix(DIRECTORY_KEY) {
            directory = Some(PathBuf::from(rest.trim_end()));
        } else if let Some(rest) = line.strip_prefix(CREDENTIALS_KEY) {
            if let Some((min_uid, max_uid, min_gid, max_gid)) = parse_credentials(rest) {
                // The box count comes from the UID span; the GID span must
                // agree or the installation is inconsistent.
                if max_uid >= min_uid && max_uid - min_uid == max_gid.wrapping_sub(min_gid) {
                    box_count = max_uid - min_uid + 1;
                }
            }
        }
    }

    let directory = directory.ok_or(ProbeError::DirectoryMissing)?;
    if box_count == 0 {
        return Err(ProbeError::NoBoxes);
    }
    Ok(SandboxInfo {
        directory,
        box_count,
    })
}

/// Parses `uid=A-B gid=C-D`.
fn parse_credentials(rest: &str) -> Option<(u32, u32, u32, u32)> {
    let mut parts = rest.split_whitespace();
    let (min_uid, max_uid) = parse_range(parts.next()?.strip_prefix("uid=")?)?;
    let (min_gid, max_gid) = parse_range(parts.next()?.strip_prefix("gid=")?)?;
    Some((min_uid, max_uid, min_gid, max_gid))
}

fn parse_range(span: &str) -> Option<(u32, u32)> {
    let (lo, hi) = span.split_once('-')?;
    Some((lo.parse().ok()?, hi.parse().ok()?))
}

/// Validates one pass-through option against the restrictive class that is
/// safe to hand to the sandbox tool. `--` is rejected outright so a caller
/// cannot terminate the tool's own option parsing.
pub fn validate_option(opt: &str) -> Result<(), InvalidOption> {
    let allowed =
        |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '=' | '/' | ':');
    if opt == "--" || !opt.chars().all(allowed) {
        return Err(InvalidOption(opt.to_string()));
    }
    Ok(())
}
