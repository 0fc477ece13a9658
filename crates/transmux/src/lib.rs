//! FFmpeg invocation helpers.
//!
//! The media helper is treated as a black-box subprocess with a stable CLI.
//! This crate covers the three ways the service drives it:
//! - one-shot runs that must complete (demux a batch, remux a fragment),
//! - a long-running publish process fed through stdin,
//! - an availability/version probe performed once at startup.

use std::ffi::OsStr;

use thiserror::Error;

pub mod command;
pub mod process;
pub mod runner;

pub use command::{PublishTarget, demux_args, publish_args, remux_args};
pub use process::PublishProcess;
pub use runner::run;

/// Default helper binary name, resolved via `PATH`.
pub const DEFAULT_BINARY: &str = "ffmpeg";

/// How much of the helper's stderr is kept for error reporting.
pub const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Error, Debug)]
pub enum TransmuxError {
    #[error("Failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Helper exited with status {code:?}: {stderr_tail}")]
    Failed {
        code: Option<i32>,
        stderr_tail: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransmuxError {
    /// Whether the error indicates a missing helper binary.
    pub fn is_binary_missing(&self) -> bool {
        matches!(
            self,
            TransmuxError::Spawn { source, .. }
                if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}

pub type Result<T> = std::result::Result<T, TransmuxError>;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Create a `tokio::process::Command` that never opens a console window.
pub(crate) fn helper_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let cmd = tokio::process::Command::new(program);
    #[cfg(windows)]
    let cmd = {
        use std::os::windows::process::CommandExt;
        let mut cmd = cmd;
        cmd.creation_flags(CREATE_NO_WINDOW);
        cmd
    };
    cmd
}

/// A located helper binary with its probed version.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    binary: String,
    version: Option<String>,
}

impl Ffmpeg {
    /// Locate the default `ffmpeg` binary and probe its version.
    pub fn new() -> Self {
        Self::with_binary(DEFAULT_BINARY)
    }

    /// Use a specific binary path.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        let binary = binary.into();
        let version = Self::detect_version(&binary);
        Self { binary, version }
    }

    /// Probe `ffmpeg -version`, returning the first output line.
    fn detect_version(binary: &str) -> Option<String> {
        std::process::Command::new(binary)
            .arg("-version")
            .output()
            .ok()
            .and_then(|output| {
                String::from_utf8(output.stdout)
                    .ok()
                    .and_then(|s| s.lines().next().map(|l| l.to_string()))
            })
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn is_available(&self) -> bool {
        self.version.is_some()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_has_no_version() {
        let ffmpeg = Ffmpeg::with_binary("definitely-not-a-real-binary");
        assert!(!ffmpeg.is_available());
        assert!(ffmpeg.version().is_none());
    }

    #[test]
    fn binary_missing_classification() {
        let err = TransmuxError::Spawn {
            binary: "ffmpeg".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(err.is_binary_missing());

        let err = TransmuxError::Failed {
            code: Some(1),
            stderr_tail: String::new(),
        };
        assert!(!err.is_binary_missing());
    }
}
