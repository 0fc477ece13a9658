//! One-shot helper runs that must complete before the pipeline moves on.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::{Result, STDERR_TAIL_BYTES, TransmuxError, helper_command};

/// Keeps the last `limit` bytes of everything pushed into it.
pub(crate) struct TailBuffer {
    data: Vec<u8>,
    limit: usize,
}

impl TailBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            data: Vec::with_capacity(limit.min(4096)),
            limit,
        }
    }

    pub(crate) fn push_line(&mut self, line: &str) {
        self.data.extend_from_slice(line.as_bytes());
        self.data.push(b'\n');
        if self.data.len() > self.limit {
            let cut = self.data.len() - self.limit;
            self.data.drain(..cut);
        }
    }

    pub(crate) fn into_string(self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Run the helper to completion with the given arguments.
///
/// Stdout is discarded; stderr is logged at debug level and its tail is kept
/// so a non-zero exit surfaces the helper's own diagnostics.
pub async fn run(binary: &str, args: &[String]) -> Result<()> {
    debug!(binary, ?args, "Running helper");

    let mut child = helper_command(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| TransmuxError::Spawn {
            binary: binary.to_string(),
            source,
        })?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| TransmuxError::Io(std::io::Error::other("Failed to capture stderr")))?;

    let mut tail = TailBuffer::new(STDERR_TAIL_BYTES);
    let mut lines = BufReader::new(stderr).lines();
    while let Some(line) = lines.next_line().await? {
        debug!(helper = binary, "{line}");
        tail.push_line(&line);
    }

    let status = child.wait().await?;
    if status.success() {
        Ok(())
    } else {
        Err(TransmuxError::Failed {
            code: status.code(),
            stderr_tail: tail.into_string(),
        })
    }
}
