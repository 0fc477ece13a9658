//! Long-running publish process with piped stdin.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tracing::{debug, error, warn};

use crate::{Result, TransmuxError, helper_command};

/// A spawned helper whose stdin the caller feeds with media fragments.
///
/// Stderr is drained by a background task so the helper never blocks on a
/// full pipe; its output is logged at debug level.
#[derive(Debug)]
pub struct PublishProcess {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl PublishProcess {
    /// Spawn the helper. A `NotFound` spawn error is how a missing binary
    /// surfaces; callers classify it via [`TransmuxError::is_binary_missing`].
    pub fn spawn(binary: &str, args: &[String]) -> Result<Self> {
        debug!(binary, ?args, "Spawning publish helper");

        let mut child = helper_command(binary)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransmuxError::Spawn {
                binary: binary.to_string(),
                source,
            })?;

        let stdin = child.stdin.take();
        if let Some(stderr) = child.stderr.take() {
            let binary = binary.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(helper = %binary, "{line}");
                }
            });
        }

        Ok(Self { child, stdin })
    }

    /// Mutable access to the helper's stdin, if still attached.
    pub fn stdin(&mut self) -> Option<&mut ChildStdin> {
        self.stdin.as_mut()
    }

    /// Whether the helper has exited. `None` means it is still running.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Close stdin, wait up to `grace` for a clean exit, then kill.
    ///
    /// Returns the exit code when one was observed.
    pub async fn terminate(mut self, grace: Duration) -> Option<i32> {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.flush().await;
            let _ = stdin.shutdown().await;
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                error!("Error waiting for publish helper: {e}");
                None
            }
            Err(_) => {
                warn!("Publish helper did not exit within grace; killing");
                let _ = self.child.kill().await;
                match self.child.wait().await {
                    Ok(status) => status.code(),
                    Err(e) => {
                        error!("Error waiting for killed publish helper: {e}");
                        None
                    }
                }
            }
        }
    }

    /// Kill the helper without waiting out the grace period.
    pub async fn kill(mut self) {
        self.stdin.take();
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}
