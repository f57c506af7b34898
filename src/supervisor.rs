//! Ownership of the forking supervisor process and the one-way command pipe
//! used to tell it to spawn more workers.
//!
//! The supervisor is an external collaborator (out of scope per the
//! specification); this module only owns the parent's side of the contract:
//! launching it, writing `spawn <N>` / `eof` commands to its FIFO, and
//! polling its exit status non-blockingly.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::sync::Mutex;

const COMMAND_FIFO_NAME: &str = "loolwsd";
const EVENT_FIFO_NAME: &str = "admin-notify";

/// Create `pipe_dir` (mode inherited from parent) and the two named FIFOs
/// the parent and supervisor use to talk to each other, both mode `0666`
/// to match the original deployment's permissive pipe directory.
pub fn ensure_pipes(pipe_dir: &Path) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(pipe_dir)
        .with_context(|| format!("creating pipe directory {}", pipe_dir.display()))?;

    let command_path = pipe_dir.join(COMMAND_FIFO_NAME);
    let event_path = pipe_dir.join(EVENT_FIFO_NAME);

    for path in [&command_path, &event_path] {
        if !path.exists() {
            nix::unistd::mkfifo(path, nix::sys::stat::Mode::from_bits_truncate(0o666))
                .with_context(|| format!("creating FIFO {}", path.display()))?;
        }
    }

    Ok((command_path, event_path))
}

/// Owns the supervisor child process and the write end of its command FIFO.
pub struct SupervisorLink {
    child: Mutex<Option<Child>>,
    command_pipe: Mutex<Option<File>>,
}

impl SupervisorLink {
    /// Launch `supervisor_bin` and open the write end of `command_path`.
    ///
    /// The named FIFO must already exist ([`ensure_pipes`]); opening for
    /// write blocks until a reader is present, which is why the supervisor
    /// is spawned first.
    pub async fn launch(supervisor_bin: &Path, command_path: &Path, args: &[String]) -> Result<Self> {
        let child = tokio::process::Command::new(supervisor_bin)
            .args(args)
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning supervisor {}", supervisor_bin.display()))?;

        let command_pipe = File::options()
            .write(true)
            .open(command_path)
            .await
            .with_context(|| format!("opening command pipe {}", command_path.display()))?;

        Ok(Self {
            child: Mutex::new(Some(child)),
            command_pipe: Mutex::new(Some(command_pipe)),
        })
    }

    /// A link with no child process and no pipe, for `--test` mode and unit
    /// tests that stub out the supervisor entirely.
    pub fn disconnected() -> Self {
        Self { child: Mutex::new(None), command_pipe: Mutex::new(None) }
    }

    /// Request `n` more pre-spawned workers.
    ///
    /// A write failure is logged, never propagated — per the specification,
    /// the in-flight request that triggered this call should still fail
    /// through the normal acquire-timeout path rather than take down the
    /// process.
    pub async fn spawn(&self, n: usize) {
        self.write_command(format!("spawn {n}\n")).await;
    }

    /// Tell the supervisor to shut down.
    pub async fn shutdown(&self) {
        self.write_command("eof\n".to_string()).await;
    }

    async fn write_command(&self, command: String) {
        let mut guard = self.command_pipe.lock().await;
        if let Some(pipe) = guard.as_mut() {
            if let Err(e) = pipe.write_all(command.as_bytes()).await {
                log::warn!("failed to write to supervisor pipe: {e}");
            }
        }
    }

    /// Non-blocking poll of the supervisor's exit status.
    ///
    /// Returns `Some(status)` once the child has exited; `None` while it is
    /// still running or when there is no child to poll (disconnected mode).
    pub async fn poll_exit(&self) -> Option<std::process::ExitStatus> {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(status) => status,
                Err(e) => {
                    log::warn!("failed to poll supervisor status: {e}");
                    None
                }
            },
            None => None,
        }
    }

    /// Terminate and reap the supervisor, if one is running.
    pub async fn terminate(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if let Some(pid) = child.id() {
                // SIGTERM, then best-effort wait; the supervisor is expected
                // to reap its own worker children before exiting.
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGTERM,
                );
            }
            let _ = child.wait().await;
        }
    }
}

impl std::fmt::Debug for SupervisorLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorLink").finish_non_exhaustive()
    }
}
