//! The leaf runner: spawns real processes.

use std::collections::HashMap;
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use super::{CommandCallback, CommandResult, CommandRunner};
use crate::interrupt::Interrupt;

/// Runs commands through `/bin/sh -c`, capturing combined output.
///
/// Each invocation runs as a tokio task; completions flow back over a
/// channel and are surfaced (callbacks and all) only inside
/// [`run_commands`](CommandRunner::run_commands) on the coordinator.
/// On interruption, in-flight children are signalled and their completions
/// arrive marked `interrupted`.
///
/// This runner reports no traced files; hooking up the syscall tracer
/// replaces the `traced: None` below with the observed read/write sets.
pub struct RealCommandRunner {
    interrupt: Interrupt,
    tx: mpsc::UnboundedSender<(u64, CommandResult)>,
    rx: mpsc::UnboundedReceiver<(u64, CommandResult)>,
    callbacks: HashMap<u64, CommandCallback>,
    next_token: u64,
}

impl RealCommandRunner {
    /// Must be constructed and used within a tokio runtime.
    pub fn new(interrupt: Interrupt) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            interrupt,
            tx,
            rx,
            callbacks: HashMap::new(),
            next_token: 0,
        }
    }
}

async fn read_all(reader: Option<impl AsyncReadExt + Unpin>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        let _ = reader.read_to_end(&mut buf).await;
    }
    buf
}

async fn run_one(command: String, interrupt: Interrupt) -> CommandResult {
    let spawned = Command::new("/bin/sh")
        .arg("-c")
        .arg(&command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(err) => {
            return CommandResult {
                exit_code: 127,
                output: format!("failed to spawn '{command}': {err}"),
                traced: None,
                interrupted: false,
            };
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    // Read both pipes concurrently so a chatty child cannot fill one while
    // the other is being drained.
    let output_reader = tokio::spawn(async move {
        let (mut out, err) = tokio::join!(read_all(stdout), read_all(stderr));
        out.extend(err);
        out
    });

    let mut interrupted = false;
    let status = tokio::select! {
        status = child.wait() => status,
        _ = interrupt.wait() => {
            interrupted = true;
            let _ = child.start_kill();
            child.wait().await
        }
    };

    let output_bytes = output_reader.await.unwrap_or_default();
    let exit_code = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(_) => -1,
    };

    CommandResult {
        exit_code,
        output: String::from_utf8_lossy(&output_bytes).into_owned(),
        traced: None,
        interrupted,
    }
}

impl CommandRunner for RealCommandRunner {
    fn invoke(&mut self, command: String, _pool: &str, on_done: CommandCallback) {
        let token = self.next_token;
        self.next_token += 1;
        self.callbacks.insert(token, on_done);

        debug!(token, %command, "spawning command");
        let tx = self.tx.clone();
        let interrupt = self.interrupt.clone();
        tokio::spawn(async move {
            let result = run_one(command, interrupt).await;
            // The receiver lives as long as the runner; a send failure just
            // means the build was torn down.
            let _ = tx.send((token, result));
        });
    }

    fn size(&self) -> usize {
        self.callbacks.len()
    }

    fn can_run_more(&self) -> bool {
        true
    }

    async fn run_commands(&mut self) -> bool {
        if self.callbacks.is_empty() {
            return self.interrupt.is_set();
        }

        let first = if self.interrupt.is_set() {
            // Already interrupted: children are being signalled, wait for
            // their completions.
            self.rx.recv().await
        } else {
            tokio::select! {
                message = self.rx.recv() => message,
                _ = self.interrupt.wait() => None,
            }
        };

        let mut completed = Vec::new();
        if let Some(message) = first {
            completed.push(message);
        }
        while let Ok(message) = self.rx.try_recv() {
            completed.push(message);
        }
        for (token, result) in completed {
            if let Some(on_done) = self.callbacks.remove(&token) {
                on_done(result);
            }
        }

        self.interrupt.is_set()
    }
}
