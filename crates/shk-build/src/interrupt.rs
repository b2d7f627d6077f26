//! The interrupt flag.
//!
//! One piece of global signal state for the whole build: a latched flag
//! that signal handlers set and `run_commands` consults. Backed by a watch
//! channel so runners can race "next completion" against "user hit ^C".

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Latched user-interrupt flag. Clone freely; clones share the flag.
#[derive(Clone)]
pub struct Interrupt {
    tx: Arc<watch::Sender<bool>>,
}

impl Interrupt {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Latch the flag. Idempotent.
    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Completes when the flag is set; immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Latch the flag on SIGINT. Spawns a background task; call at most
    /// once, from within a tokio runtime.
    pub fn install_ctrl_c(&self) {
        let interrupt = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt requested; finishing in-flight commands");
                interrupt.set();
            }
        });
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_latches_and_wait_completes() {
        let interrupt = Interrupt::new();
        assert!(!interrupt.is_set());
        interrupt.set();
        assert!(interrupt.is_set());
        // Must complete immediately even though set() happened first.
        interrupt.wait().await;
    }

    #[tokio::test]
    async fn clones_share_state() {
        let interrupt = Interrupt::new();
        let clone = interrupt.clone();
        let waiter = tokio::spawn(async move { clone.wait().await });
        interrupt.set();
        waiter.await.unwrap();
    }
}
