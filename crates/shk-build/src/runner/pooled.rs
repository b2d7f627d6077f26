//! Named resource pools.
//!
//! Pools bound how many member commands run at once: a `link` pool of
//! capacity 1 serialises memory-hungry link steps regardless of global
//! parallelism. Submissions over capacity are held in a FIFO per pool and
//! dispatched as completions free slots, so within one pool commands run
//! in submission order; across pools there is no ordering.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::warn;

use super::{CommandCallback, CommandResult, CommandRunner};

/// The built-in single-slot pool for commands that own the console.
const CONSOLE_POOL: &str = "console";

struct Pool {
    capacity: usize,
    in_flight: usize,
    delayed: VecDeque<(String, CommandCallback)>,
}

/// Decorator enforcing named pool capacities over an inner runner.
///
/// The empty pool name is unlimited; `"console"` defaults to capacity 1
/// unless the manifest overrides it.
pub struct PooledCommandRunner<R> {
    inner: R,
    pools: HashMap<String, Pool>,
    /// Pool names of commands whose callbacks ran during the last
    /// `run_commands`; drained there to release slots.
    freed: Arc<Mutex<Vec<String>>>,
}

fn track_completion(
    freed: &Arc<Mutex<Vec<String>>>,
    pool: String,
    on_done: CommandCallback,
) -> CommandCallback {
    let freed = freed.clone();
    Box::new(move |result| {
        freed.lock().unwrap().push(pool);
        on_done(result);
    })
}

impl<R: CommandRunner> PooledCommandRunner<R> {
    pub fn new(pool_capacities: HashMap<String, usize>, inner: R) -> Self {
        let mut pools: HashMap<String, Pool> = pool_capacities
            .into_iter()
            .map(|(name, capacity)| {
                (
                    name,
                    Pool {
                        capacity,
                        in_flight: 0,
                        delayed: VecDeque::new(),
                    },
                )
            })
            .collect();
        pools.entry(CONSOLE_POOL.to_string()).or_insert(Pool {
            capacity: 1,
            in_flight: 0,
            delayed: VecDeque::new(),
        });
        Self {
            inner,
            pools,
            freed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[cfg(test)]
    pub(crate) fn inner_runner(&self) -> &R {
        &self.inner
    }
}

impl<R: CommandRunner> CommandRunner for PooledCommandRunner<R> {
    fn invoke(&mut self, command: String, pool: &str, on_done: CommandCallback) {
        if pool.is_empty() {
            self.inner.invoke(command, pool, on_done);
            return;
        }
        let Some(state) = self.pools.get_mut(pool) else {
            // The manifest layer validates pool names; treat a stray name
            // as the unlimited pool rather than wedging the build.
            warn!(pool, "unknown pool; running unrestricted");
            self.inner.invoke(command, pool, on_done);
            return;
        };
        if state.in_flight < state.capacity {
            state.in_flight += 1;
            let wrapped = track_completion(&self.freed, pool.to_string(), on_done);
            self.inner.invoke(command, pool, wrapped);
        } else {
            state.delayed.push_back((command, on_done));
        }
    }

    fn size(&self) -> usize {
        let delayed: usize = self.pools.values().map(|pool| pool.delayed.len()).sum();
        self.inner.size() + delayed
    }

    fn can_run_more(&self) -> bool {
        self.inner.can_run_more()
    }

    async fn run_commands(&mut self) -> bool {
        let interrupted = self.inner.run_commands().await;

        for pool in std::mem::take(&mut *self.freed.lock().unwrap()) {
            if let Some(state) = self.pools.get_mut(&pool) {
                state.in_flight -= 1;
            }
        }

        if interrupted {
            // No new processes after an interrupt; fail the held-back
            // submissions so every callback still fires exactly once.
            for state in self.pools.values_mut() {
                while let Some((_, on_done)) = state.delayed.pop_front() {
                    on_done(CommandResult::cancelled());
                }
            }
            return true;
        }

        // Freed slots admit delayed commands, FIFO per pool.
        let mut dispatch = Vec::new();
        for (name, state) in self.pools.iter_mut() {
            while state.in_flight < state.capacity
                && let Some((command, on_done)) = state.delayed.pop_front()
            {
                state.in_flight += 1;
                dispatch.push((name.clone(), command, on_done));
            }
        }
        for (pool, command, on_done) in dispatch {
            let wrapped = track_completion(&self.freed, pool.clone(), on_done);
            self.inner.invoke(command, &pool, wrapped);
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::ImmediateRunner;
    use super::*;
    use crate::runner::limited::LimitedCommandRunner;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pools() -> HashMap<String, usize> {
        HashMap::from([
            ("a".to_string(), 0),
            ("b".to_string(), 1),
            ("c".to_string(), 2),
        ])
    }

    fn runner() -> PooledCommandRunner<ImmediateRunner> {
        PooledCommandRunner::new(pools(), ImmediateRunner::new())
    }

    fn limited_runner() -> PooledCommandRunner<LimitedCommandRunner<ImmediateRunner>> {
        PooledCommandRunner::new(pools(), LimitedCommandRunner::new(ImmediateRunner::new(), 2))
    }

    fn noop() -> CommandCallback {
        Box::new(|_| {})
    }

    #[tokio::test]
    async fn size_without_delayed_commands() {
        let mut runner = runner();
        assert_eq!(runner.size(), 0);

        let called = Arc::new(AtomicUsize::new(0));
        let observed = called.clone();
        runner.invoke(
            "cmd".to_string(),
            "",
            Box::new(move |_| {
                observed.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(runner.size(), 1);
        assert_eq!(called.load(Ordering::SeqCst), 0);

        assert!(!runner.run_commands().await);
        assert_eq!(called.load(Ordering::SeqCst), 1);
        assert_eq!(runner.size(), 0);
    }

    #[tokio::test]
    async fn size_counts_delayed_commands() {
        let mut runner = runner();
        runner.invoke("cmd".to_string(), "a", noop());
        assert_eq!(runner.size(), 1);
        runner.invoke("cmd".to_string(), "a", noop());
        assert_eq!(runner.size(), 2);
        runner.invoke("cmd".to_string(), "b", noop());
        assert_eq!(runner.size(), 3);
    }

    #[tokio::test]
    async fn can_run_more_reflects_the_inner_runner() {
        let mut runner = limited_runner();
        assert!(runner.can_run_more());
        runner.invoke("cmd".to_string(), "", noop());
        assert!(runner.can_run_more());
        runner.invoke("cmd".to_string(), "", noop());
        assert!(!runner.can_run_more());
    }

    #[tokio::test]
    async fn single_slot_pool_never_saturates_the_inner_runner() {
        // Pool b has capacity 1, so the inner parallelism limit of 2 is
        // never reached no matter how much is submitted.
        let mut runner = limited_runner();
        for _ in 0..3 {
            runner.invoke("cmd".to_string(), "b", noop());
            assert!(runner.can_run_more());
        }
    }

    #[tokio::test]
    async fn console_pool_has_capacity_one() {
        let mut runner = limited_runner();
        for _ in 0..3 {
            runner.invoke("cmd".to_string(), "console", noop());
            assert!(runner.can_run_more());
        }
    }

    #[tokio::test]
    async fn delayed_commands_are_eventually_invoked() {
        const COUNT: usize = 5;
        let called = Arc::new(AtomicUsize::new(0));

        let mut runner = runner();
        for _ in 0..COUNT {
            let observed = called.clone();
            runner.invoke(
                "cmd".to_string(),
                "b",
                Box::new(move |_| {
                    observed.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        assert_eq!(runner.size(), COUNT);
        assert_eq!(called.load(Ordering::SeqCst), 0);

        while !runner.is_empty() {
            assert!(!runner.run_commands().await);
        }
        assert_eq!(called.load(Ordering::SeqCst), COUNT);
    }

    #[tokio::test]
    async fn delayed_commands_run_in_submission_order() {
        const COUNT: usize = 5;
        let called = Arc::new(AtomicUsize::new(0));

        let mut runner = runner();
        for expected in 0..COUNT {
            let observed = called.clone();
            runner.invoke(
                "cmd".to_string(),
                "b",
                Box::new(move |_| {
                    assert_eq!(observed.load(Ordering::SeqCst), expected);
                    observed.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        while !runner.is_empty() {
            runner.run_commands().await;
        }
        assert_eq!(called.load(Ordering::SeqCst), COUNT);
    }

    #[tokio::test]
    async fn capacity_is_respected_while_draining() {
        // Pool c (capacity 2): never more than two in the inner runner.
        let mut runner = runner();
        for _ in 0..6 {
            runner.invoke("cmd".to_string(), "c", noop());
        }
        assert_eq!(runner.inner_runner().size(), 2);
        assert_eq!(runner.size(), 6);
        runner.run_commands().await;
        assert_eq!(runner.inner_runner().size(), 2);
        runner.run_commands().await;
        assert_eq!(runner.inner_runner().size(), 2);
        runner.run_commands().await;
        assert!(runner.is_empty());
    }

    /// Completes pending commands but reports an interruption.
    struct InterruptedRunner {
        inner: ImmediateRunner,
    }

    impl CommandRunner for InterruptedRunner {
        fn invoke(&mut self, command: String, pool: &str, on_done: CommandCallback) {
            self.inner.invoke(command, pool, on_done)
        }
        fn size(&self) -> usize {
            self.inner.size()
        }
        fn can_run_more(&self) -> bool {
            true
        }
        async fn run_commands(&mut self) -> bool {
            self.inner.run_commands().await;
            true
        }
    }

    #[tokio::test]
    async fn interruption_cancels_delayed_commands() {
        let mut runner = PooledCommandRunner::new(
            pools(),
            InterruptedRunner {
                inner: ImmediateRunner::new(),
            },
        );

        let cancelled = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let observed = cancelled.clone();
            runner.invoke(
                "cmd".to_string(),
                "b",
                Box::new(move |result| {
                    if result.interrupted {
                        observed.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            );
        }

        assert!(runner.run_commands().await);
        // One ran to completion in the inner runner; the two still queued
        // were cancelled. Every callback fired.
        assert_eq!(cancelled.load(Ordering::SeqCst), 2);
        assert!(runner.is_empty());
    }
}
