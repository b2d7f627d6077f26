//! Global parallelism and load-average admission control.

use tracing::trace;

use super::{CommandCallback, CommandRunner};

/// Samples the one-minute load average.
pub type LoadSampler = Box<dyn Fn() -> f64 + Send>;

/// A sampler reading `/proc/loadavg`; returns 0 where that is unavailable,
/// which disables load throttling rather than stalling the build.
pub fn system_load_sampler() -> LoadSampler {
    Box::new(|| {
        std::fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|contents| {
                contents
                    .split_whitespace()
                    .next()
                    .and_then(|first| first.parse().ok())
            })
            .unwrap_or(0.0)
    })
}

/// Caps how many commands run at once, and optionally refuses new work
/// while the machine's load average is above a ceiling.
///
/// This layer only *admits*; it never queues. Combined with
/// [`super::pooled::PooledCommandRunner`] stacked outside it, queueing
/// lives in the pool layer and the scheduler simply stops popping ready
/// steps while `can_run_more` is false.
pub struct LimitedCommandRunner<R> {
    inner: R,
    max_parallel: usize,
    /// Zero or negative disables load throttling.
    max_load_average: f64,
    load_sampler: LoadSampler,
}

impl<R: CommandRunner> LimitedCommandRunner<R> {
    pub fn new(inner: R, max_parallel: usize) -> Self {
        Self::with_load_limit(inner, max_parallel, 0.0, Box::new(|| 0.0))
    }

    pub fn with_load_limit(
        inner: R,
        max_parallel: usize,
        max_load_average: f64,
        load_sampler: LoadSampler,
    ) -> Self {
        Self {
            inner,
            max_parallel,
            max_load_average,
            load_sampler,
        }
    }
}

impl<R: CommandRunner> CommandRunner for LimitedCommandRunner<R> {
    fn invoke(&mut self, command: String, pool: &str, on_done: CommandCallback) {
        self.inner.invoke(command, pool, on_done)
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn can_run_more(&self) -> bool {
        if !self.inner.can_run_more() || self.inner.size() >= self.max_parallel {
            return false;
        }
        if self.max_load_average > 0.0 {
            let load = (self.load_sampler)();
            if load >= self.max_load_average {
                trace!(load, ceiling = self.max_load_average, "load limited");
                return false;
            }
        }
        true
    }

    async fn run_commands(&mut self) -> bool {
        self.inner.run_commands().await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::ImmediateRunner;
    use super::*;

    fn noop() -> CommandCallback {
        Box::new(|_| {})
    }

    #[tokio::test]
    async fn parallelism_bound_gates_admission() {
        let mut runner = LimitedCommandRunner::new(ImmediateRunner::new(), 2);
        assert!(runner.can_run_more());
        runner.invoke("a".to_string(), "", noop());
        assert!(runner.can_run_more());
        runner.invoke("b".to_string(), "", noop());
        assert!(!runner.can_run_more());

        assert!(!runner.run_commands().await);
        assert!(runner.can_run_more());
    }

    #[tokio::test]
    async fn load_ceiling_gates_admission() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicU64, Ordering};

        let load = Arc::new(AtomicU64::new(0));
        let sampled = load.clone();
        let mut runner = LimitedCommandRunner::with_load_limit(
            ImmediateRunner::new(),
            8,
            2.0,
            Box::new(move || sampled.load(Ordering::SeqCst) as f64),
        );

        assert!(runner.can_run_more());
        load.store(3, Ordering::SeqCst);
        assert!(!runner.can_run_more());
        load.store(1, Ordering::SeqCst);
        assert!(runner.can_run_more());
    }

    #[test]
    fn system_load_sampler_does_not_panic() {
        let sampler = system_load_sampler();
        assert!(sampler() >= 0.0);
    }
}
