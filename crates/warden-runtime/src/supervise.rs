use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{error, info, warn};

/// Cooperative stop signal checked by every stage on each iteration.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-stage failure policy: an erroring iteration logs, backs off, and
/// continues; repeated failures in a short window escalate and stop the
/// whole pipeline.
pub struct StageSupervisor {
    pub backoff: Duration,
    pub max_failures: u32,
    pub failure_window: Duration,
}

impl Default for StageSupervisor {
    fn default() -> Self {
        Self {
            backoff: Duration::from_millis(100),
            max_failures: 3,
            failure_window: Duration::from_secs(10),
        }
    }
}

impl StageSupervisor {
    /// Drive `iteration` until the stop flag is set or the stage escalates.
    /// `on_fatal` runs once if the failure budget is exhausted.
    pub fn run(
        &self,
        name: &str,
        stop: &StopFlag,
        mut iteration: impl FnMut() -> Result<()>,
        on_fatal: impl FnOnce(),
    ) {
        info!(stage = name, "stage started");
        let mut failures: Vec<Instant> = Vec::new();

        while !stop.is_set() {
            match iteration() {
                Ok(()) => {}
                Err(e) => {
                    warn!(stage = name, "stage iteration failed: {:#}", e);
                    let now = Instant::now();
                    failures.push(now);
                    failures.retain(|t| now.duration_since(*t) <= self.failure_window);
                    if failures.len() >= self.max_failures as usize {
                        error!(
                            stage = name,
                            failures = failures.len(),
                            "stage failing repeatedly, escalating"
                        );
                        on_fatal();
                        break;
                    }
                    std::thread::sleep(self.backoff);
                }
            }
        }
        info!(stage = name, "stage exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_failures_escalate() {
        let sup = StageSupervisor {
            backoff: Duration::from_millis(1),
            ..StageSupervisor::default()
        };
        let stop = StopFlag::new();
        let fatal = Arc::new(AtomicBool::new(false));
        let fatal2 = fatal.clone();

        sup.run(
            "test",
            &stop,
            || anyhow::bail!("boom"),
            move || fatal2.store(true, Ordering::SeqCst),
        );
        assert!(fatal.load(Ordering::SeqCst));
    }

    #[test]
    fn successes_between_failures_prevent_escalation() {
        let sup = StageSupervisor {
            backoff: Duration::from_millis(1),
            max_failures: 3,
            failure_window: Duration::from_millis(50),
        };
        let stop = StopFlag::new();
        let fatal = Arc::new(AtomicBool::new(false));
        let fatal2 = fatal.clone();

        let mut n = 0;
        let stop2 = stop.clone();
        sup.run(
            "test",
            &stop,
            move || {
                n += 1;
                if n > 40 {
                    stop2.stop();
                    return Ok(());
                }
                if n % 2 == 0 {
                    // failures spaced by successes and the window expiry
                    std::thread::sleep(Duration::from_millis(30));
                    anyhow::bail!("sporadic")
                }
                Ok(())
            },
            move || fatal2.store(true, Ordering::SeqCst),
        );
        assert!(!fatal.load(Ordering::SeqCst));
    }

    #[test]
    fn stop_flag_ends_the_loop() {
        let sup = StageSupervisor::default();
        let stop = StopFlag::new();
        stop.stop();
        let mut ran = false;
        sup.run("test", &stop, || {
            ran = true;
            Ok(())
        }, || {});
        assert!(!ran);
    }
}
