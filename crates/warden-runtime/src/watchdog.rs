use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{error, info};

/// Process watchdog: the main loop must kick it within the timeout or the
/// timeout action runs (in production: exit code 2 so the service manager
/// restarts the companion).
pub struct Watchdog {
    inner: Arc<Inner>,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    last_kick: Mutex<Instant>,
    timeout: Duration,
    stopped: AtomicBool,
}

impl Watchdog {
    pub fn start(timeout: Duration, on_timeout: impl FnOnce() + Send + 'static) -> Self {
        let inner = Arc::new(Inner {
            last_kick: Mutex::new(Instant::now()),
            timeout,
            stopped: AtomicBool::new(false),
        });
        let handle = {
            let inner = inner.clone();
            std::thread::spawn(move || {
                let poll = (timeout / 10).clamp(Duration::from_millis(50), Duration::from_secs(1));
                loop {
                    if inner.stopped.load(Ordering::Relaxed) {
                        return;
                    }
                    let age = inner.last_kick.lock().unwrap().elapsed();
                    if age > inner.timeout {
                        error!(age_s = age.as_secs_f64(), "watchdog timeout");
                        on_timeout();
                        return;
                    }
                    std::thread::sleep(poll);
                }
            })
        };
        info!(timeout_s = timeout.as_secs_f64(), "watchdog started");
        Self {
            inner,
            handle: Some(handle),
        }
    }

    pub fn kick(&self) {
        *self.inner.last_kick.lock().unwrap() = Instant::now();
    }

    pub fn stop(mut self) {
        self.inner.stopped.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
        info!("watchdog stopped");
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.inner.stopped.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_when_not_kicked() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let wd = Watchdog::start(Duration::from_millis(100), move || {
            flag.store(true, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(400));
        assert!(fired.load(Ordering::SeqCst));
        wd.stop();
    }

    #[test]
    fn kicks_keep_it_quiet() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let wd = Watchdog::start(Duration::from_millis(150), move || {
            flag.store(true, Ordering::SeqCst);
        });
        for _ in 0..6 {
            std::thread::sleep(Duration::from_millis(50));
            wd.kick();
        }
        assert!(!fired.load(Ordering::SeqCst));
        wd.stop();
    }
}
