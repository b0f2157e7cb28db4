//! Mixer thread watchdog
//!
//! Pings the mixer thread through its mailbox and treats a missing reply
//! as fatal.

use crate::stream_mixer::MixerTask;
use crossbeam_channel::{bounded, select, Sender};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// Called when the mixer thread misses a health check
pub type FailureHandler = Arc<dyn Fn() + Send + Sync>;

const THREAD_NAME: &str = "amix-health";

pub(crate) fn abort_on_failure() -> FailureHandler {
    Arc::new(|| {
        error!("mixer thread is unresponsive, aborting");
        std::process::abort();
    })
}

#[derive(Clone)]
pub(crate) struct HealthCheckSettings {
    pub(crate) interval: Duration,
    pub(crate) timeout: Duration,
    pub(crate) on_failure: FailureHandler,
}

enum Ping {
    Answered,
    Missed,
    Closed,
}

pub(crate) struct HealthChecker {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl HealthChecker {
    pub(crate) fn start(tasks: Sender<MixerTask>, settings: HealthCheckSettings) -> io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread = thread::Builder::new().name(THREAD_NAME.to_string()).spawn(move || {
            let HealthCheckSettings {
                interval,
                timeout,
                on_failure,
            } = settings;
            loop {
                let stopped = select! {
                    recv(stop_rx) -> _ => true,
                    default(interval) => false,
                };
                if stopped {
                    break;
                }

                let (reply_tx, reply_rx) = bounded(1);
                if tasks.send(MixerTask::HealthCheck(reply_tx)).is_err() {
                    break;
                }
                let ping = select! {
                    // Dropped unanswered: the mixer is shutting down
                    recv(reply_rx) -> reply => if reply.is_ok() { Ping::Answered } else { Ping::Closed },
                    recv(stop_rx) -> _ => Ping::Closed,
                    default(timeout) => Ping::Missed,
                };
                match ping {
                    Ping::Answered => {}
                    Ping::Closed => break,
                    Ping::Missed => {
                        error!(timeout_ms = timeout.as_millis() as u64, "mixer thread missed a health check");
                        on_failure();
                    }
                }
            }
            debug!("health checker stopped");
        })?;
        Ok(Self {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub(crate) fn stop(&mut self) {
        // Dropping the sender wakes the thread
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn settings(failures: &Arc<AtomicUsize>) -> HealthCheckSettings {
        let failures = failures.clone();
        HealthCheckSettings {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(20),
            on_failure: Arc::new(move || {
                failures.fetch_add(1, Ordering::SeqCst);
            }),
        }
    }

    #[test]
    fn test_unresponsive_mixer_reported() {
        let failures = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = unbounded();
        let mut checker = HealthChecker::start(tx, settings(&failures)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while failures.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        checker.stop();
        assert!(failures.load(Ordering::SeqCst) > 0);
        drop(rx);
    }

    #[test]
    fn test_responsive_mixer_not_reported() {
        let failures = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = unbounded();
        let responder = thread::spawn(move || {
            let mut answered = 0;
            while let Ok(task) = rx.recv() {
                if let MixerTask::HealthCheck(reply) = task {
                    let _ = reply.send(());
                    answered += 1;
                }
            }
            answered
        });

        let mut checker = HealthChecker::start(tx, settings(&failures)).unwrap();
        thread::sleep(Duration::from_millis(100));
        checker.stop();

        assert!(responder.join().unwrap() > 0);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
    }
}
