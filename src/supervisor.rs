//! Graceful shutdown and reconnect-with-backoff around broker sessions.

use crate::error::WorkerError;
use crate::retry::ReconnectPolicy;
use std::future::Future;
use tokio::sync::watch;
use tokio::time::Instant;

/// Requests shutdown. Dropping the trigger requests it as well.
pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

/// Observed by consumers and the reconnect loop.
#[derive(Clone)]
pub struct Shutdown(watch::Receiver<bool>);

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), Shutdown(rx))
}

impl Shutdown {
    pub fn is_requested(&self) -> bool {
        *self.0.borrow() || self.0.has_changed().is_err()
    }

    /// Resolves once shutdown has been requested.
    pub async fn requested(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Runs broker sessions until one ends cleanly or fails for good.
///
/// `session` is called with a fresh [`Shutdown`] each time and should connect,
/// consume, and return `Ok(())` only after a requested shutdown. Connectivity
/// failures are retried after [`ReconnectPolicy::delay_for`]; the attempt
/// counter starts over when a session stayed up longer than `max_delay`. Any
/// other error is returned straight away.
pub async fn run_with_reconnect<F, Fut>(
    policy: &ReconnectPolicy,
    mut shutdown: Shutdown,
    mut session: F,
) -> Result<(), WorkerError>
where
    F: FnMut(Shutdown) -> Fut,
    Fut: Future<Output = Result<(), WorkerError>>,
{
    let mut attempt = 0u32;

    loop {
        if shutdown.is_requested() {
            return Ok(());
        }

        let started = Instant::now();
        let err = match session(shutdown.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_connectivity_failure() => e,
            Err(e) => {
                log::error!("Worker session failed with a non-recoverable error: {}", e);
                return Err(e);
            }
        };

        if started.elapsed() > policy.max_delay {
            attempt = 0;
        }

        let Some(delay) = policy.delay_for(attempt) else {
            log::error!("Giving up after {} reconnect attempts. Last error: {}", attempt, err);
            return Err(err);
        };
        attempt += 1;

        log::error!("Worker failed: {}. Reconnecting in {:?} (attempt {})...", err, delay, attempt);

        tokio::select! {
            _ = shutdown.requested() => {
                log::info!("Shutdown requested while waiting to reconnect.");
                return Ok(());
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
