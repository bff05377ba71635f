//! Cooperative shutdown for background tasks.
//!
//! Each long-running task (the tick timer, the serial read loop) owns a
//! `watch::Receiver<bool>` and exits when it flips to `true`. The owner keeps
//! the sender and the join handles in a [`ShutdownBarrier`] and joins them
//! with a bounded grace period; anything still running after that is aborted.

use futures::future::join_all;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Cancel signal plus the set of tasks that must observe it.
#[derive(Debug)]
pub struct ShutdownBarrier {
    name: &'static str,
    signal: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ShutdownBarrier {
    /// Creates an untriggered barrier. `name` is used in log messages.
    pub fn new(name: &'static str) -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            name,
            signal,
            tasks: Vec::new(),
        }
    }

    /// Receiver to hand to a task before spawning it.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Adds a task to be joined on shutdown.
    pub fn track(&mut self, handle: JoinHandle<()>) {
        self.tasks.push(handle);
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        *self.signal.borrow()
    }

    /// Signal every task, then wait up to `grace` for them to finish.
    ///
    /// Returns the number of tasks that had to be aborted.
    pub async fn shutdown(&mut self, grace: Duration) -> usize {
        self.signal.send_replace(true);

        let tasks = std::mem::take(&mut self.tasks);
        if tasks.is_empty() {
            return 0;
        }
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();

        match tokio::time::timeout(grace, join_all(tasks)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        if e.is_panic() {
                            warn!(barrier = self.name, "Background task panicked: {}", e);
                        }
                    }
                }
                debug!(barrier = self.name, "Background tasks drained");
                0
            }
            Err(_) => {
                let stragglers = aborts.iter().filter(|a| !a.is_finished()).count();
                for abort in &aborts {
                    abort.abort();
                }
                warn!(
                    barrier = self.name,
                    stragglers,
                    "Background tasks did not stop within {:?}, aborted",
                    grace
                );
                stragglers
            }
        }
    }
}

/// Resolves once the watched flag is `true` or the sender is gone.
pub async fn cancelled(rx: &mut watch::Receiver<bool>) {
    // An error means the barrier was dropped, which is also a stop request.
    let _ = rx.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_cooperative_task_drains() {
        let mut barrier = ShutdownBarrier::new("test");
        let mut rx = barrier.subscribe();
        barrier.track(tokio::spawn(async move {
            cancelled(&mut rx).await;
        }));

        let aborted = barrier.shutdown(Duration::from_millis(100)).await;
        assert_eq!(aborted, 0);
        assert!(barrier.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_task_is_aborted() {
        let mut barrier = ShutdownBarrier::new("test");
        barrier.track(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }));

        let aborted = barrier.shutdown(Duration::from_millis(100)).await;
        assert_eq!(aborted, 1);
    }

    #[tokio::test]
    async fn test_shutdown_without_tasks() {
        let mut barrier = ShutdownBarrier::new("empty");
        assert_eq!(barrier.shutdown(Duration::from_millis(10)).await, 0);
    }
}
