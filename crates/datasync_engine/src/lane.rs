//! Serial work lanes.

use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// A unit of work run by a [`WorkLane`].
pub(crate) type Job = BoxFuture<'static, ()>;

/// Runs submitted jobs one at a time in submission order.
///
/// A suspended lane accepts jobs but does not start them. Suspending never
/// interrupts the job that is already running. Cancelling the lane's token
/// aborts the running job and drops everything queued.
pub(crate) struct WorkLane {
    jobs: mpsc::UnboundedSender<Job>,
    running: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl WorkLane {
    /// Spawns the lane worker. Must be called within a tokio runtime.
    pub(crate) fn new(name: impl Into<String>, suspended: bool, cancel: CancellationToken) -> Self {
        let name = name.into();
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        let (running, mut running_rx) = watch::channel(!suspended);
        let token = cancel.clone();

        tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = token.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                if !wait_until_running(&mut running_rx, &token).await {
                    break;
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = job => {}
                }
            }
            tracing::trace!(lane = %name, "work lane stopped");
        });

        Self {
            jobs,
            running,
            cancel,
        }
    }

    /// Queues a job. Returns false if the lane has stopped.
    pub(crate) fn submit(&self, job: Job) -> bool {
        !self.cancel.is_cancelled() && self.jobs.send(job).is_ok()
    }

    /// Stops starting new jobs.
    pub(crate) fn suspend(&self) {
        self.running.send_replace(false);
    }

    /// Starts running queued jobs again.
    pub(crate) fn resume(&self) {
        self.running.send_replace(true);
    }

    /// Returns true if the lane is suspended.
    pub(crate) fn is_suspended(&self) -> bool {
        !*self.running.borrow()
    }

    /// Aborts the running job and drops queued ones.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

async fn wait_until_running(running: &mut watch::Receiver<bool>, token: &CancellationToken) -> bool {
    while !*running.borrow_and_update() {
        tokio::select! {
            _ = token.cancelled() => return false,
            changed = running.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn recording_job(log: &Arc<Mutex<Vec<u32>>>, value: u32) -> Job {
        let log = Arc::clone(log);
        async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            log.lock().push(value);
        }
        .boxed()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn runs_jobs_in_order_one_at_a_time() {
        let lane = WorkLane::new("test", false, CancellationToken::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            let log = Arc::clone(&log);
            lane.submit(
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    log.lock().push(i);
                    active.fetch_sub(1, Ordering::SeqCst);
                }
                .boxed(),
            );
        }
        settle().await;

        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn suspended_lane_holds_jobs_until_resumed() {
        let lane = WorkLane::new("test", true, CancellationToken::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        assert!(lane.is_suspended());

        for i in 0..3 {
            lane.submit(recording_job(&log, i));
        }
        settle().await;
        assert!(log.lock().is_empty());

        lane.resume();
        settle().await;
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn cancelled_lane_drops_queued_jobs() {
        let lane = WorkLane::new("test", true, CancellationToken::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        lane.submit(recording_job(&log, 1));

        lane.cancel();
        lane.resume();
        settle().await;

        assert!(log.lock().is_empty());
        assert!(!lane.submit(recording_job(&log, 2)));
    }
}
