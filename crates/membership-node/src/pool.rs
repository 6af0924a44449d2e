//! Bounded worker pools for socket I/O and application dispatch.
//!
//! Both pools spawn onto the ambient tokio runtime and share one shutdown
//! token. After shutdown, queued work never starts and running work is dropped
//! at its next await point.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

/// Runs at most `workers` tasks at once; the rest wait for a slot.
#[derive(Debug, Clone)]
pub struct IoPool {
    slots: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl IoPool {
    pub fn new(workers: usize, cancel: CancellationToken) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(workers.max(1))),
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    /// Queue `task`. Returns false once the pool is shut down.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return false;
        }
        let slots = self.slots.clone();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                permit = slots.acquire_owned() => {
                    let Ok(_permit) = permit else { return };
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = task => {}
                    }
                }
            }
        });
        true
    }

    /// Tasks that have not finished yet, queued or running.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.slots.close();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

type Job = BoxFuture<'static, ()>;

/// Default number of jobs a lane holds behind the one running.
pub const DEFAULT_LANE_CAPACITY: usize = 1024;

/// Sharded FIFO lanes. Jobs with the same key run in submission order, one at
/// a time; different lanes run concurrently.
///
/// Each lane holds at most `capacity` waiting jobs. A submit to a full lane is
/// dropped with a warning; the caller is never blocked.
#[derive(Debug, Clone)]
pub struct DispatchPool {
    lanes: Arc<Vec<mpsc::Sender<Job>>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl DispatchPool {
    /// Must be called from within a tokio runtime.
    pub fn new(workers: usize, capacity: usize, cancel: CancellationToken) -> Self {
        let tracker = TaskTracker::new();
        let lanes = (0..workers.max(1))
            .map(|lane| {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                tracker.spawn(run_lane(lane, rx, cancel.clone()));
                tx
            })
            .collect();
        Self {
            lanes: Arc::new(lanes),
            tracker,
            cancel,
        }
    }

    /// Queue `job` on the lane for `key`. Returns false if the pool is shut
    /// down or the lane is full.
    pub fn submit<F>(&self, key: u64, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return false;
        }
        let lane = (key % self.lanes.len() as u64) as usize;
        match self.lanes[lane].try_send(job.boxed()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(lane, key, "Dispatch lane full, dropping job");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn run_lane(lane: usize, mut jobs: mpsc::Receiver<Job>, cancel: CancellationToken) {
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = AssertUnwindSafe(job).catch_unwind() => {
                if result.is_err() {
                    error!(lane, "Dispatch job panicked");
                }
            }
        }
    }
    // Anything still queued is discarded with the receiver
    debug!(lane, "Dispatch lane stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_io_pool_bounds_concurrency() {
        let pool = IoPool::new(2, CancellationToken::new());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            let done_tx = done_tx.clone();
            assert!(pool.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                let _ = done_tx.send(());
            }));
        }
        for _ in 0..6 {
            tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
                .await
                .unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_io_pool_shutdown_discards_queued() {
        let pool = IoPool::new(1, CancellationToken::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = oneshot::channel();

        pool.spawn(async move {
            let _ = started_tx.send(());
            std::future::pending::<()>().await;
        });
        started_rx.await.unwrap();

        let queued = ran.clone();
        pool.spawn(async move {
            queued.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::timeout(Duration::from_secs(5), pool.shutdown())
            .await
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(!pool.spawn(async {}));
        assert_eq!(pool.pending(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_keeps_per_key_order() {
        let pool = DispatchPool::new(3, DEFAULT_LANE_CAPACITY, CancellationToken::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();

        for i in 0..50u32 {
            let seen = seen.clone();
            pool.submit(7, async move {
                if i % 5 == 0 {
                    tokio::task::yield_now().await;
                }
                seen.lock().unwrap().push(i);
            });
        }
        pool.submit(7, async move {
            let _ = done_tx.send(());
        });

        tokio::time::timeout(Duration::from_secs(5), done_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_dispatch_survives_panicking_job() {
        let pool = DispatchPool::new(1, DEFAULT_LANE_CAPACITY, CancellationToken::new());
        let (done_tx, done_rx) = oneshot::channel();

        pool.submit(0, async {
            panic!("handler bug");
        });
        pool.submit(0, async move {
            let _ = done_tx.send(());
        });

        tokio::time::timeout(Duration::from_secs(5), done_rx)
            .await
            .unwrap()
            .unwrap();
        pool.shutdown().await;
        assert!(!pool.submit(0, async {}));
    }

    #[tokio::test]
    async fn test_full_lane_drops_new_jobs() {
        let pool = DispatchPool::new(1, 2, CancellationToken::new());
        let ran = Arc::new(Mutex::new(Vec::new()));
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        // Occupies the lane until released
        assert!(pool.submit(0, async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
        }));
        started_rx.await.unwrap();

        for i in 0..3u32 {
            let ran = ran.clone();
            let accepted = pool.submit(0, async move {
                ran.lock().unwrap().push(i);
            });
            assert_eq!(accepted, i < 2, "job {i}");
        }

        release_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while ran.lock().unwrap().len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        // Room again once the backlog drained
        let (last_tx, last_rx) = oneshot::channel();
        assert!(pool.submit(0, async move {
            let _ = last_tx.send(());
        }));
        tokio::time::timeout(Duration::from_secs(5), last_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*ran.lock().unwrap(), vec![0, 1]);
        pool.shutdown().await;
    }
}
