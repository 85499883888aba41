//! Fixed-size worker pool for parallel batched reads.
//!
//! Store constructors start a pool once; `get_many` splits its batch into
//! sub-batches, submits one job per sub-batch, and awaits one response
//! channel per job. Jobs are dispatched round-robin over bounded per-worker
//! queues, so a slow worker exerts backpressure instead of growing memory.

use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::anyhow;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Work unit executed on a pool worker.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Sub-batches are never split smaller than this, so tiny batches are not
/// fragmented across the whole pool.
pub const MIN_SUB_BATCH: usize = 64;

/// Fixed pool of worker tasks servicing boxed jobs.
///
/// [`close`](WorkerPool::close) drops every job sender and joins the
/// workers, so shutdown is deterministic; submissions after close fail
/// explicitly.
pub struct WorkerPool {
    senders: RwLock<Vec<mpsc::Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
    workers: usize,
}

impl WorkerPool {
    /// Starts `workers` tasks, each with a job queue of `queue_depth`.
    #[must_use]
    pub fn start(workers: usize, queue_depth: usize) -> Self {
        let workers = workers.max(1);
        let queue_depth = queue_depth.max(1);

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, mut rx) = mpsc::channel::<Job>(queue_depth);
            senders.push(tx);
            handles.push(tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    job();
                }
            }));
        }

        Self {
            senders: RwLock::new(senders),
            handles: Mutex::new(handles),
            next: AtomicUsize::new(0),
            workers,
        }
    }

    /// Number of workers in the pool.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Submits a job to the next worker in round-robin order.
    ///
    /// Blocks when that worker's queue is full.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool has been closed.
    pub async fn submit(&self, job: Job) -> anyhow::Result<()> {
        let sender = {
            let senders = self.senders.read();
            if senders.is_empty() {
                None
            } else {
                let i = self.next.fetch_add(1, Ordering::Relaxed) % senders.len();
                Some(senders[i].clone())
            }
        };

        match sender {
            Some(tx) => tx
                .send(job)
                .await
                .map_err(|_| anyhow!("worker pool is closed")),
            None => Err(anyhow!("worker pool is closed")),
        }
    }

    /// Drops all job senders and joins the workers.
    pub async fn close(&self) {
        let senders = std::mem::take(&mut *self.senders.write());
        drop(senders);

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Sub-batch size that spreads `items` evenly across `workers`, never
/// below `floor`.
#[must_use]
pub fn chunk_size(items: usize, workers: usize, floor: usize) -> usize {
    let workers = workers.max(1);
    items.div_ceil(workers).max(floor.max(1))
}

/// Splits `items` into owned consecutive chunks of at most `size`.
#[must_use]
pub fn into_chunks<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
    let mut it = items.into_iter();
    loop {
        let chunk: Vec<T> = it.by_ref().take(size).collect();
        if chunk.is_empty() {
            break;
        }
        chunks.push(chunk);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    use tokio::sync::oneshot;

    use super::*;

    #[test]
    fn chunk_size_spreads_evenly() {
        // 65 items over 4 workers: ceil(65 / 4) = 17.
        assert_eq!(chunk_size(65, 4, 1), 17);
        assert_eq!(chunk_size(64, 4, 1), 16);
    }

    #[test]
    fn chunk_size_applies_floor() {
        // Tiny batches are not fragmented below the floor.
        assert_eq!(chunk_size(5, 8, MIN_SUB_BATCH), MIN_SUB_BATCH);
        assert_eq!(chunk_size(0, 8, MIN_SUB_BATCH), MIN_SUB_BATCH);
    }

    #[test]
    fn into_chunks_covers_all_items_in_order() {
        let chunks = into_chunks((0..65).collect::<Vec<i32>>(), 17);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3].len(), 65 - 3 * 17);

        let flat: Vec<i32> = chunks.into_iter().flatten().collect();
        assert_eq!(flat, (0..65).collect::<Vec<i32>>());
    }

    #[tokio::test]
    async fn pool_executes_submitted_jobs() {
        let pool = WorkerPool::start(4, 8);
        let counter = Arc::new(AtomicU32::new(0));

        let mut receivers = Vec::new();
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            let (tx, rx) = oneshot::channel();
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            }))
            .await
            .unwrap();
            receivers.push(rx);
        }
        for rx in receivers {
            rx.await.unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 10);
        pool.close().await;
    }

    #[tokio::test]
    async fn submit_after_close_errors() {
        let pool = WorkerPool::start(2, 4);
        pool.close().await;

        let result = pool.submit(Box::new(|| {})).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn close_waits_for_in_flight_jobs() {
        let pool = WorkerPool::start(1, 4);
        let done = Arc::new(AtomicU32::new(0));

        let flag = Arc::clone(&done);
        pool.submit(Box::new(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            flag.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();

        pool.close().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
