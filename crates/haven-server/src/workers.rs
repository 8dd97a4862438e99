use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error};

type BoxedJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Job {
    tag: String,
    work: BoxedJob,
}

/// Small pool of tasks that run request bodies off the accept path. Jobs
/// are tagged with the request URI for per-endpoint queue accounting and
/// run to completion; a full queue is reported back as overload.
pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    queued: Arc<Mutex<HashMap<String, usize>>>,
}

impl WorkerPool {
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let queued = Arc::new(Mutex::new(HashMap::<String, usize>::new()));

        for id in 0..workers.max(1) {
            let rx = rx.clone();
            let queued = queued.clone();
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else {
                        debug!(worker = id, "Worker queue closed, exiting");
                        break;
                    };
                    {
                        let mut counts = queued.lock();
                        if let Some(depth) = counts.get_mut(&job.tag) {
                            *depth = depth.saturating_sub(1);
                            if *depth == 0 {
                                counts.remove(&job.tag);
                            }
                        }
                    }
                    // A panicking job must not take the worker down; the
                    // dropped reply channel surfaces as a 500 at the edge.
                    if let Err(panic) = std::panic::AssertUnwindSafe(job.work)
                        .catch_unwind()
                        .await
                    {
                        error!(worker = id, tag = %job.tag, ?panic, "Worker job panicked");
                    }
                }
            });
        }

        Self { tx, queued }
    }

    /// Queue a job; `Err` means the pool is saturated and the caller
    /// should shed load.
    pub fn try_inject<F>(&self, tag: &str, work: F) -> Result<(), ()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let job = Job {
            tag: tag.to_string(),
            work: Box::pin(work),
        };
        match self.tx.try_send(job) {
            Ok(()) => {
                *self.queued.lock().entry(tag.to_string()).or_insert(0) += 1;
                Ok(())
            }
            Err(_) => Err(()),
        }
    }

    pub fn queue_depths(&self) -> HashMap<String, usize> {
        self.queued.lock().clone()
    }
}
