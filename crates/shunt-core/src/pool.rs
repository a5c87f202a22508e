//! Fixed-size worker pools over a crossbeam channel.
//!
//! Two of these run the pipeline: a transfer pool for the bulk IO phases and
//! a cleanup pool for deletes and cache teardown. `JobHandle` lets a later
//! job chain behind an earlier one (the per-pack finalizer waits on the
//! dispatched source delete) without blocking a transfer worker.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Completion handle for one submitted job.
pub struct JobHandle {
    rx: Receiver<()>,
}

impl JobHandle {
    /// Block until the job finishes. A job that panicked counts as finished;
    /// the pool thread survives it.
    pub fn wait(&self) {
        let _ = self.rx.recv();
    }
}

/// Bounded pool of named worker threads draining a shared job queue.
pub struct WorkerPool {
    tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize) -> Result<Self> {
        let (tx, rx) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(size.max(1));
        for idx in 0..size.max(1) {
            let rx: Receiver<Job> = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{idx}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job));
                    }
                })
                .with_context(|| format!("spawn {name} worker {idx}"))?;
            workers.push(handle);
        }
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Queue a job. Jobs submitted after `join` are dropped; the returned
    /// handle then reports completion immediately.
    pub fn submit<F>(&self, job: F) -> JobHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let (done_tx, done_rx) = bounded::<()>(1);
        let wrapped: Job = Box::new(move || {
            job();
            let _ = done_tx.send(());
        });
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(wrapped);
        }
        JobHandle { rx: done_rx }
    }

    /// Close the queue and wait for every worker to drain it.
    pub fn join(&self) {
        self.tx.lock().take();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_every_submitted_job() {
        let pool = WorkerPool::new("test", 4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn handles_chain_completion() {
        let pool = WorkerPool::new("test", 2).unwrap();
        let flag = Arc::new(AtomicUsize::new(0));

        let first = {
            let flag = Arc::clone(&flag);
            pool.submit(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                flag.store(1, Ordering::SeqCst);
            })
        };
        let observed = {
            let flag = Arc::clone(&flag);
            pool.submit(move || {
                first.wait();
                assert_eq!(flag.load(Ordering::SeqCst), 1);
                flag.store(2, Ordering::SeqCst);
            })
        };
        observed.wait();
        assert_eq!(flag.load(Ordering::SeqCst), 2);
        pool.join();
    }
}
