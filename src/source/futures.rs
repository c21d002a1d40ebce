//! Worker pools that back the multithreaded sources and the decompression
//! stage.
//!
//! Each worker owns one resource (an open file handle, an HTTP agent slot, an
//! XRootD session) and processes one job at a time. Closing a pool refuses
//! new submissions and joins the workers; in-flight jobs run to completion.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::error::{Error, Result};

type Job<R> = Box<dyn FnOnce(&mut R) + Send>;

pub struct ResourcePool<R: Send + 'static> {
    sender: Mutex<Option<mpsc::Sender<Job<R>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    num_workers: usize,
}

impl<R: Send + 'static> ResourcePool<R> {
    /// One worker thread per resource.
    pub fn new(resources: Vec<R>) -> ResourcePool<R> {
        let (sender, receiver) = mpsc::channel::<Job<R>>();
        let receiver = Arc::new(Mutex::new(receiver));
        let num_workers = resources.len();

        let handles = resources
            .into_iter()
            .map(|mut resource| {
                let receiver = Arc::clone(&receiver);
                std::thread::spawn(move || loop {
                    let job = {
                        let guard = receiver.lock().expect("pool receiver poisoned");
                        guard.recv()
                    };
                    match job {
                        Ok(job) => job(&mut resource),
                        Err(_) => break,
                    }
                })
            })
            .collect();

        ResourcePool {
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
            num_workers,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn submit(&self, path: &str, job: impl FnOnce(&mut R) + Send + 'static) -> Result<()> {
        let guard = self.sender.lock().expect("pool sender poisoned");
        match &*guard {
            Some(sender) => sender
                .send(Box::new(job))
                .map_err(|_| Error::Closed { path: path.into() }),
            None => Err(Error::Closed { path: path.into() }),
        }
    }

    /// Refuse new submissions and join every worker.
    pub fn close(&self) {
        let sender = self.sender.lock().expect("pool sender poisoned").take();
        drop(sender);
        let handles: Vec<_> = self
            .handles
            .lock()
            .expect("pool handles poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub fn closed(&self) -> bool {
        self.sender.lock().expect("pool sender poisoned").is_none()
    }
}

impl<R: Send + 'static> Drop for ResourcePool<R> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Where decompression and interpretation work runs.
///
/// The default for interpretation is [`Executor::Trivial`] (same thread);
/// basket decompression gets a pool so independent baskets overlap with I/O.
pub enum Executor {
    Trivial,
    Pool(ResourcePool<()>),
}

impl Executor {
    pub fn pool(num_workers: usize) -> Executor {
        Executor::Pool(ResourcePool::new(vec![(); num_workers.max(1)]))
    }

    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        match self {
            Executor::Trivial => job(),
            Executor::Pool(pool) => {
                // a closed pool degrades to same-thread execution
                if pool.closed() {
                    job();
                } else {
                    let _ = pool.submit("executor", move |_| job());
                }
            }
        }
    }

    pub fn close(&self) {
        if let Executor::Pool(pool) = self {
            pool.close();
        }
    }

    /// Run a job to completion and hand back its result. Trivial runs it on
    /// the calling thread; a pooled executor gives it a thread of its own
    /// (jobs here may borrow caller state, so they cannot ride the queue).
    pub fn run<T, F>(&self, job: F) -> T
    where
        T: Send,
        F: FnOnce() -> T + Send,
    {
        match self {
            Executor::Trivial => job(),
            Executor::Pool(_) => std::thread::scope(|scope| {
                scope
                    .spawn(job)
                    .join()
                    .expect("executor job panicked")
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn jobs_run_on_workers_owning_their_resource() {
        let pool = ResourcePool::new(vec![0u64, 0u64]);
        let counter = Arc::new(AtomicUsize::new(0));
        let (done, wait) = mpsc::channel();
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            let done = done.clone();
            pool.submit("t", move |slot: &mut u64| {
                *slot += 1;
                counter.fetch_add(1, Ordering::SeqCst);
                done.send(()).unwrap();
            })
            .unwrap();
        }
        for _ in 0..16 {
            wait.recv().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn closed_pool_rejects_submissions() {
        let pool: ResourcePool<()> = ResourcePool::new(vec![()]);
        assert!(!pool.closed());
        pool.close();
        assert!(pool.closed());
        assert!(matches!(
            pool.submit("x.root", |_| {}),
            Err(Error::Closed { .. })
        ));
    }

    #[test]
    fn trivial_executor_runs_inline() {
        let hit = Arc::new(AtomicUsize::new(0));
        let hit2 = Arc::clone(&hit);
        Executor::Trivial.submit(move || {
            hit2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }
}
