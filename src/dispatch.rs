//! Work handed off the receive thread so decode/dispatch/send never block
//! the next `recv_from`. Grounded on the teacher's blocking
//! `UdpSocket::recv_from` receive loop (`src/v4/worker.rs`); this crate
//! carries the same no-async-runtime posture (no `tokio` in the
//! dependency stack) but generalizes the inline work into a small fixed
//! worker pool behind a trait, per SPEC_FULL.md §9.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait TaskDispatcher: Send + Sync {
    fn submit(&self, job: Job);
}

/// Fixed-size pool of worker threads pulling jobs off a shared channel.
pub struct ThreadPoolDispatcher {
    sender: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPoolDispatcher {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let receiver = Arc::clone(&receiver);
            workers.push(
                thread::Builder::new()
                    .name(format!("dhcp4d-worker-{id}"))
                    .spawn(move || loop {
                        let job = {
                            let guard = receiver.lock().expect("dispatcher queue mutex poisoned");
                            guard.recv()
                        };
                        match job {
                            Ok(job) => job(),
                            Err(_) => break,
                        }
                    })
                    .expect("failed to spawn dispatcher worker thread"),
            );
        }
        ThreadPoolDispatcher { sender, workers }
    }
}

impl TaskDispatcher for ThreadPoolDispatcher {
    fn submit(&self, job: Job) {
        // The receiving half only disappears once every worker has
        // exited, which only happens after `drop`; a send error here
        // means the pool is already shutting down, so dropping the job
        // silently is correct.
        let _ = self.sender.send(job);
    }
}

impl Drop for ThreadPoolDispatcher {
    fn drop(&mut self) {
        // Fields drop in declaration order only after this runs, so the
        // sender would otherwise still be alive while we join workers
        // blocked on `recv()` — replace it to close the channel first.
        let (sender, _) = mpsc::channel();
        self.sender = sender;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn submitted_jobs_all_run() {
        let dispatcher = ThreadPoolDispatcher::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = counter.clone();
            dispatcher.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        drop(dispatcher);
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn jobs_run_off_the_submitting_thread() {
        let dispatcher = ThreadPoolDispatcher::new(1);
        let (tx, rx) = mpsc::channel();
        dispatcher.submit(Box::new(move || {
            tx.send(thread::current().name().map(|s| s.to_string())).unwrap();
        }));
        let name = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(name.as_deref(), Some("dhcp4d-worker-0"));
    }
}
