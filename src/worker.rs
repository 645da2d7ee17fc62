//! Minimal one-job worker.
//!
//! A `Worker` owns at most one background thread and runs one boolean job
//! at a time: `reset` readies it, `launch` hands it a job, `sync` blocks
//! until the job is done and reports accumulated success, `end` shuts the
//! thread down. A `Synchronous` worker runs jobs inline on `launch` with
//! the same state machine and the same results, so callers never branch on
//! the threading mode.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() -> bool + Send + 'static>;

/// Whether jobs run on a spawned thread or inline in `launch`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerKind {
    Threaded,
    Synchronous,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    /// No thread attached; `reset` must run before `launch`.
    Idle,
    /// Ready to accept a job.
    Ready,
    /// A job is executing.
    Running,
}

struct Inner {
    state: State,
    job: Option<Job>,
    had_error: bool,
    quit: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    cv_job: Condvar,
    cv_done: Condvar,
}

fn lock(shared: &Shared) -> MutexGuard<'_, Inner> {
    shared.inner.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Worker {
    kind: WorkerKind,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn new(kind: WorkerKind) -> Self {
        Self {
            kind,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: State::Idle,
                    job: None,
                    had_error: false,
                    quit: false,
                }),
                cv_job: Condvar::new(),
                cv_done: Condvar::new(),
            }),
            handle: None,
        }
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Make the worker ready, spawning the thread on first use. Clears a
    /// previous error. Returns false if the thread cannot be spawned.
    pub fn reset(&mut self) -> bool {
        {
            let mut inner = lock(&self.shared);
            // collect any job still in flight; its outcome belongs to the
            // epoch being closed
            while inner.state == State::Running {
                inner = self
                    .shared
                    .cv_done
                    .wait(inner)
                    .unwrap_or_else(|e| e.into_inner());
            }
            inner.had_error = false;
            if inner.state != State::Idle {
                return true;
            }
            inner.quit = false;
            inner.state = State::Ready;
        }
        if self.kind == WorkerKind::Threaded && self.handle.is_none() {
            let shared = Arc::clone(&self.shared);
            match std::thread::Builder::new()
                .name("zenstill-worker".into())
                .spawn(move || thread_loop(&shared))
            {
                Ok(handle) => self.handle = Some(handle),
                Err(_) => {
                    let mut inner = lock(&self.shared);
                    inner.state = State::Idle;
                    inner.had_error = true;
                    return false;
                }
            }
        }
        true
    }

    /// Hand over a job. The worker must be ready (`reset` called, and any
    /// previous job collected with `sync`).
    pub fn launch<F>(&mut self, job: F)
    where
        F: FnOnce() -> bool + Send + 'static,
    {
        if self.kind == WorkerKind::Synchronous {
            let ok = job();
            let mut inner = lock(&self.shared);
            inner.had_error |= !ok;
            return;
        }
        let mut inner = lock(&self.shared);
        while inner.state == State::Running {
            inner = self
                .shared
                .cv_done
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
        if inner.state != State::Ready {
            // not reset; count it as a failed job
            inner.had_error = true;
            return;
        }
        inner.job = Some(Box::new(job));
        inner.state = State::Running;
        drop(inner);
        self.shared.cv_job.notify_one();
    }

    /// Wait for the pending job, if any, and report whether every job
    /// since the last `reset` succeeded.
    pub fn sync(&mut self) -> bool {
        let mut inner = lock(&self.shared);
        while inner.state == State::Running {
            inner = self
                .shared
                .cv_done
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
        !inner.had_error
    }

    /// Finish the pending job and shut the thread down. Idempotent.
    pub fn end(&mut self) {
        {
            let mut inner = lock(&self.shared);
            while inner.state == State::Running {
                inner = self
                    .shared
                    .cv_done
                    .wait(inner)
                    .unwrap_or_else(|e| e.into_inner());
            }
            inner.quit = true;
            inner.state = State::Idle;
        }
        self.shared.cv_job.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.end();
    }
}

fn thread_loop(shared: &Shared) {
    loop {
        let job = {
            let mut inner = lock(shared);
            loop {
                if inner.quit {
                    return;
                }
                if let Some(job) = inner.job.take() {
                    break job;
                }
                inner = shared
                    .cv_job
                    .wait(inner)
                    .unwrap_or_else(|e| e.into_inner());
            }
        };
        let ok = job();
        {
            let mut inner = lock(shared);
            inner.had_error |= !ok;
            if inner.state == State::Running {
                inner.state = State::Ready;
            }
        }
        shared.cv_done.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn synchronous_worker_runs_inline() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut w = Worker::new(WorkerKind::Synchronous);
        assert!(w.reset());
        let c = Arc::clone(&counter);
        w.launch(move || {
            c.fetch_add(1, Ordering::SeqCst);
            true
        });
        // inline mode completes before launch returns
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(w.sync());
        w.end();
    }

    #[test]
    fn threaded_worker_completes_jobs_in_order() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut w = Worker::new(WorkerKind::Threaded);
        assert!(w.reset());
        for i in 0..4 {
            let c = Arc::clone(&counter);
            w.launch(move || {
                // each job sees the result of every previous one
                c.fetch_add(i + 1, Ordering::SeqCst);
                true
            });
            assert!(w.sync());
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1 + 2 + 3 + 4);
        w.end();
    }

    #[test]
    fn failed_job_reported_at_sync() {
        let mut w = Worker::new(WorkerKind::Threaded);
        assert!(w.reset());
        w.launch(|| false);
        assert!(!w.sync());
        // the error is sticky until reset
        assert!(!w.sync());
        assert!(w.reset());
        assert!(w.sync());
        w.end();
    }

    #[test]
    fn sync_without_launch_returns_immediately() {
        let mut w = Worker::new(WorkerKind::Threaded);
        assert!(w.reset());
        assert!(w.sync());
        w.end();
    }

    #[test]
    fn end_is_idempotent() {
        let mut w = Worker::new(WorkerKind::Threaded);
        assert!(w.reset());
        w.launch(|| true);
        w.end();
        w.end();
    }

    #[test]
    fn reset_collects_a_running_job_first() {
        let mut w = Worker::new(WorkerKind::Threaded);
        assert!(w.reset());
        w.launch(|| {
            std::thread::sleep(std::time::Duration::from_millis(50));
            false
        });
        // no sync in between: the failure must stay in the old epoch
        assert!(w.reset());
        assert!(w.sync());
        w.end();
    }

    #[test]
    fn launch_without_reset_counts_as_error() {
        let mut w = Worker::new(WorkerKind::Threaded);
        w.launch(|| true);
        assert!(!w.sync());
    }
}
