use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::domain::DownloadTask;
use crate::error::ReelError;

pub trait TaskRunner: Send + Sync {
    fn run(&self, task: &DownloadTask) -> bool;
}

pub trait CompletionSink: Send + Sync {
    fn completed(&self, task: &DownloadTask);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCompletion;

impl CompletionSink for NoopCompletion {
    fn completed(&self, _task: &DownloadTask) {}
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub succeeded: usize,
    pub failed: usize,
    pub panicked: usize,
}

impl QueueStats {
    pub fn processed(&self) -> usize {
        self.succeeded + self.failed + self.panicked
    }
}

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<DownloadTask>,
    in_flight: usize,
    closed: bool,
    stats: QueueStats,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.tasks.is_empty() && self.in_flight == 0
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    available: Condvar,
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Outcome {
    Succeeded,
    Failed,
    Panicked,
}

pub struct Orchestrator {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn start(
        workers: usize,
        runner: Arc<dyn TaskRunner>,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<Self, ReelError> {
        let shared = Arc::new(Shared::default());
        let count = workers.max(1);
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let shared = Arc::clone(&shared);
            let runner = Arc::clone(&runner);
            let sink = Arc::clone(&sink);
            let handle = thread::Builder::new()
                .name(format!("reelsync-worker-{index}"))
                .spawn(move || worker_loop(&shared, runner.as_ref(), sink.as_ref()))
                .map_err(|err| ReelError::Worker(err.to_string()))?;
            handles.push(handle);
        }
        info!(workers = count, "download workers started");
        Ok(Self {
            shared,
            workers: Mutex::new(handles),
        })
    }

    /// Appends a task; returns false once the queue has been shut down.
    pub fn enqueue(&self, task: DownloadTask) -> bool {
        let mut state = self.shared.lock();
        if state.closed {
            warn!(task = %task.label(), "queue closed, task dropped");
            return false;
        }
        debug!(task = %task.label(), queued = state.tasks.len() + 1, "task queued");
        state.tasks.push_back(task);
        drop(state);
        self.shared.available.notify_one();
        true
    }

    pub fn pending(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.lock().in_flight
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.lock().stats
    }

    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn wait_idle(&self) {
        let mut state = self.shared.lock();
        while !state.is_idle() {
            state = self
                .shared
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn shutdown(&self) {
        self.close();
        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("download worker exited abnormally");
            }
        }
    }

    fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.available.notify_all();
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop(shared: &Shared, runner: &dyn TaskRunner, sink: &dyn CompletionSink) {
    while let Some(task) = next_task(shared) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| runner.run(&task)));
        let outcome = match result {
            Ok(true) => Outcome::Succeeded,
            Ok(false) => {
                warn!(task = %task.label(), "download failed");
                Outcome::Failed
            }
            Err(payload) => {
                error!(task = %task.label(), panic = %panic_message(payload.as_ref()), "download panicked");
                Outcome::Panicked
            }
        };
        // The download already counts as done; a failing sink only gets logged.
        if matches!(outcome, Outcome::Succeeded) {
            let recorded = panic::catch_unwind(AssertUnwindSafe(|| sink.completed(&task)));
            if let Err(payload) = recorded {
                error!(task = %task.label(), panic = %panic_message(payload.as_ref()), "completion handler panicked");
            }
        }

        let mut state = shared.lock();
        state.in_flight -= 1;
        match outcome {
            Outcome::Succeeded => state.stats.succeeded += 1,
            Outcome::Failed => state.stats.failed += 1,
            Outcome::Panicked => state.stats.panicked += 1,
        }
        if state.is_idle() {
            shared.idle.notify_all();
        }
    }
    debug!("download worker stopped");
}

fn next_task(shared: &Shared) -> Option<DownloadTask> {
    let mut state = shared.lock();
    loop {
        if let Some(task) = state.tasks.pop_front() {
            state.in_flight += 1;
            return Some(task);
        }
        if state.closed {
            return None;
        }
        state = shared
            .available
            .wait(state)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UrlTask;

    struct Always(bool);

    impl TaskRunner for Always {
        fn run(&self, _task: &DownloadTask) -> bool {
            self.0
        }
    }

    #[test]
    fn failures_are_counted_not_retried() {
        let orchestrator =
            Orchestrator::start(2, Arc::new(Always(false)), Arc::new(NoopCompletion)).unwrap();
        for index in 0..4 {
            assert!(orchestrator.enqueue(UrlTask::new(&format!("https://h/{index}")).into()));
        }
        orchestrator.wait_idle();
        assert_eq!(
            orchestrator.stats(),
            QueueStats {
                succeeded: 0,
                failed: 4,
                panicked: 0
            }
        );
        orchestrator.shutdown();
        assert!(!orchestrator.enqueue(UrlTask::new("https://h/late").into()));
    }

    #[test]
    fn panic_message_from_payload() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
