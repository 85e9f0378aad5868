/// Lock-free progress counters polled by the job layer
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct JobStatus {
    steps_total: AtomicUsize,
    steps_completed: AtomicUsize,
}

impl JobStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, steps_total: usize) {
        self.steps_completed.store(0, Ordering::SeqCst);
        self.steps_total.store(steps_total, Ordering::SeqCst);
    }

    pub fn step_completed(&self) {
        self.steps_completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn steps_total(&self) -> usize {
        self.steps_total.load(Ordering::SeqCst)
    }

    pub fn steps_completed(&self) -> usize {
        self.steps_completed.load(Ordering::SeqCst)
    }

    /// Completion in percent; an empty pipeline counts as done
    pub fn percent(&self) -> u8 {
        let total = self.steps_total();
        if total == 0 {
            return 100;
        }
        let done = self.steps_completed().min(total);
        (done * 100 / total) as u8
    }
}
