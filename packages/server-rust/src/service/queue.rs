//! Pending job queue with de-duplication by `(function, language, id)`.

use std::collections::VecDeque;

use jobrelay_core::{Job, JobKey, WorkerLanguage};

/// Where an enqueued job ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended at the back.
    Appended,
    /// `INIT` job inserted at the front.
    Prioritized,
    /// An equal-keyed job was pending; its payload was replaced in place.
    Replaced,
}

/// FIFO of jobs not yet sent to a worker.
///
/// At most one job per `(function, language, id)` is pending. Re-enqueuing
/// an equal-keyed job overwrites the pending payload without moving it, so
/// rapid repeated requests for the same target cannot grow the queue.
/// `INIT` jobs jump to the front so a worker learns its modules before any
/// real job reaches it.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: VecDeque<Job>,
}

impl JobQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, job: Job) -> EnqueueOutcome {
        if let Some(pending) = self.jobs.iter_mut().find(|pending| pending.same_key(&job)) {
            pending.data = job.data;
            return EnqueueOutcome::Replaced;
        }
        if job.is_init() {
            self.jobs.push_front(job);
            EnqueueOutcome::Prioritized
        } else {
            self.jobs.push_back(job);
            EnqueueOutcome::Appended
        }
    }

    pub fn pop_front(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    /// Drops every pending job for `(function, language)` regardless of id.
    /// Returns the number of jobs removed.
    pub fn remove_all_for(&mut self, function: &str, language: &WorkerLanguage) -> usize {
        let before = self.jobs.len();
        self.jobs
            .retain(|job| !(job.function == function && &job.language == language));
        before - self.jobs.len()
    }

    /// Position of the pending job with `key`, if any.
    #[must_use]
    pub fn position(&self, key: &JobKey) -> Option<usize> {
        self.jobs.iter().position(|job| {
            job.function == key.function && job.language == key.language && job.id == key.id
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    /// Removes and returns all pending jobs.
    pub fn drain(&mut self) -> Vec<Job> {
        self.jobs.drain(..).collect()
    }
}
