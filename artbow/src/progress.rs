//! Progress reporting sinks.
//!
//! Long running steps report through a [Progress] sink chosen by the caller,
//! so the algorithms never decide how (or whether) progress is shown.

use tracing::info;

pub trait Progress {
    /// Reports that `done` units out of `total` (if known) are finished for `stage`.
    fn step(&mut self, stage: &str, done: usize, total: Option<usize>);
}

/// Silent sink.
impl Progress for () {
    fn step(&mut self, _stage: &str, _done: usize, _total: Option<usize>) {}
}

impl<P: Progress + ?Sized> Progress for &mut P {
    fn step(&mut self, stage: &str, done: usize, total: Option<usize>) {
        (**self).step(stage, done, total);
    }
}

impl<P: Progress + ?Sized> Progress for Box<P> {
    fn step(&mut self, stage: &str, done: usize, total: Option<usize>) {
        (**self).step(stage, done, total);
    }
}

/// Emits an `info` event every `every` steps and on the last one.
#[derive(Debug, Clone)]
pub struct TracingProgress {
    every: usize,
}

impl TracingProgress {
    pub fn new(every: usize) -> Self {
        Self { every: every.max(1) }
    }

    fn should_report(&self, done: usize, total: Option<usize>) -> bool {
        done % self.every == 0 || total == Some(done)
    }
}

impl Default for TracingProgress {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Progress for TracingProgress {
    fn step(&mut self, stage: &str, done: usize, total: Option<usize>) {
        if !self.should_report(done, total) {
            return;
        }
        match total {
            Some(total) => info!(stage, done, total, "progress"),
            None => info!(stage, done, "progress"),
        }
    }
}

/// Records every step, for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingProgress {
    pub(crate) steps: Vec<(String, usize, Option<usize>)>,
}

#[cfg(test)]
impl Progress for RecordingProgress {
    fn step(&mut self, stage: &str, done: usize, total: Option<usize>) {
        self.steps.push((stage.to_owned(), done, total));
    }
}
