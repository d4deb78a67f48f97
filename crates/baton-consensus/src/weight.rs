//! Vote weighting

use baton_core::Worker;

/// Maps a voting worker to the weight of its vote
pub trait WeightFunction: Send + Sync {
    fn weight(&self, worker: &Worker) -> f64;
}

/// Default weighting: one unit per expertise tag, never less than 1
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpertiseWeight;

impl WeightFunction for ExpertiseWeight {
    fn weight(&self, worker: &Worker) -> f64 {
        worker.expertise.len().max(1) as f64
    }
}

/// Every vote counts the same
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformWeight;

impl WeightFunction for UniformWeight {
    fn weight(&self, _worker: &Worker) -> f64 {
        1.0
    }
}

impl<F> WeightFunction for F
where
    F: Fn(&Worker) -> f64 + Send + Sync,
{
    fn weight(&self, worker: &Worker) -> f64 {
        self(worker)
    }
}
