pub mod evaluator;
pub mod inflight;
pub mod scheduler;
