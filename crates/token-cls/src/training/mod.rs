//! Training pipeline: masked loss, correctness and macro metrics, LR
//! schedules, optimizer selection, gradient clipping, the task loop and
//! checkpointing.

pub mod checkpoint;
pub mod clip;
pub mod loss;
pub mod metrics;
pub mod optim;
pub mod schedule;
pub mod task;
