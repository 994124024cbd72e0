//! Background maintenance: periodic jobs and frozen-bucket coordination.
//!
//! A controller owns a set of job runners driven by a periodic timer.
//! Jobs run cooperatively: a run returns `Done` (wait for the next tick)
//! or `NeedsMoreWork` (reschedule immediately). Document-moving and
//! lid-space jobs must not touch a frozen bucket; the freeze registry is
//! reference-counted and notifies listeners on thaw so blocked jobs
//! resume without waiting a full tick.

pub mod controller;
pub mod frozen_buckets;
pub mod job;
pub mod jobs;

pub use controller::MaintenanceController;
pub use frozen_buckets::{BucketGuard, FrozenBuckets};
pub use job::{JobOutcome, MaintenanceJob, MaintenanceJobRunner};
