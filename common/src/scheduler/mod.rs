// Scheduler module: triggers, the engine that fires them, and job chaining

pub mod chain;
pub mod engine;
pub mod repository;
pub mod runner;
pub mod trigger;

pub use chain::{ChainCoordinator, ChainTrigger, JobLauncher};
pub use engine::{JobDefinition, Scheduler, SchedulerConfig, SchedulerEngine};
pub use repository::{ScheduleRepository, SchedulerHandle};
pub use runner::{CommandRunner, JobContext, JobRunner};
pub use trigger::{far_future, CronTrigger, Trigger};
