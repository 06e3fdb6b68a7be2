//! Cron scheduling: expression parsing and the background job engine.

mod cron;
mod engine;

pub use cron::{CronExpr, CronField, CronParseError};
pub use engine::{JobCallback, JobScheduler};
