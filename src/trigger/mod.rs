pub mod cron;
pub mod router;
pub mod webhook;

pub use cron::CronSchedule;
pub use router::{resolve_services, spawn_cron_ticker, RunOutcome, TriggerRouter};
pub use webhook::{verify_signature, Platform, TriggerInfo, WebhookHeaders};
