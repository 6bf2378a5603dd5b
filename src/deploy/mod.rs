pub mod executor;
pub mod host;
pub mod model;
pub mod parser;
pub mod store;

pub use executor::{CommandOutcome, Executor, ShellTransport, Transport};
pub use host::{HostRecord, HostRegistry};
pub use model::{
    aggregate_status, AppMeta, DeployConfig, DeployPlan, DeployStatus, DeployTargetSpec, HostType, Message, Step,
    TargetResult, TargetState, TargetStatus,
};
pub use store::{DeployTaskRecord, DeployTaskStore};
