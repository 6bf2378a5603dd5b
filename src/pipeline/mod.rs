pub mod model;
pub mod store;

pub use model::{
    branch_matches_mapping, resolve_tag_for_branch, BranchStrategy, BranchTagRule, Pipeline,
    ProjectType, PushMode, ServicePushConfig,
};
pub use store::PipelineStore;
