pub mod cache;
pub mod introspect;

pub use cache::TtlCache;
pub use introspect::{analyze_dockerfile_content, BranchesAndTags, RepoIntrospector, ServiceInfo};
