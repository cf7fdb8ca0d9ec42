// Submodules for separation of concerns
mod builder;
mod group;
mod params;
mod types;

pub use builder::Query;
pub use group::GroupedQueryItems;
pub use params::Params;
pub(crate) use types::MAX_SORT_FIELDS;
pub use types::{AggrItem, AggrOp, CommandKind, CommandName, CommandSpec, QueryItem};
