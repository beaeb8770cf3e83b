pub mod client;
pub mod groups;

pub use client::{BranchFilter, GerritClient, QueryError, QueryFilter};
pub use groups::CoreTeams;
