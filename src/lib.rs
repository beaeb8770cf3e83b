pub mod cache;
pub mod config;
pub mod gerrit;
pub mod ledger;
pub mod models;
pub mod sync;
pub mod timeline;

pub use cache::{merge_page, merge_record, ChangeCache, ChangeMap, MergeOutcome};
pub use config::{load_all_projects, load_project, Config, Project};
pub use gerrit::{BranchFilter, CoreTeams, GerritClient, QueryError, QueryFilter};
pub use ledger::{population_stats, ChangePopulationStats, ReviewerLedger, ReviewerStats};
pub use models::*;
pub use sync::Synchronizer;
pub use timeline::{approved_then_rebased, classify, should_report, ClassifiedChange, WaitingOn};
