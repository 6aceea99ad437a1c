pub mod connection;
pub mod fixtures;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with_settings, DbPool};
pub use fixtures::{DemoWorkflows, SeedResult, SeedVerification, WorkflowSeedInfo};
pub use repositories::{
    RepositoryError, SqlDelegationStore, SqlHistoryStore, SqlPolicyStore, SqlRequestStore,
};
