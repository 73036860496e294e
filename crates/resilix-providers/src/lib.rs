pub mod github;
pub mod jira;
pub mod mock;
pub mod patch;
pub mod router;
