pub mod agent;
pub mod backoff;
pub mod commit_queue;
pub mod config;
pub mod context;
pub mod errors;
pub mod executor;
pub mod init;
pub mod logging;
pub mod merge;
pub mod orchestrator;
pub mod store;
pub mod workspace;

#[cfg(test)]
pub mod testing;
