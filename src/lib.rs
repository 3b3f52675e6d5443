pub mod chain;
pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod github;
pub mod llm;
pub mod processor;
pub mod registry;
pub mod stats;
pub mod templates;
pub mod worker;

#[cfg(test)]
pub mod testing;
