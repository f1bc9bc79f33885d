pub mod config;
pub mod domain;
pub mod error;
pub mod locator;
pub mod metadata;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod registry;
pub mod report;
pub mod retention;
pub mod retrieval;
pub mod router;
pub mod session;
pub mod store;
pub mod viewer;
pub mod wado;
