pub mod checkpoint;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod fs_util;
pub mod orchestrator;
pub mod output;
pub mod results;
pub mod runner;
pub mod store;
pub mod unit;
