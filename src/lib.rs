pub mod ai_provider;
pub mod cli;
pub mod config;
pub mod core;
pub mod generator;
pub mod memory;
pub mod persona;
pub mod rate_limit;
pub mod relationship;
pub mod request;
pub mod scene;
pub mod scheduler;
pub mod session;
