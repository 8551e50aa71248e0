pub mod app;
pub mod auth;
pub mod channel;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod library;
pub mod media;
pub mod orchestrator;
pub mod output;
pub mod progress;
pub mod registry;
pub mod settings;
pub mod sites;
pub mod store;
pub mod throttle;
