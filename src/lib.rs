pub mod activation;
pub mod ai_client;
pub mod config;
pub mod database;
pub mod events;
pub mod fleet;
pub mod runtime;
pub mod scheduler;
pub mod server;
