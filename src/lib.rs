pub mod config;
pub mod events;
pub mod messaging;
pub mod metrics;
pub mod models;
pub mod relay;
pub mod scheduler;
pub mod store;
pub mod utils;
pub mod writer;
