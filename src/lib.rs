pub mod auth;
pub mod config;
pub mod daemon;
pub mod dashboard;
pub mod error;
pub mod node;
pub mod protocol;
pub mod scheduler;
pub mod shutdown;
pub mod timer;
