pub mod config;

pub use config::{Config, RaftConfig, Server};
