#![doc = include_str!("../README.md")]

pub mod server;

pub use server::config::ServerConfig;
pub use server::service::handler::SearchService;
pub use server::session::SessionConfig;
