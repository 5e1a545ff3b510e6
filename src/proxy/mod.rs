// proxy module - token-injecting forwarding gateway

pub mod cache;
pub mod common;
pub mod config;
pub mod handlers; // API endpoint handlers
pub mod middleware; // Axum middleware
pub mod server;
pub mod token_manager;
pub mod upstream; // Authenticated upstream clients

pub use config::ProxyConfig;
pub use server::AxumServer;
pub use token_manager::TokenManager;
