// Common helpers shared by the token manager and the upstream clients

pub mod auth_payload;
pub mod claims;

pub use auth_payload::AuthPayload;
