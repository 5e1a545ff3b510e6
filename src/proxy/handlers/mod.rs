// Handlers module - API endpoint handlers

pub mod auth;
pub mod proxy;
