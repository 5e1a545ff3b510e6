// Export proxy commands
pub mod proxy;
