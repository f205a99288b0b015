pub mod memory;
pub mod redis;
pub mod store;
pub mod types;
