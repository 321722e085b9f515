pub mod blob;
pub mod error;
pub mod hash;
pub mod redis;
pub mod types;
