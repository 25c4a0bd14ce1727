pub mod config;
pub mod error;
pub mod location;
pub mod record;
pub mod storage;
