pub mod config;
pub mod favorites;
pub mod platform;
pub mod protocol;
pub mod state;
