pub mod api;
pub mod config;
pub mod monitor;
pub mod rename;
pub mod rewrite;
