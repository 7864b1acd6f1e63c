pub mod app;
pub mod config;
pub mod counter;
pub mod error;
pub mod identity;
pub mod retry;
pub mod store;
pub mod table;
