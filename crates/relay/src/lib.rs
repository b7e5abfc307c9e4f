pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod server;
pub mod store;
pub mod sync;
pub mod ws;
