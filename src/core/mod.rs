pub mod config;
pub mod connection;
pub mod error;
pub mod fanout;
pub mod protocol;
pub mod registry;
pub mod signaling;
pub mod store;
pub mod transfer;
