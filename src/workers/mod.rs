pub mod api;
pub mod args;
pub mod receiver;
pub mod signal_client;
pub mod station;
