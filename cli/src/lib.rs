pub mod api;
pub mod config;
pub mod console;
pub mod errors;
pub mod monitor;
pub mod output;
pub mod qmp;
pub mod quorum;
pub mod relay;
pub mod socket;
pub mod tunnel;
pub mod vm;
