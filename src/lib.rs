pub mod archive;
pub mod cache;
pub mod cli;
pub mod commands;
pub mod config;
pub mod docker;
pub mod error;
pub mod oci;
pub mod progress;
pub mod transfer;
pub mod types;
pub mod ui;
