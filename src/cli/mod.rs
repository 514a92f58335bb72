//! Command line interface for the MALTOPUFT loader

pub mod commands;
pub mod error;

pub use error::CliError;
