pub mod cli;
pub mod config;
pub mod error;
pub mod parser;
pub mod process;
pub mod removal;
pub mod setup;
pub mod signal;
pub mod supervisor;
