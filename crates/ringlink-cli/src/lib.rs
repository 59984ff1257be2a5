//! RingLink CLI library
//!
//! Wires the connection engine to a radio backend, a terminal status surface and
//! a JSON device record, and implements the command-line subcommands on top.

pub mod app;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod surface;

pub use app::RingLinkApp;
pub use cli::{Cli, Commands};
pub use config::{AppConfig, RadioBackend};
pub use error::{CliError, Result};
pub use surface::TerminalSurface;
