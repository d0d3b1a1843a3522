//! Core domain + engines for the file-store bot.
//!
//! This crate is framework-agnostic. Telegram and SQLite live behind ports
//! (traits) implemented in adapter crates.

pub mod config;
pub mod deletion;
pub mod delivery;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod links;
pub mod locks;
pub mod logging;
pub mod memory;
pub mod messaging;
pub mod premium;
pub mod quota;
pub mod security;
pub mod services;
pub mod store;
pub mod verification;

pub use errors::{Error, Result};
