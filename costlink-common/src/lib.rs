//! # costlink Common Library
//!
//! Shared code for the costlink sync client and its consumers:
//! - Error taxonomy
//! - Configuration loading
//! - Wire protocol frames and payload types
//! - Connection status events
//! - Classification code normalization
//! - Timestamp helpers

pub mod code;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod time;

pub use code::normalize;
pub use error::{Error, Result};
