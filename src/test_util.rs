//! This module contains utilities that are useful for testing code based on collective
//!  communication. They are used for testing this crate itself, but they are also exported
//!  for application testing.

pub mod cluster;
pub mod transaction;
