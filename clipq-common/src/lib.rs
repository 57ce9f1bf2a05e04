//! # clipq Common Library
//!
//! Shared code for the clipq services including:
//! - Session and job data model
//! - Versioned job codec for store entries
//! - Job wire schema (queue message) parsing and rendering
//! - Bootstrap configuration loading
//! - Database initialization
//! - Utility functions

pub mod codec;
pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod models;
pub mod time;
pub mod wire;

pub use error::{Error, Result};
pub use models::{Job, SequenceNumber, Session, SessionStatus};
