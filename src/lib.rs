//! Content-based scene similarity
//!
//! Scores scene pairs from shared performers, groups, tags and studio, and
//! keeps a table of similarity records in step with the scene catalogue.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;

pub use config::Config;
pub use error::{AppError, AppResult};
