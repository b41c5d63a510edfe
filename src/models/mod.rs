//! Core data models for the photo store.
//!
//! These entities map cleanly to database tables via `sqlx::FromRow` and
//! serialize naturally as JSON via `serde`.

pub mod job;
pub mod object;
pub mod photo;
