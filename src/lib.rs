//! calbridge - Google Calendar sync engine
//!
//! Keeps a local cache of a user's calendars and events in step with the
//! provider, and links todos with deadlines to events in a managed calendar.

pub mod api;
pub mod calendars;
pub mod config;
pub mod crypto;
pub mod db;
pub mod dedupe;
pub mod editor;
pub mod engine;
pub mod error;
pub mod models;
pub mod oauth;
pub mod provider;
pub mod recurrence;
pub mod scheduler;
pub mod sync;
pub mod time;
pub mod title;
pub mod todo_link;
pub mod tokens;
pub mod webhook;

pub use config::Config;
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
