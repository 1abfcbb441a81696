//! vidprompt: turn a screen recording plus an instruction into a prompt.
//!
//! The consensus work lives in the `consensus` crate. This crate is the
//! service shell around it:
//!
//! - `config`: layered application settings (defaults, TOML, environment)
//! - `gemini`: the Gemini implementation of `ContentBackend`
//! - `sanitize`: instruction text hygiene
//! - `server`: axum routes for analysis and the live activity feed

pub mod config;
pub mod gemini;
pub mod sanitize;
pub mod server;

pub use config::{AppConfig, Environment};
pub use gemini::GeminiBackend;
pub use server::{router, AppState};
