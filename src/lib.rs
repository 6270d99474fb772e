//! Fixture Mock Server
//!
//! A development HTTP server that answers API requests from JSON fixture
//! files, optionally trying a real backend first.
//!
//! # Features
//!
//! - **Filename routing**: `get-users-_id.json` answers `GET /users/42`
//! - **Specificity**: literal segments beat wildcards, longer literal prefixes win
//! - **Fixture sets**: a `dist` header selects a subdirectory to prefer
//! - **Backend fallback**: forward to a live backend, use fixtures on 404
//! - **Latency Simulation**: `?_delay=<ms>`
//! - **Failure Injection**: `?_error` or `?_error=<status>`, body from `<status>.json`
//! - **Force mock**: `?_mock=true` skips the backend
//!
//! # Example Configuration
//!
//! ```yaml
//! fixtures:
//!   root: ./mocks
//! backend:
//!   url: http://localhost:3002
//! defaults:
//!   delay_ms: 0
//! ```

pub mod backend;
pub mod config;
pub mod keys;
pub mod options;
pub mod pipeline;
pub mod server;
pub mod store;

pub use config::ServerConfig;
pub use pipeline::Simulator;
