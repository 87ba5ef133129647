//! A bidirectional cloud-files sync provider for the Windows Cloud Filter
//! API: projects a server directory into a client directory as on-demand
//! placeholders, debounces and merges local edits back to the server, mirrors
//! remote changes as placeholder operations, and keeps the two directions
//! from echoing into each other.
//!
//! On non-Windows targets the crate still builds and runs as a plain mirror;
//! every cloud-filter call is confined behind platform gates.

pub mod activity;
pub mod config;
pub mod engine;
pub mod error;
pub mod hydration;
pub mod path;
pub mod placeholder;
pub mod remote;
pub mod root;
pub mod shell;
pub mod temp;
pub mod watch;
