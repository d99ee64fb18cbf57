//! World relay server library.
//!
//! This module exposes the server components for use in tests and binaries.

pub mod config;
pub mod objects;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod store;
pub mod voice;
pub mod ws;

pub use world_relay_shared::vec3;
