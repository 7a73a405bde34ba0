//! Library crate for the round engine, exposing the session core, the relay
//! and the runtime for binaries and integration tests.

pub mod config;
pub mod dto;
pub mod error;
pub mod routes;
pub mod services;
pub mod state;
