//! Huddle realtime relay library.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod config;
pub mod db;
pub mod gateway;
pub mod routes;
pub mod state;
pub mod ws;
