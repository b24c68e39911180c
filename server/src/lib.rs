//! pushpop relay server library.
//! This crate exposes internal modules for integration testing and for
//! embedding the relay in another program.
//! The binary entry point is in main.rs.

pub mod config;
pub mod error;
pub mod hub;
pub mod routes;
pub mod serve;
pub mod state;
pub mod trigger;
pub mod ws;
