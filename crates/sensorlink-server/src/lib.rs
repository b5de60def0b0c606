//! # sensorlink-server
//!
//! HTTP server library for sensorlink.
//!
//! This library provides the API handlers and state management for managing
//! BLE health sensor sessions over REST.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod state;
