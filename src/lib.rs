//! Request-defense gateway for the property marketplace API.
//!
//! Sits in front of the marketplace backend and screens every request
//! against an IP blocklist, a signature-based threat detector and
//! sliding-window rate limits before forwarding it upstream.

pub mod api;
pub mod config;
pub mod core;
pub mod error;
pub mod middleware;
pub mod models;
pub mod proxy;
pub mod utils;
