//! Tailscale device registry.
//!
//! Implements the [`DeviceRegistry`](crate::registry::DeviceRegistry) trait
//! for the Tailscale API.
//! API Documentation: <https://tailscale.com/api>

mod client;
mod models;

pub use client::Tailscale;
