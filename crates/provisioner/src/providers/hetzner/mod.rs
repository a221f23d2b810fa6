//! Hetzner Cloud provider.
//!
//! Implements the [`CloudProvider`](crate::providers::CloudProvider) trait for
//! the Hetzner Cloud API.
//! API Documentation: <https://docs.hetzner.cloud/>
//!
//! ## Overview
//!
//! Most mutating calls start an asynchronous *action*. The client polls each
//! action until it succeeds or fails, so a returned resource is usable.
//! Every create call looks the resource up by name first, which makes
//! re-running a provisioning pass safe.

mod client;
mod models;

pub use client::HetznerCloud;
