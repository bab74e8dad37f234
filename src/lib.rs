//! Quotaguard - Tiered Admission Control
//!
//! This crate decides whether an incoming API request may proceed based on
//! who is calling and how many requests they have made recently. Every
//! subject is held to two fixed windows at once: an hourly quota and a
//! short burst window. Counts live in a shared Redis store so all instances
//! see the same totals, with a per-instance fallback counter keeping the
//! service available while the store is unreachable.

pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;
pub mod server;
