// src/gps/mod.rs
//! gpsd protocol handling and location data

pub mod client;
pub mod data;
pub mod gpsd;

pub use client::GpsdClient;
pub use data::LocationPoint;
pub use gpsd::{FeedEvent, FixMode};
