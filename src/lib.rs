// src/lib.rs
//! Fake GPS Library
//!
//! Keeps the authoritative "current location" for a location-spoofing host,
//! moves it by jump, smoothed fly-to or directional nudges, and can relay live
//! fixes from a gpsd daemon into a platform location sink.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod feed;
pub mod gps;
pub mod sink;

// Re-export main types for convenience
pub use config::{AppSettings, ConnectionConfig};
pub use coordinator::{FlyPlan, LocationCoordinator};
pub use error::{GpsError, Result};
pub use feed::FeedWorker;
pub use gps::data::LocationPoint;
pub use sink::{LocationSink, ServiceNotifier};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
