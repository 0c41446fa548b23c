// src/sink.rs
//! Host-platform collaborators: where locations go and who hears about it

use crate::{error::Result, gps::data::LocationPoint};
use std::time::Duration;
use tracing::info;

/// Makes a location the system-visible GPS fix.
///
/// How the platform is persuaded to accept it is the implementor's business.
pub trait LocationSink: Send + Sync {
    /// `elapsed_realtime` is a monotonic stamp taken when the record was produced
    fn report_location(&self, location: &LocationPoint, elapsed_realtime: Duration) -> Result<()>;
}

/// Fire-and-forget notifications for the host UI
pub trait ServiceNotifier: Send + Sync {
    fn service_started(&self);

    fn service_stopped(&self);

    /// Latest accepted fix, preformatted for display
    fn fix_received(&self, _accuracy: &str, _coordinates: &str) {}
}

/// Sink for headless runs: logs each record instead of injecting it
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl LocationSink for LogSink {
    fn report_location(&self, location: &LocationPoint, elapsed_realtime: Duration) -> Result<()> {
        info!(
            lat = location.latitude,
            lon = location.longitude,
            alt = ?location.altitude,
            accuracy = ?location.accuracy_meters,
            speed = ?location.speed_mps,
            bearing = ?location.bearing_deg,
            time_ms = ?location.timestamp_ms,
            elapsed_ms = elapsed_realtime.as_millis() as u64,
            "Reporting location"
        );
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl ServiceNotifier for LogNotifier {
    fn service_started(&self) {
        info!("Location service active");
    }

    fn service_stopped(&self) {
        info!("Location service stopped");
    }

    fn fix_received(&self, accuracy: &str, coordinates: &str) {
        info!("Fix {} ({})", coordinates, accuracy);
    }
}


#[cfg(test)]
mod tests {
    use super::mocks::*;
    use super::*;

    #[test]
    fn test_log_sink_accepts_everything() {
        let point = LocationPoint::new(91.0, 200.0);
        assert!(LogSink.report_location(&point, Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_recording_sink_failure_switch() {
        let sink = RecordingSink::new();
        let point = LocationPoint::new(1.0, 2.0);

        sink.report_location(&point, Duration::ZERO).unwrap();
        sink.set_fail(true);
        assert!(sink.report_location(&point, Duration::ZERO).is_err());
        assert_eq!(sink.reports(), vec![point]);
    }
}
