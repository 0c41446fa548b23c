// src/gps/data.rs
//! Location value type shared by the feed, the coordinator and the sink

use std::fmt;

/// A geographic coordinate with optional motion and quality extras.
///
/// Latitude and longitude are in degrees. Values outside the usual
/// `[-90, 90]` / `[-180, 180]` ranges are carried as-is.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LocationPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub accuracy_meters: Option<f32>,
    pub speed_mps: Option<f32>,
    pub bearing_deg: Option<f32>,
    /// Fix time, milliseconds since the Unix epoch
    pub timestamp_ms: Option<i64>,
}

impl LocationPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            ..Self::default()
        }
    }

    pub fn with_altitude(mut self, altitude: f64) -> Self {
        self.altitude = Some(altitude);
        self
    }

    pub fn with_accuracy(mut self, meters: f32) -> Self {
        self.accuracy_meters = Some(meters);
        self
    }

    pub fn with_speed(mut self, mps: f32) -> Self {
        self.speed_mps = Some(mps);
        self
    }

    pub fn with_bearing(mut self, degrees: f32) -> Self {
        self.bearing_deg = Some(degrees);
        self
    }

    pub fn with_timestamp_ms(mut self, millis: i64) -> Self {
        self.timestamp_ms = Some(millis);
        self
    }

    /// Latitude/longitude `t` of the way from `self` to `target`.
    /// `t` is expected in `[0, 1]`.
    pub fn interpolate(&self, target: &LocationPoint, t: f64) -> (f64, f64) {
        let lat = self.latitude + t * (target.latitude - self.latitude);
        let lon = self.longitude + t * (target.longitude - self.longitude);
        (lat, lon)
    }

    /// Whether both coordinates fall inside the WGS84 ranges
    pub fn is_in_range(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Accuracy rounded to whole metres, for display
    pub fn accuracy_label(&self) -> String {
        match self.accuracy_meters {
            Some(acc) => format!("{} m", acc.round() as i64),
            None => "? m".to_string(),
        }
    }

    /// Coordinate pair with degree signs, for display
    pub fn coordinate_label(&self) -> String {
        format!("{}°, {}°", self.latitude, self.longitude)
    }
}

impl fmt::Display for LocationPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.latitude, self.longitude)
    }
}
