// src/gps/gpsd.rs
//! gpsd JSON protocol: typed objects, control commands and line parsing

use super::data::LocationPoint;
use crate::error::{GpsError, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

/// NMEA fix mode as reported in TPV `mode`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "u8")]
pub enum FixMode {
    /// Mode not yet seen
    #[default]
    NotSeen,
    NoFix,
    TwoD,
    ThreeD,
}

impl From<u8> for FixMode {
    fn from(mode: u8) -> Self {
        match mode {
            1 => FixMode::NoFix,
            2 => FixMode::TwoD,
            3 => FixMode::ThreeD,
            _ => FixMode::NotSeen,
        }
    }
}

impl FixMode {
    /// 2D and 3D fixes carry a usable position
    pub fn has_fix(self) -> bool {
        matches!(self, FixMode::TwoD | FixMode::ThreeD)
    }

    pub fn description(self) -> &'static str {
        match self {
            FixMode::NotSeen => "No signal",
            FixMode::NoFix => "No fix",
            FixMode::TwoD => "2D fix",
            FixMode::ThreeD => "3D fix",
        }
    }
}

/// TPV (Time Position Velocity) report
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TpvReport {
    pub device: Option<String>,
    #[serde(default)]
    pub mode: FixMode,
    pub time: Option<DateTime<Utc>>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    #[serde(rename = "altHAE")]
    pub alt_hae: Option<f64>,
    #[serde(rename = "altMSL")]
    pub alt_msl: Option<f64>,
    /// Longitude error estimate, metres
    pub epx: Option<f64>,
    /// Latitude error estimate, metres
    pub epy: Option<f64>,
    /// Ground speed, m/s
    pub speed: Option<f64>,
    /// Course over ground, degrees from true north
    pub track: Option<f64>,
}

impl TpvReport {
    pub fn altitude(&self) -> Option<f64> {
        self.alt.or(self.alt_hae).or(self.alt_msl)
    }

    /// Horizontal accuracy: mean of the latitude and longitude error estimates
    pub fn accuracy(&self) -> Option<f64> {
        match (self.epy, self.epx) {
            (Some(lat_err), Some(lon_err)) => Some((lat_err + lon_err) / 2.0),
            (Some(err), None) | (None, Some(err)) => Some(err),
            (None, None) => None,
        }
    }

    /// Convert to a location, or `None` when the report carries no usable position
    pub fn to_location_point(&self) -> Option<LocationPoint> {
        if !self.mode.has_fix() {
            return None;
        }
        let (lat, lon) = (self.lat?, self.lon?);

        Some(LocationPoint {
            latitude: lat,
            longitude: lon,
            altitude: self.altitude(),
            accuracy_meters: self.accuracy().map(|a| a as f32),
            speed_mps: self.speed.map(|s| s as f32),
            bearing_deg: self.track.map(|t| t as f32),
            timestamp_ms: self.time.map(|t| t.timestamp_millis()),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SatelliteReport {
    #[serde(rename = "PRN")]
    pub prn: u16,
    /// Elevation, degrees
    pub el: Option<f64>,
    /// Azimuth, degrees
    pub az: Option<f64>,
    /// Signal strength, dB-Hz
    pub ss: Option<f64>,
    #[serde(default)]
    pub used: bool,
}

/// SKY (satellite view) report
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SkyReport {
    pub device: Option<String>,
    pub time: Option<DateTime<Utc>>,
    pub hdop: Option<f64>,
    #[serde(default)]
    pub satellites: Vec<SatelliteReport>,
}

impl SkyReport {
    pub fn satellites_used(&self) -> usize {
        self.satellites.iter().filter(|sat| sat.used).count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeviceInfo {
    pub path: Option<String>,
    pub driver: Option<String>,
    pub subtype: Option<String>,
    pub bps: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeviceList {
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct VersionInfo {
    pub release: String,
    pub rev: Option<String>,
    #[serde(default)]
    pub proto_major: u32,
    #[serde(default)]
    pub proto_minor: u32,
}

/// WATCH acknowledgement, echoing the active watch policy
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WatchInfo {
    pub enable: Option<bool>,
    pub json: Option<bool>,
    pub nmea: Option<bool>,
}

/// POLL response: the most recent report from every active device
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PollReport {
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub active: u32,
    #[serde(default)]
    pub tpv: Vec<TpvReport>,
    #[serde(default)]
    pub sky: Vec<SkyReport>,
}

/// Streamed objects relevant to the location feed
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    PositionFix(TpvReport),
    SkyView(SkyReport),
    Device(DeviceInfo),
    DeviceList(DeviceList),
    Subframe(Value),
    Attitude(Value),
}

/// Any decoded gpsd object, split into stream events and command responses
#[derive(Debug, Clone, PartialEq)]
pub enum GpsdObject {
    Event(FeedEvent),
    Version(VersionInfo),
    Watch(WatchInfo),
    Poll(PollReport),
    Error(String),
    /// A well-formed object of a class this client does not handle
    Other(String),
}

impl GpsdObject {
    /// The `class` tag of a command response, used to match acknowledgements
    pub fn response_class(&self) -> Option<&'static str> {
        match self {
            GpsdObject::Version(_) => Some("VERSION"),
            GpsdObject::Watch(_) => Some("WATCH"),
            GpsdObject::Poll(_) => Some("POLL"),
            _ => None,
        }
    }
}

/// Control commands understood by gpsd
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Version,
    Watch { enable_json: bool, enable_nmea: bool },
    Poll,
}

impl Command {
    /// Wire form, newline terminated
    pub fn to_line(self) -> String {
        match self {
            Command::Version => "?VERSION;\n".to_string(),
            Command::Watch {
                enable_json,
                enable_nmea,
            } => format!(
                "?WATCH={{\"enable\":true,\"json\":{},\"nmea\":{}}};\n",
                enable_json, enable_nmea
            ),
            Command::Poll => "?POLL;\n".to_string(),
        }
    }

    /// Class of the object that acknowledges this command
    pub fn response_class(self) -> &'static str {
        match self {
            Command::Version => "VERSION",
            Command::Watch { .. } => "WATCH",
            Command::Poll => "POLL",
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(class: &str, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| GpsError::Protocol(format!("Malformed {} object: {}", class, e)))
}

/// Parse a single line of gpsd JSON output
pub fn parse_gpsd_json(line: &str) -> Result<GpsdObject> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| GpsError::Protocol(format!("Failed to parse gpsd JSON: {}", e)))?;

    let class = value
        .get("class")
        .and_then(Value::as_str)
        .ok_or_else(|| GpsError::Protocol("Object has no class field".to_string()))?
        .to_string();

    let object = match class.as_str() {
        "TPV" => GpsdObject::Event(FeedEvent::PositionFix(decode(&class, value)?)),
        "SKY" => GpsdObject::Event(FeedEvent::SkyView(decode(&class, value)?)),
        "DEVICE" => GpsdObject::Event(FeedEvent::Device(decode(&class, value)?)),
        "DEVICES" => GpsdObject::Event(FeedEvent::DeviceList(decode(&class, value)?)),
        "SUBFRAME" => GpsdObject::Event(FeedEvent::Subframe(value)),
        "ATT" => GpsdObject::Event(FeedEvent::Attitude(value)),
        "VERSION" => GpsdObject::Version(decode(&class, value)?),
        "WATCH" => GpsdObject::Watch(decode(&class, value)?),
        "POLL" => GpsdObject::Poll(decode(&class, value)?),
        "ERROR" => GpsdObject::Error(
            value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unspecified error")
                .to_string(),
        ),
        _ => GpsdObject::Other(class),
    };

    Ok(object)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TPV_3D: &str = r#"{"class":"TPV","device":"/dev/ttyUSB0","mode":3,"time":"2023-01-01T12:00:00.000Z","ept":0.005,"lat":48.117,"lon":11.517,"alt":545.4,"epx":15.319,"epy":17.054,"epv":124.484,"track":10.3797,"speed":0.091,"climb":10.7,"eps":34.11,"epc":248.97}"#;

    fn tpv(line: &str) -> TpvReport {
        match parse_gpsd_json(line).unwrap() {
            GpsdObject::Event(FeedEvent::PositionFix(tpv)) => tpv,
            other => panic!("expected TPV, got {:?}", other),
        }
    }

    #[test]
    fn test_tpv_parsing() {
        let report = tpv(TPV_3D);

        assert_eq!(report.mode, FixMode::ThreeD);
        assert_eq!(report.lat, Some(48.117));
        assert_eq!(report.lon, Some(11.517));
        assert_eq!(report.altitude(), Some(545.4));
        assert_eq!(report.speed, Some(0.091));
        assert_eq!(report.track, Some(10.3797));
        assert!((report.accuracy().unwrap() - 16.1865).abs() < 1e-9);
    }

    #[test]
    fn test_tpv_to_location_point() {
        let point = tpv(TPV_3D).to_location_point().unwrap();

        assert_eq!(point.latitude, 48.117);
        assert_eq!(point.longitude, 11.517);
        assert_eq!(point.altitude, Some(545.4));
        assert!((point.accuracy_meters.unwrap() - 16.1865).abs() < 1e-4);
        assert!((point.speed_mps.unwrap() - 0.091).abs() < 1e-6);
        assert!((point.bearing_deg.unwrap() - 10.3797).abs() < 1e-4);
        assert_eq!(point.timestamp_ms, Some(1_672_574_400_000));
    }

    #[test]
    fn test_tpv_without_fix_is_rejected() {
        let no_fix = tpv(r#"{"class":"TPV","mode":1,"lat":37.0,"lon":-122.0}"#);
        assert_eq!(no_fix.mode, FixMode::NoFix);
        assert!(no_fix.to_location_point().is_none());

        let not_seen = tpv(r#"{"class":"TPV","lat":37.0,"lon":-122.0}"#);
        assert_eq!(not_seen.mode, FixMode::NotSeen);
        assert!(not_seen.to_location_point().is_none());

        let missing_lon = tpv(r#"{"class":"TPV","mode":2,"lat":37.0}"#);
        assert!(missing_lon.to_location_point().is_none());
    }

    #[test]
    fn test_tpv_altitude_fallbacks() {
        let newer = tpv(r#"{"class":"TPV","mode":3,"lat":1.0,"lon":2.0,"altHAE":120.5,"altMSL":80.0}"#);
        assert_eq!(newer.altitude(), Some(120.5));

        let msl_only = tpv(r#"{"class":"TPV","mode":3,"lat":1.0,"lon":2.0,"altMSL":80.0}"#);
        assert_eq!(msl_only.altitude(), Some(80.0));
    }

    #[test]
    fn test_accuracy_with_single_estimate() {
        let report = tpv(r#"{"class":"TPV","mode":2,"lat":1.0,"lon":2.0,"epx":4.0}"#);
        assert_eq!(report.accuracy(), Some(4.0));
        assert_eq!(tpv(r#"{"class":"TPV","mode":2}"#).accuracy(), None);
    }

    #[test]
    fn test_sky_parsing() {
        let json = r#"{"class":"SKY","device":"/dev/ttyUSB0","time":"2023-01-01T12:00:00.000Z","hdop":1.2,"satellites":[{"PRN":1,"ss":42,"used":true},{"PRN":2,"ss":38,"used":false}]}"#;

        match parse_gpsd_json(json).unwrap() {
            GpsdObject::Event(FeedEvent::SkyView(sky)) => {
                assert_eq!(sky.satellites.len(), 2);
                assert_eq!(sky.satellites_used(), 1);
                assert_eq!(sky.hdop, Some(1.2));
                assert_eq!(sky.satellites[0].ss, Some(42.0));
            }
            other => panic!("expected SKY, got {:?}", other),
        }
    }

    #[test]
    fn test_devices_parsing() {
        let json = r#"{"class":"DEVICES","devices":[{"class":"DEVICE","path":"/dev/ttyACM0","driver":"u-blox","activated":"2023-01-01T12:00:00.000Z","bps":9600}]}"#;

        match parse_gpsd_json(json).unwrap() {
            GpsdObject::Event(FeedEvent::DeviceList(list)) => {
                assert_eq!(list.devices.len(), 1);
                assert_eq!(list.devices[0].path.as_deref(), Some("/dev/ttyACM0"));
                assert_eq!(list.devices[0].bps, Some(9600));
            }
            other => panic!("expected DEVICES, got {:?}", other),
        }
    }

    #[test]
    fn test_raw_events_are_kept() {
        let att = r#"{"class":"ATT","device":"/dev/imu","heading":14.2}"#;
        match parse_gpsd_json(att).unwrap() {
            GpsdObject::Event(FeedEvent::Attitude(value)) => assert_eq!(value["heading"], 14.2),
            other => panic!("expected ATT, got {:?}", other),
        }

        let subframe = r#"{"class":"SUBFRAME","tSV":5,"frame":1}"#;
        assert!(matches!(
            parse_gpsd_json(subframe).unwrap(),
            GpsdObject::Event(FeedEvent::Subframe(_))
        ));
    }

    #[test]
    fn test_command_responses() {
        let version = parse_gpsd_json(
            r#"{"class":"VERSION","release":"3.25","rev":"3.25","proto_major":3,"proto_minor":15}"#,
        )
        .unwrap();
        assert_eq!(version.response_class(), Some("VERSION"));
        match version {
            GpsdObject::Version(info) => {
                assert_eq!(info.release, "3.25");
                assert_eq!(info.proto_major, 3);
            }
            other => panic!("expected VERSION, got {:?}", other),
        }

        let watch = parse_gpsd_json(r#"{"class":"WATCH","enable":true,"json":true,"nmea":false}"#).unwrap();
        assert_eq!(
            watch,
            GpsdObject::Watch(WatchInfo {
                enable: Some(true),
                json: Some(true),
                nmea: Some(false),
            })
        );

        let poll = parse_gpsd_json(
            r#"{"class":"POLL","time":"2023-01-01T12:00:00.000Z","active":1,"tpv":[{"class":"TPV","mode":3,"lat":1.0,"lon":2.0}],"sky":[]}"#,
        )
        .unwrap();
        match poll {
            GpsdObject::Poll(report) => {
                assert_eq!(report.active, 1);
                assert_eq!(report.tpv.len(), 1);
                assert!(report.tpv[0].to_location_point().is_some());
            }
            other => panic!("expected POLL, got {:?}", other),
        }
    }

    #[test]
    fn test_error_and_unknown_classes() {
        assert_eq!(
            parse_gpsd_json(r#"{"class":"ERROR","message":"Unrecognized request 'FOO'"}"#).unwrap(),
            GpsdObject::Error("Unrecognized request 'FOO'".to_string())
        );
        assert_eq!(
            parse_gpsd_json(r#"{"class":"PPS","device":"/dev/pps0"}"#).unwrap(),
            GpsdObject::Other("PPS".to_string())
        );
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(parse_gpsd_json(r#"{"invalid": json"#), Err(GpsError::Protocol(_))));
        assert!(matches!(parse_gpsd_json(r#"{"lat":1.0}"#), Err(GpsError::Protocol(_))));
        assert!(matches!(
            parse_gpsd_json(r#"{"class":"TPV","lat":"north"}"#),
            Err(GpsError::Protocol(_))
        ));
    }

    #[test]
    fn test_command_lines() {
        assert_eq!(Command::Version.to_line(), "?VERSION;\n");
        assert_eq!(Command::Poll.to_line(), "?POLL;\n");
        assert_eq!(
            Command::Watch { enable_json: true, enable_nmea: false }.to_line(),
            "?WATCH={\"enable\":true,\"json\":true,\"nmea\":false};\n"
        );
        assert_eq!(Command::Watch { enable_json: true, enable_nmea: true }.response_class(), "WATCH");
    }
}
