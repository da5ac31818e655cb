//! Rig configuration: process settings from the environment, rig behaviour
//! from a JSON (or TOML) config file.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::gpio::PinMap;
use crate::mqtt::MqttBroker;
use crate::pump::DutyCycle;
use crate::ranging::DEFAULT_ECHO_TIMEOUT;
use crate::window::Schedule;

pub const DEFAULT_CONFIG_PATH: &str = "/selfhydro/config/configData.json";
pub const DEFAULT_CPU_TEMP_PATH: &str = "/sys/class/thermal/thermal_zone0/temp";

/// Upper bound for every minutes setting.
const MAX_MINUTES: u64 = 7 * 24 * 60;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub water_temp_sensor_id: String,
    pub led_on_time: String,
    pub led_off_time: String,
    pub air_pump_on_minutes: u64,
    pub air_pump_off_minutes: u64,
    pub sensor_period_minutes: u64,
    pub water_level_enabled: bool,
    pub low_water_distance_cm: f32,
    pub climate_sensor_enabled: bool,
    pub pins: PinMap,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            water_temp_sensor_id: String::new(),
            led_on_time: String::new(),
            led_off_time: String::new(),
            air_pump_on_minutes: 30,
            air_pump_off_minutes: 120,
            sensor_period_minutes: 180,
            water_level_enabled: false,
            low_water_distance_cm: 1.0,
            climate_sensor_enabled: true,
            pins: PinMap::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[u8] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Returns `Ok(())` or an error describing every violation found (not
    /// just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_timing(&mut errors);
        self.validate_pins(&mut errors);

        errors.extend(check_low_water(self.low_water_distance_cm));

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        for (name, minutes) in [
            ("airPumpOnMinutes", self.air_pump_on_minutes),
            ("airPumpOffMinutes", self.air_pump_off_minutes),
            ("sensorPeriodMinutes", self.sensor_period_minutes),
        ] {
            errors.extend(check_minutes(name, minutes));
        }
    }

    fn validate_pins(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<u8> = HashSet::new();
        for (name, bcm) in self.pins.entries() {
            if !VALID_GPIO_PINS.contains(&bcm) {
                errors.push(format!(
                    "pins.{name}: {bcm} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen.insert(bcm) {
                errors.push(format!("pins.{name}: gpio {bcm} is already used by another line"));
            }
        }
    }

    // -- Derived settings --------------------------------------------------

    /// The light schedule, or `None` when it is absent or unparseable. The
    /// light then stays off.
    pub fn schedule(&self) -> Option<Schedule> {
        if self.led_on_time.trim().is_empty() && self.led_off_time.trim().is_empty() {
            info!("no light schedule configured");
            return None;
        }
        match Schedule::parse(&self.led_on_time, &self.led_off_time) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("ignoring light schedule: {e:#}");
                None
            }
        }
    }

    pub fn duty_cycle(&self) -> DutyCycle {
        DutyCycle {
            on: minutes(self.air_pump_on_minutes),
            off: minutes(self.air_pump_off_minutes),
        }
    }

    pub fn sensor_period(&self) -> Duration {
        minutes(self.sensor_period_minutes)
    }
}

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m.saturating_mul(60))
}

fn check_minutes(name: &str, minutes: u64) -> Option<String> {
    if minutes == 0 {
        Some(format!("{name} must be positive, got 0"))
    } else if minutes > MAX_MINUTES {
        Some(format!("{name} must be at most {MAX_MINUTES} (one week), got {minutes}"))
    } else {
        None
    }
}

fn check_low_water(cm: f32) -> Option<String> {
    (!cm.is_finite() || cm < 0.0)
        .then(|| format!("lowWaterDistanceCm must be zero or positive, got {cm}"))
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a config file. `.toml` files are parsed as
/// TOML, everything else as JSON.
pub fn load(path: &Path) -> Result<Config> {
    let shown = path.display();
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {shown}"))?;
    let config: Config = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {shown}"))?
    } else {
        serde_json::from_str(&contents).with_context(|| format!("failed to parse config: {shown}"))?
    };
    config
        .validate()
        .with_context(|| format!("invalid config: {shown}"))?;
    Ok(config)
}

/// Lenient counterpart of [`load`]. Each field is read on its own: a field
/// that is malformed or out of range is logged and keeps its default while
/// the rest of the file still applies. An unreadable file gives defaults.
pub fn load_or_default(path: &Path) -> Config {
    let shown = path.display();
    let document = match read_document(path) {
        Ok(document) => document,
        Err(e) => {
            warn!("{e:#}");
            warn!("continuing with default config");
            return Config::default();
        }
    };
    let Some(fields) = document.as_object() else {
        warn!("config {shown} is not a table of settings, continuing with default config");
        return Config::default();
    };

    let mut config = Config::default();
    field(fields, "waterTempSensorId", &mut config.water_temp_sensor_id);
    field(fields, "ledOnTime", &mut config.led_on_time);
    field(fields, "ledOffTime", &mut config.led_off_time);
    field(fields, "airPumpOnMinutes", &mut config.air_pump_on_minutes);
    field(fields, "airPumpOffMinutes", &mut config.air_pump_off_minutes);
    field(fields, "sensorPeriodMinutes", &mut config.sensor_period_minutes);
    field(fields, "waterLevelEnabled", &mut config.water_level_enabled);
    field(fields, "lowWaterDistanceCm", &mut config.low_water_distance_cm);
    field(fields, "climateSensorEnabled", &mut config.climate_sensor_enabled);
    field(fields, "pins", &mut config.pins);

    let config = config.repaired();
    info!(path = %shown, "config loaded");
    config
}

fn read_document(path: &Path) -> Result<Value> {
    let shown = path.display();
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {shown}"))?;
    if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {shown}"))
    } else {
        serde_json::from_str(&contents).with_context(|| format!("failed to parse config: {shown}"))
    }
}

/// Overwrite `slot` with `key` when present and well-formed.
fn field<T: DeserializeOwned + std::fmt::Debug>(fields: &Map<String, Value>, key: &str, slot: &mut T) {
    let Some(raw) = fields.get(key) else { return };
    match serde_json::from_value(raw.clone()) {
        Ok(value) => *slot = value,
        Err(e) => warn!("config {key}={raw}: {e}, using {slot:?}"),
    }
}

impl Config {
    /// Reset every value that fails validation to its default.
    fn repaired(mut self) -> Self {
        let defaults = Config::default();
        for (name, slot, default) in [
            ("airPumpOnMinutes", &mut self.air_pump_on_minutes, defaults.air_pump_on_minutes),
            ("airPumpOffMinutes", &mut self.air_pump_off_minutes, defaults.air_pump_off_minutes),
            ("sensorPeriodMinutes", &mut self.sensor_period_minutes, defaults.sensor_period_minutes),
        ] {
            if let Some(problem) = check_minutes(name, *slot) {
                warn!("{problem}, using {default}");
                *slot = default;
            }
        }

        if let Some(problem) = check_low_water(self.low_water_distance_cm) {
            warn!("{problem}, using {}", defaults.low_water_distance_cm);
            self.low_water_distance_cm = defaults.low_water_distance_cm;
        }

        let mut pin_errors = Vec::new();
        self.validate_pins(&mut pin_errors);
        if !pin_errors.is_empty() {
            for problem in &pin_errors {
                warn!("{problem}");
            }
            warn!("using the default pin map");
            self.pins = defaults.pins;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Environment settings
// ---------------------------------------------------------------------------

pub struct Settings {
    pub config_path: PathBuf,
    pub mqtt: MqttBroker,
    pub device_id: String,
    pub cpu_temp_path: PathBuf,
    pub recovery_program: String,
    pub recovery_ssid: String,
    pub web_port: u16,
    pub echo_timeout: Duration,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let credentials = match (get("MQTT_USER"), get("MQTT_PASS")) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        };

        Self {
            config_path: PathBuf::from(text("CONFIG_PATH", DEFAULT_CONFIG_PATH)),
            mqtt: MqttBroker {
                host: text("MQTT_HOST", "127.0.0.1"),
                port: parsed(&get, "MQTT_PORT", 1883),
                credentials,
            },
            device_id: text("DEVICE_ID", "selfhydro"),
            cpu_temp_path: PathBuf::from(text("CPU_TEMP_PATH", DEFAULT_CPU_TEMP_PATH)),
            recovery_program: text("RECOVERY_PROGRAM", "wifi-connect"),
            recovery_ssid: text("RECOVERY_SSID", "Selfhydro Connect"),
            web_port: parsed(&get, "WEB_PORT", 8080),
            echo_timeout: Duration::from_millis(parsed(
                &get,
                "ECHO_TIMEOUT_MS",
                DEFAULT_ECHO_TIMEOUT.as_millis() as u64,
            )),
        }
    }
}

fn parsed<T: std::str::FromStr + std::fmt::Display>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match get(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{key}={raw:?} is not valid, using {default}");
            default
        }),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use time::macros::time;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    fn write(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_rig_json() {
        let json = r#"{
            "waterTempSensorId": "28-000005e2fdc3",
            "ledOnTime": "08:00:00",
            "ledOffTime": "20:00:00"
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.water_temp_sensor_id, "28-000005e2fdc3");
        assert_eq!(cfg.led_on_time, "08:00:00");
        assert_eq!(cfg.air_pump_on_minutes, 30);
        assert!(cfg.climate_sensor_enabled);
        assert_eq!(cfg.pins, PinMap::default());
    }

    #[test]
    fn parse_empty_json_gives_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn parse_toml_with_pin_override() {
        let toml_str = r#"
ledOnTime = "06:00:00"
ledOffTime = "22:00:00"
waterLevelEnabled = true
lowWaterDistanceCm = 2.5

[pins]
growLight = 26
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert!(cfg.water_level_enabled);
        assert_eq!(cfg.low_water_distance_cm, 2.5);
        assert_eq!(cfg.pins.grow_light, 26);
        assert_eq!(cfg.pins.air_pump, 21);
    }

    // -- Validation ---------------------------------------------------------

    #[test]
    fn default_config_passes() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn reserved_pin_rejected() {
        let mut cfg = Config::default();
        cfg.pins.button = 1;
        assert_validation_err(&cfg, "pins.button: 1 is not a valid BCM GPIO pin");
    }

    #[test]
    fn pin_past_header_rejected() {
        let mut cfg = Config::default();
        cfg.pins.echo = 28;
        assert_validation_err(&cfg, "pins.echo: 28");
    }

    #[test]
    fn shared_pin_rejected() {
        let mut cfg = Config::default();
        cfg.pins.air_pump = cfg.pins.grow_light;
        assert_validation_err(&cfg, "pins.airPump: gpio 19 is already used");
    }

    #[test]
    fn zero_durations_rejected() {
        let cfg = Config {
            air_pump_off_minutes: 0,
            ..Config::default()
        };
        assert_validation_err(&cfg, "airPumpOffMinutes must be positive");
    }

    #[test]
    fn durations_longer_than_a_week_rejected() {
        let cfg = Config {
            air_pump_on_minutes: u64::MAX,
            ..Config::default()
        };
        assert_validation_err(&cfg, "airPumpOnMinutes must be at most 10080");
        Config {
            sensor_period_minutes: MAX_MINUTES,
            ..Config::default()
        }
        .validate()
        .unwrap();
    }

    #[test]
    fn huge_minutes_saturate_instead_of_overflowing() {
        let cfg = Config {
            air_pump_on_minutes: u64::MAX,
            sensor_period_minutes: u64::MAX,
            ..Config::default()
        };
        assert_eq!(cfg.duty_cycle().on, Duration::from_secs(u64::MAX));
        assert_eq!(cfg.sensor_period(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn negative_low_water_rejected() {
        let cfg = Config {
            low_water_distance_cm: -1.0,
            ..Config::default()
        };
        assert_validation_err(&cfg, "lowWaterDistanceCm");
    }

    #[test]
    fn every_violation_is_reported() {
        let mut cfg = Config {
            air_pump_on_minutes: 0,
            sensor_period_minutes: 0,
            ..Config::default()
        };
        cfg.pins.ping = 0;
        assert_validation_err(&cfg, "3 errors");
    }

    // -- Derived settings ---------------------------------------------------

    #[test]
    fn schedule_from_both_times() {
        let cfg = Config {
            led_on_time: "08:00:00".into(),
            led_off_time: "20:00:00".into(),
            ..Config::default()
        };
        let s = cfg.schedule().unwrap();
        assert_eq!(s.on, time!(08:00:00));
        assert_eq!(s.off, time!(20:00:00));
    }

    #[test]
    fn missing_schedule_means_none() {
        assert!(Config::default().schedule().is_none());
    }

    #[test]
    fn malformed_schedule_means_none() {
        let cfg = Config {
            led_on_time: "8 o'clock".into(),
            led_off_time: "20:00:00".into(),
            ..Config::default()
        };
        assert!(cfg.schedule().is_none());

        let half = Config {
            led_on_time: "08:00:00".into(),
            ..Config::default()
        };
        assert!(half.schedule().is_none());
    }

    #[test]
    fn durations_are_minutes() {
        let cfg = Config::default();
        assert_eq!(cfg.duty_cycle(), DutyCycle::default());
        assert_eq!(cfg.sensor_period(), Duration::from_secs(3 * 60 * 60));
    }

    // -- Loading ------------------------------------------------------------

    #[test]
    fn load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "configData.json", r#"{"ledOnTime":"08:00:00","ledOffTime":"20:00:00"}"#);
        let cfg = load(&path).unwrap();
        assert!(cfg.schedule().is_some());
    }

    #[test]
    fn load_toml_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "rig.toml", "sensorPeriodMinutes = 60\n");
        assert_eq!(load(&path).unwrap().sensor_period_minutes, 60);
    }

    #[test]
    fn load_missing_file_fails_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let err = load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("absent.json"));
    }

    #[test]
    fn load_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "c.json", r#"{"pins":{"growLight":99}}"#);
        let err = load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("invalid config"));
    }

    #[test]
    fn load_or_default_falls_back_on_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "c.json", "{ not json");
        assert_eq!(load_or_default(&path), Config::default());
    }

    #[test]
    fn load_or_default_keeps_schedule_when_another_field_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "c.json",
            r#"{"ledOnTime":"08:00:00","ledOffTime":"20:00:00","airPumpOnMinutes":"thirty","airPumpOffMinutes":90,"climateSensorEnabled":false}"#,
        );
        let cfg = load_or_default(&path);
        assert!(!cfg.climate_sensor_enabled);
        let s = cfg.schedule().unwrap();
        assert_eq!(s.on, time!(08:00:00));
        assert_eq!(cfg.air_pump_on_minutes, 30);
        assert_eq!(cfg.air_pump_off_minutes, 90);
    }

    #[test]
    fn load_or_default_resets_only_out_of_range_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "c.json",
            r#"{"ledOnTime":"06:00:00","ledOffTime":"22:00:00","airPumpOnMinutes":18446744073709551615,"sensorPeriodMinutes":0,"lowWaterDistanceCm":-3,"waterLevelEnabled":true}"#,
        );
        let cfg = load_or_default(&path);
        assert_eq!(cfg.air_pump_on_minutes, 30);
        assert_eq!(cfg.sensor_period_minutes, 180);
        assert_eq!(cfg.low_water_distance_cm, 1.0);
        assert!(cfg.water_level_enabled);
        assert!(cfg.schedule().is_some());
        cfg.validate().unwrap();
    }

    #[test]
    fn load_or_default_bad_pins_fall_back_to_default_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "c.json",
            r#"{"ledOnTime":"08:00:00","ledOffTime":"20:00:00","pins":{"growLight":99}}"#,
        );
        let cfg = load_or_default(&path);
        assert_eq!(cfg.pins, PinMap::default());
        assert!(cfg.schedule().is_some());
    }

    #[test]
    fn load_or_default_reads_toml_field_by_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "rig.toml",
            "ledOnTime = \"07:00:00\"\nledOffTime = \"19:00:00\"\nsensorPeriodMinutes = \"hourly\"\n\n[pins]\ngrowLight = 26\n",
        );
        let cfg = load_or_default(&path);
        assert_eq!(cfg.schedule().unwrap().off, time!(19:00:00));
        assert_eq!(cfg.sensor_period_minutes, 180);
        assert_eq!(cfg.pins.grow_light, 26);
    }

    #[test]
    fn load_or_default_non_table_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "c.json", r#"["08:00:00","20:00:00"]"#);
        assert_eq!(load_or_default(&path), Config::default());
    }

    // -- Settings -----------------------------------------------------------

    fn settings(vars: &[(&str, &str)]) -> Settings {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn settings_defaults() {
        let s = settings(&[]);
        assert_eq!(s.config_path, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(s.cpu_temp_path, PathBuf::from(DEFAULT_CPU_TEMP_PATH));
        assert_eq!(s.mqtt.port, 1883);
        assert!(s.mqtt.credentials.is_none());
        assert_eq!(s.recovery_program, "wifi-connect");
        assert_eq!(s.recovery_ssid, "Selfhydro Connect");
        assert_eq!(s.web_port, 8080);
        assert_eq!(s.echo_timeout, DEFAULT_ECHO_TIMEOUT);
    }

    #[test]
    fn settings_overrides() {
        let s = settings(&[
            ("MQTT_HOST", "broker.local"),
            ("MQTT_PORT", "8883"),
            ("MQTT_USER", "rig"),
            ("MQTT_PASS", "secret"),
            ("DEVICE_ID", "rig-7"),
            ("ECHO_TIMEOUT_MS", "30"),
        ]);
        assert_eq!(s.mqtt.host, "broker.local");
        assert_eq!(s.mqtt.port, 8883);
        assert_eq!(s.mqtt.credentials, Some(("rig".into(), "secret".into())));
        assert_eq!(s.device_id, "rig-7");
        assert_eq!(s.echo_timeout, Duration::from_millis(30));
    }

    #[test]
    fn settings_bad_number_falls_back() {
        let s = settings(&[("MQTT_PORT", "eighty"), ("WEB_PORT", "70000")]);
        assert_eq!(s.mqtt.port, 1883);
        assert_eq!(s.web_port, 8080);
    }

    #[test]
    fn credentials_need_both_halves() {
        let s = settings(&[("MQTT_USER", "rig")]);
        assert!(s.mqtt.credentials.is_none());
    }
}
