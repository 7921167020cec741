//! Configuration system using Figment.
//!
//! Settings are layered, highest precedence first:
//! 1. Environment variables prefixed with `TEM_EMULATOR_` (nested keys split on `__`)
//! 2. A TOML file, if one is given
//! 3. Built-in defaults
//!
//! # Environment Variable Overrides
//!
//! ```text
//! TEM_EMULATOR_APPLICATION__LOG_LEVEL=debug
//! TEM_EMULATOR_TEM__PORT=9001
//! TEM_EMULATOR_CAMERA__WIDTH=1024
//! ```
//!
//! # Example
//!
//! ```no_run
//! use tem_emulator::config::Settings;
//!
//! let settings = Settings::load(Some("config/emulator.toml".as_ref()))?;
//! println!("TEM on {}, camera on {}", settings.tem.addr(), settings.camera.addr());
//! # Ok::<(), tem_emulator::error::EmulatorError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{AppResult, EmulatorError};
use crate::limits::{DEFAULT_MAX_REQUEST_BYTES, MAX_FRAME_BYTES};
use crate::protocol::FrameLimits;
use crate::render::SensorSettings;
use crate::state::{Calibration, MicroscopeState};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "TEM_EMULATOR_";

/// Top-level emulator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Name and logging.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// TEM control service endpoint.
    #[serde(default = "default_tem_service")]
    pub tem: ServiceConfig,
    /// Camera service endpoint and detector.
    #[serde(default)]
    pub camera: CameraConfig,
    /// Session I/O bounds.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Initial microscope state.
    #[serde(default)]
    pub microscope: MicroscopeState,
    /// Magnification and camera-length tables.
    #[serde(default)]
    pub calibration: Calibration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            tem: default_tem_service(),
            camera: CameraConfig::default(),
            network: NetworkConfig::default(),
            microscope: MicroscopeState::default(),
            calibration: Calibration::default(),
        }
    }
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// `pretty` or `json`
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "tem-emulator".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Where a service listens. Port 0 picks an ephemeral port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Interface to bind.
    pub host: String,
    /// TCP port; 0 picks one.
    pub port: u16,
}

impl ServiceConfig {
    /// `host:port` for binding.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_tem_service() -> ServiceConfig {
    ServiceConfig {
        host: "127.0.0.1".to_string(),
        port: 8001,
    }
}

/// Camera service endpoint and simulated detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Interface to bind.
    pub host: String,
    /// TCP port; 0 picks one.
    pub port: u16,
    /// Unbinned sensor width in pixels.
    pub width: u32,
    /// Unbinned sensor height in pixels.
    pub height: u32,
    /// Longest accepted exposure in seconds.
    pub max_exposure_s: f64,
    /// Mean counts per pixel with no beam.
    pub dark_level: u16,
    /// Hold each acquisition for its exposure time before reading out.
    pub simulate_exposure: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        let sensor = SensorSettings::default();
        Self {
            host: "127.0.0.1".to_string(),
            port: 8002,
            width: sensor.width,
            height: sensor.height,
            max_exposure_s: sensor.max_exposure_s,
            dark_level: sensor.dark_level,
            simulate_exposure: false,
        }
    }
}

impl CameraConfig {
    /// `host:port` for binding.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The detector description handed to the renderer.
    pub fn sensor(&self) -> SensorSettings {
        SensorSettings {
            width: self.width,
            height: self.height,
            max_exposure_s: self.max_exposure_s,
            dark_level: self.dark_level,
        }
    }
}

/// Session I/O bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Longest a session may sit idle between requests.
    pub idle_timeout_ms: u64,
    /// Longest a started frame or a write may take.
    pub io_timeout_ms: u64,
    /// Largest request body accepted.
    pub max_request_bytes: usize,
    /// How long shutdown waits for sessions to finish their current request.
    pub shutdown_grace_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 300_000,
            io_timeout_ms: 5_000,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl NetworkConfig {
    /// Framing bounds for inbound requests.
    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_frame_bytes: self.max_request_bytes,
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            io_timeout: Duration::from_millis(self.io_timeout_ms),
        }
    }

    /// Grace period for draining sessions on shutdown.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load settings from defaults, an optional TOML file and the environment.
    ///
    /// After loading, settings are validated.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed, an override has the wrong type,
    /// or validation fails.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(EmulatorError::ConfigValidation(format!(
                    "config file '{}' does not exist",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Extract and validate settings from an arbitrary figment.
    pub fn from_figment(figment: Figment) -> AppResult<Self> {
        let mut settings: Settings = figment.extract()?;
        // Generation counts writes since startup; a config file cannot preset it.
        settings.microscope.generation = 0;
        settings.validate()?;
        Ok(settings)
    }

    /// Same settings with both services on ephemeral loopback ports.
    pub fn with_ephemeral_ports(mut self) -> Self {
        self.tem.host = "127.0.0.1".to_string();
        self.tem.port = 0;
        self.camera.host = "127.0.0.1".to_string();
        self.camera.port = 0;
        self
    }

    /// Validate settings after loading
    ///
    /// Checks:
    /// - Log level and format are known
    /// - The two services do not claim the same fixed port
    /// - The detector and calibration are usable
    /// - The initial microscope state is within bounds
    ///
    /// # Errors
    ///
    /// Returns a `ConfigValidation` error describing the first failure.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(EmulatorError::ConfigValidation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(EmulatorError::ConfigValidation(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.tem.port != 0 && self.tem.port == self.camera.port && self.tem.host == self.camera.host
        {
            return Err(EmulatorError::ConfigValidation(format!(
                "TEM and camera services both configured on {}",
                self.tem.addr()
            )));
        }

        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(EmulatorError::ConfigValidation(format!(
                "Camera dimensions {}x{} must be non-zero",
                self.camera.width, self.camera.height
            )));
        }
        if !self.camera.max_exposure_s.is_finite() || self.camera.max_exposure_s <= 0.0 {
            return Err(EmulatorError::ConfigValidation(format!(
                "Camera max_exposure_s {} must be positive",
                self.camera.max_exposure_s
            )));
        }

        if self.network.io_timeout_ms == 0 || self.network.idle_timeout_ms == 0 {
            return Err(EmulatorError::ConfigValidation(
                "Network timeouts must be > 0".to_string(),
            ));
        }
        if self.network.max_request_bytes == 0 || self.network.max_request_bytes > MAX_FRAME_BYTES {
            return Err(EmulatorError::ConfigValidation(format!(
                "max_request_bytes {} must be within 1..={MAX_FRAME_BYTES}",
                self.network.max_request_bytes
            )));
        }

        let cal = &self.calibration;
        for (name, table) in [
            ("magnifications", &cal.magnifications),
            ("camera_lengths", &cal.camera_lengths),
        ] {
            if table.is_empty() {
                return Err(EmulatorError::ConfigValidation(format!(
                    "Calibration table '{name}' cannot be empty"
                )));
            }
            if table.iter().any(|v| !v.is_finite() || *v <= 0.0) {
                return Err(EmulatorError::ConfigValidation(format!(
                    "Calibration table '{name}' must hold positive values"
                )));
            }
        }
        if !cal.pixel_size_um.is_finite() || cal.pixel_size_um <= 0.0 {
            return Err(EmulatorError::ConfigValidation(
                "Calibration pixel_size_um must be positive".to_string(),
            ));
        }
        if !cal.wavelength_pm.is_finite() || cal.wavelength_pm <= 0.0 {
            return Err(EmulatorError::ConfigValidation(
                "Calibration wavelength_pm must be positive".to_string(),
            ));
        }

        self.microscope
            .validate(cal)
            .map_err(|e| EmulatorError::ConfigValidation(format!("Initial microscope state: {e}")))
    }
}
