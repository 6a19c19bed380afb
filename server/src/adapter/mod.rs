pub mod bambu;
pub mod hms;
pub mod moonraker;
pub mod prusalink;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::AdapterError;

/// Hardware-reported device state, normalized across vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Idle,
    Prepare,
    Running,
    Paused,
    Failed,
    Finished,
}

impl DeviceState {
    /// States that count as an active print for fleet projections.
    pub fn is_printing(self) -> bool {
        matches!(self, DeviceState::Running | DeviceState::Prepare)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceState::Idle => "idle",
            DeviceState::Prepare => "prepare",
            DeviceState::Running => "running",
            DeviceState::Paused => "paused",
            DeviceState::Failed => "failed",
            DeviceState::Finished => "finished",
        }
    }
}

/// One hardware filament slot as reported by the device (AMS tray or
/// direct-feed channel). All fields optional: absent means unknown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotReading {
    /// 1-based slot index.
    pub slot: u8,
    pub material: Option<String>,
    pub color_hex: Option<String>,
    pub remaining_pct: Option<f64>,
    pub rfid: Option<String>,
}

/// Normalized snapshot of a printer's state, emitted by an adapter.
/// Numeric fields are Option-typed: absent means the vendor did not
/// report them in this frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusFrame {
    pub state: Option<DeviceState>,
    pub bed_temp: Option<f64>,
    pub bed_target: Option<f64>,
    pub nozzle_temp: Option<f64>,
    pub nozzle_target: Option<f64>,
    pub fan_percent: Option<u8>,
    pub progress: Option<f64>,
    pub remaining_minutes: Option<i64>,
    pub layer: Option<i64>,
    pub total_layers: Option<i64>,
    /// File name of the print the device reports as current.
    pub file_name: Option<String>,
    pub slots: Vec<SlotReading>,
    /// Vendor error codes, already rendered to the vendor's identifier
    /// format (HMS `AABBCCDD_EEFFGGHH`, moonraker message strings, ...).
    pub error_codes: Vec<String>,
}

/// Where adapters push status frames.
pub type FrameSink = mpsc::Sender<StatusFrame>;

/// Options accepted by `start_print`.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub bed_leveling: bool,
    pub flow_calibration: bool,
    /// AMS slot mapping: artifact filament index -> hardware slot.
    pub slot_mapping: Vec<u8>,
}

/// Control commands beyond start.
#[derive(Debug, Clone)]
pub enum ControlCommand {
    Pause,
    Resume,
    Stop,
    SetFanSpeed(u8),
    SetLights(bool),
    SkipObjects(Vec<i64>),
}

/// Transport coordinates + decrypted credentials for one printer.
#[derive(Debug, Clone)]
pub struct Coordinates {
    pub host: String,
    /// Vendor-specific credential string. Message-bus vendor uses
    /// `serial|access_code`; HTTP vendors use an API key (may be empty).
    pub credentials: String,
}

impl Coordinates {
    /// Split `serial|access_code` credentials for the message-bus vendor.
    pub fn split_serial_access(&self) -> Result<(&str, &str), AdapterError> {
        self.credentials.split_once('|').ok_or_else(|| {
            AdapterError::Protocol("credentials must be serial|access_code".to_string())
        })
    }
}

/// Vendor driver for one printer. One instance per session; `connect`
/// is idempotent and `disconnect` is safe from any state.
///
/// Control commands return once the device accepts them. Callers must
/// not assume the state changed until a later StatusFrame reflects it.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Establish the transport. Returns after the first status frame
    /// has been pushed into the sink, or fails on a deadline.
    async fn connect(&self) -> Result<(), AdapterError>;

    /// Clean teardown. Safe to call from any state.
    async fn disconnect(&self);

    /// Transfer an artifact to the device under `remote_name`.
    async fn upload(&self, bytes: &[u8], remote_name: &str) -> Result<(), AdapterError>;

    /// Instruct hardware to begin printing `remote_name`. Returns when
    /// the command is accepted, not when printing ends.
    async fn start_print(&self, remote_name: &str, options: &StartOptions)
        -> Result<(), AdapterError>;

    async fn control(&self, command: ControlCommand) -> Result<(), AdapterError>;
}

/// Supported vendor transports, selected by the printer's `api_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiType {
    /// TLS message-bus vendor (MQTT report/request topics).
    Bambu,
    /// JSON-over-HTTP polling vendor.
    Moonraker,
    /// File-upload-via-session vendor.
    Prusalink,
}

impl ApiType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "bambu" => Some(ApiType::Bambu),
            "moonraker" => Some(ApiType::Moonraker),
            "prusalink" => Some(ApiType::Prusalink),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ApiType::Bambu => "bambu",
            ApiType::Moonraker => "moonraker",
            ApiType::Prusalink => "prusalink",
        }
    }
}

/// Build the driver for a printer's transport.
pub fn for_api_type(
    api_type: ApiType,
    coordinates: Coordinates,
    artifact_base_url: Option<String>,
    sink: FrameSink,
) -> Result<Box<dyn Adapter>, AdapterError> {
    match api_type {
        ApiType::Bambu => Ok(Box::new(bambu::BambuAdapter::new(
            coordinates,
            artifact_base_url,
            sink,
        )?)),
        ApiType::Moonraker => Ok(Box::new(moonraker::MoonrakerAdapter::new(coordinates, sink))),
        ApiType::Prusalink => Ok(Box::new(prusalink::PrusalinkAdapter::new(coordinates, sink))),
    }
}

/// Static reachability probe that does not bind a session.
pub async fn test_connection(
    api_type: ApiType,
    coordinates: &Coordinates,
) -> Result<(), AdapterError> {
    match api_type {
        ApiType::Bambu => bambu::probe(coordinates).await,
        ApiType::Moonraker => moonraker::probe(coordinates).await,
        ApiType::Prusalink => prusalink::probe(coordinates).await,
    }
}
