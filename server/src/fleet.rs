//! Live in-memory projection of printer state. One writer per printer
//! (the owning session); readers get value snapshots, never references
//! into the map.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::adapter::{DeviceState, SlotReading, StatusFrame};

/// Descriptor of the print a device currently reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentPrint {
    pub file_name: Option<String>,
    pub progress: Option<f64>,
    pub remaining_minutes: Option<i64>,
    pub layer: Option<i64>,
    pub total_layers: Option<i64>,
}

/// Most recent projected state for one printer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterSnapshot {
    pub printer_id: i64,
    pub last_frame_at: DateTime<Utc>,
    pub state: Option<DeviceState>,
    pub bed_temp: Option<f64>,
    pub bed_target: Option<f64>,
    pub nozzle_temp: Option<f64>,
    pub nozzle_target: Option<f64>,
    pub fan_percent: Option<u8>,
    pub slots: Vec<SlotReading>,
    pub error_codes: Vec<String>,
    current: Option<CurrentPrint>,
}

impl PrinterSnapshot {
    fn from_frame(printer_id: i64, frame: &StatusFrame, at: DateTime<Utc>) -> Self {
        Self {
            printer_id,
            last_frame_at: at,
            state: frame.state,
            bed_temp: frame.bed_temp,
            bed_target: frame.bed_target,
            nozzle_temp: frame.nozzle_temp,
            nozzle_target: frame.nozzle_target,
            fan_percent: frame.fan_percent,
            slots: frame.slots.clone(),
            error_codes: frame.error_codes.clone(),
            current: Some(CurrentPrint {
                file_name: frame.file_name.clone(),
                progress: frame.progress,
                remaining_minutes: frame.remaining_minutes,
                layer: frame.layer,
                total_layers: frame.total_layers,
            }),
        }
    }

    /// Online means a frame arrived within the liveness window.
    pub fn is_online(&self, now: DateTime<Utc>, liveness_secs: i64) -> bool {
        now - self.last_frame_at < Duration::seconds(liveness_secs)
    }

    pub fn is_printing(&self) -> bool {
        self.state.is_some_and(DeviceState::is_printing)
    }

    /// Non-empty only while the device is printing.
    pub fn current_print(&self) -> Option<&CurrentPrint> {
        if self.is_printing() {
            self.current.as_ref()
        } else {
            None
        }
    }

    /// The print descriptor regardless of state, for terminal-state
    /// reconciliation (a finished print still names its file).
    pub fn last_print(&self) -> Option<&CurrentPrint> {
        self.current.as_ref()
    }
}

/// Fleet-wide map of live printer snapshots.
#[derive(Default)]
pub struct FleetState {
    printers: RwLock<HashMap<i64, PrinterSnapshot>>,
}

impl FleetState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a status frame. Fields absent from the frame keep their
    /// previous value so sparse vendor reports do not erase state.
    pub async fn apply_frame(&self, printer_id: i64, frame: &StatusFrame) -> PrinterSnapshot {
        let now = Utc::now();
        let mut printers = self.printers.write().await;
        let snapshot = match printers.get(&printer_id) {
            Some(previous) => {
                let mut next = PrinterSnapshot::from_frame(printer_id, frame, now);
                if next.state.is_none() {
                    next.state = previous.state;
                }
                if next.bed_temp.is_none() {
                    next.bed_temp = previous.bed_temp;
                }
                if next.bed_target.is_none() {
                    next.bed_target = previous.bed_target;
                }
                if next.nozzle_temp.is_none() {
                    next.nozzle_temp = previous.nozzle_temp;
                }
                if next.nozzle_target.is_none() {
                    next.nozzle_target = previous.nozzle_target;
                }
                if next.fan_percent.is_none() {
                    next.fan_percent = previous.fan_percent;
                }
                if next.slots.is_empty() {
                    next.slots = previous.slots.clone();
                }
                if let (Some(current), Some(prev)) = (next.current.as_mut(), previous.current.as_ref())
                {
                    if current.file_name.is_none() {
                        current.file_name = prev.file_name.clone();
                    }
                }
                next
            }
            None => PrinterSnapshot::from_frame(printer_id, frame, now),
        };
        printers.insert(printer_id, snapshot.clone());
        snapshot
    }

    pub async fn snapshot(&self, printer_id: i64) -> Option<PrinterSnapshot> {
        self.printers.read().await.get(&printer_id).cloned()
    }

    pub async fn all(&self) -> Vec<PrinterSnapshot> {
        self.printers.read().await.values().cloned().collect()
    }

    /// Drop a printer's snapshot when its session stops.
    pub async fn remove(&self, printer_id: i64) {
        self.printers.write().await.remove(&printer_id);
    }
}
