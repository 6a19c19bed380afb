use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapter::{SlotReading, StatusFrame};

/// Alert severity, ordered so that `min_severity` preferences can
/// compare directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// Everything published on the in-process bus. Each variant maps to a
/// stable dotted topic; payloads carry ids, never live references.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    PrinterStateChanged {
        printer_id: i64,
        frame: StatusFrame,
    },
    PrinterConnected {
        printer_id: i64,
    },
    PrinterDisconnected {
        printer_id: i64,
    },
    PrinterError {
        printer_id: i64,
        code: String,
        message: String,
        severity: Severity,
    },
    PrinterHmsCode {
        printer_id: i64,
        code: String,
        message: String,
        severity: Severity,
    },
    JobSubmitted {
        job_id: i64,
        item_name: String,
    },
    JobApproved {
        job_id: i64,
    },
    JobRejected {
        job_id: i64,
        reason: String,
    },
    JobScheduled {
        job_id: i64,
        printer_id: i64,
        scheduled_start: DateTime<Utc>,
        scheduled_end: DateTime<Utc>,
    },
    JobStarted {
        job_id: i64,
        printer_id: i64,
    },
    JobCompleted {
        job_id: i64,
        printer_id: Option<i64>,
    },
    JobFailed {
        job_id: i64,
        printer_id: Option<i64>,
        reason: String,
    },
    SpoolLow {
        spool_id: i64,
        remaining_grams: f64,
    },
    SpoolEmpty {
        spool_id: i64,
    },
    SpoolMismatch {
        printer_id: i64,
        slot_number: i64,
        spool_id: i64,
        reported_hex: String,
    },
    /// Published by the out-of-scope vision subsystem; carried so alert
    /// routing can fan it out.
    VisionDetection {
        printer_id: i64,
        kind: String,
        confidence: f64,
    },
    BackupCompleted {
        path: String,
    },
}

impl Event {
    /// Stable dotted topic name for routing and audit.
    pub fn topic(&self) -> &'static str {
        match self {
            Event::PrinterStateChanged { .. } => "printer.state_changed",
            Event::PrinterConnected { .. } => "printer.connected",
            Event::PrinterDisconnected { .. } => "printer.disconnected",
            Event::PrinterError { .. } => "printer.error",
            Event::PrinterHmsCode { .. } => "printer.hms_code",
            Event::JobSubmitted { .. } => "job.submitted",
            Event::JobApproved { .. } => "job.approved",
            Event::JobRejected { .. } => "job.rejected",
            Event::JobScheduled { .. } => "job.scheduled",
            Event::JobStarted { .. } => "job.started",
            Event::JobCompleted { .. } => "job.completed",
            Event::JobFailed { .. } => "job.failed",
            Event::SpoolLow { .. } => "inventory.spool_low",
            Event::SpoolEmpty { .. } => "inventory.spool_empty",
            Event::SpoolMismatch { .. } => "inventory.spool_mismatch",
            Event::VisionDetection { .. } => "vision.detection",
            Event::BackupCompleted { .. } => "system.backup_completed",
        }
    }

    /// Terminal transitions may never be dropped under backpressure.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::JobCompleted { .. } | Event::JobFailed { .. } | Event::SpoolEmpty { .. }
        )
    }

    /// Slot readings carried by this event, if any.
    pub fn slot_readings(&self) -> Option<&[SlotReading]> {
        match self {
            Event::PrinterStateChanged { frame, .. } if !frame.slots.is_empty() => {
                Some(&frame.slots)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_are_stable() {
        let event = Event::SpoolLow { spool_id: 3, remaining_grams: 88.0 };
        assert_eq!(event.topic(), "inventory.spool_low");
        assert_eq!(
            Event::BackupCompleted { path: "x".into() }.topic(),
            "system.backup_completed"
        );
    }

    #[test]
    fn terminal_flags() {
        assert!(Event::JobCompleted { job_id: 1, printer_id: None }.is_terminal());
        assert!(Event::JobFailed { job_id: 1, printer_id: None, reason: "clog".into() }
            .is_terminal());
        assert!(!Event::PrinterConnected { printer_id: 1 }.is_terminal());
    }

    #[test]
    fn serializes_with_type_tag() {
        let json = serde_json::to_value(Event::JobApproved { job_id: 7 }).unwrap();
        assert_eq!(json["type"], "job_approved");
        assert_eq!(json["job_id"], 7);
    }

    #[test]
    fn severity_orders() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
        assert_eq!(Severity::parse("warning"), Some(Severity::Warning));
    }
}
