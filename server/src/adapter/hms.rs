//! Vendor error-code decoding for the message-bus vendor.
//!
//! Codes arrive as `AABBCCDD_EEFFGGHH`: the first word identifies
//! device, module index, error class and sub-error; the second carries
//! the error category and a specific error or slot number. Known codes
//! are looked up exactly; anything else is decoded structurally from
//! the identifier layout.

use crate::events::Severity;

/// A decoded vendor error code.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedError {
    pub code: String,
    pub message: String,
    pub severity: Severity,
}

fn device_name(id: u8) -> Option<&'static str> {
    Some(match id {
        0x01 => "Motion Controller",
        0x02 => "Mainboard",
        0x03 => "AMS",
        0x04 | 0x05 => "AMS Hub",
        0x06 => "Filament System",
        0x07 => "Camera",
        0x08 => "MC Module",
        0x09 => "Toolhead Board",
        0x0A => "Toolhead",
        0x0B => "Nozzle",
        0x0C | 0x0D => "Extruder",
        0x0E => "Bed Leveling",
        0x0F => "Purge System",
        0x10 => "Chamber",
        0x11 => "Power Supply",
        0x12 => "Heatbed",
        0x13 => "WiFi Module",
        0x14 => "Display",
        _ => return None,
    })
}

fn class_description(device: u8, class: u8) -> Option<&'static str> {
    Some(match (device, class) {
        (0x03, 0x01) => "filament runout",
        (0x03, 0x02) => "filament broken or unable to feed",
        (0x03, 0x03) => "filament tangled",
        (0x03, 0x04) => "RFID read failure",
        (0x03, 0x05) => "filament buffer error",
        (0x03, 0x07) => "assist motor error",
        (0x03, 0x08) => "slot detect error",
        (0x03, 0x0A) => "lid open",
        (0x05, 0x01) => "communication error",
        (0x05, 0x02) => "cutter failure",
        (0x05, 0x03) => "motor overload",
        (0x05, 0x04) => "filament load/unload failure",
        (0x0C, 0x01) | (0x0D, 0x01) => "temperature abnormal",
        (0x0C, 0x02) | (0x0D, 0x02) => "heating failure",
        (0x0C, 0x03) | (0x0D, 0x03) => "nozzle clog detected",
        (0x0C, 0x04) => "motor stall or jam",
        (0x12, 0x01) => "temperature abnormal",
        (0x12, 0x02) => "heating failure",
        (0x12, 0x03) => "adhesion failure detected",
        (0x12, 0x05) => "bed leveling failure",
        (0x01, 0x01) => "motor stall or endstop error",
        (0x01, 0x02) => "homing failure",
        (0x01, 0x04) => "calibration failure",
        (0x02, 0x02) => "firmware error",
        (0x02, 0x03) => "communication bus error",
        (0x02, 0x04) => "power supply error",
        (0x07, 0x01) => "inspection error",
        (0x07, 0x03) => "print quality issue detected",
        (0x0A, 0x03) => "front cover removed",
        (0x10, 0x02) => "door opened during print",
        _ => return None,
    })
}

/// Exact messages for frequently seen codes. Structural decode covers
/// the long tail.
fn known_message(code: &str) -> Option<&'static str> {
    Some(match code {
        "0300_0100_0001_0001" => "AMS: filament runout, please insert filament.",
        "0300_0200_0001_0001" => "AMS: filament is broken in the tube, please pull it out.",
        "0300_0300_0001_0002" => "AMS: filament tangled, printing paused.",
        "0300_0400_0002_0001" => "AMS: RFID cannot be read, tray information unavailable.",
        "0500_0200_0002_0001" => "AMS Hub: cutter stuck, check the blade.",
        "0500_0400_0001_0003" => "AMS Hub: filament failed to load into the extruder.",
        "0C00_0100_0001_0004" => "Extruder: nozzle temperature abnormal, print paused.",
        "0C00_0300_0002_0002" => "Extruder: nozzle clog detected, clean the nozzle.",
        "0C00_0200_0001_0001" => "Extruder: heating failed, check the heater wiring.",
        "1200_0100_0002_0002" => "Heatbed: temperature abnormal, heating stopped.",
        "1200_0300_0001_0001" => "Heatbed: first layer adhesion failure detected.",
        "1200_0500_0002_0001" => "Heatbed: automatic bed leveling failed.",
        "0100_0100_0001_0003" => "Motion Controller: motor stall detected on X axis.",
        "0100_0200_0001_0001" => "Motion Controller: homing failed, check the carriage.",
        "0100_0400_0002_0002" => "Motion Controller: resonance calibration failed.",
        "0200_0200_0001_0001" => "Mainboard: firmware exception, restart the printer.",
        "0700_0300_0001_0001" => "Camera: possible spaghetti failure detected.",
        "0700_0100_0001_0002" => "Camera: first layer inspection found defects.",
        "0A00_0300_0001_0001" => "Toolhead: front cover fell off, print paused.",
        "1000_0200_0001_0001" => "Chamber: door opened during print.",
        "0300_0A00_0001_0001" => "AMS: lid open, close the lid to continue.",
        _ => return None,
    })
}

/// Severity from the category word: 1=fatal, 2=serious, 3=common,
/// 4=info per the vendor's convention. Firmware revisions put the
/// level in either byte of the word.
fn severity_for_category(category: u16) -> Severity {
    let level = if category <= 0x00FF { category } else { category >> 8 };
    match level {
        0x01 | 0x02 => Severity::Critical,
        0x03 => Severity::Warning,
        _ => Severity::Info,
    }
}

/// Decode a vendor error code into a human message and severity.
pub fn decode(raw: &str) -> DecodedError {
    let code = raw.trim().to_uppercase();
    let normalized = code.replace('-', "_").replace(' ', "");

    if let Some(message) = known_message(&normalized) {
        let category = parse_category(&normalized).unwrap_or(0x0300);
        return DecodedError {
            code: normalized,
            message: message.to_string(),
            severity: severity_for_category(category),
        };
    }

    match decode_structural(&normalized) {
        Some(decoded) => decoded,
        None => DecodedError {
            code: normalized.clone(),
            message: format!("Unknown device error: {normalized}"),
            severity: Severity::Warning,
        },
    }
}

fn parse_category(code: &str) -> Option<u16> {
    // Category is the EEFF word: first 4 hex digits after the attr half.
    let tail = code.split('_').nth(2)?;
    u16::from_str_radix(tail.get(0..4)?, 16).ok()
}

fn decode_structural(code: &str) -> Option<DecodedError> {
    let digits: Vec<&str> = code.split('_').collect();
    if digits.len() != 4 || digits.iter().any(|part| part.len() != 4) {
        return None;
    }
    let attr = u32::from_str_radix(&format!("{}{}", digits[0], digits[1]), 16).ok()?;
    let code_word = u32::from_str_radix(&format!("{}{}", digits[2], digits[3]), 16).ok()?;

    let device = ((attr >> 24) & 0xFF) as u8;
    let module = ((attr >> 16) & 0xFF) as u8;
    let class = ((attr >> 8) & 0xFF) as u8;
    let category = ((code_word >> 16) & 0xFFFF) as u16;
    let specific = (code_word & 0xFFFF) as u16;

    let device_label = match device_name(device) {
        Some(_) if (device == 0x03 || device == 0x05) && module > 0 => {
            format!("AMS{module}")
        }
        Some(name) if module > 0 => format!("{name} (unit {module})"),
        Some(name) => name.to_string(),
        None => format!("Device 0x{device:02X}"),
    };

    let class_label = class_description(device, class)
        .map(str::to_string)
        .unwrap_or_else(|| format!("error 0x{class:02X}"));

    let mut message = format!("{device_label}: {class_label}");
    if (device == 0x03 || device == 0x05) && (1..=4).contains(&specific) {
        message.push_str(&format!(" (slot {specific})"));
    }
    message.push('.');

    Some(DecodedError {
        code: code.to_string(),
        message,
        severity: severity_for_category(category),
    })
}

/// Render the raw `attr`/`code` words from a device report into the
/// canonical `AABB_CCDD_EEFF_GGHH` identifier.
pub fn format_code(attr: u32, code: u32) -> String {
    format!(
        "{:04X}_{:04X}_{:04X}_{:04X}",
        (attr >> 16) & 0xFFFF,
        attr & 0xFFFF,
        (code >> 16) & 0xFFFF,
        code & 0xFFFF
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_code_wins_over_structural() {
        let decoded = decode("0300_0100_0001_0001");
        assert_eq!(decoded.message, "AMS: filament runout, please insert filament.");
        assert_eq!(decoded.severity, Severity::Critical);
    }

    #[test]
    fn structural_decode_names_device_and_class() {
        // AMS unit 2, filament tangled, slot 3, common severity.
        let decoded = decode("0302_0300_0300_0003");
        assert_eq!(decoded.message, "AMS2: filament tangled (slot 3).");
        assert_eq!(decoded.severity, Severity::Warning);
    }

    #[test]
    fn unknown_device_still_renders() {
        let decoded = decode("FF00_0000_0400_0000");
        assert!(decoded.message.starts_with("Device 0xFF"));
        assert_eq!(decoded.severity, Severity::Info);
    }

    #[test]
    fn malformed_codes_fall_back() {
        let decoded = decode("garbage");
        assert!(decoded.message.contains("Unknown device error"));
    }

    #[test]
    fn formats_report_words() {
        assert_eq!(format_code(0x0300_0100, 0x0001_0001), "0300_0100_0001_0001");
    }
}
