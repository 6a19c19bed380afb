//! Message-bus vendor driver: TLS MQTT on 8883, per-device report and
//! request topics, JSON command envelopes acknowledged on the report
//! topic. Report payloads are incremental; the driver deep-merges them
//! into an accumulated document before projecting a StatusFrame.
//!
//! The vendor's real artifact transfer runs over an implicit-FTPS
//! sidecar. Wire fidelity is out of scope here; the driver models the
//! transfer as a staged-fetch command envelope with the same ack
//! machinery the print commands use.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::ServerName;
use tokio::sync::{oneshot, watch, Mutex};

use crate::adapter::{
    Adapter, ControlCommand, Coordinates, DeviceState, FrameSink, SlotReading, StartOptions,
    StatusFrame,
};
use crate::adapter::hms;
use crate::error::AdapterError;

const CONNECT_DEADLINE: Duration = Duration::from_secs(15);
const ACK_DEADLINE: Duration = Duration::from_secs(20);

/// The vendor ships self-signed device certificates; sessions pin by
/// access code instead of by certificate chain.
#[derive(Debug)]
struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer,
        _intermediates: &[rustls::pki_types::CertificateDer],
        _server_name: &ServerName,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

type PendingAcks = Arc<Mutex<HashMap<String, oneshot::Sender<Result<(), String>>>>>;

struct Session {
    client: AsyncClient,
    shutdown: watch::Sender<bool>,
}

pub struct BambuAdapter {
    serial: String,
    access_code: String,
    host: String,
    artifact_base_url: Option<String>,
    sink: FrameSink,
    session: Mutex<Option<Session>>,
    pending: PendingAcks,
    frame_seen: watch::Sender<bool>,
}

impl BambuAdapter {
    pub fn new(
        coordinates: Coordinates,
        artifact_base_url: Option<String>,
        sink: FrameSink,
    ) -> Result<Self, AdapterError> {
        let (serial, access_code) = coordinates.split_serial_access()?;
        let (frame_seen, _) = watch::channel(false);
        Ok(Self {
            serial: serial.to_string(),
            access_code: access_code.to_string(),
            host: coordinates.host,
            artifact_base_url,
            sink,
            session: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            frame_seen,
        })
    }

    fn report_topic(&self) -> String {
        format!("device/{}/report", self.serial)
    }

    fn request_topic(&self) -> String {
        format!("device/{}/request", self.serial)
    }

    fn mqtt_options(&self) -> MqttOptions {
        let client_id = format!("printfarm_{}_{}", self.serial, uuid::Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, &self.host, 8883);
        options
            .set_credentials("bblp", &self.access_code)
            .set_keep_alive(Duration::from_secs(30));

        let tls = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .expect("ring provider supports default protocol versions")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
        .with_no_client_auth();
        options.set_transport(Transport::Tls(TlsConfiguration::Rustls(Arc::new(tls))));
        options
    }

    /// Publish a command envelope and wait for its result ack on the
    /// report topic.
    async fn send_acked(&self, mut envelope: serde_json::Value) -> Result<(), AdapterError> {
        let sequence_id = chrono::Utc::now().timestamp_millis().to_string();
        if let Some(body) = envelope
            .as_object_mut()
            .and_then(|outer| outer.values_mut().next())
            .and_then(|inner| inner.as_object_mut())
        {
            body.insert("sequence_id".into(), sequence_id.clone().into());
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending.lock().await.insert(sequence_id.clone(), ack_tx);

        let result = self.publish(envelope).await;
        if result.is_err() {
            self.pending.lock().await.remove(&sequence_id);
            return result;
        }

        match tokio::time::timeout(ACK_DEADLINE, ack_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(AdapterError::Rejected(reason)),
            // Sender dropped: session torn down mid-command.
            Ok(Err(_)) => Err(AdapterError::Unreachable("session closed".to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&sequence_id);
                Err(AdapterError::TimedOut(ACK_DEADLINE))
            }
        }
    }

    async fn publish(&self, envelope: serde_json::Value) -> Result<(), AdapterError> {
        let session = self.session.lock().await;
        let session = session
            .as_ref()
            .ok_or_else(|| AdapterError::Unreachable("not connected".to_string()))?;
        session
            .client
            .publish(
                self.request_topic(),
                QoS::AtMostOnce,
                false,
                envelope.to_string().into_bytes(),
            )
            .await
            .map_err(|e| AdapterError::Unreachable(e.to_string()))
    }
}

#[async_trait]
impl Adapter for BambuAdapter {
    async fn connect(&self) -> Result<(), AdapterError> {
        {
            let session = self.session.lock().await;
            if session.is_some() {
                return Ok(());
            }
        }

        let (client, event_loop) = AsyncClient::new(self.mqtt_options(), 10);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let _ = self.frame_seen.send(false);

        tokio::spawn(run_event_loop(EventLoopCtx {
            event_loop,
            client: client.clone(),
            serial: self.serial.clone(),
            report_topic: self.report_topic(),
            request_topic: self.request_topic(),
            sink: self.sink.clone(),
            pending: Arc::clone(&self.pending),
            frame_seen: self.frame_seen.clone(),
            shutdown: shutdown_rx,
        }));

        {
            let mut session = self.session.lock().await;
            *session = Some(Session {
                client,
                shutdown: shutdown_tx,
            });
        }

        // Connect resolves only once the first status frame arrived.
        let mut seen = self.frame_seen.subscribe();
        let wait = async {
            loop {
                if *seen.borrow_and_update() {
                    return;
                }
                if seen.changed().await.is_err() {
                    return;
                }
            }
        };
        match tokio::time::timeout(CONNECT_DEADLINE, wait).await {
            Ok(()) if *self.frame_seen.borrow() => Ok(()),
            _ => {
                self.disconnect().await;
                Err(AdapterError::TimedOut(CONNECT_DEADLINE))
            }
        }
    }

    async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        if let Some(session) = session.take() {
            let _ = session.shutdown.send(true);
            let _ = session.client.disconnect().await;
        }
        // Fail any command still waiting for an ack.
        let mut pending = self.pending.lock().await;
        pending.clear();
    }

    async fn upload(&self, _bytes: &[u8], remote_name: &str) -> Result<(), AdapterError> {
        let base = self.artifact_base_url.as_deref().ok_or_else(|| {
            AdapterError::Protocol("artifact base url not configured for staged fetch".to_string())
        })?;
        self.send_acked(serde_json::json!({
            "print": {
                "command": "file_transfer",
                "url": format!("{}/{}", base.trim_end_matches('/'), remote_name),
                "file": remote_name,
            }
        }))
        .await
    }

    async fn start_print(
        &self,
        remote_name: &str,
        options: &StartOptions,
    ) -> Result<(), AdapterError> {
        let ams_mapping: Vec<i64> = options.slot_mapping.iter().map(|&s| s as i64).collect();
        self.send_acked(serde_json::json!({
            "print": {
                "command": "project_file",
                "param": "Metadata/plate_1.gcode",
                "subtask_name": remote_name,
                "url": format!("file:///sdcard/{remote_name}"),
                "bed_leveling": options.bed_leveling,
                "flow_cali": options.flow_calibration,
                "use_ams": !ams_mapping.is_empty(),
                "ams_mapping": ams_mapping,
            }
        }))
        .await
    }

    async fn control(&self, command: ControlCommand) -> Result<(), AdapterError> {
        let envelope = match command {
            ControlCommand::Pause => serde_json::json!({"print": {"command": "pause"}}),
            ControlCommand::Resume => serde_json::json!({"print": {"command": "resume"}}),
            ControlCommand::Stop => serde_json::json!({"print": {"command": "stop"}}),
            ControlCommand::SetFanSpeed(percent) => serde_json::json!({
                "print": {"command": "gcode_line", "param": format!("M106 P1 S{}", fan_pwm(percent))}
            }),
            ControlCommand::SetLights(on) => serde_json::json!({
                "system": {"command": "ledctrl", "led_node": "chamber_light",
                           "led_mode": if on { "on" } else { "off" }}
            }),
            ControlCommand::SkipObjects(ids) => serde_json::json!({
                "print": {"command": "skip_objects", "obj_list": ids}
            }),
        };
        self.send_acked(envelope).await
    }
}

fn fan_pwm(percent: u8) -> u32 {
    (percent.min(100) as u32 * 255) / 100
}

/// Reachability probe: TCP dial of the TLS port, no session bound.
pub async fn probe(coordinates: &Coordinates) -> Result<(), AdapterError> {
    coordinates.split_serial_access()?;
    let address = format!("{}:8883", coordinates.host);
    match tokio::time::timeout(Duration::from_secs(5), tokio::net::TcpStream::connect(&address))
        .await
    {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(AdapterError::Unreachable(e.to_string())),
        Err(_) => Err(AdapterError::TimedOut(Duration::from_secs(5))),
    }
}

struct EventLoopCtx {
    event_loop: rumqttc::EventLoop,
    client: AsyncClient,
    serial: String,
    report_topic: String,
    request_topic: String,
    sink: FrameSink,
    pending: PendingAcks,
    frame_seen: watch::Sender<bool>,
    shutdown: watch::Receiver<bool>,
}

async fn run_event_loop(mut ctx: EventLoopCtx) {
    let mut accumulated = serde_json::Value::Object(serde_json::Map::new());

    loop {
        if *ctx.shutdown.borrow() {
            return;
        }
        let event = tokio::select! {
            event = ctx.event_loop.poll() => event,
            _ = ctx.shutdown.changed() => return,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!(serial = %ctx.serial, "message-bus session established");
                if let Err(e) = ctx.client.subscribe(&ctx.report_topic, QoS::AtMostOnce).await {
                    tracing::warn!(serial = %ctx.serial, "subscribe failed: {e}");
                    continue;
                }
                // Ask for a full status push so the first frame is complete.
                let request = serde_json::json!({
                    "pushing": {"command": "pushall"},
                })
                .to_string();
                if let Err(e) = ctx
                    .client
                    .publish(&ctx.request_topic, QoS::AtMostOnce, false, request.into_bytes())
                    .await
                {
                    tracing::warn!(serial = %ctx.serial, "status request failed: {e}");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload: serde_json::Value = match serde_json::from_slice(&publish.payload) {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!(serial = %ctx.serial, "unparseable report payload: {e}");
                        continue;
                    }
                };

                resolve_acks(&ctx.pending, &payload).await;

                accumulated = deep_merge(accumulated, payload);
                let frame = project_frame(&accumulated);
                let _ = ctx.frame_seen.send(true);
                if ctx.sink.send(frame).await.is_err() {
                    // Session consumer gone; stop pumping.
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(serial = %ctx.serial, "transport error: {e}");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

/// Complete pending command acks from a report payload carrying a
/// `result` for a known sequence id.
async fn resolve_acks(pending: &PendingAcks, payload: &serde_json::Value) {
    for section in ["print", "system", "pushing"] {
        let Some(body) = payload.get(section) else { continue };
        let Some(sequence_id) = body.get("sequence_id").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(result) = body.get("result").and_then(|v| v.as_str()) else { continue };
        if let Some(ack) = pending.lock().await.remove(sequence_id) {
            let outcome = if result.eq_ignore_ascii_case("success") {
                Ok(())
            } else {
                Err(body
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or(result)
                    .to_string())
            };
            let _ = ack.send(outcome);
        }
    }
}

/// Merge an incremental report into the accumulated document. Objects
/// merge key-wise, everything else is replaced, with one quirk kept
/// from the field: a non-empty current file name is not clobbered by
/// an empty one.
fn deep_merge(mut base: serde_json::Value, incoming: serde_json::Value) -> serde_json::Value {
    match (&mut base, incoming) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(new_map)) => {
            for (key, value) in new_map {
                if key == "subtask_name"
                    && value.as_str().is_some_and(str::is_empty)
                    && base_map
                        .get(&key)
                        .and_then(|v| v.as_str())
                        .is_some_and(|s| !s.is_empty())
                {
                    continue;
                }
                match base_map.get_mut(&key) {
                    Some(existing) => {
                        *existing = deep_merge(existing.take(), value);
                    }
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
            base
        }
        (_, new_value) => new_value,
    }
}

fn parse_device_state(gcode_state: &str) -> Option<DeviceState> {
    match gcode_state.to_ascii_uppercase().as_str() {
        "IDLE" => Some(DeviceState::Idle),
        "PREPARE" | "SLICING" => Some(DeviceState::Prepare),
        "RUNNING" | "PRINTING" => Some(DeviceState::Running),
        "PAUSE" | "PAUSED" => Some(DeviceState::Paused),
        "FAILED" => Some(DeviceState::Failed),
        "FINISH" | "FINISHED" => Some(DeviceState::Finished),
        _ => None,
    }
}

/// Project the accumulated report document into a normalized frame.
fn project_frame(accumulated: &serde_json::Value) -> StatusFrame {
    let mut frame = StatusFrame::default();
    let Some(print) = accumulated.get("print") else {
        return frame;
    };

    frame.state = print
        .get("gcode_state")
        .and_then(|v| v.as_str())
        .and_then(parse_device_state);
    frame.bed_temp = print.get("bed_temper").and_then(|v| v.as_f64());
    frame.bed_target = print.get("bed_target_temper").and_then(|v| v.as_f64());
    frame.nozzle_temp = print.get("nozzle_temper").and_then(|v| v.as_f64());
    frame.nozzle_target = print.get("nozzle_target_temper").and_then(|v| v.as_f64());
    frame.fan_percent = print
        .get("cooling_fan_speed")
        .and_then(|v| v.as_str().map_or_else(|| v.as_u64(), |s| s.parse().ok()))
        .map(|gear| ((gear.min(15) * 100 + 7) / 15) as u8);
    frame.progress = print.get("mc_percent").and_then(|v| v.as_f64());
    frame.remaining_minutes = print.get("mc_remaining_time").and_then(|v| v.as_i64());
    frame.layer = print.get("layer_num").and_then(|v| v.as_i64());
    frame.total_layers = print.get("total_layer_num").and_then(|v| v.as_i64());
    frame.file_name = print
        .get("subtask_name")
        .and_then(|v| v.as_str())
        .filter(|name| !name.is_empty() && *name != "Unknown")
        .map(str::to_string);
    frame.slots = project_slots(print.get("ams"));
    frame.error_codes = project_errors(print);
    frame
}

fn project_slots(ams: Option<&serde_json::Value>) -> Vec<SlotReading> {
    let Some(units) = ams.and_then(|a| a.get("ams")).and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    let mut slots = Vec::new();
    for (unit_index, unit) in units.iter().enumerate() {
        let Some(trays) = unit.get("tray").and_then(|v| v.as_array()) else { continue };
        for tray in trays {
            let tray_index = tray
                .get("id")
                .and_then(|v| v.as_str().map_or_else(|| v.as_u64(), |s| s.parse().ok()))
                .unwrap_or(0);
            let slot = (unit_index as u64 * 4 + tray_index + 1).min(u8::MAX as u64) as u8;
            let material = tray
                .get("tray_type")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            // Device reports RRGGBBAA; keep the RGB part as #RRGGBB.
            let color_hex = tray
                .get("tray_color")
                .and_then(|v| v.as_str())
                .filter(|s| s.len() >= 6)
                .map(|s| format!("#{}", &s[..6].to_uppercase()));
            let remaining_pct = tray.get("remain").and_then(|v| v.as_f64()).filter(|p| *p >= 0.0);
            let rfid = tray
                .get("tag_uid")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty() && !s.chars().all(|c| c == '0'))
                .map(str::to_string);
            slots.push(SlotReading {
                slot,
                material,
                color_hex,
                remaining_pct,
                rfid,
            });
        }
    }
    slots
}

fn project_errors(print: &serde_json::Value) -> Vec<String> {
    let mut codes = Vec::new();
    if let Some(entries) = print.get("hms").and_then(|v| v.as_array()) {
        for entry in entries {
            let attr = entry.get("attr").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            let code = entry.get("code").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            if attr != 0 || code != 0 {
                codes.push(hms::format_code(attr, code));
            }
        }
    }
    if let Some(error) = print.get("print_error").and_then(|v| v.as_i64()) {
        if error > 0 {
            codes.push(format!("{:04X}_{:04X}", (error >> 16) & 0xFFFF, error & 0xFFFF));
        }
    }
    codes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_incremental_reports() {
        let base = serde_json::json!({"print": {"mc_percent": 10, "gcode_state": "RUNNING"}});
        let update = serde_json::json!({"print": {"mc_percent": 55}});
        let merged = deep_merge(base, update);
        assert_eq!(merged["print"]["mc_percent"], 55);
        assert_eq!(merged["print"]["gcode_state"], "RUNNING");
    }

    #[test]
    fn keeps_file_name_over_empty_update() {
        let base = serde_json::json!({"print": {"subtask_name": "bracket.3mf"}});
        let update = serde_json::json!({"print": {"subtask_name": ""}});
        let merged = deep_merge(base, update);
        assert_eq!(merged["print"]["subtask_name"], "bracket.3mf");
    }

    #[test]
    fn projects_running_frame() {
        let doc = serde_json::json!({"print": {
            "gcode_state": "RUNNING",
            "bed_temper": 60.0,
            "nozzle_temper": 219.5,
            "nozzle_target_temper": 220.0,
            "mc_percent": 42.0,
            "mc_remaining_time": 73,
            "layer_num": 57,
            "total_layer_num": 210,
            "subtask_name": "clip.3mf",
            "cooling_fan_speed": "15",
        }});
        let frame = project_frame(&doc);
        assert_eq!(frame.state, Some(DeviceState::Running));
        assert_eq!(frame.progress, Some(42.0));
        assert_eq!(frame.remaining_minutes, Some(73));
        assert_eq!(frame.file_name.as_deref(), Some("clip.3mf"));
        assert_eq!(frame.fan_percent, Some(100));
    }

    #[test]
    fn projects_ams_trays_to_global_slots() {
        let doc = serde_json::json!({"print": {"ams": {"ams": [
            {"tray": [
                {"id": "0", "tray_type": "PLA", "tray_color": "FF0000FF", "remain": 80,
                 "tag_uid": "A1B2C3D4"},
                {"id": "1", "tray_type": "PETG", "tray_color": "2563EBFF", "remain": 55,
                 "tag_uid": "0000000000000000"},
            ]},
            {"tray": [
                {"id": "0", "tray_type": "PLA", "tray_color": "1A1A1AFF", "remain": 12},
            ]},
        ]}}});
        let frame = project_frame(&doc);
        assert_eq!(frame.slots.len(), 3);
        assert_eq!(frame.slots[0].slot, 1);
        assert_eq!(frame.slots[0].color_hex.as_deref(), Some("#FF0000"));
        assert_eq!(frame.slots[0].rfid.as_deref(), Some("A1B2C3D4"));
        // All-zero tag uid means no RFID present.
        assert_eq!(frame.slots[1].rfid, None);
        // Second AMS unit starts at slot 5.
        assert_eq!(frame.slots[2].slot, 5);
    }

    #[test]
    fn formats_hms_codes_from_report_words() {
        let doc = serde_json::json!({"print": {
            "hms": [{"attr": 0x0300_0100u64, "code": 0x0001_0001u64}],
        }});
        let frame = project_frame(&doc);
        assert_eq!(frame.error_codes, vec!["0300_0100_0001_0001".to_string()]);
    }

    #[test]
    fn unknown_gcode_state_is_absent_not_guessed() {
        let doc = serde_json::json!({"print": {"gcode_state": "WAT"}});
        assert_eq!(project_frame(&doc).state, None);
    }
}
