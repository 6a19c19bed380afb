//! JSON-over-HTTP vendor driver: polls the printer's object query
//! endpoint on a fixed cadence and projects the response into status
//! frames. Uploads are multipart POSTs; control goes through the
//! print and gcode script endpoints.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};

use crate::adapter::{
    Adapter, ControlCommand, Coordinates, DeviceState, FrameSink, StartOptions, StatusFrame,
};
use crate::error::AdapterError;

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const CONNECT_DEADLINE: Duration = Duration::from_secs(10);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct MoonrakerAdapter {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
    sink: FrameSink,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    frame_seen: watch::Sender<bool>,
}

impl MoonrakerAdapter {
    pub fn new(coordinates: Coordinates, sink: FrameSink) -> Self {
        let (frame_seen, _) = watch::channel(false);
        Self {
            base_url: base_url(&coordinates.host),
            api_key: Some(coordinates.credentials)
                .filter(|c| !c.is_empty()),
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
            sink,
            shutdown: Mutex::new(None),
            frame_seen,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.header("X-Api-Key", key);
        }
        builder
    }

    async fn post_ok(&self, path: &str) -> Result<(), AdapterError> {
        let response = self
            .request(reqwest::Method::POST, path)
            .send()
            .await
            .map_err(map_transport_error)?;
        check_status(response).await.map(|_| ())
    }
}

#[async_trait]
impl Adapter for MoonrakerAdapter {
    async fn connect(&self) -> Result<(), AdapterError> {
        {
            let shutdown = self.shutdown.lock().await;
            if shutdown.is_some() {
                return Ok(());
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let _ = self.frame_seen.send(false);
        tokio::spawn(poll_loop(
            self.base_url.clone(),
            self.api_key.clone(),
            self.http.clone(),
            self.sink.clone(),
            self.frame_seen.clone(),
            shutdown_rx,
        ));
        *self.shutdown.lock().await = Some(shutdown_tx);

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
        if let Some(shutdown) = self.shutdown.lock().await.take() {
            let _ = shutdown.send(true);
        }
    }

    async fn upload(&self, bytes: &[u8], remote_name: &str) -> Result<(), AdapterError> {
        let part = reqwest::multipart::Part::bytes(bytes.to_vec())
            .file_name(remote_name.to_string())
            .mime_str("application/octet-stream")
            .map_err(|e| AdapterError::Protocol(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("root", "gcodes")
            .part("file", part);

        let response = self
            .request(reqwest::Method::POST, "/server/files/upload")
            .multipart(form)
            .send()
            .await
            .map_err(map_transport_error)?;
        check_status(response).await.map(|_| ())
    }

    async fn start_print(
        &self,
        remote_name: &str,
        _options: &StartOptions,
    ) -> Result<(), AdapterError> {
        self.post_ok(&format!("/printer/print/start?filename={remote_name}"))
            .await
    }

    async fn control(&self, command: ControlCommand) -> Result<(), AdapterError> {
        match command {
            ControlCommand::Pause => self.post_ok("/printer/print/pause").await,
            ControlCommand::Resume => self.post_ok("/printer/print/resume").await,
            ControlCommand::Stop => self.post_ok("/printer/print/cancel").await,
            ControlCommand::SetFanSpeed(percent) => {
                let pwm = (percent.min(100) as u32 * 255) / 100;
                self.post_ok(&format!("/printer/gcode/script?script=M106 S{pwm}")).await
            }
            ControlCommand::SetLights(on) => {
                let value = if on { 1 } else { 0 };
                self.post_ok(&format!(
                    "/printer/gcode/script?script=SET_PIN PIN=caselight VALUE={value}"
                ))
                .await
            }
            ControlCommand::SkipObjects(ids) => {
                for id in ids {
                    self.post_ok(&format!(
                        "/printer/gcode/script?script=EXCLUDE_OBJECT NAME=object_{id}"
                    ))
                    .await?;
                }
                Ok(())
            }
        }
    }
}

/// Reachability probe against `/printer/info`.
pub async fn probe(coordinates: &Coordinates) -> Result<(), AdapterError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_default();
    let mut builder = client.get(format!("{}/printer/info", base_url(&coordinates.host)));
    if !coordinates.credentials.is_empty() {
        builder = builder.header("X-Api-Key", &coordinates.credentials);
    }
    let response = builder.send().await.map_err(map_transport_error)?;
    check_status(response).await.map(|_| ())
}

fn base_url(host: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        host.trim_end_matches('/').to_string()
    } else {
        format!("http://{host}")
    }
}

fn map_transport_error(e: reqwest::Error) -> AdapterError {
    if e.is_timeout() {
        AdapterError::TimedOut(HTTP_TIMEOUT)
    } else {
        AdapterError::Unreachable(e.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AdapterError> {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(AdapterError::AuthRejected);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AdapterError::Rejected(format!("{status}: {body}")));
    }
    Ok(response)
}

async fn poll_loop(
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
    sink: FrameSink,
    frame_seen: watch::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let query = "/printer/objects/query?print_stats&heater_bed&extruder&display_status&fan";
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }
        if *shutdown.borrow() {
            return;
        }

        let mut request = http.get(format!("{base_url}{query}"));
        if let Some(key) = &api_key {
            request = request.header("X-Api-Key", key);
        }
        let payload = match request.send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<serde_json::Value>().await {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!(%base_url, "bad poll payload: {e}");
                        continue;
                    }
                }
            }
            Ok(response) => {
                tracing::warn!(%base_url, status = %response.status(), "poll rejected");
                continue;
            }
            Err(e) => {
                tracing::debug!(%base_url, "poll failed: {e}");
                continue;
            }
        };

        let frame = project_frame(&payload);
        let _ = frame_seen.send(true);
        if sink.send(frame).await.is_err() {
            return;
        }
    }
}

fn parse_device_state(state: &str) -> Option<DeviceState> {
    match state {
        "standby" | "cancelled" => Some(DeviceState::Idle),
        "printing" => Some(DeviceState::Running),
        "paused" => Some(DeviceState::Paused),
        "complete" => Some(DeviceState::Finished),
        "error" => Some(DeviceState::Failed),
        _ => None,
    }
}

fn project_frame(payload: &serde_json::Value) -> StatusFrame {
    let mut frame = StatusFrame::default();
    let Some(status) = payload.pointer("/result/status") else {
        return frame;
    };

    let print_stats = &status["print_stats"];
    frame.state = print_stats
        .get("state")
        .and_then(|v| v.as_str())
        .and_then(parse_device_state);
    frame.file_name = print_stats
        .get("filename")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    frame.layer = print_stats.pointer("/info/current_layer").and_then(|v| v.as_i64());
    frame.total_layers = print_stats.pointer("/info/total_layer").and_then(|v| v.as_i64());

    frame.bed_temp = status.pointer("/heater_bed/temperature").and_then(|v| v.as_f64());
    frame.bed_target = status.pointer("/heater_bed/target").and_then(|v| v.as_f64());
    frame.nozzle_temp = status.pointer("/extruder/temperature").and_then(|v| v.as_f64());
    frame.nozzle_target = status.pointer("/extruder/target").and_then(|v| v.as_f64());
    frame.fan_percent = status
        .pointer("/fan/speed")
        .and_then(|v| v.as_f64())
        .map(|speed| (speed.clamp(0.0, 1.0) * 100.0).round() as u8);

    let progress = status.pointer("/display_status/progress").and_then(|v| v.as_f64());
    frame.progress = progress.map(|p| (p * 100.0).clamp(0.0, 100.0));

    // The vendor reports elapsed seconds, not remaining; derive the
    // remainder from progress when both are present and meaningful.
    if let (Some(p), Some(elapsed)) = (
        progress.filter(|p| *p > 0.01),
        print_stats.get("print_duration").and_then(|v| v.as_f64()),
    ) {
        let total = elapsed / p;
        frame.remaining_minutes = Some(((total - elapsed) / 60.0).max(0.0).round() as i64);
    }

    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poll_payload() -> serde_json::Value {
        serde_json::json!({"result": {"status": {
            "print_stats": {
                "state": "printing",
                "filename": "bracket.gcode",
                "print_duration": 1800.0,
                "info": {"current_layer": 40, "total_layer": 160},
            },
            "heater_bed": {"temperature": 59.8, "target": 60.0},
            "extruder": {"temperature": 214.9, "target": 215.0},
            "display_status": {"progress": 0.25},
            "fan": {"speed": 0.8},
        }}})
    }

    #[test]
    fn projects_poll_response() {
        let frame = project_frame(&poll_payload());
        assert_eq!(frame.state, Some(DeviceState::Running));
        assert_eq!(frame.file_name.as_deref(), Some("bracket.gcode"));
        assert_eq!(frame.progress, Some(25.0));
        assert_eq!(frame.fan_percent, Some(80));
        // 1800s elapsed at 25% leaves 5400s.
        assert_eq!(frame.remaining_minutes, Some(90));
        assert_eq!(frame.layer, Some(40));
    }

    #[test]
    fn cancelled_maps_to_idle() {
        let mut payload = poll_payload();
        payload["result"]["status"]["print_stats"]["state"] = "cancelled".into();
        assert_eq!(project_frame(&payload).state, Some(DeviceState::Idle));
    }

    #[test]
    fn missing_sections_leave_fields_unknown() {
        let frame = project_frame(&serde_json::json!({"result": {"status": {}}}));
        assert_eq!(frame.state, None);
        assert_eq!(frame.bed_temp, None);
        assert_eq!(frame.remaining_minutes, None);
    }

    #[test]
    fn host_gets_scheme_prefixed() {
        assert_eq!(base_url("192.168.1.20"), "http://192.168.1.20");
        assert_eq!(base_url("https://voron.local/"), "https://voron.local");
    }
}
