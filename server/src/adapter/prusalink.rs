//! File-upload-via-session vendor driver: api-key authenticated HTTP,
//! status polled from `/api/v1/status`, artifacts PUT directly to the
//! device storage, printing started by re-referencing the stored file.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};

use crate::adapter::{
    Adapter, ControlCommand, Coordinates, DeviceState, FrameSink, StartOptions, StatusFrame,
};
use crate::error::AdapterError;

const POLL_INTERVAL: Duration = Duration::from_secs(3);
const CONNECT_DEADLINE: Duration = Duration::from_secs(10);
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

pub struct PrusalinkAdapter {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
    sink: FrameSink,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    frame_seen: watch::Sender<bool>,
}

impl PrusalinkAdapter {
    pub fn new(coordinates: Coordinates, sink: FrameSink) -> Self {
        let (frame_seen, _) = watch::channel(false);
        Self {
            base_url: base_url(&coordinates.host),
            api_key: coordinates.credentials,
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
            sink,
            shutdown: Mutex::new(None),
            frame_seen,
        }
    }

    async fn job_id(&self) -> Result<Option<i64>, AdapterError> {
        let response = self
            .http
            .get(format!("{}/api/v1/status", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await
            .map_err(map_transport_error)?;
        let payload: serde_json::Value = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| AdapterError::Protocol(e.to_string()))?;
        Ok(payload.pointer("/job/id").and_then(|v| v.as_i64()))
    }

    async fn job_action(&self, action: &str) -> Result<(), AdapterError> {
        let Some(job_id) = self.job_id().await? else {
            return Err(AdapterError::Rejected("no active job".to_string()));
        };
        let response = self
            .http
            .put(format!("{}/api/v1/job/{job_id}/{action}", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await
            .map_err(map_transport_error)?;
        check_status(response).await.map(|_| ())
    }
}

#[async_trait]
impl Adapter for PrusalinkAdapter {
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
        let response = self
            .http
            .put(format!("{}/api/v1/files/usb/{remote_name}", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .header("Content-Type", "application/octet-stream")
            .header("Overwrite", "?1")
            .body(bytes.to_vec())
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
        let response = self
            .http
            .post(format!("{}/api/v1/files/usb/{remote_name}", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await
            .map_err(map_transport_error)?;
        check_status(response).await.map(|_| ())
    }

    async fn control(&self, command: ControlCommand) -> Result<(), AdapterError> {
        match command {
            ControlCommand::Pause => self.job_action("pause").await,
            ControlCommand::Resume => self.job_action("resume").await,
            ControlCommand::Stop => {
                let Some(job_id) = self.job_id().await? else {
                    return Err(AdapterError::Rejected("no active job".to_string()));
                };
                let response = self
                    .http
                    .delete(format!("{}/api/v1/job/{job_id}", self.base_url))
                    .header("X-Api-Key", &self.api_key)
                    .send()
                    .await
                    .map_err(map_transport_error)?;
                check_status(response).await.map(|_| ())
            }
            // This vendor exposes no fan, light, or object-skip control.
            ControlCommand::SetFanSpeed(_)
            | ControlCommand::SetLights(_)
            | ControlCommand::SkipObjects(_) => {
                Err(AdapterError::Rejected("unsupported on this vendor".to_string()))
            }
        }
    }
}

/// Reachability probe against `/api/v1/status`.
pub async fn probe(coordinates: &Coordinates) -> Result<(), AdapterError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_default();
    let response = client
        .get(format!("{}/api/v1/status", base_url(&coordinates.host)))
        .header("X-Api-Key", &coordinates.credentials)
        .send()
        .await
        .map_err(map_transport_error)?;
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
    api_key: String,
    http: reqwest::Client,
    sink: FrameSink,
    frame_seen: watch::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
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

        let request = http
            .get(format!("{base_url}/api/v1/status"))
            .header("X-Api-Key", &api_key);
        let payload = match request.send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<serde_json::Value>().await {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!(%base_url, "bad status payload: {e}");
                        continue;
                    }
                }
            }
            Ok(response) => {
                tracing::warn!(%base_url, status = %response.status(), "status poll rejected");
                continue;
            }
            Err(e) => {
                tracing::debug!(%base_url, "status poll failed: {e}");
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
    match state.to_ascii_uppercase().as_str() {
        "IDLE" | "READY" | "STOPPED" => Some(DeviceState::Idle),
        "BUSY" | "ATTENTION" => Some(DeviceState::Prepare),
        "PRINTING" => Some(DeviceState::Running),
        "PAUSED" => Some(DeviceState::Paused),
        "ERROR" => Some(DeviceState::Failed),
        "FINISHED" => Some(DeviceState::Finished),
        _ => None,
    }
}

fn project_frame(payload: &serde_json::Value) -> StatusFrame {
    let mut frame = StatusFrame::default();
    let printer = &payload["printer"];

    frame.state = printer
        .get("state")
        .and_then(|v| v.as_str())
        .and_then(parse_device_state);
    frame.bed_temp = printer.get("temp_bed").and_then(|v| v.as_f64());
    frame.bed_target = printer.get("target_bed").and_then(|v| v.as_f64());
    frame.nozzle_temp = printer.get("temp_nozzle").and_then(|v| v.as_f64());
    frame.nozzle_target = printer.get("target_nozzle").and_then(|v| v.as_f64());
    frame.fan_percent = printer
        .get("fan_print")
        .and_then(|v| v.as_f64())
        .map(|rpm| ((rpm / 8500.0) * 100.0).clamp(0.0, 100.0).round() as u8);

    if let Some(job) = payload.get("job").filter(|j| !j.is_null()) {
        frame.progress = job.get("progress").and_then(|v| v.as_f64());
        frame.remaining_minutes = job
            .get("time_remaining")
            .and_then(|v| v.as_f64())
            .map(|secs| (secs / 60.0).round() as i64);
        frame.file_name = job
            .pointer("/file/display_name")
            .or_else(|| job.pointer("/file/name"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
    }

    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projects_printing_status() {
        let payload = serde_json::json!({
            "printer": {"state": "PRINTING", "temp_bed": 60.1, "target_bed": 60.0,
                        "temp_nozzle": 214.8, "target_nozzle": 215.0, "fan_print": 4250.0},
            "job": {"id": 9, "progress": 37.5, "time_remaining": 5400,
                    "file": {"name": "mount.gcode", "display_name": "mount.gcode"}},
        });
        let frame = project_frame(&payload);
        assert_eq!(frame.state, Some(DeviceState::Running));
        assert_eq!(frame.progress, Some(37.5));
        assert_eq!(frame.remaining_minutes, Some(90));
        assert_eq!(frame.file_name.as_deref(), Some("mount.gcode"));
        assert_eq!(frame.fan_percent, Some(50));
    }

    #[test]
    fn idle_status_has_no_job() {
        let payload = serde_json::json!({"printer": {"state": "IDLE", "temp_bed": 24.0}});
        let frame = project_frame(&payload);
        assert_eq!(frame.state, Some(DeviceState::Idle));
        assert_eq!(frame.progress, None);
        assert_eq!(frame.file_name, None);
    }

    #[test]
    fn attention_maps_to_prepare() {
        let payload = serde_json::json!({"printer": {"state": "ATTENTION"}});
        assert_eq!(project_frame(&payload).state, Some(DeviceState::Prepare));
    }
}
