//! Per-printer session supervision: one long-lived worker per active
//! printer that owns the adapter, pumps status frames into fleet state
//! and the bus, reconnects with jittered exponential backoff, and
//! watches liveness.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch, Mutex};

use crate::adapter::{self, Adapter, StatusFrame};
use crate::adapter::hms;
use crate::bus::EventBus;
use crate::config::Config;
use crate::db::printers::Printer;
use crate::db::Store;
use crate::events::Event;
use crate::fleet::FleetState;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const FRAME_CHANNEL_CAP: usize = 64;

struct SessionHandle {
    shutdown: watch::Sender<bool>,
    adapter: Arc<dyn Adapter>,
}

pub struct SessionManager {
    store: Store,
    fleet: Arc<FleetState>,
    bus: EventBus,
    config: Config,
    sessions: Mutex<HashMap<i64, SessionHandle>>,
}

impl SessionManager {
    pub fn new(store: Store, fleet: Arc<FleetState>, bus: EventBus, config: Config) -> Self {
        Self {
            store,
            fleet,
            bus,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn sessions for every active printer at service start.
    pub async fn start_all(&self) -> Result<(), sqlx::Error> {
        for printer in self.store.list_printers(true).await? {
            if let Err(e) = self.start(&printer).await {
                tracing::warn!(printer = %printer.name, "session not started: {e}");
            }
        }
        Ok(())
    }

    /// Start (or restart) the session for one printer.
    pub async fn start(&self, printer: &Printer) -> Result<(), anyhow::Error> {
        self.stop(printer.id).await;

        let Some(api_type) = printer.api_type() else {
            anyhow::bail!("unknown api_type {}", printer.api_type);
        };
        let coordinates = self.store.printer_coordinates(printer)?;
        let (frame_tx, frame_rx) = mpsc::channel::<StatusFrame>(FRAME_CHANNEL_CAP);
        let adapter: Arc<dyn Adapter> = Arc::from(adapter::for_api_type(
            api_type,
            coordinates,
            self.config.artifact_base_url.clone(),
            frame_tx,
        )?);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(
                printer.id,
                SessionHandle { shutdown: shutdown_tx, adapter: Arc::clone(&adapter) },
            );
        }

        let worker = SessionWorker {
            printer_id: printer.id,
            printer_name: printer.name.clone(),
            adapter,
            store: self.store.clone(),
            fleet: Arc::clone(&self.fleet),
            bus: self.bus.clone(),
            liveness: Duration::from_secs(self.config.liveness_secs.max(5) as u64),
        };
        tokio::spawn(worker.run(frame_rx, shutdown_rx));
        tracing::info!(printer = %printer.name, "session started");
        Ok(())
    }

    /// Stop a printer's session: deactivation, deletion, or hot config
    /// change (the supervisor re-spawns after the latter).
    pub async fn stop(&self, printer_id: i64) {
        let handle = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(&printer_id)
        };
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(true);
            handle.adapter.disconnect().await;
            self.fleet.remove(printer_id).await;
            tracing::info!(printer_id, "session stopped");
        }
    }

    pub async fn stop_all(&self) {
        let ids: Vec<i64> = {
            let sessions = self.sessions.lock().await;
            sessions.keys().copied().collect()
        };
        for id in ids {
            self.stop(id).await;
        }
    }

    /// The live adapter for a printer, for dispatch and control calls.
    pub async fn adapter(&self, printer_id: i64) -> Option<Arc<dyn Adapter>> {
        let sessions = self.sessions.lock().await;
        sessions.get(&printer_id).map(|handle| Arc::clone(&handle.adapter))
    }

    /// Register an adapter without spawning a worker, for tests that
    /// drive dispatch against a scripted transport.
    #[cfg(test)]
    pub(crate) async fn insert_adapter(&self, printer_id: i64, adapter: Arc<dyn Adapter>) {
        let (shutdown, _) = watch::channel(false);
        let mut sessions = self.sessions.lock().await;
        sessions.insert(printer_id, SessionHandle { shutdown, adapter });
    }
}

struct SessionWorker {
    printer_id: i64,
    printer_name: String,
    adapter: Arc<dyn Adapter>,
    store: Store,
    fleet: Arc<FleetState>,
    bus: EventBus,
    liveness: Duration,
}

impl SessionWorker {
    async fn run(
        self,
        mut frames: mpsc::Receiver<StatusFrame>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                return;
            }

            match self.adapter.connect().await {
                Ok(()) => {
                    attempt = 0;
                    let _ = self.store.record_printer_error(self.printer_id, None).await;
                    self.bus.publish(Event::PrinterConnected { printer_id: self.printer_id });

                    let lost = self.pump_frames(&mut frames, &mut shutdown).await;
                    self.adapter.disconnect().await;
                    if !lost {
                        // Shutdown requested.
                        return;
                    }
                    self.bus.publish(Event::PrinterDisconnected { printer_id: self.printer_id });
                }
                Err(e) => {
                    tracing::warn!(printer = %self.printer_name, "connect failed: {e}");
                    let _ = self
                        .store
                        .record_printer_error(self.printer_id, Some(&e.to_string()))
                        .await;
                }
            }

            // Jittered exponential backoff; never gives up while the
            // printer stays active.
            let delay = backoff_delay(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Pump frames until shutdown (false) or liveness loss (true).
    async fn pump_frames(
        &self,
        frames: &mut mpsc::Receiver<StatusFrame>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            tokio::select! {
                frame = frames.recv() => {
                    match frame {
                        Some(frame) => self.apply_frame(frame).await,
                        // Adapter dropped its sink: treat as lost.
                        None => return true,
                    }
                }
                _ = tokio::time::sleep(self.liveness) => {
                    tracing::warn!(printer = %self.printer_name, "no frame within liveness window");
                    let _ = self
                        .store
                        .record_printer_error(self.printer_id, Some("liveness timeout"))
                        .await;
                    return true;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
    }

    async fn apply_frame(&self, frame: StatusFrame) {
        let _snapshot = self.fleet.apply_frame(self.printer_id, &frame).await;

        if let Err(e) = self
            .store
            .record_telemetry(
                self.printer_id,
                frame.bed_temp,
                frame.nozzle_temp,
                frame.bed_target,
                frame.nozzle_target,
                frame.fan_percent.map(|f| f as i64),
            )
            .await
        {
            tracing::debug!(printer = %self.printer_name, "telemetry write failed: {e}");
        }

        self.record_error_codes(&frame).await;

        self.bus.publish(Event::PrinterStateChanged {
            printer_id: self.printer_id,
            frame,
        });
    }

    /// Decode and persist new device error codes, deduping repeats of
    /// the most recent one.
    async fn record_error_codes(&self, frame: &StatusFrame) {
        if frame.error_codes.is_empty() {
            return;
        }
        let last = self
            .store
            .last_hms_code(self.printer_id)
            .await
            .ok()
            .flatten();
        for code in &frame.error_codes {
            if last.as_deref() == Some(code.as_str()) {
                continue;
            }
            let decoded = hms::decode(code);
            if let Err(e) = self
                .store
                .record_hms_event(self.printer_id, &decoded.code, &decoded.message, decoded.severity)
                .await
            {
                tracing::debug!(printer = %self.printer_name, "hms write failed: {e}");
            }
            self.bus.publish(Event::PrinterHmsCode {
                printer_id: self.printer_id,
                code: decoded.code.clone(),
                message: decoded.message.clone(),
                severity: decoded.severity,
            });
        }
    }
}

/// base * 2^attempt, capped, with ±20% jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let exponential = BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(attempt.min(6)))
        .min(BACKOFF_CAP);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    exponential.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_to_cap_with_jitter_bounds() {
        for attempt in 0..12 {
            let delay = backoff_delay(attempt);
            assert!(delay >= Duration::from_millis(800), "attempt {attempt}: {delay:?}");
            assert!(delay <= Duration::from_secs(72), "attempt {attempt}: {delay:?}");
        }
        // Attempt 0 stays near the one-second base.
        let first = backoff_delay(0);
        assert!(first <= Duration::from_millis(1200));
        // Deep attempts land near the cap.
        let late = backoff_delay(11);
        assert!(late >= Duration::from_secs(48));
    }
}
