//! Dispatcher: converts a scheduled assignment into hardware action
//! (upload with retries, start, confirm via observed state) and
//! reconciles job state from what the fleet actually reports.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::adapter::{ControlCommand, DeviceState, StartOptions};
use crate::adapter::hms;
use crate::bus::EventBus;
use crate::db::jobs::{Job, JobStatus};
use crate::db::models::Artifact;
use crate::db::prints::PrintStatus;
use crate::db::Store;
use crate::error::{AdapterError, DispatchError};
use crate::events::Event;
use crate::filament::FilamentAccounting;
use crate::fleet::FleetState;
use crate::locks::LockMap;
use crate::session::SessionManager;

const UPLOAD_RETRY_DELAYS: [Duration; 3] =
    [Duration::from_secs(2), Duration::from_secs(6), Duration::from_secs(18)];
const START_CONFIRM_DEADLINE: Duration = Duration::from_secs(30);
const START_CONFIRM_POLL: Duration = Duration::from_millis(500);
const CANCEL_CONFIRM_DEADLINE: Duration = Duration::from_secs(30);

pub struct Dispatcher {
    store: Store,
    fleet: Arc<FleetState>,
    bus: EventBus,
    sessions: Arc<SessionManager>,
    accounting: Arc<FilamentAccounting>,
    job_locks: Arc<LockMap>,
}

impl Dispatcher {
    pub fn new(
        store: Store,
        fleet: Arc<FleetState>,
        bus: EventBus,
        sessions: Arc<SessionManager>,
        accounting: Arc<FilamentAccounting>,
    ) -> Self {
        Self {
            store,
            fleet,
            bus,
            sessions,
            accounting,
            job_locks: Arc::new(LockMap::new()),
        }
    }

    /// Move one scheduled job onto its printer. `force` overrides the
    /// advisory compatibility check.
    pub async fn dispatch_job(&self, job_id: i64, force: bool) -> Result<(), DispatchError> {
        let _guard = self.job_locks.acquire(job_id).await;

        let job = self
            .store
            .find_job(job_id)
            .await?
            .ok_or(DispatchError::JobNotFound(job_id))?;
        if job.status != JobStatus::Scheduled {
            return Err(DispatchError::NotScheduled {
                job_id,
                status: job.status.as_str().to_string(),
            });
        }
        let printer_id = job.printer_id.ok_or(DispatchError::NoPrinter(job_id))?;
        let printer = self.store.get_printer(printer_id).await?;

        let artifact = self
            .resolve_artifact(&job)
            .await?
            .ok_or(DispatchError::NoArtifact(job_id))?;

        if let Err(reason) = check_compatibility(&artifact, &printer) {
            if force {
                tracing::warn!(job_id, "compatibility override: {reason}");
            } else {
                return Err(DispatchError::Incompatible(reason));
            }
        }

        let adapter = self
            .sessions
            .adapter(printer_id)
            .await
            .ok_or_else(|| AdapterError::Unreachable("no live session for printer".to_string()))?;

        let bytes = tokio::fs::read(&artifact.file_path).await.map_err(|e| {
            DispatchError::Adapter(AdapterError::Protocol(format!(
                "artifact unreadable at {}: {e}",
                artifact.file_path
            )))
        })?;

        // Upload with fixed backoff; the last failure marks the job.
        let remote_name = artifact.file_name.clone();
        let mut last_error = None;
        let mut uploaded = false;
        for (attempt, delay) in UPLOAD_RETRY_DELAYS.iter().enumerate() {
            match adapter.upload(&bytes, &remote_name).await {
                Ok(()) => {
                    uploaded = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(job_id, attempt = attempt + 1, "upload failed: {e}");
                    last_error = Some(e);
                    if attempt + 1 < UPLOAD_RETRY_DELAYS.len() {
                        tokio::time::sleep(*delay).await;
                    }
                }
            }
        }
        if !uploaded {
            let source = last_error
                .unwrap_or_else(|| AdapterError::Unreachable("upload never attempted".to_string()));
            self.store
                .fail_job(job_id, Some("other"), Some("upload failed after retries"))
                .await?;
            self.bus.publish(Event::JobFailed {
                job_id,
                printer_id: Some(printer_id),
                reason: "upload failed".to_string(),
            });
            return Err(DispatchError::UploadFailed {
                attempts: UPLOAD_RETRY_DELAYS.len() as u32,
                source,
            });
        }
        self.store
            .log_audit(
                "job.upload_succeeded",
                "job",
                job_id,
                Some(serde_json::json!({"printer_id": printer_id, "file": remote_name})),
                None,
            )
            .await;

        adapter.start_print(&remote_name, &StartOptions::default()).await?;

        // Accepted only once an observed frame shows the print live.
        if !self.await_start_confirmation(printer_id, &remote_name).await {
            self.store
                .fail_job(job_id, Some("other"), Some("print start not confirmed"))
                .await?;
            self.bus.publish(Event::JobFailed {
                job_id,
                printer_id: Some(printer_id),
                reason: "start timeout".to_string(),
            });
            return Err(DispatchError::StartTimeout(START_CONFIRM_DEADLINE));
        }

        if self.store.mark_job_printing(job_id).await?.is_none() {
            // Raced with a cancel between upload and confirmation.
            return Err(DispatchError::NotScheduled {
                job_id,
                status: "moved during dispatch".to_string(),
            });
        }
        self.store
            .start_print_record(printer_id, Some(job_id), &remote_name)
            .await?;
        self.bus.publish(Event::JobStarted { job_id, printer_id });
        tracing::info!(job_id, printer_id, file = %remote_name, "job dispatched");
        Ok(())
    }

    /// Dispatch every scheduled job whose window has opened.
    pub async fn dispatch_due(&self) {
        let due = match self.store.scheduled_jobs_due(Utc::now()).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!("due-job query failed: {e}");
                return;
            }
        };
        for job in due {
            if let Err(e) = self.dispatch_job(job.id, false).await {
                tracing::warn!(job_id = job.id, "dispatch failed: {e}");
            }
        }
    }

    /// Cancel a job in any cancellable state.
    pub async fn cancel(&self, job_id: i64) -> Result<(), DispatchError> {
        let _guard = self.job_locks.acquire(job_id).await;
        let job = self
            .store
            .find_job(job_id)
            .await?
            .ok_or(DispatchError::JobNotFound(job_id))?;

        match job.status {
            JobStatus::Pending | JobStatus::Scheduled => {
                self.store.cancel_job_record(job_id).await?;
                Ok(())
            }
            JobStatus::Printing => {
                let printer_id = job.printer_id.ok_or(DispatchError::NoPrinter(job_id))?;
                let adapter = self.sessions.adapter(printer_id).await.ok_or_else(|| {
                    AdapterError::Unreachable("no live session for printer".to_string())
                })?;
                adapter.control(ControlCommand::Stop).await?;

                // Cancelled only once the device confirms idle.
                let deadline = tokio::time::Instant::now() + CANCEL_CONFIRM_DEADLINE;
                loop {
                    if tokio::time::Instant::now() > deadline {
                        return Err(DispatchError::StartTimeout(CANCEL_CONFIRM_DEADLINE));
                    }
                    if let Some(snapshot) = self.fleet.snapshot(printer_id).await {
                        if matches!(
                            snapshot.state,
                            Some(DeviceState::Idle) | Some(DeviceState::Finished)
                                | Some(DeviceState::Failed)
                        ) {
                            break;
                        }
                    }
                    tokio::time::sleep(START_CONFIRM_POLL).await;
                }
                self.store.cancel_printing_job(job_id).await?;
                if let Some(record) = self.store.open_print_record(printer_id).await? {
                    self.store
                        .close_print_record(record.id, PrintStatus::Cancelled)
                        .await?;
                }
                Ok(())
            }
            _ => Err(DispatchError::NotScheduled {
                job_id,
                status: job.status.as_str().to_string(),
            }),
        }
    }

    async fn resolve_artifact(&self, job: &Job) -> Result<Option<Artifact>, sqlx::Error> {
        if let Some(artifact_id) = job.artifact_id {
            return self.store.find_artifact(artifact_id).await;
        }
        if let Some(model_id) = job.model_id {
            if let Some(model) = self.store.find_model(model_id).await? {
                if let Some(artifact_id) = model.artifact_id {
                    return self.store.find_artifact(artifact_id).await;
                }
            }
        }
        Ok(None)
    }

    async fn await_start_confirmation(&self, printer_id: i64, remote_name: &str) -> bool {
        let deadline = tokio::time::Instant::now() + START_CONFIRM_DEADLINE;
        while tokio::time::Instant::now() <= deadline {
            if let Some(snapshot) = self.fleet.snapshot(printer_id).await {
                if snapshot.is_printing() {
                    let file_matches = snapshot
                        .current_print()
                        .and_then(|print| print.file_name.as_deref())
                        .map(|name| file_names_match(name, remote_name))
                        // A frame without a file name still confirms.
                        .unwrap_or(true);
                    if file_matches {
                        return true;
                    }
                }
            }
            tokio::time::sleep(START_CONFIRM_POLL).await;
        }
        false
    }

    /// Bus subscriber loop: reconcile job and print-record state from
    /// observed printer frames.
    pub async fn run_reconciler(self: Arc<Self>, mut subscription: crate::bus::Subscription) {
        while let Some(event) = subscription.recv().await {
            let Event::PrinterStateChanged { printer_id, frame } = event else {
                continue;
            };
            if let Err(e) = self.reconcile_frame(printer_id, &frame).await {
                tracing::warn!(printer_id, "reconciliation failed: {e}");
            }
        }
    }

    async fn reconcile_frame(
        &self,
        printer_id: i64,
        frame: &crate::adapter::StatusFrame,
    ) -> Result<(), sqlx::Error> {
        match frame.state {
            Some(DeviceState::Running) | Some(DeviceState::Prepare) => {
                self.track_running_print(printer_id, frame).await?;
            }
            Some(DeviceState::Finished) => {
                self.settle_prints(printer_id, frame, PrintStatus::Completed).await?;
            }
            Some(DeviceState::Failed) => {
                self.settle_prints(printer_id, frame, PrintStatus::Failed).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Keep an open PrintRecord for whatever the device reports as
    /// running; foreign prints get an unlinked record.
    async fn track_running_print(
        &self,
        printer_id: i64,
        frame: &crate::adapter::StatusFrame,
    ) -> Result<(), sqlx::Error> {
        let file_name = frame.file_name.clone().unwrap_or_else(|| "unknown".to_string());

        let record = match self.store.open_print_record(printer_id).await? {
            Some(record) if file_names_match(&record.file_name, &file_name) => record,
            Some(stale) => {
                // Device moved on to a different print without a clean
                // terminal frame for the previous one.
                self.store.close_print_record(stale.id, PrintStatus::Failed).await?;
                let job_id = self.match_job(printer_id, &file_name).await?;
                self.store.start_print_record(printer_id, job_id, &file_name).await?
            }
            None => {
                let job_id = self.match_job(printer_id, &file_name).await?;
                self.store.start_print_record(printer_id, job_id, &file_name).await?
            }
        };

        self.store
            .update_print_progress(
                record.id,
                frame.progress,
                frame.remaining_minutes,
                frame.layer,
                frame.total_layers,
            )
            .await
    }

    /// Terminal frame observed: close the open record and settle any
    /// matching printing job, including filament deduction.
    async fn settle_prints(
        &self,
        printer_id: i64,
        frame: &crate::adapter::StatusFrame,
        outcome: PrintStatus,
    ) -> Result<(), sqlx::Error> {
        if let Some(record) = self.store.open_print_record(printer_id).await? {
            self.store.close_print_record(record.id, outcome).await?;
        }

        let file_name = frame.file_name.as_deref();
        let candidates = self.store.printing_jobs_on(printer_id).await?;
        let matched: Vec<Job> = match (file_name, candidates.len()) {
            (_, 0) => Vec::new(),
            // A single in-flight job matches regardless of name.
            (_, 1) => candidates,
            (Some(name), _) => candidates
                .into_iter()
                .filter(|job| self.job_matches_file(job, name))
                .collect(),
            (None, _) => Vec::new(),
        };

        for job in matched {
            let _guard = self.job_locks.acquire(job.id).await;
            match outcome {
                PrintStatus::Completed => {
                    // The guard on `printing` makes a repeated terminal
                    // frame a no-op, so deduction runs exactly once.
                    if let Some(job) = self.store.complete_job(job.id).await? {
                        self.accounting.deduct_for_job(&job).await?;
                        if let (Some(start), Some(end)) = (job.actual_start, job.actual_end) {
                            let hours = (end - start).num_seconds().max(0) as f64 / 3600.0;
                            self.store.add_printer_usage(printer_id, hours).await?;
                        }
                        self.bus.publish(Event::JobCompleted {
                            job_id: job.id,
                            printer_id: Some(printer_id),
                        });
                        tracing::info!(job_id = job.id, printer_id, "job completed");
                    }
                }
                PrintStatus::Failed => {
                    let reason = frame
                        .error_codes
                        .first()
                        .map(|code| fail_reason_for_code(code))
                        .unwrap_or("other");
                    let notes = frame
                        .error_codes
                        .first()
                        .map(|code| hms::decode(code).message);
                    if self
                        .store
                        .fail_job(job.id, Some(reason), notes.as_deref())
                        .await?
                        .is_some()
                    {
                        self.bus.publish(Event::JobFailed {
                            job_id: job.id,
                            printer_id: Some(printer_id),
                            reason: reason.to_string(),
                        });
                        tracing::warn!(job_id = job.id, printer_id, reason, "job failed");
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn match_job(
        &self,
        printer_id: i64,
        file_name: &str,
    ) -> Result<Option<i64>, sqlx::Error> {
        let printing = self.store.printing_jobs_on(printer_id).await?;
        if printing.len() == 1 {
            return Ok(Some(printing[0].id));
        }
        Ok(printing
            .iter()
            .find(|job| self.job_matches_file(job, file_name))
            .map(|job| job.id))
    }

    fn job_matches_file(&self, job: &Job, file_name: &str) -> bool {
        file_names_match(&job.item_name, file_name)
    }
}

/// Advisory compatibility: printer-model tag intersection plus bed fit.
fn check_compatibility(
    artifact: &Artifact,
    printer: &crate::db::printers::Printer,
) -> Result<(), String> {
    let tags = artifact.compatible_models();
    if !tags.is_empty() && !printer.model.is_empty() {
        let printer_model = printer.model.to_lowercase();
        let intersects = tags.iter().any(|tag| {
            let tag = tag.to_lowercase();
            tag.contains(&printer_model) || printer_model.contains(&tag)
        });
        if !intersects {
            return Err(format!(
                "artifact targets {:?}, printer is {}",
                tags, printer.model
            ));
        }
    }
    if let (Some(width), Some(printer_width)) = (artifact.bed_width_mm, printer.bed_width_mm) {
        if width > printer_width {
            return Err(format!("bed width {width}mm exceeds printer {printer_width}mm"));
        }
    }
    if let (Some(depth), Some(printer_depth)) = (artifact.bed_depth_mm, printer.bed_depth_mm) {
        if depth > printer_depth {
            return Err(format!("bed depth {depth}mm exceeds printer {printer_depth}mm"));
        }
    }
    Ok(())
}

/// Device-reported names often lose extensions or pick up path
/// prefixes; compare on sanitized stems.
fn file_names_match(a: &str, b: &str) -> bool {
    let stem = |name: &str| {
        let base = Path::new(name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(name)
            .to_lowercase();
        base
    };
    let (a, b) = (stem(a), stem(b));
    !a.is_empty() && (a == b || a.contains(&b) || b.contains(&a))
}

/// Map a decoded device error to the closed fail-reason set.
fn fail_reason_for_code(code: &str) -> &'static str {
    let message = hms::decode(code).message.to_lowercase();
    if message.contains("runout") {
        "filament_runout"
    } else if message.contains("tangle") {
        "filament_tangle"
    } else if message.contains("clog") {
        "clog"
    } else if message.contains("adhesion") {
        "adhesion"
    } else if message.contains("firmware") {
        "firmware_error"
    } else if message.contains("power") {
        "power_loss"
    } else if message.contains("spaghetti") || message.contains("quality") {
        "spaghetti"
    } else {
        "other"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ApiType, StatusFrame};
    use crate::db::jobs::NewJob;
    use crate::db::models::NewArtifact;
    use crate::db::printers::NewPrinter;
    use crate::db::test_store;

    async fn harness() -> (Store, Arc<FleetState>, EventBus, Arc<SessionManager>, Arc<Dispatcher>) {
        let store = test_store().await;
        let fleet = Arc::new(FleetState::new());
        let bus = EventBus::new();
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            Arc::clone(&fleet),
            bus.clone(),
            crate::config::test_config(),
        ));
        let accounting = Arc::new(FilamentAccounting::new(store.clone(), bus.clone(), None));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            Arc::clone(&fleet),
            bus.clone(),
            Arc::clone(&sessions),
            accounting,
        ));
        (store, fleet, bus, sessions, dispatcher)
    }

    async fn seed_printer(store: &Store) -> i64 {
        store
            .create_printer(NewPrinter {
                name: "Apollo".into(),
                model: "X1 Carbon".into(),
                api_type: ApiType::Bambu,
                api_host: "192.0.2.1".into(),
                credentials: "s|c".into(),
                slot_count: 4,
                bed_width_mm: Some(256.0),
                bed_depth_mm: Some(256.0),
            })
            .await
            .unwrap()
            .id
    }

    async fn seed_printing_job(store: &Store, printer_id: i64, name: &str) -> Job {
        let job = store
            .create_job(NewJob {
                model_id: None,
                artifact_id: None,
                item_name: name.to_string(),
                quantity: 1,
                priority: 3,
                material_type: "PLA".into(),
                colors: vec![],
                duration_minutes: Some(30),
                due_date: None,
            })
            .await
            .unwrap();
        store.approve_job(job.id).await.unwrap();
        store
            .mark_job_scheduled(job.id, printer_id, Utc::now(), Utc::now())
            .await
            .unwrap();
        store.mark_job_printing(job.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn dispatch_rejects_wrong_status_and_missing_artifact() {
        let (store, _fleet, _bus, _sessions, dispatcher) = harness().await;
        let printer_id = seed_printer(&store).await;

        let job = store
            .create_job(NewJob {
                model_id: None,
                artifact_id: None,
                item_name: "clip".into(),
                quantity: 1,
                priority: 3,
                material_type: "PLA".into(),
                colors: vec![],
                duration_minutes: Some(30),
                due_date: None,
            })
            .await
            .unwrap();

        assert!(matches!(
            dispatcher.dispatch_job(job.id, false).await,
            Err(DispatchError::NotScheduled { .. })
        ));
        assert!(matches!(
            dispatcher.dispatch_job(99999, false).await,
            Err(DispatchError::JobNotFound(_))
        ));

        store.approve_job(job.id).await.unwrap();
        store
            .mark_job_scheduled(job.id, printer_id, Utc::now(), Utc::now())
            .await
            .unwrap();
        assert!(matches!(
            dispatcher.dispatch_job(job.id, false).await,
            Err(DispatchError::NoArtifact(_))
        ));
    }

    #[tokio::test]
    async fn incompatible_artifact_is_advisory() {
        let (store, _fleet, _bus, _sessions, dispatcher) = harness().await;
        let printer_id = seed_printer(&store).await;
        let artifact = store
            .create_artifact(NewArtifact {
                file_id: "f1".into(),
                file_name: "big.3mf".into(),
                file_path: "/nonexistent/big.3mf".into(),
                size_bytes: 10,
                content_hash: "h".into(),
                printer_models: Some("Voron 2.4".into()),
                ..NewArtifact::default()
            })
            .await
            .unwrap();

        let job = store
            .create_job(NewJob {
                model_id: None,
                artifact_id: Some(artifact.id),
                item_name: "big".into(),
                quantity: 1,
                priority: 3,
                material_type: "PLA".into(),
                colors: vec![],
                duration_minutes: Some(30),
                due_date: None,
            })
            .await
            .unwrap();
        store.approve_job(job.id).await.unwrap();
        store
            .mark_job_scheduled(job.id, printer_id, Utc::now(), Utc::now())
            .await
            .unwrap();

        assert!(matches!(
            dispatcher.dispatch_job(job.id, false).await,
            Err(DispatchError::Incompatible(_))
        ));
        // With force the check is bypassed; the next failure is the
        // missing live session, not compatibility.
        let forced = dispatcher.dispatch_job(job.id, true).await;
        assert!(matches!(forced, Err(DispatchError::Adapter(_))));
    }

    #[tokio::test]
    async fn observed_finish_completes_job_once() {
        let (store, _fleet, bus, _sessions, dispatcher) = harness().await;
        let printer_id = seed_printer(&store).await;
        let job = seed_printing_job(&store, printer_id, "clip").await;
        store
            .start_print_record(printer_id, Some(job.id), "clip.3mf")
            .await
            .unwrap();
        let mut sub = bus.subscribe("test");

        let frame = StatusFrame {
            state: Some(DeviceState::Finished),
            file_name: Some("clip.3mf".into()),
            ..StatusFrame::default()
        };
        dispatcher.reconcile_frame(printer_id, &frame).await.unwrap();
        // Terminal frames repeat; the second application is a no-op.
        dispatcher.reconcile_frame(printer_id, &frame).await.unwrap();

        let job = store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.actual_end.is_some());

        let completions = crate::bus::drain(&mut sub)
            .into_iter()
            .filter(|event| matches!(event, Event::JobCompleted { .. }))
            .count();
        assert_eq!(completions, 1);

        // Printer usage counters rolled once.
        let printer = store.get_printer(printer_id).await.unwrap();
        assert_eq!(printer.total_print_count, 1);
    }

    #[tokio::test]
    async fn observed_failure_maps_error_code_to_reason() {
        let (store, _fleet, _bus, _sessions, dispatcher) = harness().await;
        let printer_id = seed_printer(&store).await;
        let job = seed_printing_job(&store, printer_id, "clip").await;

        let frame = StatusFrame {
            state: Some(DeviceState::Failed),
            file_name: Some("clip.3mf".into()),
            error_codes: vec!["0300_0100_0001_0001".into()],
            ..StatusFrame::default()
        };
        dispatcher.reconcile_frame(printer_id, &frame).await.unwrap();

        let job = store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.fail_reason.as_deref(), Some("filament_runout"));
        assert!(job.notes.unwrap().contains("runout"));
    }

    #[tokio::test]
    async fn foreign_print_gets_unlinked_record() {
        let (store, _fleet, _bus, _sessions, dispatcher) = harness().await;
        let printer_id = seed_printer(&store).await;

        let frame = StatusFrame {
            state: Some(DeviceState::Running),
            file_name: Some("panel-started.3mf".into()),
            progress: Some(12.0),
            ..StatusFrame::default()
        };
        dispatcher.reconcile_frame(printer_id, &frame).await.unwrap();

        let records = store.unlinked_print_records(Some(printer_id)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file_name, "panel-started.3mf");
        assert_eq!(records[0].progress, Some(12.0));
    }

    #[tokio::test]
    async fn cancel_pending_and_scheduled_directly() {
        let (store, _fleet, _bus, _sessions, dispatcher) = harness().await;
        let job = store
            .create_job(NewJob {
                model_id: None,
                artifact_id: None,
                item_name: "clip".into(),
                quantity: 1,
                priority: 3,
                material_type: "PLA".into(),
                colors: vec![],
                duration_minutes: Some(30),
                due_date: None,
            })
            .await
            .unwrap();
        store.approve_job(job.id).await.unwrap();
        dispatcher.cancel(job.id).await.unwrap();
        let job = store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        // Terminal jobs cannot be cancelled again.
        assert!(matches!(
            dispatcher.cancel(job.id).await,
            Err(DispatchError::NotScheduled { .. })
        ));
    }

    /// Scripted transport: fails the first N uploads, accepts the rest.
    struct FlakyAdapter {
        fail_uploads: u32,
        uploads: std::sync::atomic::AtomicU32,
        starts: std::sync::atomic::AtomicU32,
    }

    #[async_trait::async_trait]
    impl crate::adapter::Adapter for FlakyAdapter {
        async fn connect(&self) -> Result<(), AdapterError> {
            Ok(())
        }

        async fn disconnect(&self) {}

        async fn upload(&self, _bytes: &[u8], _remote_name: &str) -> Result<(), AdapterError> {
            let attempt = self.uploads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if attempt < self.fail_uploads {
                Err(AdapterError::Unreachable("transport hiccup".to_string()))
            } else {
                Ok(())
            }
        }

        async fn start_print(
            &self,
            _remote_name: &str,
            _options: &StartOptions,
        ) -> Result<(), AdapterError> {
            self.starts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        async fn control(&self, _command: ControlCommand) -> Result<(), AdapterError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn upload_retries_then_dispatch_succeeds() {
        let (store, fleet, bus, sessions, dispatcher) = harness().await;
        let printer_id = seed_printer(&store).await;
        let mut sub = bus.subscribe("test");

        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("clip.3mf");
        std::fs::write(&file_path, b"sliced bytes").unwrap();
        let artifact = store
            .create_artifact(NewArtifact {
                file_id: "f1".into(),
                file_name: "clip.3mf".into(),
                file_path: file_path.display().to_string(),
                size_bytes: 12,
                content_hash: "h".into(),
                ..NewArtifact::default()
            })
            .await
            .unwrap();

        let job = store
            .create_job(NewJob {
                model_id: None,
                artifact_id: Some(artifact.id),
                item_name: "clip".into(),
                quantity: 1,
                priority: 3,
                material_type: "PLA".into(),
                colors: vec![],
                duration_minutes: Some(30),
                due_date: None,
            })
            .await
            .unwrap();
        store.approve_job(job.id).await.unwrap();
        store
            .mark_job_scheduled(job.id, printer_id, Utc::now(), Utc::now())
            .await
            .unwrap();

        let adapter = Arc::new(FlakyAdapter {
            fail_uploads: 2,
            uploads: std::sync::atomic::AtomicU32::new(0),
            starts: std::sync::atomic::AtomicU32::new(0),
        });
        let live: Arc<dyn crate::adapter::Adapter> = adapter.clone() as Arc<dyn crate::adapter::Adapter>;
        sessions.insert_adapter(printer_id, live).await;

        // The device already reports the file running, so start
        // confirmation resolves on the first poll.
        fleet
            .apply_frame(
                printer_id,
                &StatusFrame {
                    state: Some(DeviceState::Running),
                    file_name: Some("clip.3mf".into()),
                    ..StatusFrame::default()
                },
            )
            .await;

        dispatcher.dispatch_job(job.id, false).await.unwrap();

        // Two transport failures, one success.
        assert_eq!(adapter.uploads.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(adapter.starts.load(std::sync::atomic::Ordering::SeqCst), 1);

        let job = store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Printing);
        assert!(job.is_locked);

        // Exactly one upload audit entry and one started event.
        let audit = store.recent_audit(50).await.unwrap();
        let uploads = audit.iter().filter(|e| e.action == "job.upload_succeeded").count();
        assert_eq!(uploads, 1);
        let started = crate::bus::drain(&mut sub)
            .into_iter()
            .filter(|event| matches!(event, Event::JobStarted { .. }))
            .count();
        assert_eq!(started, 1);
    }

    #[test]
    fn file_name_matching_handles_stems() {
        assert!(file_names_match("clip.3mf", "clip"));
        assert!(file_names_match("clip", "clip.gcode"));
        assert!(file_names_match("/cache/clip.3mf", "clip.3mf"));
        assert!(!file_names_match("clip", "bracket"));
    }

    #[test]
    fn compatibility_checks_models_and_bed() {
        let artifact = |models: Option<&str>, width: Option<f64>| Artifact {
            id: 1,
            file_id: "f".into(),
            file_name: "a.3mf".into(),
            file_path: "/a".into(),
            size_bytes: 1,
            content_hash: "h".into(),
            est_print_seconds: None,
            total_grams: None,
            filaments: None,
            thumbnail_png: None,
            printer_models: models.map(str::to_string),
            bed_width_mm: width,
            bed_depth_mm: None,
            supports_used: false,
            model_id: None,
            created_at: Utc::now(),
        };
        let printer = |model: &str, width: Option<f64>| crate::db::printers::Printer {
            id: 1,
            name: "p".into(),
            model: model.to_string(),
            api_type: "bambu".into(),
            api_host: "h".into(),
            credentials: String::new(),
            slot_count: 4,
            bed_width_mm: width,
            bed_depth_mm: None,
            is_active: true,
            last_error: None,
            total_print_hours: 0.0,
            total_print_count: 0,
            hours_since_service: 0.0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert!(check_compatibility(
            &artifact(Some("Bambu Lab X1 Carbon"), None),
            &printer("X1 Carbon", None)
        )
        .is_ok());
        assert!(check_compatibility(
            &artifact(Some("Voron 2.4"), None),
            &printer("X1 Carbon", None)
        )
        .is_err());
        // No tags: anything goes.
        assert!(check_compatibility(&artifact(None, None), &printer("X1 Carbon", None)).is_ok());
        // Bed too small.
        assert!(check_compatibility(
            &artifact(None, Some(300.0)),
            &printer("X1 Carbon", Some(256.0))
        )
        .is_err());
    }

    #[test]
    fn fail_reasons_map_from_codes() {
        assert_eq!(fail_reason_for_code("0300_0100_0001_0001"), "filament_runout");
        assert_eq!(fail_reason_for_code("0302_0300_0300_0003"), "filament_tangle");
        assert_eq!(fail_reason_for_code("0C00_0300_0002_0002"), "clog");
        assert_eq!(fail_reason_for_code("FFFF_0000_0400_0000"), "other");
    }
}
