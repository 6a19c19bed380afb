//! Batch job scheduler: a deterministic single-pass greedy planner
//! that assigns pending jobs to printers over a bounded horizon,
//! preferring printers that already have the required colors loaded
//! and pushing work out of the nightly blackout window.
//!
//! Planning is pure (`plan`) over naive local datetimes; `Scheduler::run`
//! loads state, applies the plan, and writes the run record.

use chrono::{Duration, NaiveDateTime, NaiveTime, TimeZone, Utc};
use tokio::sync::Mutex;

use crate::bus::EventBus;
use crate::config::Config;
use crate::db::jobs::Job;
use crate::db::Store;
use crate::error::SchedulerError;
use crate::events::Event;
use crate::fleet::FleetState;

/// Daily no-print interval in local wall time. May wrap midnight; a
/// zero-length window disables it.
#[derive(Debug, Clone, Copy)]
pub struct Blackout {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Blackout {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    fn is_disabled(&self) -> bool {
        self.start == self.end
    }

    /// If `[start, end)` intersects a blackout occurrence, the end of
    /// the earliest such occurrence; else `None`. Touching endpoints do
    /// not intersect: a window may end exactly at blackout start or
    /// begin exactly at blackout end.
    fn conflict(&self, window_start: NaiveDateTime, window_end: NaiveDateTime) -> Option<NaiveDateTime> {
        if self.is_disabled() || window_end <= window_start {
            return None;
        }
        let mut date = window_start.date() - Duration::days(1);
        let last = window_end.date();
        let mut earliest: Option<(NaiveDateTime, NaiveDateTime)> = None;
        while date <= last {
            let occurrence_start = date.and_time(self.start);
            let occurrence_end = if self.start < self.end {
                date.and_time(self.end)
            } else {
                (date + Duration::days(1)).and_time(self.end)
            };
            if window_start < occurrence_end && window_end > occurrence_start {
                match earliest {
                    Some((existing_start, _)) if existing_start <= occurrence_start => {}
                    _ => earliest = Some((occurrence_start, occurrence_end)),
                }
            }
            date += Duration::days(1);
        }
        earliest.map(|(_, end)| end)
    }
}

/// A printer as the planner sees it.
#[derive(Debug, Clone)]
pub struct PlanPrinter {
    pub id: i64,
    pub slot_count: i64,
    /// Upper-cased hexes currently loaded.
    pub loaded_colors: Vec<String>,
    /// Materials currently loaded; empty means unconfigured slots,
    /// which accept any material.
    pub materials: Vec<String>,
    /// Earliest the printer is free (projected end of a running job).
    pub busy_until: NaiveDateTime,
    /// Windows held by locked scheduled jobs, pre-placed.
    pub reserved: Vec<(NaiveDateTime, NaiveDateTime)>,
}

/// A candidate job as the planner sees it.
#[derive(Debug, Clone)]
pub struct PlanJob {
    pub id: i64,
    pub material: String,
    pub colors: Vec<String>,
    pub duration_minutes: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub job_id: i64,
    pub printer_id: i64,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub setup_block: bool,
    pub match_score: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Skip {
    pub job_id: i64,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoCandidatePrinter,
    ColorsExceedSlots,
    ExceedsHorizon,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::NoCandidatePrinter => "no candidate printer",
            SkipReason::ColorsExceedSlots => "color requirement exceeds slot count",
            SkipReason::ExceedsHorizon => "exceeds horizon",
        }
    }
}

#[derive(Debug, Default)]
pub struct Plan {
    pub placements: Vec<Placement>,
    pub skipped: Vec<Skip>,
    pub setup_blocks: i64,
}

pub struct PlanParams {
    pub now: NaiveDateTime,
    pub blackout: Blackout,
    pub horizon: Duration,
    pub setup: Duration,
}

/// Single-pass greedy assignment. `jobs` must already be in candidate
/// order (priority, due date, age); printers are tried deterministically
/// with ties broken by ascending printer id.
pub fn plan(jobs: &[PlanJob], printers: &[PlanPrinter], params: &PlanParams) -> Plan {
    let mut outcome = Plan::default();
    let horizon_end = params.now + params.horizon;

    let mut timelines: Vec<Timeline> = printers
        .iter()
        .map(|printer| Timeline {
            printer: printer.clone(),
            cursor: printer.busy_until.max(params.now),
            loaded_colors: printer.loaded_colors.iter().map(|c| c.to_uppercase()).collect(),
        })
        .collect();
    timelines.sort_by_key(|timeline| timeline.printer.id);

    for job in jobs {
        let required = required_colors(job);
        let duration = Duration::minutes(if job.duration_minutes <= 0 {
            30
        } else {
            job.duration_minutes
        });

        if !timelines
            .iter()
            .any(|t| t.printer.slot_count >= required.len() as i64)
        {
            outcome.skipped.push(Skip { job_id: job.id, reason: SkipReason::ColorsExceedSlots });
            continue;
        }

        // Best candidate minimizes (earliest_start, -match_score, id),
        // where earliest_start includes any leading setup block.
        let mut best: Option<(NaiveDateTime, usize, usize, bool)> = None;
        for (index, timeline) in timelines.iter().enumerate() {
            if !timeline.accepts(job, &required) {
                continue;
            }
            let match_score = timeline.match_score(&required);
            let needs_setup = match_score < required.len();
            let total = if needs_setup { params.setup + duration } else { duration };
            let Some(block_start) =
                timeline.earliest_fit(total, &params.blackout, horizon_end)
            else {
                continue;
            };
            let job_start = if needs_setup { block_start + params.setup } else { block_start };
            let candidate = (job_start, match_score, index, needs_setup);
            best = match best {
                None => Some(candidate),
                Some(current) => {
                    let (current_start, current_score, current_index, _) = current;
                    let current_id = timelines[current_index].printer.id;
                    let candidate_id = timeline.printer.id;
                    if (job_start, std::cmp::Reverse(match_score), candidate_id)
                        < (current_start, std::cmp::Reverse(current_score), current_id)
                    {
                        Some(candidate)
                    } else {
                        Some(current)
                    }
                }
            };
        }

        let Some((job_start, match_score, index, needs_setup)) = best else {
            let reason = if timelines.iter().any(|t| t.accepts(job, &required)) {
                SkipReason::ExceedsHorizon
            } else {
                SkipReason::NoCandidatePrinter
            };
            outcome.skipped.push(Skip { job_id: job.id, reason });
            continue;
        };

        let start = job_start;
        let end = start + duration;
        if end > horizon_end {
            outcome.skipped.push(Skip { job_id: job.id, reason: SkipReason::ExceedsHorizon });
            continue;
        }

        let timeline = &mut timelines[index];
        timeline.cursor = end;
        if needs_setup {
            outcome.setup_blocks += 1;
            // After a swap the printer carries the job's colors.
            timeline.loaded_colors = required.clone();
        }
        outcome.placements.push(Placement {
            job_id: job.id,
            printer_id: timeline.printer.id,
            start,
            end,
            setup_block: needs_setup,
            match_score,
        });
    }

    outcome
}

fn required_colors(job: &PlanJob) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for color in &job.colors {
        let color = color.to_uppercase();
        if !seen.contains(&color) {
            seen.push(color);
        }
    }
    seen
}

struct Timeline {
    printer: PlanPrinter,
    cursor: NaiveDateTime,
    loaded_colors: Vec<String>,
}

impl Timeline {
    /// Material and slot-count feasibility.
    fn accepts(&self, job: &PlanJob, required: &[String]) -> bool {
        if self.printer.slot_count < required.len() as i64 {
            return false;
        }
        if self.printer.materials.is_empty() {
            return true;
        }
        self.printer
            .materials
            .iter()
            .any(|m| m.eq_ignore_ascii_case(&job.material))
    }

    fn match_score(&self, required: &[String]) -> usize {
        required
            .iter()
            .filter(|color| self.loaded_colors.contains(color))
            .count()
    }

    /// Earliest block start at or after the cursor where `total` fits
    /// outside every blackout occurrence and reserved window.
    fn earliest_fit(
        &self,
        total: Duration,
        blackout: &Blackout,
        horizon_end: NaiveDateTime,
    ) -> Option<NaiveDateTime> {
        let mut start = self.cursor;
        loop {
            if start > horizon_end {
                return None;
            }
            let end = start + total;
            if let Some(conflict_end) = blackout.conflict(start, end) {
                start = conflict_end;
                continue;
            }
            if let Some(&(_, reserved_end)) = self
                .printer
                .reserved
                .iter()
                .filter(|(reserved_start, reserved_end)| start < *reserved_end && end > *reserved_start)
                .min_by_key(|(reserved_start, _)| *reserved_start)
            {
                start = reserved_end;
                continue;
            }
            return Some(start);
        }
    }
}

/// Wires the pure planner to store, fleet, and bus. Runs are mutually
/// exclusive process-wide.
pub struct Scheduler {
    store: Store,
    fleet: std::sync::Arc<FleetState>,
    bus: EventBus,
    config: Config,
    run_lock: Mutex<()>,
}

/// Summary of one executed batch.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub candidate_count: i64,
    pub scheduled_count: i64,
    pub skipped_count: i64,
    pub setup_blocks: i64,
}

impl Scheduler {
    pub fn new(
        store: Store,
        fleet: std::sync::Arc<FleetState>,
        bus: EventBus,
        config: Config,
    ) -> Self {
        Self { store, fleet, bus, config, run_lock: Mutex::new(()) }
    }

    pub async fn run(&self) -> Result<RunSummary, SchedulerError> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            return Err(SchedulerError::AlreadyRunning);
        };
        let started_at = Utc::now();
        let now_local = to_local_naive(started_at);

        let candidates = self.store.schedulable_jobs().await?;
        let mut plan_jobs = Vec::with_capacity(candidates.len());
        for job in &candidates {
            plan_jobs.push(PlanJob {
                id: job.id,
                material: job.material_type.clone(),
                colors: job.required_colors(),
                duration_minutes: self.effective_duration_minutes(job).await?,
            });
        }

        let printers = self.load_plan_printers().await?;
        let params = PlanParams {
            now: now_local,
            blackout: Blackout::new(self.config.blackout_start, self.config.blackout_end),
            horizon: Duration::days(self.config.horizon_days.max(1)),
            setup: Duration::minutes(self.config.setup_minutes.max(0)),
        };
        let outcome = plan(&plan_jobs, &printers, &params);

        for placement in &outcome.placements {
            let start = from_local_naive(placement.start);
            let end = from_local_naive(placement.end);
            if self
                .store
                .mark_job_scheduled(placement.job_id, placement.printer_id, start, end)
                .await?
                .is_some()
            {
                self.bus.publish(Event::JobScheduled {
                    job_id: placement.job_id,
                    printer_id: placement.printer_id,
                    scheduled_start: start,
                    scheduled_end: end,
                });
            }
        }

        let notes = if outcome.skipped.is_empty() {
            None
        } else {
            let mut parts: Vec<String> = outcome
                .skipped
                .iter()
                .map(|skip| format!("#{}: {}", skip.job_id, skip.reason.as_str()))
                .collect();
            parts.sort();
            Some(parts.join("; "))
        };

        let summary = RunSummary {
            candidate_count: plan_jobs.len() as i64,
            scheduled_count: outcome.placements.len() as i64,
            skipped_count: outcome.skipped.len() as i64,
            setup_blocks: outcome.setup_blocks,
        };
        self.store
            .record_scheduler_run(
                started_at,
                summary.candidate_count,
                summary.scheduled_count,
                summary.skipped_count,
                summary.setup_blocks,
                notes.as_deref(),
            )
            .await?;
        tracing::info!(
            candidates = summary.candidate_count,
            scheduled = summary.scheduled_count,
            skipped = summary.skipped_count,
            setup_blocks = summary.setup_blocks,
            "scheduler run complete"
        );
        Ok(summary)
    }

    /// Effective duration: job override, then model build time, then
    /// artifact estimate; zero and unknown both mean 30 minutes.
    async fn effective_duration_minutes(&self, job: &Job) -> Result<i64, sqlx::Error> {
        if let Some(minutes) = job.duration_minutes.filter(|m| *m > 0) {
            return Ok(minutes * job.quantity.max(1));
        }
        if let Some(model_id) = job.model_id {
            if let Some(model) = self.store.find_model(model_id).await? {
                if model.build_time_hours > 0.0 {
                    return Ok((model.build_time_hours * 60.0).round() as i64 * job.quantity.max(1));
                }
            }
        }
        if let Some(artifact_id) = job.artifact_id {
            if let Some(artifact) = self.store.find_artifact(artifact_id).await? {
                if let Some(seconds) = artifact.est_print_seconds.filter(|s| *s > 0) {
                    return Ok((seconds / 60).max(1) * job.quantity.max(1));
                }
            }
        }
        Ok(30)
    }

    async fn load_plan_printers(&self) -> Result<Vec<PlanPrinter>, sqlx::Error> {
        let printers = self.store.list_printers(true).await?;
        let now = Utc::now();
        let mut plan_printers = Vec::with_capacity(printers.len());

        let locked = self.store.locked_scheduled_jobs().await?;

        for printer in printers {
            let slots = self.store.printer_slots(printer.id).await?;
            let loaded_colors: Vec<String> = slots
                .iter()
                .filter_map(|slot| slot.color_hex.as_ref())
                .map(|hex| hex.to_uppercase())
                .collect();
            let materials: Vec<String> = slots
                .iter()
                .filter_map(|slot| slot.filament_type.clone())
                .collect();

            // Projected end of the print currently on the bed: live
            // remaining minutes when online, else the job's window.
            let mut busy_until = now;
            for job in self.store.printing_jobs_on(printer.id).await? {
                let projected = match self.fleet.snapshot(printer.id).await.and_then(|snapshot| {
                    snapshot.current_print().and_then(|print| print.remaining_minutes)
                }) {
                    Some(remaining) => now + Duration::minutes(remaining.max(0)),
                    None => job.scheduled_end.unwrap_or(now),
                };
                busy_until = busy_until.max(projected);
            }

            let reserved = locked
                .iter()
                .filter(|job| job.printer_id == Some(printer.id))
                .filter_map(|job| match (job.scheduled_start, job.scheduled_end) {
                    (Some(start), Some(end)) => {
                        Some((to_local_naive(start), to_local_naive(end)))
                    }
                    _ => None,
                })
                .collect();

            plan_printers.push(PlanPrinter {
                id: printer.id,
                slot_count: printer.slot_count,
                loaded_colors,
                materials,
                busy_until: to_local_naive(busy_until),
                reserved,
            });
        }
        Ok(plan_printers)
    }
}

fn to_local_naive(at: chrono::DateTime<Utc>) -> NaiveDateTime {
    at.with_timezone(&chrono::Local).naive_local()
}

fn from_local_naive(at: NaiveDateTime) -> chrono::DateTime<Utc> {
    match chrono::Local.from_local_datetime(&at) {
        chrono::LocalResult::Single(local) | chrono::LocalResult::Ambiguous(local, _) => {
            local.with_timezone(&Utc)
        }
        chrono::LocalResult::None => Utc.from_utc_datetime(&at),
    }
}
