use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Submitted,
    Pending,
    Scheduled,
    Printing,
    Completed,
    Failed,
    Cancelled,
    Rejected,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Rejected
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Submitted => "submitted",
            JobStatus::Pending => "pending",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Printing => "printing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Rejected => "rejected",
        }
    }
}

/// Closed set of failure reasons a failed job may carry.
pub const FAIL_REASONS: &[&str] = &[
    "spaghetti",
    "adhesion",
    "clog",
    "layer_shift",
    "stringing",
    "warping",
    "filament_runout",
    "filament_tangle",
    "power_loss",
    "firmware_error",
    "user_cancelled",
    "other",
];

pub fn is_valid_fail_reason(reason: &str) -> bool {
    FAIL_REASONS.contains(&reason)
}

/// The core scheduling unit.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub model_id: Option<i64>,
    pub artifact_id: Option<i64>,
    pub item_name: String,
    pub quantity: i64,
    /// 1 is most urgent, 5 least.
    pub priority: i64,
    pub status: JobStatus,
    pub material_type: String,
    /// JSON array of required color hexes.
    pub colors: Option<String>,
    pub duration_minutes: Option<i64>,
    pub hold: bool,
    pub due_date: Option<DateTime<Utc>>,
    pub printer_id: Option<i64>,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub scheduled_end: Option<DateTime<Utc>>,
    pub actual_start: Option<DateTime<Utc>>,
    pub actual_end: Option<DateTime<Utc>>,
    pub is_locked: bool,
    pub estimated_cost: Option<f64>,
    pub suggested_price: Option<f64>,
    pub fail_reason: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Required colors, upper-cased, deduplicated, order preserved.
    pub fn required_colors(&self) -> Vec<String> {
        let mut seen = Vec::new();
        let parsed: Vec<String> = self
            .colors
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        for color in parsed {
            let color = color.to_uppercase();
            if !seen.contains(&color) {
                seen.push(color);
            }
        }
        seen
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub model_id: Option<i64>,
    pub artifact_id: Option<i64>,
    pub item_name: String,
    pub quantity: i64,
    pub priority: i64,
    pub material_type: String,
    pub colors: Vec<String>,
    pub duration_minutes: Option<i64>,
    pub due_date: Option<DateTime<Utc>>,
}

/// Audit record of one scheduler batch.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SchedulerRun {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub candidate_count: i64,
    pub scheduled_count: i64,
    pub skipped_count: i64,
    pub setup_blocks: i64,
    pub notes: Option<String>,
}

impl Store {
    /// Create a job in `submitted`. Cost fields are computed here and
    /// frozen: the material estimate prices per-slot grams against the
    /// library when a model is linked.
    pub async fn create_job(&self, input: NewJob) -> Result<Job, sqlx::Error> {
        let now = Utc::now();
        let colors_json = serde_json::to_string(&input.colors).unwrap_or_default();

        let (estimated_cost, suggested_price) = match input.model_id {
            Some(model_id) => self.estimate_job_cost(model_id, input.quantity).await?,
            None => (None, None),
        };

        let job = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (model_id, artifact_id, item_name, quantity, priority,
                              material_type, colors, duration_minutes, due_date,
                              estimated_cost, suggested_price, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(input.model_id)
        .bind(input.artifact_id)
        .bind(&input.item_name)
        .bind(input.quantity.max(1))
        .bind(input.priority.clamp(1, 5))
        .bind(&input.material_type)
        .bind(&colors_json)
        .bind(input.duration_minutes)
        .bind(input.due_date)
        .bind(estimated_cost)
        .bind(suggested_price)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await?;
        Ok(job)
    }

    async fn estimate_job_cost(
        &self,
        model_id: i64,
        quantity: i64,
    ) -> Result<(Option<f64>, Option<f64>), sqlx::Error> {
        const FALLBACK_COST_PER_GRAM: f64 = 0.025;
        const MARKUP: f64 = 2.5;

        let Some(model) = self.find_model(model_id).await? else {
            return Ok((None, None));
        };
        let mut cost = 0.0;
        let mut any = false;
        for requirement in model.requirements().values() {
            let Some(grams) = requirement.grams else { continue };
            let per_gram = self
                .find_library_match(Some(&model.default_filament_type), &requirement.color)
                .await?
                .map(|entry| entry.cost_per_gram)
                .filter(|rate| *rate > 0.0)
                .unwrap_or(FALLBACK_COST_PER_GRAM);
            cost += grams * per_gram;
            any = true;
        }
        if !any {
            return Ok((None, None));
        }
        let total = cost * quantity.max(1) as f64;
        Ok((Some(total), Some(total * MARKUP)))
    }

    pub async fn find_job(&self, id: i64) -> Result<Option<Job>, sqlx::Error> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
    }

    /// Guarded transition: update only when the current status is one
    /// of `from`. Returns the refreshed job on success, `None` when the
    /// guard failed (already moved, or unknown id).
    async fn transition_job(
        &self,
        id: i64,
        from: &[JobStatus],
        apply: &str,
        binds: Vec<SqlValue>,
    ) -> Result<Option<Job>, sqlx::Error> {
        let placeholders = from.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql =
            format!("UPDATE jobs SET {apply}, updated_at = ? WHERE id = ? AND status IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for value in binds {
            query = match value {
                SqlValue::Status(status) => query.bind(status),
                SqlValue::Text(text) => query.bind(text),
                SqlValue::OptText(text) => query.bind(text),
                SqlValue::Int(int) => query.bind(int),
                SqlValue::Time(time) => query.bind(time),
            };
        }
        query = query.bind(Utc::now()).bind(id);
        for status in from {
            query = query.bind(*status);
        }
        let result = query.execute(self.pool()).await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.find_job(id).await
    }

    pub async fn approve_job(&self, id: i64) -> Result<Option<Job>, sqlx::Error> {
        self.transition_job(
            id,
            &[JobStatus::Submitted],
            "status = ?",
            vec![SqlValue::Status(JobStatus::Pending)],
        )
        .await
    }

    pub async fn reject_job(&self, id: i64, reason: &str) -> Result<Option<Job>, sqlx::Error> {
        self.transition_job(
            id,
            &[JobStatus::Submitted],
            "status = ?, notes = ?",
            vec![
                SqlValue::Status(JobStatus::Rejected),
                SqlValue::Text(format!("Rejected: {reason}")),
            ],
        )
        .await
    }

    /// Rejected jobs may be corrected and resubmitted.
    pub async fn resubmit_job(&self, id: i64) -> Result<Option<Job>, sqlx::Error> {
        self.transition_job(
            id,
            &[JobStatus::Rejected],
            "status = ?, notes = NULL",
            vec![SqlValue::Status(JobStatus::Submitted)],
        )
        .await
    }

    pub async fn cancel_job_record(&self, id: i64) -> Result<Option<Job>, sqlx::Error> {
        self.transition_job(
            id,
            &[JobStatus::Pending, JobStatus::Scheduled],
            "status = ?, is_locked = 1",
            vec![SqlValue::Status(JobStatus::Cancelled)],
        )
        .await
    }

    /// Scheduled (unlocked) back to the pending pool.
    pub async fn reset_job(&self, id: i64) -> Result<Option<Job>, sqlx::Error> {
        self.transition_job(
            id,
            &[JobStatus::Scheduled],
            "status = ?, printer_id = NULL, scheduled_start = NULL, scheduled_end = NULL",
            vec![SqlValue::Status(JobStatus::Pending)],
        )
        .await
    }

    /// Clone a terminal job into a fresh pending copy.
    pub async fn repeat_job(&self, id: i64) -> Result<Option<Job>, sqlx::Error> {
        let Some(source) = self.find_job(id).await? else {
            return Ok(None);
        };
        if !source.status.is_terminal() {
            return Ok(None);
        }
        let clone = self
            .create_job(NewJob {
                model_id: source.model_id,
                artifact_id: source.artifact_id,
                item_name: source.item_name.clone(),
                quantity: source.quantity,
                priority: source.priority,
                material_type: source.material_type.clone(),
                colors: source.required_colors(),
                duration_minutes: source.duration_minutes,
                due_date: None,
            })
            .await?;
        self.approve_job(clone.id).await
    }

    pub async fn set_job_hold(&self, id: i64, hold: bool) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE jobs SET hold = ?, updated_at = ? WHERE id = ?")
            .bind(hold)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Scheduler placement: pending|scheduled -> scheduled with window.
    pub async fn mark_job_scheduled(
        &self,
        id: i64,
        printer_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<Job>, sqlx::Error> {
        self.transition_job(
            id,
            &[JobStatus::Pending, JobStatus::Scheduled],
            "status = ?, printer_id = ?, scheduled_start = ?, scheduled_end = ?",
            vec![
                SqlValue::Status(JobStatus::Scheduled),
                SqlValue::Int(printer_id),
                SqlValue::Time(start),
                SqlValue::Time(end),
            ],
        )
        .await
    }

    /// Dispatcher success: scheduled -> printing, locked.
    pub async fn mark_job_printing(&self, id: i64) -> Result<Option<Job>, sqlx::Error> {
        self.transition_job(
            id,
            &[JobStatus::Scheduled],
            "status = ?, actual_start = ?, is_locked = 1",
            vec![SqlValue::Status(JobStatus::Printing), SqlValue::Time(Utc::now())],
        )
        .await
    }

    /// Observed completion. Guarded on `printing`, so completing twice
    /// is a no-op and deduction cannot run twice.
    pub async fn complete_job(&self, id: i64) -> Result<Option<Job>, sqlx::Error> {
        self.transition_job(
            id,
            &[JobStatus::Printing],
            "status = ?, actual_end = ?, is_locked = 1",
            vec![SqlValue::Status(JobStatus::Completed), SqlValue::Time(Utc::now())],
        )
        .await
    }

    pub async fn fail_job(
        &self,
        id: i64,
        fail_reason: Option<&str>,
        notes: Option<&str>,
    ) -> Result<Option<Job>, sqlx::Error> {
        let reason = fail_reason.filter(|r| is_valid_fail_reason(r)).map(str::to_string);
        self.transition_job(
            id,
            &[JobStatus::Scheduled, JobStatus::Printing],
            "status = ?, actual_end = ?, is_locked = 1, fail_reason = ?, notes = COALESCE(?, notes)",
            vec![
                SqlValue::Status(JobStatus::Failed),
                SqlValue::Time(Utc::now()),
                SqlValue::OptText(reason),
                SqlValue::OptText(notes.map(str::to_string)),
            ],
        )
        .await
    }

    /// Dispatcher cancel confirmation for an in-flight print.
    pub async fn cancel_printing_job(&self, id: i64) -> Result<Option<Job>, sqlx::Error> {
        self.transition_job(
            id,
            &[JobStatus::Printing],
            "status = ?, actual_end = ?, fail_reason = 'user_cancelled'",
            vec![SqlValue::Status(JobStatus::Cancelled), SqlValue::Time(Utc::now())],
        )
        .await
    }

    /// Annotate a failed job with the operator's diagnosis.
    pub async fn update_job_failure(
        &self,
        id: i64,
        fail_reason: &str,
        notes: Option<&str>,
    ) -> Result<Option<Job>, sqlx::Error> {
        if !is_valid_fail_reason(fail_reason) {
            return Ok(None);
        }
        self.transition_job(
            id,
            &[JobStatus::Failed],
            "fail_reason = ?, notes = COALESCE(?, notes)",
            vec![
                SqlValue::Text(fail_reason.to_string()),
                SqlValue::OptText(notes.map(str::to_string)),
            ],
        )
        .await
    }

    /// Scheduler candidates: pending or scheduled, not held, not locked,
    /// in deterministic priority order.
    pub async fn schedulable_jobs(&self) -> Result<Vec<Job>, sqlx::Error> {
        sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE status IN ('pending', 'scheduled') AND hold = 0 AND is_locked = 0
            ORDER BY priority ASC,
                     CASE WHEN due_date IS NULL THEN 1 ELSE 0 END,
                     due_date ASC,
                     created_at ASC,
                     id ASC
            "#,
        )
        .fetch_all(self.pool())
        .await
    }

    /// Locked scheduled jobs are pre-placed on scheduler timelines.
    pub async fn locked_scheduled_jobs(&self) -> Result<Vec<Job>, sqlx::Error> {
        sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE status = 'scheduled' AND is_locked = 1",
        )
        .fetch_all(self.pool())
        .await
    }

    pub async fn printing_jobs_on(&self, printer_id: i64) -> Result<Vec<Job>, sqlx::Error> {
        sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE printer_id = ? AND status = 'printing' ORDER BY id",
        )
        .bind(printer_id)
        .fetch_all(self.pool())
        .await
    }

    /// Scheduled jobs whose window has opened, ready for dispatch.
    pub async fn scheduled_jobs_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>, sqlx::Error> {
        sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE status = 'scheduled' AND printer_id IS NOT NULL
              AND scheduled_start IS NOT NULL AND scheduled_start <= ?
            ORDER BY scheduled_start, id
            "#,
        )
        .bind(now)
        .fetch_all(self.pool())
        .await
    }

    pub async fn printing_jobs(&self) -> Result<Vec<Job>, sqlx::Error> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE status = 'printing' ORDER BY id")
            .fetch_all(self.pool())
            .await
    }

    pub async fn record_scheduler_run(
        &self,
        started_at: DateTime<Utc>,
        candidate_count: i64,
        scheduled_count: i64,
        skipped_count: i64,
        setup_blocks: i64,
        notes: Option<&str>,
    ) -> Result<SchedulerRun, sqlx::Error> {
        sqlx::query_as::<_, SchedulerRun>(
            r#"
            INSERT INTO scheduler_runs (started_at, finished_at, candidate_count,
                                        scheduled_count, skipped_count, setup_blocks, notes)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(started_at)
        .bind(Utc::now())
        .bind(candidate_count)
        .bind(scheduled_count)
        .bind(skipped_count)
        .bind(setup_blocks)
        .bind(notes)
        .fetch_one(self.pool())
        .await
    }
}

/// Bind values for guarded transitions.
enum SqlValue {
    Status(JobStatus),
    Text(String),
    OptText(Option<String>),
    Int(i64),
    Time(DateTime<Utc>),
}
