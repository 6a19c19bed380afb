//! Alert routing: turns bus events into per-user notices, applies
//! preferences and quiet hours, and fans out to the enabled channels
//! (in-app rows, SMTP, push relay, webhooks).

pub mod email;
pub mod webhook;

use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Utc};

use crate::bus::Subscription;
use crate::config::Config;
use crate::db::alerts::{AlertPreference, AlertRefs};
use crate::db::Store;
use crate::events::{Event, Severity};

/// Items older than this are dropped instead of delivered.
const MAX_NOTICE_AGE_SECS: i64 = 3600;

/// A renderable notification derived from one bus event.
#[derive(Debug, Clone)]
pub struct Notice {
    pub kind: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub refs: AlertRefs,
    pub created_at: DateTime<Utc>,
}

pub struct AlertDispatcher {
    store: Store,
    config: Config,
    http: reqwest::Client,
    email: Option<Arc<email::EmailSender>>,
}

impl AlertDispatcher {
    pub fn new(store: Store, config: Config) -> Self {
        let email = config.smtp.as_ref().and_then(email::EmailSender::new).map(Arc::new);
        Self {
            store,
            config,
            http: reqwest::Client::builder()
                .timeout(webhook::DELIVERY_TIMEOUT)
                .build()
                .unwrap_or_default(),
            email,
        }
    }

    /// Bus subscriber loop.
    pub async fn run(self: Arc<Self>, mut subscription: Subscription) {
        while let Some(event) = subscription.recv().await {
            let Some(notice) = notice_for_event(&event) else {
                continue;
            };
            if (Utc::now() - notice.created_at).num_seconds() > MAX_NOTICE_AGE_SECS {
                tracing::warn!(kind = %notice.kind, "stale notice dropped");
                continue;
            }
            self.route(&notice, &event).await;
        }
    }

    async fn route(&self, notice: &Notice, event: &Event) {
        let preferences = match self.store.alert_preferences().await {
            Ok(preferences) => preferences,
            Err(e) => {
                tracing::warn!("preference load failed: {e}");
                Vec::new()
            }
        };

        for preference in &preferences {
            if notice.severity < preference.min_severity() {
                continue;
            }
            let quiet = in_quiet_hours(preference, chrono::Local::now().time());

            if preference.in_app {
                // In-app rows land even in quiet hours; they wait
                // silently until the user looks.
                if let Err(e) = self
                    .store
                    .create_alert(
                        &notice.kind,
                        notice.severity,
                        preference.user_id,
                        &notice.title,
                        &notice.message,
                        notice.refs,
                    )
                    .await
                {
                    tracing::warn!(user = preference.user_id, "alert row failed: {e}");
                }
            }

            if quiet {
                tracing::debug!(user = preference.user_id, "quiet hours, channels suppressed");
                continue;
            }

            // Outbound channels are fire-and-forget worker tasks with
            // their own 10 s timeout; failure is logged, not retried.
            if preference.email {
                if let (Some(sender), Some(address)) =
                    (&self.email, preference.email_address.as_deref())
                {
                    let sender = Arc::clone(sender);
                    let address = address.to_string();
                    let subject = format!("[printfarm] {}", notice.title);
                    let body = notice.message.clone();
                    tokio::spawn(async move {
                        sender.send(&address, &subject, &body).await;
                    });
                }
            }

            if preference.push {
                if let Some(relay) = self.config.push_relay_url.clone() {
                    let client = self.http.clone();
                    let payload = serde_json::json!({
                        "user_id": preference.user_id,
                        "title": notice.title,
                        "body": notice.message,
                        "severity": notice.severity.as_str(),
                    });
                    tokio::spawn(async move {
                        push_relay(&client, &relay, payload).await;
                    });
                }
            }
        }

        self.fan_out_webhooks(notice, event).await;
    }

    async fn fan_out_webhooks(&self, notice: &Notice, event: &Event) {
        let endpoints = match self.store.enabled_webhooks().await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                tracing::warn!("webhook load failed: {e}");
                return;
            }
        };
        if endpoints.is_empty() {
            return;
        }
        let event_json = serde_json::to_value(event).unwrap_or_default();

        for endpoint in endpoints {
            if !endpoint.wants_topic(&notice.kind) {
                continue;
            }
            let Some(raw_url) = endpoint.decrypt_url(self.store.cipher()) else {
                tracing::warn!(endpoint = %endpoint.name, "webhook url undecryptable");
                continue;
            };
            let url = match webhook::validate_url(&raw_url, self.config.webhook_block_private) {
                Ok(url) => url,
                Err(reason) => {
                    tracing::warn!(endpoint = %endpoint.name, "webhook url refused: {reason}");
                    continue;
                }
            };

            // Fire-and-forget on a worker task.
            let client = self.http.clone();
            let notice = notice.clone();
            let event_json = event_json.clone();
            let name = endpoint.name.clone();
            let kind = endpoint.kind.clone();
            tokio::spawn(async move {
                webhook::deliver(&client, &name, &kind, url, &notice, &event_json).await;
            });
        }
    }
}

/// Forward a rendered alert to the configured push relay, which holds
/// the VAPID keys and subscription set.
async fn push_relay(client: &reqwest::Client, relay: &str, payload: serde_json::Value) {
    match tokio::time::timeout(
        webhook::DELIVERY_TIMEOUT,
        client.post(relay).json(&payload).send(),
    )
    .await
    {
        Ok(Ok(response)) if response.status().is_success() => {}
        Ok(Ok(response)) => {
            tracing::warn!(status = %response.status(), "push relay rejected");
        }
        Ok(Err(e)) => tracing::warn!("push relay failed: {e}"),
        Err(_) => tracing::warn!("push relay timed out"),
    }
}

/// Quiet hours in local wall time, wrapping midnight like the blackout
/// window.
fn in_quiet_hours(preference: &AlertPreference, now: NaiveTime) -> bool {
    let parse = |raw: &Option<String>| {
        raw.as_deref()
            .and_then(|value| NaiveTime::parse_from_str(value, "%H:%M").ok())
    };
    let (Some(start), Some(end)) = (parse(&preference.quiet_start), parse(&preference.quiet_end))
    else {
        return false;
    };
    if start == end {
        return false;
    }
    if start < end {
        now >= start && now < end
    } else {
        now >= start || now < end
    }
}

/// Which events become alerts, and how they render. Routine chatter
/// (state frames, scheduling) stays off the alert channels.
pub fn notice_for_event(event: &Event) -> Option<Notice> {
    let now = Utc::now();
    let notice = |severity: Severity, title: String, message: String, refs: AlertRefs| Notice {
        kind: event.topic().to_string(),
        severity,
        title,
        message,
        refs,
        created_at: now,
    };

    Some(match event {
        Event::PrinterDisconnected { printer_id } => notice(
            Severity::Warning,
            "Printer offline".to_string(),
            format!("Printer #{printer_id} stopped reporting."),
            AlertRefs { printer_id: Some(*printer_id), ..AlertRefs::default() },
        ),
        Event::PrinterError { printer_id, message, severity, .. }
        | Event::PrinterHmsCode { printer_id, message, severity, .. } => notice(
            *severity,
            "Printer error".to_string(),
            message.clone(),
            AlertRefs { printer_id: Some(*printer_id), ..AlertRefs::default() },
        ),
        Event::JobCompleted { job_id, printer_id } => notice(
            Severity::Info,
            "Job completed".to_string(),
            format!("Job #{job_id} finished."),
            AlertRefs { job_id: Some(*job_id), printer_id: *printer_id, ..AlertRefs::default() },
        ),
        Event::JobFailed { job_id, printer_id, reason } => notice(
            Severity::Critical,
            "Job failed".to_string(),
            format!("Job #{job_id} failed: {reason}."),
            AlertRefs { job_id: Some(*job_id), printer_id: *printer_id, ..AlertRefs::default() },
        ),
        Event::SpoolLow { spool_id, remaining_grams } => notice(
            Severity::Warning,
            "Spool running low".to_string(),
            format!("Spool #{spool_id} is down to {remaining_grams:.0} g."),
            AlertRefs { spool_id: Some(*spool_id), ..AlertRefs::default() },
        ),
        Event::SpoolEmpty { spool_id } => notice(
            Severity::Warning,
            "Spool empty".to_string(),
            format!("Spool #{spool_id} is empty."),
            AlertRefs { spool_id: Some(*spool_id), ..AlertRefs::default() },
        ),
        Event::SpoolMismatch { printer_id, slot_number, spool_id, reported_hex } => notice(
            Severity::Warning,
            "Loaded filament mismatch".to_string(),
            format!(
                "Slot {slot_number} on printer #{printer_id} reports {reported_hex}, \
                 which no longer matches spool #{spool_id}."
            ),
            AlertRefs {
                printer_id: Some(*printer_id),
                spool_id: Some(*spool_id),
                ..AlertRefs::default()
            },
        ),
        Event::VisionDetection { printer_id, kind, confidence } => notice(
            Severity::Warning,
            "Possible print failure".to_string(),
            format!("Detected {kind} on printer #{printer_id} ({confidence:.0}% confidence)."),
            AlertRefs { printer_id: Some(*printer_id), ..AlertRefs::default() },
        ),
        Event::BackupCompleted { path } => notice(
            Severity::Info,
            "Backup completed".to_string(),
            format!("State store snapshot written to {path}."),
            AlertRefs::default(),
        ),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_store;

    fn preference(quiet: Option<(&str, &str)>) -> AlertPreference {
        AlertPreference {
            id: 1,
            user_id: 1,
            in_app: true,
            email: false,
            push: false,
            webhook: true,
            min_severity: "info".to_string(),
            quiet_start: quiet.map(|(start, _)| start.to_string()),
            quiet_end: quiet.map(|(_, end)| end.to_string()),
            email_address: None,
        }
    }

    fn time(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
    }

    #[test]
    fn quiet_hours_wrap_midnight() {
        let preference = preference(Some(("22:00", "07:00")));
        assert!(in_quiet_hours(&preference, time(23, 0)));
        assert!(in_quiet_hours(&preference, time(3, 0)));
        assert!(!in_quiet_hours(&preference, time(12, 0)));
        // Boundaries: quiet starts at start, ends at end.
        assert!(in_quiet_hours(&preference, time(22, 0)));
        assert!(!in_quiet_hours(&preference, time(7, 0)));
    }

    #[test]
    fn no_quiet_hours_means_always_deliver() {
        assert!(!in_quiet_hours(&preference(None), time(3, 0)));
    }

    #[test]
    fn routine_events_produce_no_notice() {
        assert!(notice_for_event(&Event::PrinterConnected { printer_id: 1 }).is_none());
        assert!(notice_for_event(&Event::JobScheduled {
            job_id: 1,
            printer_id: 1,
            scheduled_start: Utc::now(),
            scheduled_end: Utc::now(),
        })
        .is_none());
    }

    #[test]
    fn failures_are_critical() {
        let notice = notice_for_event(&Event::JobFailed {
            job_id: 9,
            printer_id: Some(2),
            reason: "clog".to_string(),
        })
        .unwrap();
        assert_eq!(notice.severity, Severity::Critical);
        assert_eq!(notice.kind, "job.failed");
        assert_eq!(notice.refs.job_id, Some(9));
        assert!(notice.message.contains("clog"));
    }

    #[tokio::test]
    async fn routing_respects_min_severity_and_writes_rows() {
        let store = test_store().await;
        store
            .upsert_alert_preference(
                1,
                true,
                false,
                false,
                true,
                Severity::Warning,
                None,
                None,
                None,
            )
            .await
            .unwrap();

        let dispatcher = AlertDispatcher::new(store.clone(), crate::config::test_config());

        // Info is below the user's warning floor.
        let info = notice_for_event(&Event::JobCompleted { job_id: 1, printer_id: None }).unwrap();
        dispatcher.route(&info, &Event::JobCompleted { job_id: 1, printer_id: None }).await;
        assert!(store.unread_alerts(1).await.unwrap().is_empty());

        let failed_event = Event::JobFailed {
            job_id: 2,
            printer_id: None,
            reason: "clog".to_string(),
        };
        let critical = notice_for_event(&failed_event).unwrap();
        dispatcher.route(&critical, &failed_event).await;
        let alerts = store.unread_alerts(1).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, "job.failed");
    }
}
