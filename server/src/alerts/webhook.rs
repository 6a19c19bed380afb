//! Webhook fan-out: per-kind payload formatting and an SSRF guard on
//! configured URLs.

use std::net::IpAddr;
use std::time::Duration;

use crate::alerts::Notice;

pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Reject webhook targets that point back into the deployment.
/// Loopback and link-local are always refused; RFC1918 ranges only
/// when `block_private` is configured.
pub fn validate_url(raw: &str, block_private: bool) -> Result<reqwest::Url, String> {
    let url = reqwest::Url::parse(raw).map_err(|e| format!("invalid url: {e}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme {}", url.scheme()));
    }
    let Some(host) = url.host_str() else {
        return Err("url has no host".to_string());
    };

    if host.eq_ignore_ascii_case("localhost") {
        return Err("loopback host refused".to_string());
    }
    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        if ip.is_loopback() || ip.is_unspecified() {
            return Err("loopback address refused".to_string());
        }
        let link_local = match ip {
            IpAddr::V4(v4) => v4.is_link_local(),
            IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
        };
        if link_local {
            return Err("link-local address refused".to_string());
        }
        if block_private {
            let private = match ip {
                IpAddr::V4(v4) => v4.is_private(),
                IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
            };
            if private {
                return Err("private address refused".to_string());
            }
        }
    }
    Ok(url)
}

/// Channel-specific request body for one notice.
pub fn payload_for(kind: &str, notice: &Notice, event_json: &serde_json::Value) -> serde_json::Value {
    let line = format!("{}: {}", notice.title, notice.message);
    match kind {
        "discord" => serde_json::json!({
            "embeds": [{
                "title": notice.title,
                "description": notice.message,
                "color": match notice.severity {
                    crate::events::Severity::Critical => 0xDC2626,
                    crate::events::Severity::Warning => 0xEAB308,
                    crate::events::Severity::Info => 0x2563EB,
                },
            }]
        }),
        "slack" => serde_json::json!({ "text": line }),
        "ntfy" => serde_json::json!({
            "title": notice.title,
            "message": notice.message,
            "priority": match notice.severity {
                crate::events::Severity::Critical => 5,
                crate::events::Severity::Warning => 4,
                crate::events::Severity::Info => 3,
            },
        }),
        "telegram" => serde_json::json!({ "text": line }),
        "pushover" => serde_json::json!({ "message": line, "title": notice.title }),
        "whatsapp" => serde_json::json!({ "body": line }),
        // Generic endpoints get the full event envelope.
        _ => serde_json::json!({
            "kind": notice.kind,
            "severity": notice.severity.as_str(),
            "title": notice.title,
            "message": notice.message,
            "event": event_json,
        }),
    }
}

/// Fire one delivery. Failures are logged, never retried.
pub async fn deliver(
    client: &reqwest::Client,
    endpoint_name: &str,
    kind: &str,
    url: reqwest::Url,
    notice: &Notice,
    event_json: &serde_json::Value,
) {
    let payload = payload_for(kind, notice, event_json);
    let result = tokio::time::timeout(
        DELIVERY_TIMEOUT,
        client.post(url).json(&payload).send(),
    )
    .await;
    match result {
        Ok(Ok(response)) if response.status().is_success() => {
            tracing::debug!(endpoint = endpoint_name, "webhook delivered");
        }
        Ok(Ok(response)) => {
            tracing::warn!(
                endpoint = endpoint_name,
                status = %response.status(),
                "webhook rejected"
            );
        }
        Ok(Err(e)) => {
            tracing::warn!(endpoint = endpoint_name, "webhook failed: {e}");
        }
        Err(_) => {
            tracing::warn!(endpoint = endpoint_name, "webhook timed out");
        }
    }
}
