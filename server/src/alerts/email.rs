//! SMTP delivery channel.

use std::time::Duration;

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::SmtpConfig;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

pub struct EmailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailSender {
    pub fn new(config: &SmtpConfig) -> Option<Self> {
        let from: Mailbox = config.from.parse().ok()?;
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host).ok()?;
        builder = builder.port(config.port);
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }
        Some(Self { transport: builder.build(), from })
    }

    /// Fire one message. Failures are logged, never retried.
    pub async fn send(&self, to: &str, subject: &str, body: &str) {
        let Ok(to) = to.parse::<Mailbox>() else {
            tracing::warn!(to, "invalid recipient address");
            return;
        };
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .body(body.to_string());
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("email build failed: {e}");
                return;
            }
        };
        match tokio::time::timeout(SEND_TIMEOUT, self.transport.send(message)).await {
            Ok(Ok(_)) => tracing::debug!(subject, "email sent"),
            Ok(Err(e)) => tracing::warn!(subject, "email failed: {e}"),
            Err(_) => tracing::warn!(subject, "email timed out"),
        }
    }
}
