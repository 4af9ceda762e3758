use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{Mailbox, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::{AlertError, AlertSink, EmailSettings};
use crate::modules::monitor::Alert;

const SMTP_TIMEOUT: Duration = Duration::from_secs(10);
const IMPLICIT_TLS_PORT: u16 = 465;

/// How the SMTP session is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Security {
    /// TLS from the first byte (port 465).
    Implicit,
    /// STARTTLS is mandatory.
    Required,
    /// STARTTLS when the relay offers it, plaintext otherwise.
    Opportunistic,
}

fn security(host: &str, port: u16) -> Security {
    if port == IMPLICIT_TLS_PORT {
        Security::Implicit
    } else if is_loopback(host) {
        Security::Opportunistic
    } else {
        Security::Required
    }
}

fn is_loopback(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.eq_ignore_ascii_case("localhost")
        || host
            .parse::<std::net::IpAddr>()
            .is_ok_and(|addr| addr.is_loopback())
}

/// Sends alerts as plain-text mail through an SMTP relay. Credentials are
/// sent only when a username is configured.
#[derive(Debug, Clone)]
pub struct EmailAlertSink {
    settings: EmailSettings,
}

impl EmailAlertSink {
    pub fn new(settings: EmailSettings) -> Self {
        Self { settings }
    }

    fn message(&self, alert: &Alert) -> Result<Message, AlertError> {
        if self.settings.to.is_empty() {
            return Err(AlertError::Configuration("no email recipients".into()));
        }

        let from: Mailbox = self
            .settings
            .from
            .parse()
            .map_err(|err| AlertError::Configuration(format!("sender address: {err}")))?;
        let mut builder = Message::builder().from(from).subject(subject(alert));
        for recipient in &self.settings.to {
            let mailbox: Mailbox = recipient.parse().map_err(|err| {
                AlertError::Configuration(format!("recipient address '{recipient}': {err}"))
            })?;
            builder = builder.to(mailbox);
        }

        builder
            .header(ContentType::TEXT_PLAIN)
            .body(body(alert))
            .map_err(|err| AlertError::Configuration(err.to_string()))
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, AlertError> {
        let host = self.settings.host.as_str();
        let relay_error = |err: lettre::transport::smtp::Error| {
            AlertError::Configuration(format!("smtp relay {host}: {err}"))
        };
        let builder = match security(host, self.settings.port) {
            Security::Implicit => {
                AsyncSmtpTransport::<Tokio1Executor>::relay(host).map_err(relay_error)?
            }
            Security::Required => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host).map_err(relay_error)?
            }
            Security::Opportunistic => {
                let tls = TlsParameters::new(host.to_string()).map_err(relay_error)?;
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
                    .tls(Tls::Opportunistic(tls))
            }
        };

        let mut builder = builder.port(self.settings.port).timeout(Some(SMTP_TIMEOUT));
        if !self.settings.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                self.settings.username.clone(),
                self.settings.password.clone(),
            ));
        }
        Ok(builder.build())
    }
}

#[async_trait]
impl AlertSink for EmailAlertSink {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), AlertError> {
        let message = self.message(alert)?;
        self.transport()?
            .send(message)
            .await
            .map_err(|err| AlertError::Delivery(err.to_string()))?;
        Ok(())
    }
}

pub(crate) fn subject(alert: &Alert) -> String {
    format!("[{}] Checkout Error Alert", alert.event.category)
}

pub(crate) fn body(alert: &Alert) -> String {
    let event = &alert.event;
    let mut body = String::new();
    let _ = writeln!(body, "Error Alert\n");
    let _ = writeln!(body, "Event ID: {}", event.id);
    let _ = writeln!(body, "Time: {}", event.timestamp.to_rfc3339());
    let _ = writeln!(body, "Category: {}", event.category);
    let _ = writeln!(body, "Severity: {}", event.severity);
    let _ = writeln!(body, "Message: {}", event.message);

    if !event.details.is_empty() {
        let _ = writeln!(body, "\nDetails:");
        for (key, value) in &event.details {
            match value {
                serde_json::Value::String(text) => {
                    let _ = writeln!(body, "  {key}: {text}");
                }
                other => {
                    let _ = writeln!(body, "  {key}: {other}");
                }
            }
        }
    }

    let _ = writeln!(
        body,
        "\n{} {} errors since the previous alert.",
        alert.category_count, event.category
    );
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::monitor::{ErrorCategory, ErrorEvent, EventDetails, Severity};
    use chrono::Utc;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn alert() -> Alert {
        let mut details = EventDetails::new();
        details.insert("card_last4".into(), json!("4450"));
        details.insert("attempt".into(), json!(2));
        Alert {
            event: ErrorEvent {
                id: "err_1700000000_4".into(),
                timestamp: Utc::now(),
                severity: Severity::Critical,
                category: ErrorCategory::Payment,
                message: "Payment failed: declined".into(),
                details,
                resolved: false,
                resolved_at: None,
                retry_count: 0,
            },
            category_count: 1,
        }
    }

    fn settings(to: Vec<String>) -> EmailSettings {
        EmailSettings {
            host: "smtp.invalid".into(),
            port: 587,
            username: "bot".into(),
            password: "secret".into(),
            from: "alerts@shop.invalid".into(),
            to,
        }
    }

    #[test]
    fn subject_names_the_category() {
        assert_eq!(subject(&alert()), "[PAYMENT] Checkout Error Alert");
    }

    #[test]
    fn body_lists_fields_details_and_count() {
        let body = body(&alert());
        assert!(body.contains("Event ID: err_1700000000_4"));
        assert!(body.contains("Severity: CRITICAL"));
        assert!(body.contains("Message: Payment failed: declined"));
        assert!(body.contains("  card_last4: 4450"));
        assert!(body.contains("  attempt: 2"));
        assert!(body.contains("1 PAYMENT errors since the previous alert."));
    }

    #[test]
    fn rejects_missing_or_bad_recipients() {
        let sink = EmailAlertSink::new(settings(Vec::new()));
        assert!(matches!(sink.message(&alert()), Err(AlertError::Configuration(_))));

        let sink = EmailAlertSink::new(settings(vec!["not an address".into()]));
        assert!(matches!(sink.message(&alert()), Err(AlertError::Configuration(_))));

        let sink = EmailAlertSink::new(settings(vec!["ops@shop.invalid".into()]));
        assert!(sink.message(&alert()).is_ok());
    }

    #[test]
    fn only_loopback_relays_may_skip_tls() {
        assert_eq!(security("smtp.shop.invalid", 465), Security::Implicit);
        assert_eq!(security("smtp.shop.invalid", 587), Security::Required);
        assert_eq!(security("smtp.shop.invalid", 25), Security::Required);
        assert_eq!(security("localhost", 25), Security::Opportunistic);
        assert_eq!(security("127.0.0.1", 1025), Security::Opportunistic);
        assert_eq!(security("[::1]", 1025), Security::Opportunistic);
        assert_eq!(security("localhost", 465), Security::Implicit);
    }

    /// Minimal SMTP relay without STARTTLS; yields the DATA payload.
    async fn plaintext_relay() -> (u16, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            write.write_all(b"220 localhost ESMTP\r\n").await.unwrap();

            let mut data = String::new();
            let mut in_data = false;
            while let Ok(Some(line)) = lines.next_line().await {
                if in_data {
                    if line == "." {
                        in_data = false;
                        write.write_all(b"250 queued\r\n").await.unwrap();
                    } else {
                        data.push_str(&line);
                        data.push('\n');
                    }
                    continue;
                }
                let command = line.to_ascii_uppercase();
                let reply: &[u8] = if command.starts_with("EHLO") || command.starts_with("HELO") {
                    b"250 localhost\r\n"
                } else if command.starts_with("DATA") {
                    in_data = true;
                    b"354 go ahead\r\n"
                } else if command.starts_with("QUIT") {
                    let _ = write.write_all(b"221 bye\r\n").await;
                    break;
                } else {
                    b"250 ok\r\n"
                };
                write.write_all(reply).await.unwrap();
            }
            let _ = tx.send(data);
        });

        (port, rx)
    }

    #[tokio::test]
    async fn delivers_through_plaintext_local_relay() {
        let (port, data) = plaintext_relay().await;
        let sink = EmailAlertSink::new(EmailSettings {
            host: "127.0.0.1".into(),
            port,
            username: String::new(),
            password: String::new(),
            from: "alerts@shop.invalid".into(),
            to: vec!["ops@shop.invalid".into()],
        });

        sink.deliver(&alert()).await.unwrap();

        let data = data.await.unwrap();
        assert!(data.contains("Subject: [PAYMENT] Checkout Error Alert"));
        assert!(data.contains("Event ID: err_1700000000_4"));
    }
}
