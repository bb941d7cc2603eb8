//! Deal alert delivery: HTML table rendering (Askama) + SMTP transport (lettre).

use askama::Template;
use async_trait::async_trait;
use dealwatch_core::DealAlert;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "dealwatch-notify";

/// Display projection of one alert. Absent values render as empty cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertRow {
    pub title: String,
    pub price: String,
    pub rating: String,
    pub reviews: String,
    pub availability: String,
}

impl AlertRow {
    pub fn from_alert(alert: &DealAlert) -> Self {
        let observation = alert.observation();
        Self {
            title: observation.title.clone(),
            price: format!("{:.2}", alert.price),
            rating: observation.rating.clone().unwrap_or_default(),
            reviews: observation.review_count.clone().unwrap_or_default(),
            availability: observation.availability.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertCopy {
    pub subject: String,
    pub heading: String,
}

impl AlertCopy {
    pub fn for_threshold(retailer: &str, threshold: Decimal) -> Self {
        let limit = threshold.round_dp(2).normalize();
        Self {
            subject: format!("New {retailer} Deals Under ${limit}"),
            heading: format!("New {retailer} Deals (Under ${limit})"),
        }
    }
}

#[derive(Template)]
#[template(path = "deal_alert.html")]
struct DealAlertTemplate<'a> {
    heading: &'a str,
    rows: &'a [AlertRow],
}

pub fn render_alert_html(heading: &str, alerts: &[DealAlert]) -> Result<String, NotifyError> {
    let rows: Vec<AlertRow> = alerts.iter().map(AlertRow::from_alert).collect();
    let html = DealAlertTemplate {
        heading,
        rows: &rows,
    }
    .render()?;
    Ok(html)
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid mail address {address:?}: {source}")]
    Address {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },
    #[error("rendering alert email: {0}")]
    Render(#[from] askama::Error),
    #[error("building alert email: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("smtp delivery failed: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Skipped,
    Sent { rows: usize },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one batch. An empty batch is a no-op that never touches the transport.
    async fn notify(&self, alerts: &[DealAlert]) -> Result<NotifyOutcome, NotifyError>;
}

/// Credentials and addressing for the alert mail. The password is never
/// printed by `Debug`.
#[derive(Clone)]
pub struct MailConfig {
    pub sender: String,
    pub password: String,
    pub recipient: String,
    pub smtp_host: String,
}

impl std::fmt::Debug for MailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailConfig")
            .field("sender", &self.sender)
            .field("password", &"<redacted>")
            .field("recipient", &self.recipient)
            .field("smtp_host", &self.smtp_host)
            .finish()
    }
}

/// Addresses and the relay are resolved per delivery, so bad mail settings
/// surface as a `NotifyError` from `notify` instead of at construction.
pub struct SmtpNotifier {
    config: MailConfig,
    copy: AlertCopy,
}

fn parse_mailbox(address: &str) -> Result<Mailbox, NotifyError> {
    address.parse().map_err(|source| NotifyError::Address {
        address: address.to_string(),
        source,
    })
}

impl SmtpNotifier {
    pub fn new(config: MailConfig, copy: AlertCopy) -> Self {
        Self { config, copy }
    }

    pub fn build_message(&self, alerts: &[DealAlert]) -> Result<Message, NotifyError> {
        let from = parse_mailbox(&self.config.sender)?;
        let to = parse_mailbox(&self.config.recipient)?;
        let html = render_alert_html(&self.copy.heading, alerts)?;
        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(self.copy.subject.clone())
            .header(ContentType::TEXT_HTML)
            .body(html)?;
        Ok(message)
    }

    /// Implicit-TLS submission (port 465) with login credentials.
    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, NotifyError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&self.config.smtp_host)?
            .credentials(Credentials::new(
                self.config.sender.clone(),
                self.config.password.clone(),
            ))
            .build();
        Ok(transport)
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(&self, alerts: &[DealAlert]) -> Result<NotifyOutcome, NotifyError> {
        if alerts.is_empty() {
            return Ok(NotifyOutcome::Skipped);
        }
        let message = self.build_message(alerts)?;
        self.transport()?.send(message).await?;
        info!(rows = alerts.len(), to = %self.config.recipient, "deal alert sent");
        Ok(NotifyOutcome::Sent { rows: alerts.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use dealwatch_core::{ChangeKind, ChangeSetEntry, Observation};
    use std::str::FromStr;

    fn alert(title: &str, price: &str, rating: Option<&str>) -> DealAlert {
        let price = Decimal::from_str(price).unwrap();
        DealAlert {
            entry: ChangeSetEntry {
                observation: Observation {
                    title: title.to_string(),
                    price: Some(price),
                    rating: rating.map(ToString::to_string),
                    review_count: None,
                    availability: "In Stock".to_string(),
                    observed_date: NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
                },
                previous: None,
                kind: ChangeKind::New,
            },
            price,
        }
    }

    #[test]
    fn copy_uses_the_configured_threshold() {
        let copy = AlertCopy::for_threshold("Amazon", Decimal::from_str("50.00").unwrap());
        assert_eq!(copy.subject, "New Amazon Deals Under $50");
        assert_eq!(copy.heading, "New Amazon Deals (Under $50)");
        let copy = AlertCopy::for_threshold("Amazon", Decimal::from_str("39.5").unwrap());
        assert_eq!(copy.subject, "New Amazon Deals Under $39.5");
    }

    #[test]
    fn rows_project_absent_values_as_empty_cells() {
        let row = AlertRow::from_alert(&alert("Sneaker A", "45", None));
        assert_eq!(
            row,
            AlertRow {
                title: "Sneaker A".into(),
                price: "45.00".into(),
                rating: String::new(),
                reviews: String::new(),
                availability: "In Stock".into(),
            }
        );
    }

    #[test]
    fn rendered_table_has_one_escaped_row_per_alert() {
        let alerts = vec![
            alert("Sneaker <b>A</b>", "35.00", Some("4.4 out of 5 stars")),
            alert("Sneaker C", "30.00", None),
        ];
        let html = render_alert_html("New Amazon Deals (Under $50)", &alerts).unwrap();
        assert!(html.contains("<h3>New Amazon Deals (Under $50)</h3>"));
        assert_eq!(html.matches("<tr>").count(), 2);
        assert!(html.contains("Sneaker &lt;b&gt;A&lt;/b&gt;"));
        assert!(html.contains("<td>35.00</td>"));
        assert!(html.contains("<td>4.4 out of 5 stars</td>"));
    }

    #[test]
    fn invalid_addresses_fail_the_message_not_the_notifier() {
        let config = MailConfig {
            sender: "not-an-address".into(),
            password: "secret".into(),
            recipient: "deals@example.com".into(),
            smtp_host: "smtp.example.com".into(),
        };
        assert!(!format!("{config:?}").contains("secret"));
        let copy = AlertCopy::for_threshold("Amazon", Decimal::from(50));
        let notifier = SmtpNotifier::new(config, copy);
        let err = notifier
            .build_message(&[alert("Sneaker A", "45.00", None)])
            .err()
            .expect("address error");
        assert!(matches!(err, NotifyError::Address { .. }), "{err}");
    }

    #[test]
    fn message_carries_subject_and_html_body() {
        let config = MailConfig {
            sender: "bot@example.com".into(),
            password: "secret".into(),
            recipient: "deals@example.com".into(),
            smtp_host: "smtp.example.com".into(),
        };
        let copy = AlertCopy::for_threshold("Amazon", Decimal::from(50));
        let notifier = SmtpNotifier::new(config, copy);
        let message = notifier.build_message(&[alert("Sneaker A", "45.00", None)]).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: New Amazon Deals Under $50"));
        assert!(raw.contains("Content-Type: text/html"));
    }
}
