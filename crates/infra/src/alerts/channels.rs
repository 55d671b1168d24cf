//! Notification channels.
//!
//! Concrete Slack/email/Discord clients live outside this crate; they plug in
//! through the transport traits below. [`Notifier`] renders an
//! [`AlertEvent`](super::AlertEvent) for each channel and hands it over.

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::config::{AlertSettings, Severity};
use super::manager::AlertEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Slack,
    Email,
    Discord,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [ChannelKind::Slack, ChannelKind::Email, ChannelKind::Discord];

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Slack => "slack",
            ChannelKind::Email => "email",
            ChannelKind::Discord => "discord",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChannelKind::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ChannelError::Unknown(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("unknown channel: {0}")]
    Unknown(String),
    #[error("no {0} transport configured")]
    NotConfigured(ChannelKind),
    #[error("{0} transport is disabled")]
    Disabled(ChannelKind),
    #[error("{channel} delivery failed: {message}")]
    Delivery { channel: ChannelKind, message: String },
}

/// Presentation hints for chat transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageOptions {
    pub severity: Severity,
    pub title: String,
    pub username: Option<String>,
}

pub trait SlackTransport: Send + Sync {
    fn is_enabled(&self) -> bool;
    fn send_slack(&self, channel: Option<&str>, text: &str, opts: &MessageOptions) -> Result<(), ChannelError>;
}

pub trait EmailTransport: Send + Sync {
    fn is_enabled(&self) -> bool;
    fn send_email(&self, to: &[String], subject: &str, body: &str) -> Result<(), ChannelError>;
}

pub trait DiscordTransport: Send + Sync {
    fn is_enabled(&self) -> bool;
    fn send_discord(&self, text: &str, opts: &MessageOptions) -> Result<(), ChannelError>;
}

/// Fan-out point to whichever transports are wired.
#[derive(Clone, Default)]
pub struct Notifier {
    slack: Option<Arc<dyn SlackTransport>>,
    email: Option<Arc<dyn EmailTransport>>,
    discord: Option<Arc<dyn DiscordTransport>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slack(mut self, transport: Arc<dyn SlackTransport>) -> Self {
        self.slack = Some(transport);
        self
    }

    pub fn with_email(mut self, transport: Arc<dyn EmailTransport>) -> Self {
        self.email = Some(transport);
        self
    }

    pub fn with_discord(mut self, transport: Arc<dyn DiscordTransport>) -> Self {
        self.discord = Some(transport);
        self
    }

    /// Same transport for every channel.
    pub fn with_all<T>(transport: Arc<T>) -> Self
    where
        T: SlackTransport + EmailTransport + DiscordTransport + 'static,
    {
        Self {
            slack: Some(transport.clone()),
            email: Some(transport.clone()),
            discord: Some(transport),
        }
    }

    pub fn is_enabled(&self, kind: ChannelKind) -> bool {
        match kind {
            ChannelKind::Slack => self.slack.as_ref().is_some_and(|t| t.is_enabled()),
            ChannelKind::Email => self.email.as_ref().is_some_and(|t| t.is_enabled()),
            ChannelKind::Discord => self.discord.as_ref().is_some_and(|t| t.is_enabled()),
        }
    }

    pub fn enabled_channels(&self) -> Vec<ChannelKind> {
        ChannelKind::ALL.into_iter().filter(|k| self.is_enabled(*k)).collect()
    }

    /// Deliver one event over one channel.
    pub fn deliver(&self, kind: ChannelKind, event: &AlertEvent, settings: &AlertSettings) -> Result<(), ChannelError> {
        let opts = MessageOptions {
            severity: event.severity,
            title: event.title.clone(),
            username: settings.discord.username.clone(),
        };
        let text = format!("[{}] {}\n{}", event.severity.as_str().to_uppercase(), event.title, event.message);

        match kind {
            ChannelKind::Slack => {
                let t = self.slack.as_ref().ok_or(ChannelError::NotConfigured(kind))?;
                if !t.is_enabled() {
                    return Err(ChannelError::Disabled(kind));
                }
                t.send_slack(settings.slack.channel.as_deref(), &text, &opts)
            }
            ChannelKind::Email => {
                let t = self.email.as_ref().ok_or(ChannelError::NotConfigured(kind))?;
                if !t.is_enabled() {
                    return Err(ChannelError::Disabled(kind));
                }
                if settings.email.recipients.is_empty() {
                    return Err(ChannelError::Delivery {
                        channel: kind,
                        message: "no email recipients configured".into(),
                    });
                }
                let subject = format!("[{}] {}", event.severity.as_str().to_uppercase(), event.title);
                t.send_email(&settings.email.recipients, &subject, &event.message)
            }
            ChannelKind::Discord => {
                let t = self.discord.as_ref().ok_or(ChannelError::NotConfigured(kind))?;
                if !t.is_enabled() {
                    return Err(ChannelError::Disabled(kind));
                }
                t.send_discord(&text, &opts)
            }
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("channels", &self.enabled_channels())
            .finish()
    }
}

/// Writes alerts to the log instead of an external service.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTransport;

impl SlackTransport for TracingTransport {
    fn is_enabled(&self) -> bool {
        true
    }

    fn send_slack(&self, channel: Option<&str>, text: &str, opts: &MessageOptions) -> Result<(), ChannelError> {
        info!(channel = "slack", slack_channel = ?channel, severity = %opts.severity, text = %text, "alert");
        Ok(())
    }
}

impl EmailTransport for TracingTransport {
    fn is_enabled(&self) -> bool {
        true
    }

    fn send_email(&self, to: &[String], subject: &str, body: &str) -> Result<(), ChannelError> {
        info!(channel = "email", to = ?to, subject = %subject, body = %body, "alert");
        Ok(())
    }
}

impl DiscordTransport for TracingTransport {
    fn is_enabled(&self) -> bool {
        true
    }

    fn send_discord(&self, text: &str, opts: &MessageOptions) -> Result<(), ChannelError> {
        info!(channel = "discord", username = ?opts.username, severity = %opts.severity, text = %text, "alert");
        Ok(())
    }
}

/// One captured delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub channel: ChannelKind,
    pub target: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// Keeps every delivery in memory; individual channels can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    deliveries: Mutex<Vec<Delivery>>,
    failing: Mutex<Vec<ChannelKind>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, kind: ChannelKind) {
        if let Ok(mut f) = self.failing.lock() {
            f.push(kind);
        }
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn count(&self, kind: ChannelKind) -> usize {
        self.deliveries().iter().filter(|d| d.channel == kind).count()
    }

    fn capture(&self, delivery: Delivery) -> Result<(), ChannelError> {
        let failing = self.failing.lock().map(|f| f.contains(&delivery.channel)).unwrap_or(false);
        if failing {
            return Err(ChannelError::Delivery {
                channel: delivery.channel,
                message: "transport unavailable".into(),
            });
        }
        if let Ok(mut d) = self.deliveries.lock() {
            d.push(delivery);
        }
        Ok(())
    }
}

impl SlackTransport for RecordingTransport {
    fn is_enabled(&self) -> bool {
        true
    }

    fn send_slack(&self, channel: Option<&str>, text: &str, opts: &MessageOptions) -> Result<(), ChannelError> {
        self.capture(Delivery {
            channel: ChannelKind::Slack,
            target: channel.map(str::to_string).into_iter().collect(),
            subject: opts.title.clone(),
            body: text.to_string(),
        })
    }
}

impl EmailTransport for RecordingTransport {
    fn is_enabled(&self) -> bool {
        true
    }

    fn send_email(&self, to: &[String], subject: &str, body: &str) -> Result<(), ChannelError> {
        self.capture(Delivery {
            channel: ChannelKind::Email,
            target: to.to_vec(),
            subject: subject.to_string(),
            body: body.to_string(),
        })
    }
}

impl DiscordTransport for RecordingTransport {
    fn is_enabled(&self) -> bool {
        true
    }

    fn send_discord(&self, text: &str, opts: &MessageOptions) -> Result<(), ChannelError> {
        self.capture(Delivery {
            channel: ChannelKind::Discord,
            target: opts.username.clone().into_iter().collect(),
            subject: opts.title.clone(),
            body: text.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::alerts::config::{EmailSettings, SlackSettings};
    use jobwarden_core::AlertEventId;

    fn event() -> AlertEvent {
        AlertEvent {
            id: AlertEventId::new(),
            alert_name: "sync-streak".into(),
            severity: Severity::High,
            title: "sync failed 3 times in a row".into(),
            message: "last error: upstream 503".into(),
            channels: vec![ChannelKind::Slack, ChannelKind::Email],
            metadata: serde_json::json!({}),
            triggered_at: Utc::now(),
            job_id: Some("sync".into()),
            queued_job_id: None,
        }
    }

    fn settings() -> AlertSettings {
        AlertSettings {
            enabled: true,
            slack: SlackSettings {
                channel: Some("#ops".into()),
            },
            email: EmailSettings {
                recipients: vec!["oncall@example.com".into()],
            },
            ..AlertSettings::default()
        }
    }

    #[test]
    fn renders_per_channel() {
        let transport = Arc::new(RecordingTransport::new());
        let notifier = Notifier::with_all(transport.clone());

        notifier.deliver(ChannelKind::Slack, &event(), &settings()).unwrap();
        notifier.deliver(ChannelKind::Email, &event(), &settings()).unwrap();

        let deliveries = transport.deliveries();
        assert_eq!(deliveries[0].target, vec!["#ops"]);
        assert!(deliveries[0].body.starts_with("[HIGH] sync failed"));
        assert_eq!(deliveries[1].target, vec!["oncall@example.com"]);
        assert_eq!(deliveries[1].subject, "[HIGH] sync failed 3 times in a row");
    }

    #[test]
    fn missing_transport_and_recipients_are_errors() {
        let notifier = Notifier::new().with_email(Arc::new(TracingTransport));
        assert_eq!(
            notifier.deliver(ChannelKind::Slack, &event(), &settings()),
            Err(ChannelError::NotConfigured(ChannelKind::Slack))
        );

        let no_recipients = AlertSettings::default();
        assert!(matches!(
            notifier.deliver(ChannelKind::Email, &event(), &no_recipients),
            Err(ChannelError::Delivery { .. })
        ));
        assert_eq!(notifier.enabled_channels(), vec![ChannelKind::Email]);
    }

    #[test]
    fn channel_names_parse() {
        assert_eq!("Discord".parse::<ChannelKind>().unwrap(), ChannelKind::Discord);
        assert!("pager".parse::<ChannelKind>().is_err());
    }
}
