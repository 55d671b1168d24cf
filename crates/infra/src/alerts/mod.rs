//! Alerting: rule evaluation over executions and queue health, throttling,
//! persisted alert history, and delivery over pluggable channels.

pub mod channels;
pub mod config;
pub mod manager;
pub mod throttle;

pub use channels::{
    ChannelError, ChannelKind, Delivery, DiscordTransport, EmailTransport, MessageOptions, Notifier,
    RecordingTransport, SlackTransport, TracingTransport,
};
pub use config::{
    AlertConfig, AlertConfigError, AlertRule, AlertRuleSet, AlertSettings, JobFailureConditions,
    PerformanceConditions, QueueHealthConditions, Severity, ThrottlePolicy,
};
pub use manager::{
    AlertEvent, AlertManager, AlertMonitorHandle, AlertRequest, AlertStatus, DeadLetterCursor, QueueHealthSnapshot,
    QueueHealthSource, TestAlertReport,
};
pub use throttle::{AlertThrottle, Suppression};
