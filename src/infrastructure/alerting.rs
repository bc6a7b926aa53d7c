//! Webhook notifications for critical trading events, with fingerprint
//! deduplication and escalation of unresolved alerts.

use crate::config::AlertSettings;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "INFO"),
            AlertSeverity::Warning => write!(f, "WARNING"),
            AlertSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl FromStr for AlertSeverity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "info" => Ok(AlertSeverity::Info),
            "warning" => Ok(AlertSeverity::Warning),
            "critical" => Ok(AlertSeverity::Critical),
            _ => Err(()),
        }
    }
}

struct AlertRecord {
    last_seen: Instant,
    first_seen: Instant,
    count: u32,
    escalated: bool,
}

pub struct AlertService {
    enabled: bool,
    webhook_url: String,
    min_severity: AlertSeverity,
    dry_run: bool,
    timeout: Duration,
    dedupe_window: Duration,
    escalation_after: Duration,
    client: reqwest::Client,
    history: Mutex<HashMap<String, AlertRecord>>,
}

impl AlertService {
    pub fn from_settings(settings: &AlertSettings) -> Self {
        let enabled = settings.enabled && !settings.webhook_url.is_empty();
        if settings.enabled && settings.webhook_url.is_empty() {
            warn!("alerting enabled but no webhook URL set; disabling alerts");
        }
        let min_severity =
            AlertSeverity::from_str(&settings.min_severity).unwrap_or(AlertSeverity::Warning);
        Self {
            enabled,
            webhook_url: settings.webhook_url.clone(),
            min_severity,
            dry_run: settings.dry_run,
            timeout: Duration::from_secs(settings.timeout_secs),
            dedupe_window: Duration::from_secs(settings.dedupe_secs),
            escalation_after: Duration::from_secs(settings.escalation_secs),
            client: reqwest::Client::new(),
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Disabled service for tests and DRY_RUN shakedowns.
    pub fn disabled() -> Self {
        Self::from_settings(&AlertSettings::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Distinct alerts seen so far (dedupe fingerprints).
    pub fn alert_count(&self) -> usize {
        self.history.lock().expect("alert history lock poisoned").len()
    }

    pub async fn notify(
        &self,
        severity: AlertSeverity,
        title: &str,
        message: &str,
        context: Value,
    ) {
        if !self.enabled || severity < self.min_severity {
            return;
        }

        let mut effective_severity = severity;
        {
            let mut history = self.history.lock().expect("alert history lock poisoned");
            let fingerprint = format!("{severity}|{title}|{message}");
            let now = Instant::now();
            match history.get_mut(&fingerprint) {
                Some(record) => {
                    record.count += 1;
                    let unresolved_for = now.duration_since(record.first_seen);
                    if now.duration_since(record.last_seen) < self.dedupe_window {
                        if unresolved_for >= self.escalation_after && !record.escalated {
                            record.escalated = true;
                            record.last_seen = now;
                            effective_severity = AlertSeverity::Critical;
                        } else {
                            record.last_seen = now;
                            return;
                        }
                    } else {
                        record.last_seen = now;
                    }
                }
                None => {
                    history.insert(
                        fingerprint,
                        AlertRecord { last_seen: now, first_seen: now, count: 1, escalated: false },
                    );
                }
            }
        }

        let payload = build_payload(effective_severity, title, message, &context);
        if self.dry_run {
            info!("[ALERT:{effective_severity}] {title} - {message} | {context}");
            return;
        }

        let result = self
            .client
            .post(&self.webhook_url)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                error!("failed to deliver alert '{title}': HTTP {}", response.status());
            }
            Err(e) => {
                error!("failed to deliver alert '{title}': {e}");
            }
        }
    }
}

/// Single-line payload: `{"text": "[SEVERITY] title | message | context=…"}`.
fn build_payload(severity: AlertSeverity, title: &str, message: &str, context: &Value) -> Value {
    let mut parts = vec![format!("[{severity}] {title}"), message.to_string()];
    if !context.is_null() {
        parts.push(format!("context={context}"));
    }
    serde_json::json!({ "text": parts.join(" | ") })
}
