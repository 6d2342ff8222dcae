//! Delivery of the notification instructions produced by workflow transitions.
//!
//! Delivery is fire-and-forget: the dispatcher resolves recipients, hands the sends to a
//! detached task and returns immediately. A slow or failing transport is logged and never
//! reaches the caller of the transition that produced the instruction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use crate::config::NotificationConfig;
use crate::observability::workflow_metrics;
use crate::workflow::types::Role;

pub type TemplateData = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// The recipient's role now owns the request.
    ActionRequired,
    RequestRejected,
    RequestCompleted,
    MediaDisposed,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ActionRequired => "action_required",
            NotificationKind::RequestRejected => "request_rejected",
            NotificationKind::RequestCompleted => "request_completed",
            NotificationKind::MediaDisposed => "media_disposed",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Recipient {
    /// Everyone holding the role, resolved through a [`RecipientDirectory`].
    Role(Role),
    Email(String),
}

/// A request for a notification. Produced by the state machine, executed by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationInstruction {
    pub kind: NotificationKind,
    pub recipient: Recipient,
    pub template: TemplateData,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotificationError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
    #[error("notification timed out after {0:?}")]
    Timeout(Duration),
}

/// Transport for a single notification.
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        kind: NotificationKind,
        recipient_email: &str,
        template: &TemplateData,
    ) -> Result<(), NotificationError>;
}

/// Maps a role to the addresses that should hear about it.
#[cfg_attr(any(test, feature = "testing"), automock)]
pub trait RecipientDirectory: Send + Sync {
    fn emails_for(&self, role: Role) -> Vec<String>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    by_role: HashMap<Role, Vec<String>>,
}

impl StaticDirectory {
    pub fn new(by_role: HashMap<Role, Vec<String>>) -> Self {
        Self { by_role }
    }

    /// Build from config, skipping keys that do not name a role.
    pub fn from_config(config: &NotificationConfig) -> Self {
        let mut by_role = HashMap::new();
        for (key, emails) in &config.role_recipients {
            match key.parse::<Role>() {
                Ok(role) => {
                    by_role.insert(role, emails.clone());
                }
                Err(err) => warn!(
                    key = %key,
                    error = %err,
                    "Ignoring notification recipients for unknown role"
                ),
            }
        }
        Self { by_role }
    }
}

impl RecipientDirectory for StaticDirectory {
    fn emails_for(&self, role: Role) -> Vec<String> {
        self.by_role.get(&role).cloned().unwrap_or_default()
    }
}

/// Writes notifications to the log instead of sending them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        kind: NotificationKind,
        recipient_email: &str,
        template: &TemplateData,
    ) -> Result<(), NotificationError> {
        info!(
            kind = %kind,
            to = %recipient_email,
            request_number = template.get("request_number").map(String::as_str).unwrap_or(""),
            "Notification"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub kind: NotificationKind,
    pub to: String,
    pub template: TemplateData,
}

/// Keeps every notification in memory. Can be switched to fail every send.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
    failing: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        kind: NotificationKind,
        recipient_email: &str,
        template: &TemplateData,
    ) -> Result<(), NotificationError> {
        if self.failing {
            return Err(NotificationError::Delivery("mail transport down".to_string()));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(SentNotification {
                kind,
                to: recipient_email.to_string(),
                template: template.clone(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    /// Role-addressed instructions for which the directory had nobody.
    pub unresolved: usize,
}

pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    directory: Arc<dyn RecipientDirectory>,
    timeout: Duration,
    enabled: bool,
}

impl NotificationDispatcher {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        directory: Arc<dyn RecipientDirectory>,
        timeout: Duration,
    ) -> Self {
        Self {
            notifier,
            directory,
            timeout,
            enabled: true,
        }
    }

    pub fn from_config(notifier: Arc<dyn Notifier>, config: &NotificationConfig) -> Self {
        Self {
            notifier,
            directory: Arc::new(StaticDirectory::from_config(config)),
            timeout: Duration::from_millis(config.timeout_ms),
            enabled: config.enabled,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Start delivering `instructions` in the background.
    ///
    /// Returns `None` when there is nothing to send, delivery is disabled, or no tokio runtime
    /// is available to run it on.
    pub fn dispatch(
        &self,
        instructions: Vec<NotificationInstruction>,
    ) -> Option<JoinHandle<DispatchReport>> {
        if !self.enabled || instructions.is_empty() {
            return None;
        }
        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = %err, "No async runtime; dropping notifications");
                return None;
            }
        };

        let mut unresolved = 0;
        let mut sends = Vec::new();
        for instruction in instructions {
            match &instruction.recipient {
                Recipient::Email(email) => {
                    sends.push((instruction.kind, email.clone(), instruction.template));
                }
                Recipient::Role(role) => {
                    let emails = self.directory.emails_for(*role);
                    if emails.is_empty() {
                        unresolved += 1;
                        debug!(
                            role = %role,
                            kind = %instruction.kind,
                            "No recipients configured for role"
                        );
                    }
                    for email in emails {
                        sends.push((instruction.kind, email, instruction.template.clone()));
                    }
                }
            }
        }

        let notifier = Arc::clone(&self.notifier);
        let timeout = self.timeout;
        Some(runtime.spawn(async move {
            let mut report = DispatchReport {
                unresolved,
                ..DispatchReport::default()
            };
            for (kind, email, template) in sends {
                let send = notifier.notify(kind, &email, &template);
                let outcome = match tokio::time::timeout(timeout, send).await {
                    Ok(result) => result,
                    Err(_) => Err(NotificationError::Timeout(timeout)),
                };
                match outcome {
                    Ok(()) => report.delivered += 1,
                    Err(err) => {
                        report.failed += 1;
                        workflow_metrics().record_notification_failure();
                        warn!(
                            kind = %kind,
                            to = %email,
                            error = %err,
                            "Notification delivery failed"
                        );
                    }
                }
            }
            report
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instruction(recipient: Recipient) -> NotificationInstruction {
        let mut template = TemplateData::new();
        template.insert("request_number".to_string(), "AFT-20260101-00001".to_string());
        NotificationInstruction {
            kind: NotificationKind::ActionRequired,
            recipient,
            template,
        }
    }

    fn directory() -> Arc<StaticDirectory> {
        let mut by_role = HashMap::new();
        by_role.insert(
            Role::Cpso,
            vec!["cpso1@example.mil".to_string(), "cpso2@example.mil".to_string()],
        );
        Arc::new(StaticDirectory::new(by_role))
    }

    fn dispatcher(notifier: Arc<dyn Notifier>) -> NotificationDispatcher {
        NotificationDispatcher::new(notifier, directory(), Duration::from_secs(1))
    }

    fn email(to: &str) -> Vec<NotificationInstruction> {
        vec![instruction(Recipient::Email(to.to_string()))]
    }

    #[tokio::test]
    async fn test_role_recipients_fan_out() {
        let notifier = Arc::new(RecordingNotifier::new());
        let report = dispatcher(notifier.clone())
            .dispatch(vec![instruction(Recipient::Role(Role::Cpso))])
            .unwrap()
            .await
            .unwrap();

        assert_eq!(report.delivered, 2);
        let to: Vec<String> = notifier.sent().into_iter().map(|n| n.to).collect();
        assert_eq!(to, vec!["cpso1@example.mil", "cpso2@example.mil"]);
    }

    #[tokio::test]
    async fn test_unresolved_role_is_counted() {
        let notifier = Arc::new(RecordingNotifier::new());
        let report = dispatcher(notifier.clone())
            .dispatch(vec![instruction(Recipient::Role(Role::Dao))])
            .unwrap()
            .await
            .unwrap();
        assert_eq!(report.unresolved, 1);
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_reported_not_raised() {
        let mut mock = MockNotifier::new();
        mock.expect_notify()
            .withf(|kind, to, _| {
                *kind == NotificationKind::ActionRequired && to == "owner@example.mil"
            })
            .times(1)
            .returning(|_, _, _| Err(NotificationError::Delivery("smtp refused".to_string())));

        let report = dispatcher(Arc::new(mock))
            .dispatch(email("owner@example.mil"))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 0);
    }

    struct SlowNotifier;

    #[async_trait]
    impl Notifier for SlowNotifier {
        async fn notify(
            &self,
            _: NotificationKind,
            _: &str,
            _: &TemplateData,
        ) -> Result<(), NotificationError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_transport_times_out() {
        let slow = NotificationDispatcher::new(
            Arc::new(SlowNotifier),
            directory(),
            Duration::from_millis(50),
        );
        let report = slow
            .dispatch(email("x@example.mil"))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_disabled_dispatcher_sends_nothing() {
        let notifier = Arc::new(RecordingNotifier::new());
        let disabled = dispatcher(notifier.clone()).disabled();
        assert!(disabled.dispatch(email("x@example.mil")).is_none());
    }

    #[test]
    fn test_no_runtime_drops_quietly() {
        assert!(dispatcher(Arc::new(LogNotifier))
            .dispatch(email("x@example.mil"))
            .is_none());
    }

    #[test]
    fn test_directory_from_config_skips_unknown_roles() {
        let mut config = NotificationConfig::default();
        config
            .role_recipients
            .insert("issm".to_string(), vec!["issm@example.mil".to_string()]);
        config
            .role_recipients
            .insert("janitor".to_string(), vec!["j@example.mil".to_string()]);
        let directory = StaticDirectory::from_config(&config);
        assert_eq!(directory.emails_for(Role::Approver), vec!["issm@example.mil"]);
        assert!(directory.emails_for(Role::Admin).is_empty());
    }
}
