//! # Approval Workflow
//!
//! An [`ApprovalCommand`] asks an approver to allow an action. The
//! [`ApprovalWorkflow`] runs the approval handler as its own task and polls it
//! until it either decides or the request expires.
//!
//! ## Outcomes
//!
//! | handler outcome          | status     | callback published |
//! |--------------------------|------------|--------------------|
//! | returns `Approved`       | `Approved` | `on_approval`      |
//! | returns `Denied`         | `Denied`   | `on_denial`        |
//! | expired at a poll        | `Expired`  | `on_expiry`        |
//! | returns an error/panics  | `Denied`   | none               |
//! | task cancelled           | `Expired`  | none               |
//!
//! The workflow itself never fails; every outcome is an [`ApprovalResult`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::handler::{AsyncHandler, HandlerContext, SyncHandler, scoped};
use super::message::{
    Command, CommandResult, Event, HandlerFailure, HandlerResult, MessageMeta, Metadata, SessionId,
};
use super::message_bus::MessageBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
        };
        f.write_str(status)
    }
}

#[derive(Debug, Clone)]
pub struct ApprovalCommand {
    pub meta: MessageMeta,
    pub approver: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Description of the action awaiting approval.
    pub request: serde_json::Value,
    pub on_approval_callback: Option<Arc<dyn Event>>,
    pub on_denial_callback: Option<Arc<dyn Event>>,
    pub on_expiry_callback: Option<Arc<dyn Event>>,
}

impl ApprovalCommand {
    pub fn new() -> Self {
        Self {
            meta: MessageMeta::new(),
            approver: None,
            expires_at: None,
            request: serde_json::Value::Null,
            on_approval_callback: None,
            on_denial_callback: None,
            on_expiry_callback: None,
        }
    }

    pub fn approver(mut self, approver: impl Into<String>) -> Self {
        self.approver = Some(approver.into());
        self
    }

    pub fn expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn expires_in(self, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.expires_at(expires_at)
    }

    pub fn request(mut self, request: serde_json::Value) -> Self {
        self.request = request;
        self
    }

    pub fn session(mut self, session_id: impl Into<SessionId>) -> Self {
        self.meta.session_id = session_id.into();
        self
    }

    pub fn on_approval<E: Event>(mut self, event: E) -> Self {
        self.on_approval_callback = Some(Arc::new(event));
        self
    }

    pub fn on_denial<E: Event>(mut self, event: E) -> Self {
        self.on_denial_callback = Some(Arc::new(event));
        self
    }

    pub fn on_expiry<E: Event>(mut self, event: E) -> Self {
        self.on_expiry_callback = Some(Arc::new(event));
        self
    }

    /// True once `expires_at` has passed. Requests without one never expire.
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|expires_at| Utc::now() > expires_at)
    }
}

impl Default for ApprovalCommand {
    fn default() -> Self {
        Self::new()
    }
}

impl Command for ApprovalCommand {
    fn meta(&self) -> &MessageMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut MessageMeta {
        &mut self.meta
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResult {
    pub status: ApprovalStatus,
    pub success: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub command_id: Option<String>,
    #[serde(default)]
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ApprovalResult {
    pub fn with_status(status: ApprovalStatus) -> Self {
        Self {
            status,
            success: status == ApprovalStatus::Approved,
            result: None,
            error: None,
            command_id: None,
            session_id: SessionId::root(),
            timestamp: Utc::now(),
            metadata: Metadata::new(),
        }
    }

    pub fn approved() -> Self {
        Self::with_status(ApprovalStatus::Approved)
    }

    pub fn denied() -> Self {
        Self::with_status(ApprovalStatus::Denied)
    }

    pub fn expired(error: impl Into<String>) -> Self {
        Self::with_status(ApprovalStatus::Expired).with_error(error)
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn correlate(mut self, meta: &MessageMeta) -> Self {
        self.command_id = Some(meta.id.clone());
        self.session_id = meta.session_id.clone();
        self
    }
}

impl From<ApprovalResult> for CommandResult {
    fn from(approval: ApprovalResult) -> Self {
        let mut metadata = approval.metadata;
        metadata.insert(
            "approval_status".to_string(),
            serde_json::Value::String(approval.status.to_string()),
        );
        Self {
            success: approval.success,
            result: approval.result,
            error: approval.error,
            command_id: approval.command_id,
            session_id: approval.session_id,
            timestamp: approval.timestamp,
            metadata,
        }
    }
}

/// Decides approval requests.
#[async_trait]
pub trait ApprovalHandler: Send + Sync + 'static {
    async fn decide(&self, command: ApprovalCommand) -> HandlerResult<ApprovalResult>;
}

#[async_trait]
impl<F> ApprovalHandler for SyncHandler<F>
where
    F: Fn(ApprovalCommand) -> HandlerResult<ApprovalResult> + Send + Sync + 'static,
{
    async fn decide(&self, command: ApprovalCommand) -> HandlerResult<ApprovalResult> {
        (self.0)(command)
    }
}

#[async_trait]
impl<F, Fut> ApprovalHandler for AsyncHandler<F>
where
    F: Fn(ApprovalCommand) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<ApprovalResult>> + Send + 'static,
{
    async fn decide(&self, command: ApprovalCommand) -> HandlerResult<ApprovalResult> {
        (self.0)(command).await
    }
}

/// Ready-made callback published when a request is approved.
#[derive(Debug, Clone)]
pub struct ApprovalGranted {
    pub meta: MessageMeta,
    pub approval_id: String,
}

/// Ready-made callback published when a request is denied.
#[derive(Debug, Clone)]
pub struct ApprovalDenied {
    pub meta: MessageMeta,
    pub approval_id: String,
}

/// Ready-made callback published when a request expires.
#[derive(Debug, Clone)]
pub struct ApprovalExpired {
    pub meta: MessageMeta,
    pub approval_id: String,
}

macro_rules! callback_event {
    ($name:ident) => {
        impl $name {
            pub fn for_request(command: &ApprovalCommand) -> Self {
                Self {
                    meta: MessageMeta::in_session(command.meta.session_id.clone()),
                    approval_id: command.meta.id.clone(),
                }
            }
        }

        impl Event for $name {
            fn meta(&self) -> &MessageMeta {
                &self.meta
            }
        }
    };
}

callback_event!(ApprovalGranted);
callback_event!(ApprovalDenied);
callback_event!(ApprovalExpired);

/// Polls an approval handler until it decides or the request expires.
pub struct ApprovalWorkflow {
    bus: Arc<MessageBus>,
    poll_interval: Duration,
}

impl ApprovalWorkflow {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        let poll_interval = bus.config().approval.poll_interval;
        Self { bus, poll_interval }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[tracing::instrument(skip_all, fields(approval_id = %command.meta.id), level = "debug")]
    pub async fn execute<H: ApprovalHandler>(&self, command: ApprovalCommand, handler: H) -> ApprovalResult {
        let meta = command.meta.clone();
        let watched = command.clone();
        let handler = Arc::new(handler);
        let mut task = tokio::spawn(scoped(HandlerContext::Approval, async move {
            handler.decide(command).await
        }));

        loop {
            // Expiry wins over a decision that arrived too late.
            if watched.is_expired() {
                task.abort();
                self.publish_callback(watched.on_expiry_callback.as_ref());
                info!("Approval {} expired", meta.id);
                return ApprovalResult::expired("Approval request expired").correlate(&meta);
            }

            if task.is_finished() {
                let result = match (&mut task).await {
                    Ok(Ok(result)) => {
                        let callback = match result.status {
                            ApprovalStatus::Approved => watched.on_approval_callback.as_ref(),
                            ApprovalStatus::Denied => watched.on_denial_callback.as_ref(),
                            _ => None,
                        };
                        self.publish_callback(callback);
                        info!("Approval {} finished: {}", meta.id, result.status);
                        result
                    }
                    Ok(Err(failure)) => Self::failed(&failure),
                    Err(join) if join.is_cancelled() => {
                        ApprovalResult::expired("Approval request was cancelled")
                    }
                    Err(join) => Self::failed(&HandlerFailure::from_panic(join.into_panic())),
                };
                return result.correlate(&meta);
            }

            debug!("Approval {} pending", meta.id);
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn failed(failure: &HandlerFailure) -> ApprovalResult {
        warn!("Approval handler failed: {}", failure);
        ApprovalResult::denied().with_error(format!("Approval request failed: {}", failure))
    }

    fn publish_callback(&self, callback: Option<&Arc<dyn Event>>) {
        let Some(callback) = callback else { return };
        if let Err(e) = self.bus.sync_publish(Arc::clone(callback)) {
            warn!("Failed to publish approval callback {}: {}", callback.name(), e);
        }
    }
}

impl MessageBus {
    /// Runs `command` through an [`ApprovalWorkflow`] using the configured
    /// poll interval.
    pub async fn execute_approval<H: ApprovalHandler>(
        self: &Arc<Self>,
        command: ApprovalCommand,
        handler: H,
    ) -> ApprovalResult {
        ApprovalWorkflow::new(Arc::clone(self))
            .execute(command, handler)
            .await
    }
}
