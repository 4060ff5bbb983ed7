//! Processing of pending directives.
//!
//! Every directive is handled inside its own savepoint: tickets drawn and
//! directives marked as sent for it are rolled back if anything goes wrong,
//! while the work done for earlier directives is kept. The caller owns the
//! surrounding transaction and commits it whatever the outcome.

use chrono::Utc;
use mailgen_core::directive::Directive;
use mailgen_core::store::{DirectiveFilter, NotificationStore, PendingDirectives};
use mailgen_core::types::Timestamp;
use mailgen_mail::MailTransport;
use tokio_util::sync::CancellationToken;

use crate::context::{NotificationContext, NotificationSettings};
use crate::error::PipelineError;
use crate::script::{ScriptOutcome, ScriptRegistry};

/// Name of the per-directive savepoint.
pub const DIRECTIVE_SAVEPOINT: &str = "sendmail";

/// Counts of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Mails handed to the transport.
    pub sent: usize,
    pub postponed: usize,
    /// Directives whose processing failed.
    pub errored: usize,
}

impl RunSummary {
    pub fn merge(&mut self, other: RunSummary) {
        self.sent += other.sent;
        self.postponed += other.postponed;
        self.errored += other.errored;
    }
}

/// Result of [`Orchestrator::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another instance holds the lock; nothing was done.
    Locked,
    Completed(RunSummary),
}

/// What happened to one directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirectiveResult {
    Sent(usize),
    Postponed,
}

pub struct Orchestrator<'a> {
    scripts: &'a ScriptRegistry,
    settings: &'a NotificationSettings,
    transport: &'a dyn MailTransport,
    /// Roll back every savepoint, even after success.
    dry_run: bool,
    cancel: CancellationToken,
    clock: fn() -> Timestamp,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        scripts: &'a ScriptRegistry,
        settings: &'a NotificationSettings,
        transport: &'a dyn MailTransport,
    ) -> Self {
        Self {
            scripts,
            settings,
            transport,
            dry_run: false,
            cancel: CancellationToken::new(),
            clock: Utc::now,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Stop between directives once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_clock(mut self, clock: fn() -> Timestamp) -> Self {
        self.clock = clock;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Fetch the pending directives, logging the lock and empty cases.
    pub async fn fetch(
        &self,
        store: &mut dyn NotificationStore,
        filter: Option<&DirectiveFilter>,
    ) -> Result<Option<Vec<Directive>>, PipelineError> {
        tracing::debug!("Fetching pending directives");
        match store.fetch_pending(filter).await? {
            PendingDirectives::Locked => Ok(None),
            PendingDirectives::Ready(directives) => {
                if directives.is_empty() {
                    tracing::info!("No pending notifications to be sent");
                } else {
                    tracing::debug!(groups = directives.len(), "Got groups of directives");
                }
                Ok(Some(directives))
            }
        }
    }

    /// Batch mode: fetch and process everything that is pending.
    pub async fn run(
        &self,
        store: &mut dyn NotificationStore,
        filter: Option<&DirectiveFilter>,
    ) -> Result<RunOutcome, PipelineError> {
        let Some(directives) = self.fetch(store, filter).await? else {
            return Ok(RunOutcome::Locked);
        };
        let summary = self.process(store, &directives).await?;
        tracing::info!(
            sent = summary.sent,
            postponed = summary.postponed,
            errored = summary.errored,
            "{} mails sent, {} postponed, {} errors",
            summary.sent,
            summary.postponed,
            summary.errored
        );
        Ok(RunOutcome::Completed(summary))
    }

    /// Process `directives` in order.
    ///
    /// Per-directive errors are logged and counted. Only a fatal error ends
    /// the loop early; it is returned after its savepoint was rolled back.
    pub async fn process(
        &self,
        store: &mut dyn NotificationStore,
        directives: &[Directive],
    ) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::default();
        for directive in directives {
            if self.cancel.is_cancelled() {
                tracing::warn!("Run cancelled, not processing remaining directives");
                break;
            }
            match self.process_directive(store, directive).await {
                Ok(DirectiveResult::Sent(count)) => summary.sent += count,
                Ok(DirectiveResult::Postponed) => summary.postponed += 1,
                Err(e) => {
                    summary.errored += 1;
                    tracing::error!(
                        recipient = %directive.recipient_address,
                        template = %directive.template_name,
                        directive_ids = ?directive.directive_ids,
                        invalid_directive = e.is_invalid_directive(),
                        error = %e,
                        "Could not create or send mails, continuing with other notifications"
                    );
                    if e.is_fatal() {
                        return Err(e);
                    }
                }
            }
        }
        Ok(summary)
    }

    /// Handle one directive inside [`DIRECTIVE_SAVEPOINT`]. The savepoint is
    /// rolled back on error and in dry runs, and released in every case.
    async fn process_directive(
        &self,
        store: &mut dyn NotificationStore,
        directive: &Directive,
    ) -> Result<DirectiveResult, PipelineError> {
        store.savepoint(DIRECTIVE_SAVEPOINT).await?;
        let result = self.create_and_send(store, directive).await;
        if result.is_err() || self.dry_run {
            store.rollback_to_savepoint(DIRECTIVE_SAVEPOINT).await?;
        }
        store.release_savepoint(DIRECTIVE_SAVEPOINT).await?;
        result
    }

    async fn create_and_send(
        &self,
        store: &mut dyn NotificationStore,
        directive: &Directive,
    ) -> Result<DirectiveResult, PipelineError> {
        let outcome = {
            let mut ctx = NotificationContext::new(directive, store, self.settings, (self.clock)());
            self.scripts.dispatch(&mut ctx).await?
        };

        match outcome {
            ScriptOutcome::Postponed => {
                tracing::debug!(directive_ids = ?directive.directive_ids, "Directive postponed");
                Ok(DirectiveResult::Postponed)
            }
            ScriptOutcome::Notify(notifications) => {
                for notification in &notifications {
                    notification.send(self.transport, store).await?;
                    tracing::info!(
                        recipient = %directive.recipient_address,
                        ticket = %notification.ticket,
                        "Sent {notification}"
                    );
                }
                Ok(DirectiveResult::Sent(notifications.len()))
            }
            // `dispatch` only returns actual results.
            ScriptOutcome::NoResult => Err(PipelineError::NoScriptResult(directive.to_string())),
        }
    }
}
