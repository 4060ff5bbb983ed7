//! Notifications produced by scripts and their delivery.

use std::fmt;

use mailgen_core::store::NotificationStore;
use mailgen_core::ticket::Ticket;
use mailgen_core::types::DbId;
use mailgen_mail::{ComposedMail, MailTransport};

use crate::error::PipelineError;

/// One composed e-mail together with the bookkeeping needed after sending.
#[derive(Debug, Clone)]
pub struct Notification {
    pub mail: ComposedMail,
    pub ticket: Ticket,
    /// Directive rows that are marked as sent with this notification.
    pub directive_ids: Vec<DbId>,
    /// Overrides the recipients taken from the message headers.
    pub envelope_recipients: Option<Vec<String>>,
    pub mark_as_sent: bool,
}

impl Notification {
    pub fn new(mail: ComposedMail, ticket: Ticket, directive_ids: Vec<DbId>) -> Self {
        Self {
            mail,
            ticket,
            directive_ids,
            envelope_recipients: None,
            mark_as_sent: true,
        }
    }

    /// Hand the mail to `transport`, then record it as sent. The send time
    /// is the `Date` of the message.
    pub async fn send(
        &self,
        transport: &dyn MailTransport,
        store: &mut dyn NotificationStore,
    ) -> Result<(), PipelineError> {
        transport
            .send(&self.mail.message, self.envelope_recipients.as_deref())
            .await?;
        if self.mark_as_sent {
            let sent_id = store
                .mark_sent(&self.directive_ids, &self.ticket, self.mail.date)
                .await?;
            tracing::debug!(sent_id, ticket = %self.ticket, "Marked directives as sent");
        }
        Ok(())
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "notification {} ({})", self.ticket, self.mail.message_id)
    }
}
