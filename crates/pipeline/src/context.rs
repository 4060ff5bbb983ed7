//! The capabilities a script gets while it handles one directive.
//!
//! A [`NotificationContext`] is created per directive and dropped before the
//! resulting notifications are sent. Scripts never see the orchestrator or
//! the raw database transaction, only the operations below.

use std::collections::BTreeMap;

use chrono::Duration;
use mailgen_core::directive::Directive;
use mailgen_core::event::Event;
use mailgen_core::store::NotificationStore;
use mailgen_core::tableformat::TableFormat;
use mailgen_core::template::{Substitutions, Template, TemplateStore};
use mailgen_core::ticket::Ticket;
use mailgen_core::types::Timestamp;
use mailgen_mail::{compose, MailDraft, Signer, TextPart};

use crate::error::PipelineError;
use crate::notification::Notification;

/// Substitution key of the ticket number.
pub const TICKET_NUMBER_KEY: &str = "ticket_number";
/// Substitution key of the inline CSV data.
pub const EVENTS_AS_CSV_KEY: &str = "events_as_csv";
/// File name of the CSV attachment.
pub const CSV_ATTACHMENT_NAME: &str = "events.csv";

/// Run-wide settings shared by every context.
pub struct NotificationSettings {
    /// `From` address, optionally with a display name.
    pub sender: String,
    pub templates: TemplateStore,
    /// Signs outgoing mail when set.
    pub signer: Option<Box<dyn Signer>>,
    /// Domain part of X-ARF report ids. Defaults to the sender's domain.
    pub xarf_report_domain: Option<String>,
}

impl NotificationSettings {
    pub fn new(sender: impl Into<String>, templates: TemplateStore) -> Self {
        Self {
            sender: sender.into(),
            templates,
            signer: None,
            xarf_report_domain: None,
        }
    }

    pub fn with_signer(mut self, signer: Box<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn signer(&self) -> Option<&dyn Signer> {
        self.signer.as_deref()
    }
}

/// Options of [`NotificationContext::format_as_csv`].
#[derive(Debug, Clone)]
pub struct CsvOptions {
    /// Columns of the CSV data; the fallback format when `None`.
    pub table_format: Option<TableFormat>,
    /// Template to use instead of looking one up by name.
    pub template: Option<Template>,
    /// Template to look up instead of the directive's template.
    pub template_name: Option<String>,
    /// Extra substitutions on top of the ones shared through the context.
    pub substitutions: Substitutions,
    /// Attach the CSV as `events.csv` instead of putting it into the body.
    pub attach_as_file: bool,
    pub envelope_recipients: Option<Vec<String>>,
    /// Reuse this ticket instead of drawing a new one.
    pub ticket: Option<Ticket>,
    pub mark_as_sent: bool,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            table_format: None,
            template: None,
            template_name: None,
            substitutions: Substitutions::new(),
            attach_as_file: false,
            envelope_recipients: None,
            ticket: None,
            mark_as_sent: true,
        }
    }
}

pub struct NotificationContext<'a> {
    directive: &'a Directive,
    store: &'a mut dyn NotificationStore,
    settings: &'a NotificationSettings,
    now: Timestamp,
    substitutions: Substitutions,
    templates: BTreeMap<String, Template>,
}

impl<'a> NotificationContext<'a> {
    pub fn new(
        directive: &'a Directive,
        store: &'a mut dyn NotificationStore,
        settings: &'a NotificationSettings,
        now: Timestamp,
    ) -> Self {
        Self {
            directive,
            store,
            settings,
            now,
            substitutions: Substitutions::new(),
            templates: BTreeMap::new(),
        }
    }

    pub fn directive(&self) -> &Directive {
        self.directive
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    pub fn sender(&self) -> &str {
        &self.settings.sender
    }

    // -- Directive helpers --------------------------------------------------

    /// Whether the directive's notification interval has passed since the
    /// last similar notification.
    pub fn interval_exceeded(&self) -> bool {
        self.directive.interval_exceeded(self.now)
    }

    pub fn age_of_newest_directive(&self) -> Duration {
        self.directive.age_of_newest_directive(self.now)
    }

    pub fn age_of_observation(&self) -> Result<Option<Duration>, PipelineError> {
        Ok(self.directive.age_of_observation(self.now)?)
    }

    pub fn aggregation_item(&self, key: &str) -> Option<&str> {
        self.directive.aggregation_item(key)
    }

    // -- Shared state between scripts ---------------------------------------

    /// Substitutions shared by all scripts that run for this directive.
    pub fn substitutions(&self) -> &Substitutions {
        &self.substitutions
    }

    pub fn add_substitutions(&mut self, values: impl IntoIterator<Item = (String, String)>) {
        self.substitutions.extend(values);
    }

    /// Register an in-memory template that shadows the template directory.
    pub fn add_template(&mut self, name: impl Into<String>, template: Template) {
        self.templates.insert(name.into(), template);
    }

    fn aggregation_substitutions(&self) -> impl Iterator<Item = (String, String)> + '_ {
        self.directive
            .aggregate_identifier
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    // -- Store access -------------------------------------------------------

    pub async fn load_events(&mut self, columns: &[String]) -> Result<Vec<Event>, PipelineError> {
        Ok(self
            .store
            .load_events(&self.directive.event_ids, columns)
            .await?)
    }

    pub async fn new_ticket(&mut self) -> Result<Ticket, PipelineError> {
        let ticket = self.store.new_ticket().await?;
        tracing::debug!(%ticket, "Drew ticket");
        Ok(ticket)
    }

    // -- Templates and signing ----------------------------------------------

    /// Look up a template: registered templates first, then the template
    /// directory.
    pub async fn read_template(&self, name: &str) -> Result<Template, PipelineError> {
        tracing::debug!(template = name, "Using template");
        if let Some(template) = self.templates.get(name) {
            return Ok(template.clone());
        }
        self.settings
            .templates
            .read(name)
            .await
            .map_err(|source| PipelineError::InvalidTemplate {
                name: name.to_string(),
                source,
            })
    }

    /// Clearsign `text`, or return it unchanged when signing is off.
    pub async fn clearsign(&self, text: &str) -> Result<String, PipelineError> {
        match self.settings.signer() {
            Some(signer) => Ok(signer.clearsign(text).await?),
            None => Ok(text.to_string()),
        }
    }

    // -- Formats --------------------------------------------------------------

    /// Create one mail with the directive's events as CSV.
    ///
    /// Substitutions, from lowest to highest precedence: the shared context
    /// substitutions, `options.substitutions`, `ticket_number` and
    /// `events_as_csv` (empty when the data is attached), and the items of
    /// the aggregation identifier.
    pub async fn format_as_csv(
        &mut self,
        options: CsvOptions,
    ) -> Result<Vec<Notification>, PipelineError> {
        let format = options.table_format.unwrap_or_else(TableFormat::fallback);
        let events = self.load_events(&format.event_table_columns()).await?;
        let csv = format.render_csv(&events)?;

        let template = match (options.template, options.template_name) {
            (Some(template), _) => template,
            (None, Some(name)) => self.read_template(&name).await?,
            (None, None) => self.read_template(&self.directive.template_name).await?,
        };

        let ticket = match options.ticket {
            Some(ticket) => ticket,
            None => self.new_ticket().await?,
        };

        let mut substitutions = self.substitutions.clone();
        substitutions.extend(options.substitutions);
        substitutions.insert(TICKET_NUMBER_KEY.to_string(), ticket.to_string());
        substitutions.insert(
            EVENTS_AS_CSV_KEY.to_string(),
            if options.attach_as_file {
                String::new()
            } else {
                csv.clone()
            },
        );
        substitutions.extend(self.aggregation_substitutions());

        let (subject, body) = template.substitute(&substitutions)?;
        let mut draft = MailDraft::new(
            self.settings.sender.clone(),
            self.directive.recipient_address.clone(),
            subject,
            body,
        );
        if options.attach_as_file {
            draft = draft.with_part(TextPart::attachment("csv", CSV_ATTACHMENT_NAME, csv));
        }
        let mail = compose(&draft, self.settings.signer(), self.now).await?;

        Ok(vec![Notification {
            mail,
            ticket,
            directive_ids: self.directive.directive_ids.clone(),
            envelope_recipients: options.envelope_recipients,
            mark_as_sent: options.mark_as_sent,
        }])
    }

    /// Create one X-ARF report per event, each with its own ticket. The
    /// template sees the shared substitutions, `ticket_number` and the
    /// aggregation identifier.
    #[cfg(feature = "xarf")]
    pub async fn format_as_xarf(
        &mut self,
        schema: &mailgen_core::xarf::XarfSchema,
    ) -> Result<Vec<Notification>, PipelineError> {
        use mailgen_core::xarf::to_yaml;
        use serde_json::Value;

        let events = self.load_events(&schema.event_columns()).await?;
        let report_domain = match &self.settings.xarf_report_domain {
            Some(domain) => domain.clone(),
            None => mailgen_mail::domain_from_sender(&self.settings.sender)?,
        };
        let template = self.read_template(&self.directive.template_name).await?;

        let mut notifications = Vec::with_capacity(events.len());
        for event in &events {
            let ticket = self.new_ticket().await?;
            let mut substitutions = self.substitutions.clone();
            substitutions.insert(TICKET_NUMBER_KEY.to_string(), ticket.to_string());
            substitutions.extend(self.aggregation_substitutions());
            let (subject, body) = template.substitute(&substitutions)?;

            let mut params = BTreeMap::from([
                (
                    "reported_from".to_string(),
                    Value::from(self.settings.sender.clone()),
                ),
                (
                    "report_id".to_string(),
                    Value::from(format!("{ticket}@{report_domain}")),
                ),
            ]);
            params.extend(schema.params(event)?);

            let draft = MailDraft::new(
                self.settings.sender.clone(),
                self.directive.recipient_address.clone(),
                subject,
                body,
            )
            .with_part(TextPart::inline("plain", to_yaml(&params)?))
            .as_xarf_report();
            let mail = compose(&draft, None, self.now).await?;
            notifications.push(Notification::new(
                mail,
                ticket,
                self.directive.directive_ids.clone(),
            ));
        }
        Ok(notifications)
    }
}
