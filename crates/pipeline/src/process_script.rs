//! Scripts that run as separate executables.
//!
//! The executable receives one JSON request on stdin describing the
//! directive and answers with one JSON document on stdout. A non-zero exit
//! status, a timeout or an unparsable answer counts as the script failing.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use mailgen_core::scripting::executor::{ScriptError, ScriptExecutor, ScriptInput};
use mailgen_core::scripting::plugin::{is_executable, PluginExecutor};
use mailgen_core::tableformat::TableFormat;
use mailgen_core::template::{Substitutions, Template};
use mailgen_core::ticket::Ticket;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::context::{CsvOptions, NotificationContext};
use crate::error::PipelineError;
use crate::notification::Notification;
use crate::script::{Script, ScriptOutcome};

/// Entry point named in every request.
pub const ENTRY_POINT: &str = "create_notifications";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ScriptResponse {
    NoResult {
        #[serde(default)]
        substitutions: Substitutions,
        #[serde(default)]
        templates: BTreeMap<String, TemplateSpec>,
    },
    Postponed,
    Notify {
        notifications: Vec<NotificationRequest>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum NotificationRequest {
    Csv(CsvRequest),
    #[cfg(feature = "xarf")]
    Xarf {
        schema: mailgen_core::xarf::XarfSchema,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateSpec {
    pub subject: String,
    pub body: String,
}

impl From<TemplateSpec> for Template {
    fn from(spec: TemplateSpec) -> Self {
        Template::from_strings(spec.subject, spec.body)
    }
}

#[derive(Debug, Deserialize)]
pub struct TableFormatSpec {
    pub name: String,
    /// `(field, title)` pairs; fields starting with `extra.` read from the
    /// event's extra data.
    pub columns: Vec<(String, String)>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct CsvRequest {
    pub table_format: Option<TableFormatSpec>,
    pub template: Option<TemplateSpec>,
    pub template_name: Option<String>,
    #[serde(default)]
    pub substitutions: Substitutions,
    #[serde(default)]
    pub attach_as_file: bool,
    pub envelope_recipients: Option<Vec<String>>,
    pub ticket: Option<Ticket>,
    #[serde(default = "default_true")]
    pub mark_as_sent: bool,
}

impl CsvRequest {
    fn into_options(self) -> Result<CsvOptions, PipelineError> {
        let table_format = self
            .table_format
            .map(|spec| {
                TableFormat::build(
                    spec.name,
                    spec.columns.iter().map(|(f, t)| (f.as_str(), t.as_str())),
                )
            })
            .transpose()?;
        Ok(CsvOptions {
            table_format,
            template: self.template.map(Template::from),
            template_name: self.template_name,
            substitutions: self.substitutions,
            attach_as_file: self.attach_as_file,
            envelope_recipients: self.envelope_recipients,
            ticket: self.ticket,
            mark_as_sent: self.mark_as_sent,
        })
    }
}

/// The request sent to the script for the directive in `ctx`.
pub fn build_request(ctx: &NotificationContext<'_>) -> Value {
    json!({
        "entry_point": ENTRY_POINT,
        "directive": ctx.directive(),
        "interval_exceeded": ctx.interval_exceeded(),
        "age_of_newest_directive_secs": ctx.age_of_newest_directive().num_seconds(),
        "age_of_observation_secs": ctx
            .age_of_observation()
            .ok()
            .flatten()
            .map(|age| age.num_seconds()),
        "substitutions": ctx.substitutions(),
    })
}

// ---------------------------------------------------------------------------
// ProcessScript
// ---------------------------------------------------------------------------

/// A plugin executable.
#[derive(Debug, Clone)]
pub struct ProcessScript {
    name: String,
    path: PathBuf,
    timeout: Option<Duration>,
}

impl ProcessScript {
    /// Check that `path` is a regular, executable file.
    pub async fn load(
        name: String,
        path: PathBuf,
        timeout: Option<Duration>,
    ) -> Result<Self, ScriptError> {
        let display = path.display().to_string();
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|_| ScriptError::NotFound(display.clone()))?;
        if !metadata.is_file() || !is_executable(metadata.permissions().mode()) {
            return Err(ScriptError::PermissionDenied(display));
        }
        Ok(Self {
            name,
            path,
            timeout,
        })
    }

    fn protocol_error(&self, message: impl Into<String>) -> PipelineError {
        PipelineError::ScriptProtocol {
            name: self.name.clone(),
            message: message.into(),
        }
    }

    async fn call(&self, request: &Value) -> Result<ScriptResponse, PipelineError> {
        let mut input = ScriptInput::json(request);
        input.timeout = self.timeout;
        let output = PluginExecutor
            .execute(&self.path, input)
            .await
            .and_then(|o| o.check_success())
            .map_err(|source| PipelineError::Script {
                name: self.name.clone(),
                source,
            })?;
        if !output.stderr.is_empty() {
            tracing::debug!(script = %self.name, stderr = %output.stderr.trim_end(), "Script stderr");
        }
        let value = output
            .parsed_output
            .ok_or_else(|| self.protocol_error("stdout is not a JSON document"))?;
        serde_json::from_value(value).map_err(|e| self.protocol_error(e.to_string()))
    }
}

#[async_trait]
impl Script for ProcessScript {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_notifications(
        &self,
        ctx: &mut NotificationContext<'_>,
    ) -> Result<ScriptOutcome, PipelineError> {
        let request = build_request(ctx);
        match self.call(&request).await? {
            ScriptResponse::NoResult {
                substitutions,
                templates,
            } => {
                ctx.add_substitutions(substitutions);
                for (name, spec) in templates {
                    ctx.add_template(name, spec.into());
                }
                Ok(ScriptOutcome::NoResult)
            }
            ScriptResponse::Postponed => Ok(ScriptOutcome::Postponed),
            ScriptResponse::Notify { notifications } => {
                let mut out: Vec<Notification> = Vec::new();
                for request in notifications {
                    match request {
                        NotificationRequest::Csv(csv) => {
                            out.extend(ctx.format_as_csv(csv.into_options()?).await?);
                        }
                        #[cfg(feature = "xarf")]
                        NotificationRequest::Xarf { schema } => {
                            out.extend(ctx.format_as_xarf(&schema).await?);
                        }
                    }
                }
                Ok(ScriptOutcome::Notify(out))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
