//! Interactive mode.
//!
//! Pending directives are shown to the operator in batches of
//! [`BATCH_SIZE`]. Nothing is sent or written for a batch before the
//! operator confirms it.

use std::fmt::Write as _;

use async_trait::async_trait;
use mailgen_core::directive::Directive;
use mailgen_core::store::NotificationStore;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::orchestrator::{Orchestrator, RunSummary};

pub const BATCH_SIZE: usize = 10;

/// The operator's decision for the current batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    /// `c`: skip this batch.
    Skip,
    /// `s`: send this batch.
    Send,
    /// `a`: send this batch and all remaining ones.
    SendAll,
    /// `q`: stop without sending anything else.
    Quit,
}

impl Answer {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "c" => Some(Self::Skip),
            "s" => Some(Self::Send),
            "a" => Some(Self::SendAll),
            "q" => Some(Self::Quit),
            _ => None,
        }
    }
}

/// The operator's side of interactive mode.
#[async_trait]
pub trait Prompt: Send {
    /// Show a message.
    async fn say(&mut self, text: &str) -> Result<(), PipelineError>;

    /// Read one line of input; `None` at end of input.
    async fn read_line(&mut self) -> Result<Option<String>, PipelineError>;
}

/// Prompt on the process's stdin/stdout.
pub struct TerminalPrompt {
    stdin: BufReader<tokio::io::Stdin>,
    stdout: tokio::io::Stdout,
}

impl TerminalPrompt {
    pub fn new() -> Self {
        Self {
            stdin: BufReader::new(tokio::io::stdin()),
            stdout: tokio::io::stdout(),
        }
    }
}

impl Default for TerminalPrompt {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prompt for TerminalPrompt {
    async fn say(&mut self, text: &str) -> Result<(), PipelineError> {
        self.stdout.write_all(text.as_bytes()).await?;
        self.stdout.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<Option<String>, PipelineError> {
        let mut line = String::new();
        if self.stdin.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(line))
    }
}

/// Describe a batch the way the operator sees it.
pub fn describe_batch(batch: &[Directive], total: usize) -> String {
    let mut out = format!("Current batch ({} of {} total):\n", batch.len(), total);
    for d in batch {
        let _ = writeln!(
            out,
            "    * {} {} ({}/{}): {} events",
            d.recipient_address,
            d.template_name,
            d.notification_format,
            d.event_data_format,
            d.event_ids.len()
        );
    }
    out
}

/// Ask until the operator gives a valid answer. End of input and
/// cancellation both read as quit; cancellation also ends a pending read.
async fn ask(
    prompt: &mut dyn Prompt,
    cancel: &CancellationToken,
) -> Result<Answer, PipelineError> {
    loop {
        prompt
            .say("Options: [c]ontinue, [s]end this batch, send [a]ll, [q]uit? ")
            .await?;
        let line = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            line = prompt.read_line() => line?,
        };
        let Some(line) = line else {
            return Ok(Answer::Quit);
        };
        match Answer::parse(&line) {
            Some(answer) => return Ok(answer),
            None => {
                prompt
                    .say("Please enter one of the characters c, s, a, q\n")
                    .await?
            }
        }
    }
}

/// Walk through `directives` batch by batch, processing what the operator
/// confirms.
pub async fn run_interactive(
    orchestrator: &Orchestrator<'_>,
    store: &mut dyn NotificationStore,
    directives: &[Directive],
    prompt: &mut dyn Prompt,
) -> Result<RunSummary, PipelineError> {
    let mut summary = RunSummary::default();
    let mut start = 0;
    while start < directives.len() {
        let end = (start + BATCH_SIZE).min(directives.len());
        let batch = &directives[start..end];
        prompt
            .say(&describe_batch(batch, directives.len() - start))
            .await?;

        let to_send = match ask(prompt, orchestrator.cancellation()).await? {
            Answer::Skip => {
                prompt.say("Skipping this batch.\n").await?;
                start = end;
                continue;
            }
            Answer::Quit => {
                prompt
                    .say("Exiting without sending any further mails.\n")
                    .await?;
                break;
            }
            Answer::Send => batch,
            Answer::SendAll => &directives[start..],
        };

        prompt
            .say(&format!("Sending mails for {} entries... ", to_send.len()))
            .await?;
        let result = orchestrator.process(store, to_send).await?;
        prompt
            .say(&format!(
                "{} mails sent, {} postponed.\n",
                result.sent, result.postponed
            ))
            .await?;
        summary.merge(result);
        start += to_send.len();
    }
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
