//! Shared fixtures for pipeline integration tests: an in-memory store with
//! savepoints, a recording transport and an HMAC test signer.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use hmac::{Hmac, Mac};
use lettre::Message;
use mail_parser::MessageParser;
use mailgen_core::directive::Directive;
use mailgen_core::event::Event;
use mailgen_core::store::{DirectiveFilter, NotificationStore, PendingDirectives, StoreError};
use mailgen_core::template::TemplateStore;
use mailgen_core::ticket::{Ticket, TicketSequencer};
use mailgen_core::types::{DbId, Timestamp};
use mailgen_mail::{DetachedSignature, HashAlgorithm, MailError, MailTransport, SignError, Signer};
use mailgen_pipeline::NotificationSettings;
use sha2::Sha256;

pub const SENDER: &str = "Example CERT <cert@example.com>";

/// Fixed clock of the tests: 2024-05-01 12:00 UTC.
pub fn now() -> Timestamp {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub fn today() -> NaiveDate {
    now().date_naive()
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn directive(recipient: &str, event_ids: Vec<DbId>, directive_ids: Vec<DbId>) -> Directive {
    Directive {
        recipient_address: recipient.to_string(),
        template_name: "default".to_string(),
        notification_format: "shadowserver".to_string(),
        event_data_format: "csv_malware".to_string(),
        aggregate_identifier: BTreeMap::from([("source.asn".to_string(), "64496".to_string())]),
        event_ids,
        directive_ids,
        inserted_at: now() - Duration::minutes(16),
        notification_interval: Duration::hours(1),
        last_sent: None,
    }
}

pub fn event(ip: &str) -> Event {
    Event::new()
        .with("source.asn", 64496_i64)
        .with("source.ip", ip)
        .with(
            "time.source",
            DateTime::parse_from_rfc3339("2024-05-01T09:30:00+02:00").unwrap(),
        )
}

/// A template directory with a `default` template.
pub fn template_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("default"),
        "Report ${ticket_number} for AS${source.asn}\n\n\
         Dear colleagues,\n\nplease have a look at these events:\n\n${events_as_csv}\n",
    )
    .unwrap();
    dir
}

pub fn settings(templates: &Path) -> NotificationSettings {
    NotificationSettings::new(SENDER, TemplateStore::new(templates))
}

/// Write an executable plugin that discards its request and prints `answer`.
pub fn write_plugin(dir: &Path, name: &str, answer: &str) -> PathBuf {
    write_plugin_script(dir, name, &format!("cat > /dev/null\ncat <<'JSON'\n{answer}\nJSON\n"))
}

pub fn write_plugin_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/bash\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SentRecord {
    pub id: DbId,
    pub directive_ids: Vec<DbId>,
    pub ticket: Ticket,
    pub sent_at: Timestamp,
}

#[derive(Debug, Clone)]
struct State {
    sequencer: TicketSequencer,
    drawn: bool,
    sent: Vec<SentRecord>,
}

/// A store keeping everything in memory. Savepoints snapshot the mutable
/// state, so rollbacks behave like the database.
pub struct MemoryStore {
    pub pending: PendingDirectives,
    pub events: BTreeMap<DbId, Event>,
    pub today: NaiveDate,
    /// Last filter passed to `fetch_pending`.
    pub last_filter: Option<DirectiveFilter>,
    state: State,
    savepoints: Vec<(String, State)>,
}

impl MemoryStore {
    pub fn new(directives: Vec<Directive>) -> Self {
        Self {
            pending: PendingDirectives::Ready(directives),
            events: BTreeMap::new(),
            today: today(),
            last_filter: None,
            state: State {
                sequencer: TicketSequencer::new(today()),
                drawn: false,
                sent: Vec::new(),
            },
            savepoints: Vec::new(),
        }
    }

    pub fn with_events(mut self, events: impl IntoIterator<Item = (DbId, Event)>) -> Self {
        self.events.extend(events);
        self
    }

    /// Pretend the ticket day marker was set for `day`.
    pub fn with_ticket_day(mut self, day: NaiveDate) -> Self {
        self.state.sequencer = TicketSequencer::new(day);
        self
    }

    pub fn directives(&self) -> Vec<Directive> {
        match &self.pending {
            PendingDirectives::Ready(d) => d.clone(),
            PendingDirectives::Locked => Vec::new(),
        }
    }

    pub fn sent(&self) -> &[SentRecord] {
        &self.state.sent
    }

    pub fn open_savepoints(&self) -> usize {
        self.savepoints.len()
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn fetch_pending(
        &mut self,
        filter: Option<&DirectiveFilter>,
    ) -> Result<PendingDirectives, StoreError> {
        self.last_filter = filter.cloned();
        Ok(self.pending.clone())
    }

    async fn load_events(
        &mut self,
        event_ids: &[DbId],
        columns: &[String],
    ) -> Result<Vec<Event>, StoreError> {
        Ok(event_ids
            .iter()
            .filter_map(|id| self.events.get(id))
            .map(|event| {
                event
                    .fields()
                    .filter(|(name, _)| columns.iter().any(|c| c.as_str() == *name))
                    .map(|(name, value)| (name.to_string(), value.clone()))
                    .collect::<Event>()
            })
            .collect())
    }

    async fn new_ticket(&mut self) -> Result<Ticket, StoreError> {
        let ticket = self.state.sequencer.draw(self.today)?;
        self.state.drawn = true;
        Ok(ticket)
    }

    async fn last_ticket(&mut self) -> Result<Option<Ticket>, StoreError> {
        Ok(self.state.drawn.then(|| self.state.sequencer.last()))
    }

    async fn mark_sent(
        &mut self,
        directive_ids: &[DbId],
        ticket: &Ticket,
        sent_at: Timestamp,
    ) -> Result<DbId, StoreError> {
        let id = self.state.sent.len() as DbId + 1;
        self.state.sent.push(SentRecord {
            id,
            directive_ids: directive_ids.to_vec(),
            ticket: ticket.clone(),
            sent_at,
        });
        Ok(id)
    }

    async fn savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.savepoints.push((name.to_string(), self.state.clone()));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        let (_, state) = self
            .savepoints
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .ok_or_else(|| StoreError::backend(std::io::Error::other("no such savepoint")))?;
        self.state = state.clone();
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        let pos = self
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| StoreError::backend(std::io::Error::other("no such savepoint")))?;
        self.savepoints.truncate(pos);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingTransport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SentMail {
    pub raw: Vec<u8>,
    pub envelope_recipients: Option<Vec<String>>,
}

impl SentMail {
    pub fn subject(&self) -> String {
        MessageParser::default()
            .parse(&self.raw)
            .and_then(|m| m.subject().map(str::to_string))
            .unwrap_or_default()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }
}

#[derive(Default)]
pub struct RecordingTransport {
    pub mails: Mutex<Vec<SentMail>>,
}

impl RecordingTransport {
    pub fn mails(&self) -> Vec<SentMail> {
        self.mails.lock().unwrap().clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.mails().iter().map(SentMail::subject).collect()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(
        &self,
        message: &Message,
        envelope_recipients: Option<&[String]>,
    ) -> Result<(), MailError> {
        self.mails.lock().unwrap().push(SentMail {
            raw: message.formatted(),
            envelope_recipients: envelope_recipients.map(<[String]>::to_vec),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HmacSigner
// ---------------------------------------------------------------------------

/// Signs with HMAC-SHA256 in place of OpenPGP.
pub struct HmacSigner;

fn mac_hex(data: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(b"mailgen test key").unwrap();
    mac.update(data);
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[async_trait]
impl Signer for HmacSigner {
    async fn detached_signature(&self, data: &[u8]) -> Result<DetachedSignature, SignError> {
        Ok(DetachedSignature {
            armored: format!(
                "-----BEGIN PGP SIGNATURE-----\n\n{}\n-----END PGP SIGNATURE-----\n",
                mac_hex(data)
            ),
            hash_algorithm: HashAlgorithm::Sha256,
        })
    }

    async fn clearsign(&self, text: &str) -> Result<String, SignError> {
        Ok(format!("SIGNED[{}]\n{text}", mac_hex(text.as_bytes())))
    }
}
