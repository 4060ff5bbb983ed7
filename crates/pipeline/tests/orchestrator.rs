//! End-to-end runs of the orchestrator against the in-memory store.

mod common;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use mail_parser::{MessageParser, MimeHeaders};
use mailgen_core::store::{DirectiveFilter, NotificationStore, PendingDirectives};
use mailgen_core::template::Template;
use mailgen_core::ticket::Ticket;
use mailgen_pipeline::{
    CsvOptions, NotificationContext, Orchestrator, PipelineError, RunOutcome, RunSummary, Script,
    ScriptOutcome, ScriptRegistry,
};
use tokio_util::sync::CancellationToken;

use common::{directive, event, now, settings, template_dir, HmacSigner, MemoryStore, RecordingTransport};

/// Sends the events as CSV once the notification interval has passed.
struct CsvScript {
    options: CsvOptions,
}

impl CsvScript {
    fn boxed(options: CsvOptions) -> Box<dyn Script> {
        Box::new(Self { options })
    }
}

#[async_trait]
impl Script for CsvScript {
    fn name(&self) -> &str {
        "10csv"
    }

    async fn create_notifications(
        &self,
        ctx: &mut NotificationContext<'_>,
    ) -> Result<ScriptOutcome, PipelineError> {
        if !ctx.interval_exceeded() {
            return Ok(ScriptOutcome::Postponed);
        }
        Ok(ScriptOutcome::Notify(
            ctx.format_as_csv(self.options.clone()).await?,
        ))
    }
}

fn registry(options: CsvOptions) -> ScriptRegistry {
    ScriptRegistry::from_scripts(vec![CsvScript::boxed(options)])
}

fn seq(day: &str, n: i64) -> Ticket {
    Ticket::new(NaiveDate::parse_from_str(day, "%Y%m%d").unwrap(), n)
}

#[tokio::test]
async fn aggregated_directive_yields_one_mail_and_one_mark() {
    let templates = template_dir();
    let settings = settings(templates.path());
    let scripts = registry(CsvOptions {
        attach_as_file: true,
        ..CsvOptions::default()
    });
    let transport = RecordingTransport::default();
    let mut store = MemoryStore::new(vec![directive("abuse@example.net", vec![1, 2], vec![10, 11])])
        .with_events([(1, event("192.0.2.1")), (2, event("192.0.2.2"))]);

    let outcome = Orchestrator::new(&scripts, &settings, &transport)
        .with_clock(now)
        .run(&mut store, None)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RunOutcome::Completed(RunSummary {
            sent: 1,
            postponed: 0,
            errored: 0
        })
    );
    assert_eq!(store.sent().len(), 1);
    assert_eq!(store.sent()[0].directive_ids, vec![10, 11]);
    assert_eq!(store.sent()[0].ticket, seq("20240501", 1));
    assert_eq!(store.sent()[0].sent_at, now());
    assert_eq!(store.open_savepoints(), 0);

    let mails = transport.mails();
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].subject(), "Report 20240501-00000001 for AS64496");

    let parsed = MessageParser::default().parse(&mails[0].raw).unwrap();
    let attachment = parsed.attachment(0).unwrap();
    let csv = String::from_utf8_lossy(attachment.contents()).replace("\r\n", "\n");
    assert!(csv.starts_with("\"asn\",\"ip\",\"timestamp\""));
    assert!(csv.contains("\"64496\",\"192.0.2.1\",\"2024-05-01 09:30:00\""));
    assert!(csv.contains("\"192.0.2.2\""));
    // Attached data is not repeated in the body.
    assert!(!parsed.body_text(0).unwrap().contains("192.0.2.1"));
}

#[tokio::test]
async fn missing_template_fails_only_its_directive() {
    let templates = template_dir();
    let settings = settings(templates.path());
    let scripts = registry(CsvOptions::default());
    let transport = RecordingTransport::default();

    let mut broken = directive("second@example.net", vec![2], vec![20]);
    broken.template_name = "missing".to_string();
    let mut store = MemoryStore::new(vec![
        directive("first@example.net", vec![1], vec![10]),
        broken,
        directive("third@example.net", vec![3], vec![30]),
    ])
    .with_events([(1, event("192.0.2.1")), (2, event("192.0.2.2")), (3, event("192.0.2.3"))]);

    let outcome = Orchestrator::new(&scripts, &settings, &transport)
        .with_clock(now)
        .run(&mut store, None)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RunOutcome::Completed(RunSummary {
            sent: 2,
            postponed: 0,
            errored: 1
        })
    );
    let marked: Vec<_> = store.sent().iter().map(|r| r.directive_ids.clone()).collect();
    assert_eq!(marked, vec![vec![10], vec![30]]);
    assert_eq!(transport.mails().len(), 2);
    // Inline CSV ends up in the body.
    assert!(transport.mails()[0].text().contains("192.0.2.1"));
}

#[tokio::test]
async fn failed_directive_gives_back_its_ticket() {
    let templates = template_dir();
    let settings = settings(templates.path());
    let scripts = registry(CsvOptions::default());
    let transport = RecordingTransport::default();

    // The recipient cannot be parsed, so composing fails after the ticket
    // was drawn.
    let mut store = MemoryStore::new(vec![
        directive("first@example.net", vec![1], vec![10]),
        directive("not an address", vec![1], vec![20]),
        directive("third@example.net", vec![1], vec![30]),
    ])
    .with_events([(1, event("192.0.2.1"))]);

    let outcome = Orchestrator::new(&scripts, &settings, &transport)
        .with_clock(now)
        .run(&mut store, None)
        .await
        .unwrap();

    assert_matches!(outcome, RunOutcome::Completed(RunSummary { sent: 2, errored: 1, .. }));
    let tickets: Vec<_> = store.sent().iter().map(|r| r.ticket.clone()).collect();
    assert_eq!(tickets, vec![seq("20240501", 1), seq("20240501", 2)]);
}

#[tokio::test]
async fn interval_not_exceeded_postpones() {
    let templates = template_dir();
    let settings = settings(templates.path());
    let scripts = registry(CsvOptions::default());
    let transport = RecordingTransport::default();

    let mut recent = directive("abuse@example.net", vec![1], vec![10]);
    recent.last_sent = Some(now() - Duration::minutes(10));
    let mut store = MemoryStore::new(vec![recent]).with_events([(1, event("192.0.2.1"))]);

    let outcome = Orchestrator::new(&scripts, &settings, &transport)
        .with_clock(now)
        .run(&mut store, None)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RunOutcome::Completed(RunSummary {
            sent: 0,
            postponed: 1,
            errored: 0
        })
    );
    assert!(transport.mails().is_empty());
    assert!(store.sent().is_empty());
}

#[tokio::test]
async fn dry_run_leaves_no_trace() {
    let templates = template_dir();
    let settings = settings(templates.path());
    let scripts = registry(CsvOptions::default());
    let transport = RecordingTransport::default();
    let mut store = MemoryStore::new(vec![
        directive("first@example.net", vec![1], vec![10]),
        directive("second@example.net", vec![1], vec![20]),
    ])
    .with_events([(1, event("192.0.2.1"))]);

    let outcome = Orchestrator::new(&scripts, &settings, &transport)
        .dry_run(true)
        .with_clock(now)
        .run(&mut store, None)
        .await
        .unwrap();

    assert_matches!(outcome, RunOutcome::Completed(RunSummary { sent: 2, .. }));
    assert!(store.sent().is_empty());
    assert_eq!(store.last_ticket().await.unwrap(), None);
    // Both directives drew the same ticket since each draw was rolled back.
    let subjects = transport.subjects();
    assert_eq!(subjects[0], subjects[1]);
}

#[tokio::test]
async fn clock_skew_stops_the_run() {
    let templates = template_dir();
    let settings = settings(templates.path());
    let scripts = registry(CsvOptions::default());
    let transport = RecordingTransport::default();
    let mut store = MemoryStore::new(vec![
        directive("first@example.net", vec![1], vec![10]),
        directive("second@example.net", vec![1], vec![20]),
    ])
    .with_events([(1, event("192.0.2.1"))])
    .with_ticket_day(NaiveDate::from_ymd_opt(2024, 5, 2).unwrap());

    let err = Orchestrator::new(&scripts, &settings, &transport)
        .with_clock(now)
        .run(&mut store, None)
        .await
        .unwrap_err();

    assert!(err.is_fatal());
    assert!(transport.mails().is_empty());
    assert_eq!(store.open_savepoints(), 0);
}

#[tokio::test]
async fn ticket_sequence_resets_on_a_new_day() {
    let templates = template_dir();
    let settings = settings(templates.path());
    let scripts = registry(CsvOptions::default());
    let transport = RecordingTransport::default();
    let mut store = MemoryStore::new(vec![directive("first@example.net", vec![1], vec![10])])
        .with_events([(1, event("192.0.2.1"))])
        .with_ticket_day(NaiveDate::from_ymd_opt(2024, 4, 30).unwrap());

    Orchestrator::new(&scripts, &settings, &transport)
        .with_clock(now)
        .run(&mut store, None)
        .await
        .unwrap();

    assert_eq!(store.sent()[0].ticket, seq("20240501", 1));
}

#[tokio::test]
async fn locked_store_ends_run_quietly() {
    let templates = template_dir();
    let settings = settings(templates.path());
    let scripts = registry(CsvOptions::default());
    let transport = RecordingTransport::default();
    let mut store = MemoryStore::new(Vec::new());
    store.pending = PendingDirectives::Locked;

    let filter = DirectiveFilter::new("directives.template_name = 'default'");
    let outcome = Orchestrator::new(&scripts, &settings, &transport)
        .run(&mut store, Some(&filter))
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Locked);
    assert_eq!(store.last_filter, Some(filter));
}

#[tokio::test]
async fn cancelled_run_processes_nothing() {
    let templates = template_dir();
    let settings = settings(templates.path());
    let scripts = registry(CsvOptions::default());
    let transport = RecordingTransport::default();
    let mut store = MemoryStore::new(vec![directive("first@example.net", vec![1], vec![10])])
        .with_events([(1, event("192.0.2.1"))]);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = Orchestrator::new(&scripts, &settings, &transport)
        .with_cancellation(cancel)
        .with_clock(now)
        .run(&mut store, None)
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Completed(RunSummary::default()));
    assert!(transport.mails().is_empty());
}

#[tokio::test]
async fn copies_share_the_ticket_without_marking() {
    /// Sends the regular notification plus an unmarked copy to a
    /// constituency contact under the same ticket.
    struct CopyScript;

    #[async_trait]
    impl Script for CopyScript {
        fn name(&self) -> &str {
            "01copies"
        }

        async fn create_notifications(
            &self,
            ctx: &mut NotificationContext<'_>,
        ) -> Result<ScriptOutcome, PipelineError> {
            let mut notifications = ctx.format_as_csv(CsvOptions::default()).await?;
            let ticket = notifications[0].ticket.clone();
            ctx.add_template(
                "copy",
                Template::from_strings("Copy of ${ticket_number}", "FYI\n"),
            );
            notifications.extend(
                ctx.format_as_csv(CsvOptions {
                    template_name: Some("copy".to_string()),
                    envelope_recipients: Some(vec!["constituency@example.org".to_string()]),
                    ticket: Some(ticket),
                    mark_as_sent: false,
                    ..CsvOptions::default()
                })
                .await?,
            );
            Ok(ScriptOutcome::Notify(notifications))
        }
    }

    let templates = template_dir();
    let settings = settings(templates.path());
    let scripts = ScriptRegistry::from_scripts(vec![Box::new(CopyScript)]);
    let transport = RecordingTransport::default();
    let mut store = MemoryStore::new(vec![directive("abuse@example.net", vec![1], vec![10])])
        .with_events([(1, event("192.0.2.1"))]);

    let outcome = Orchestrator::new(&scripts, &settings, &transport)
        .with_clock(now)
        .run(&mut store, None)
        .await
        .unwrap();

    assert_matches!(outcome, RunOutcome::Completed(RunSummary { sent: 2, .. }));
    assert_eq!(store.sent().len(), 1);
    let mails = transport.mails();
    assert_eq!(mails[0].envelope_recipients, None);
    assert_eq!(
        mails[1].envelope_recipients,
        Some(vec!["constituency@example.org".to_string()])
    );
    assert_eq!(mails[1].subject(), "Copy of 20240501-00000001");
}

#[tokio::test]
async fn signed_notifications_are_multipart_signed() {
    let templates = template_dir();
    let settings = settings(templates.path()).with_signer(Box::new(HmacSigner));
    let scripts = registry(CsvOptions::default());
    let transport = RecordingTransport::default();
    let mut store = MemoryStore::new(vec![directive("abuse@example.net", vec![1], vec![10])])
        .with_events([(1, event("192.0.2.1"))]);

    Orchestrator::new(&scripts, &settings, &transport)
        .with_clock(now)
        .run(&mut store, None)
        .await
        .unwrap();

    let mails = transport.mails();
    let parsed = MessageParser::default().parse(&mails[0].raw).unwrap();
    let content_type = parsed.content_type().unwrap();
    assert_eq!(content_type.subtype(), Some("signed"));
    assert_eq!(content_type.attribute("micalg"), Some("pgp-sha256"));
    assert!(mails[0].text().contains("-----BEGIN PGP SIGNATURE-----"));
}
