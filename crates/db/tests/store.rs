//! Integration tests for the PostgreSQL store.
//!
//! Like every `#[sqlx::test]`, these need `DATABASE_URL` pointing at a
//! PostgreSQL server; each test gets a fresh, migrated database.

use assert_matches::assert_matches;
use chrono::Utc;
use mailgen_core::store::{DirectiveFilter, NotificationStore, PendingDirectives};
use mailgen_db::PgStore;
use sqlx::PgPool;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn insert_event(pool: &PgPool, asn: i64, ip: &str) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO events (\"source.asn\", \"source.ip\", \"time.source\", extra) \
         VALUES ($1, $2::inet, '2024-05-01 12:00:00+02', '{\"system_desc\": \"router\"}') \
         RETURNING id",
    )
    .bind(asn)
    .bind(ip)
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn insert_directive(pool: &PgPool, event_id: i64, recipient: &str, asn: i64) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO directives (events_id, medium, recipient_address, template_name, \
             notification_format, event_data_format, aggregate_identifier, \
             notification_interval, endpoint) \
         VALUES ($1, 'email', $2, 'test-template', 'shadowserver', 'csv_malware', \
                 jsonb_build_object('source.asn', $3::text), interval '1 hour', 'source') \
         RETURNING id",
    )
    .bind(event_id)
    .bind(recipient)
    .bind(asn)
    .fetch_one(pool)
    .await
    .unwrap()
}

fn ready(pending: PendingDirectives) -> Vec<mailgen_core::directive::Directive> {
    match pending {
        PendingDirectives::Ready(d) => d,
        PendingDirectives::Locked => panic!("expected pending directives"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
async fn aggregates_pending_directives(pool: PgPool) {
    let e1 = insert_event(&pool, 64496, "192.0.2.1").await;
    let e2 = insert_event(&pool, 64496, "192.0.2.2").await;
    let e3 = insert_event(&pool, 64497, "192.0.2.3").await;
    let d1 = insert_directive(&pool, e1, "abuse@example.com", 64496).await;
    let d2 = insert_directive(&pool, e2, "abuse@example.com", 64496).await;
    insert_directive(&pool, e3, "abuse@example.com", 64497).await;

    let mut store = PgStore::begin(&pool).await.unwrap();
    let directives = ready(store.fetch_pending(None).await.unwrap());
    assert_eq!(directives.len(), 2);

    let first = &directives[0];
    assert_eq!(first.directive_ids, vec![d1, d2]);
    assert_eq!(first.event_ids, vec![e1, e2]);
    assert_eq!(first.aggregation_item("source.asn"), Some("64496"));
    assert_eq!(first.notification_interval.num_seconds(), 3600);
    assert_eq!(first.last_sent, None);
    store.rollback().await.unwrap();
}

#[sqlx::test(migrations = "./migrations")]
async fn second_run_sees_lock_unavailable(pool: PgPool) {
    let e1 = insert_event(&pool, 64496, "192.0.2.1").await;
    insert_directive(&pool, e1, "abuse@example.com", 64496).await;

    let mut first = PgStore::begin(&pool).await.unwrap();
    assert_eq!(ready(first.fetch_pending(None).await.unwrap()).len(), 1);

    let mut second = PgStore::begin(&pool).await.unwrap();
    assert_eq!(
        second.fetch_pending(None).await.unwrap(),
        PendingDirectives::Locked
    );
    second.rollback().await.unwrap();
    first.rollback().await.unwrap();
}

#[sqlx::test(migrations = "./migrations")]
async fn filter_on_event_columns(pool: PgPool) {
    let e1 = insert_event(&pool, 64496, "192.0.2.1").await;
    let e2 = insert_event(&pool, 64497, "192.0.2.2").await;
    insert_directive(&pool, e1, "a@example.com", 64496).await;
    insert_directive(&pool, e2, "b@example.com", 64497).await;

    let mut store = PgStore::begin(&pool).await.unwrap();
    let filter = DirectiveFilter::new("events.\"source.asn\" = 64497");
    let directives = ready(store.fetch_pending(Some(&filter)).await.unwrap());
    assert_eq!(directives.len(), 1);
    assert_eq!(directives[0].recipient_address, "b@example.com");
    store.rollback().await.unwrap();
}

#[sqlx::test(migrations = "./migrations")]
async fn mark_sent_removes_directives_from_pending(pool: PgPool) {
    let e1 = insert_event(&pool, 64496, "192.0.2.1").await;
    let d1 = insert_directive(&pool, e1, "abuse@example.com", 64496).await;

    let mut store = PgStore::begin(&pool).await.unwrap();
    let ticket = store.new_ticket().await.unwrap();
    let sent_at = Utc::now();
    store.mark_sent(&[d1], &ticket, sent_at).await.unwrap();
    assert_eq!(ready(store.fetch_pending(None).await.unwrap()), vec![]);
    store.commit().await.unwrap();

    // A new directive of the same group now reports when the group was sent.
    let e2 = insert_event(&pool, 64496, "192.0.2.2").await;
    insert_directive(&pool, e2, "abuse@example.com", 64496).await;
    let mut store = PgStore::begin(&pool).await.unwrap();
    let directives = ready(store.fetch_pending(None).await.unwrap());
    let last_sent = directives[0].last_sent.unwrap();
    assert_eq!(last_sent.timestamp(), sent_at.timestamp());
    store.rollback().await.unwrap();
}

#[sqlx::test(migrations = "./migrations")]
async fn savepoint_rollback_discards_mark_sent(pool: PgPool) {
    let e1 = insert_event(&pool, 64496, "192.0.2.1").await;
    let d1 = insert_directive(&pool, e1, "abuse@example.com", 64496).await;

    let mut store = PgStore::begin(&pool).await.unwrap();
    store.savepoint("sendmail").await.unwrap();
    let ticket = store.new_ticket().await.unwrap();
    store.mark_sent(&[d1], &ticket, Utc::now()).await.unwrap();
    store.rollback_to_savepoint("sendmail").await.unwrap();
    store.release_savepoint("sendmail").await.unwrap();

    assert_eq!(ready(store.fetch_pending(None).await.unwrap()).len(), 1);
    store.rollback().await.unwrap();
}

#[sqlx::test(migrations = "./migrations")]
async fn tickets_increase_and_reset_for_a_new_day(pool: PgPool) {
    let mut store = PgStore::begin(&pool).await.unwrap();
    assert_eq!(store.last_ticket().await.unwrap(), None);

    let t1 = store.new_ticket().await.unwrap();
    let t2 = store.new_ticket().await.unwrap();
    assert!(t1 < t2);
    assert!(t1.as_str().ends_with("-00000001"));
    assert_eq!(t1.day(), Utc::now().date_naive());
    assert_eq!(store.last_ticket().await.unwrap(), Some(t2));
    store.commit().await.unwrap();

    // Pretend the sequence was last reset yesterday.
    sqlx::query("UPDATE ticket_day SET initialized_for_day = current_date - 1")
        .execute(&pool)
        .await
        .unwrap();
    let mut store = PgStore::begin(&pool).await.unwrap();
    assert!(store.new_ticket().await.unwrap().as_str().ends_with("-00000001"));
    store.rollback().await.unwrap();
}

#[sqlx::test(migrations = "./migrations")]
async fn future_day_marker_is_fatal(pool: PgPool) {
    sqlx::query("UPDATE ticket_day SET initialized_for_day = current_date + 1")
        .execute(&pool)
        .await
        .unwrap();
    let mut store = PgStore::begin(&pool).await.unwrap();
    let err = store.new_ticket().await.unwrap_err();
    assert!(err.is_fatal());
    store.rollback().await.unwrap();
}

#[sqlx::test(migrations = "./migrations")]
async fn loads_typed_event_columns(pool: PgPool) {
    let e1 = insert_event(&pool, 64496, "192.0.2.1").await;

    let mut store = PgStore::begin(&pool).await.unwrap();
    let columns: Vec<String> = [
        "source.asn",
        "source.ip",
        "destination.ip",
        "time.source",
        "extra",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect();
    let events = store.load_events(&[e1], &columns).await.unwrap();
    assert_eq!(events.len(), 1);

    use mailgen_core::event::EventValue;
    let event = &events[0];
    assert_eq!(event.get("source.asn"), Some(&EventValue::Integer(64496)));
    assert_eq!(event.get("source.ip"), Some(&EventValue::from("192.0.2.1")));
    assert_eq!(event.get("destination.ip"), None);
    assert_matches!(event.get("time.source"), Some(EventValue::Timestamp(ts))
        if ts.to_rfc3339() == "2024-05-01T10:00:00+00:00");
    assert_matches!(event.get("extra"), Some(EventValue::Text(_)));
    store.rollback().await.unwrap();
}
