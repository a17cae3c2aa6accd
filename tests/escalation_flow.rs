use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use theatron::engine::EscalationPolicy;
use theatron::tenant::TenantManager;
use theatron::wire;

const H: i64 = 3_600_000; // 1 hour in ms
const M: i64 = 60_000; // 1 minute in ms

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("theatron_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, EscalationPolicy::default()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "theatron".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(format!("test_{}", Ulid::new()))
        .user("theatron")
        .password("theatron");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn data_rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect()
}

async fn query(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    data_rows(client.simple_query(sql).await.unwrap())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

/// Fetch one booking row by id, as (start, end, status, is_emergency,
/// overridden_booking_id).
async fn booking_row(
    client: &tokio_postgres::Client,
    theater: Ulid,
    id: Ulid,
) -> (i64, i64, String, String, Option<String>) {
    let rows = query(
        client,
        &format!("SELECT * FROM bookings WHERE theater_id = '{theater}'"),
    )
    .await;
    let row = rows
        .iter()
        .find(|r| r.get(0) == Some(id.to_string().as_str()))
        .expect("booking not found");
    (
        row.get(2).unwrap().parse().unwrap(),
        row.get(3).unwrap().parse().unwrap(),
        row.get(4).unwrap().to_string(),
        row.get(5).unwrap().to_string(),
        row.get(6).map(|s| s.to_string()),
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn create_and_list_bookings() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let tid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO theaters (id, name) VALUES ('{tid}', 'OR-1')"
        ))
        .await
        .unwrap();

    let bid = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, theater_id, start, "end", patient, procedure) VALUES ('{bid}', '{tid}', 1000, 2000, 'doe, j', 'appendectomy')"#
        ))
        .await
        .unwrap();

    let theaters = query(&client, "SELECT * FROM theaters").await;
    assert_eq!(theaters.len(), 1);
    assert_eq!(theaters[0].get(1), Some("OR-1"));

    let bookings = query(
        &client,
        &format!("SELECT * FROM bookings WHERE theater_id = '{tid}'"),
    )
    .await;
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].get(0), Some(bid.to_string().as_str()));
    assert_eq!(bookings[0].get(4), Some("scheduled"));
    assert_eq!(bookings[0].get(8), Some("doe, j"));
}

#[tokio::test]
async fn conflict_check_and_gate() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let tid = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO theaters (id) VALUES ('{tid}')"))
        .await
        .unwrap();

    let bid = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, theater_id, start, "end") VALUES ('{bid}', '{tid}', 1000, 2000)"#
        ))
        .await
        .unwrap();

    // Overlapping window reports the collider
    let conflicts = query(
        &client,
        &format!(
            r#"SELECT * FROM conflicts WHERE theater_id = '{tid}' AND start = 1500 AND "end" = 2500"#
        ),
    )
    .await;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].get(0), Some(bid.to_string().as_str()));

    // Touching window is free
    let conflicts = query(
        &client,
        &format!(
            r#"SELECT * FROM conflicts WHERE theater_id = '{tid}' AND start = 2000 AND "end" = 3000"#
        ),
    )
    .await;
    assert!(conflicts.is_empty());

    // Excluding the booking itself clears the report
    let conflicts = query(
        &client,
        &format!(
            r#"SELECT * FROM conflicts WHERE theater_id = '{tid}' AND start = 1500 AND "end" = 2500 AND exclude = '{bid}'"#
        ),
    )
    .await;
    assert!(conflicts.is_empty());

    // The gate rejects the write outright, with the collider in the message
    let result = client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, theater_id, start, "end") VALUES ('{}', '{tid}', 1500, 2500)"#,
            Ulid::new()
        ))
        .await;
    let err = result.unwrap_err().to_string();
    assert!(err.contains("conflict"), "unexpected error: {err}");

    // Invalid interval rejected before any store access
    let result = client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, theater_id, start, "end") VALUES ('{}', '{tid}', 2000, 2000)"#,
            Ulid::new()
        ))
        .await;
    assert!(result.unwrap_err().to_string().contains("invalid interval"));
}

#[tokio::test]
async fn escalation_end_to_end() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let now = now_ms();

    let tid = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO theaters (id) VALUES ('{tid}')"))
        .await
        .unwrap();

    // X straddles "now"; D sits right behind it, inside the emergency window.
    let x = Ulid::new();
    let d = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, theater_id, start, "end", patient) VALUES ('{x}', '{tid}', {}, {}, 'patient x')"#,
            now - 30 * M,
            now + 30 * M,
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, theater_id, start, "end") VALUES ('{d}', '{tid}', {}, {})"#,
            now + 30 * M,
            now + 90 * M,
        ))
        .await
        .unwrap();

    // Escalate X — response row carries the outcome
    let eid = Ulid::new();
    let rows = query(
        &client,
        &format!(
            "INSERT INTO escalations (id, booking_id, reason) VALUES ('{eid}', '{x}', 'ruptured aneurysm')"
        ),
    )
    .await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0), Some(eid.to_string().as_str()));
    assert_eq!(rows[0].get(1), Some(x.to_string().as_str()));
    assert_eq!(rows[0].get(2), Some(d.to_string().as_str())); // one shifted id

    // X preempted at its original interval
    let (x_start, x_end, x_status, _, _) = booking_row(&client, tid, x).await;
    assert_eq!(x_status, "preempted");
    assert_eq!(x_end - x_start, 60 * M);

    // Emergency booked for a 1h window, linked back to X
    let (e_start, e_end, e_status, e_flag, e_overrides) = booking_row(&client, tid, eid).await;
    assert_eq!(e_status, "scheduled");
    assert!(e_flag == "t" || e_flag == "true", "is_emergency flag: {e_flag}");
    assert_eq!(e_end - e_start, H);
    assert_eq!(e_overrides.as_deref(), Some(x.to_string().as_str()));

    // D pushed to the first slot after the window, duration preserved
    let (d_start, d_end, d_status, _, _) = booking_row(&client, tid, d).await;
    assert_eq!(d_status, "scheduled");
    assert_eq!(d_start, e_end);
    assert_eq!(d_end - d_start, 60 * M);

    // Double escalation is refused
    let result = client
        .batch_execute(&format!(
            "INSERT INTO escalations (id, booking_id, reason) VALUES ('{}', '{x}', 'again')",
            Ulid::new()
        ))
        .await;
    assert!(result
        .unwrap_err()
        .to_string()
        .contains("not eligible for escalation"));
}

#[tokio::test]
async fn escalation_reversal_end_to_end() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let now = now_ms();

    let tid = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO theaters (id) VALUES ('{tid}')"))
        .await
        .unwrap();

    let x = Ulid::new();
    let d = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, theater_id, start, "end") VALUES ('{x}', '{tid}', {}, {}), ('{d}', '{tid}', {}, {})"#,
            now - 30 * M,
            now + 30 * M,
            now + 30 * M,
            now + 90 * M,
        ))
        .await
        .unwrap();

    let eid = Ulid::new();
    query(
        &client,
        &format!(
            "INSERT INTO escalations (id, booking_id, reason) VALUES ('{eid}', '{x}', 'trauma')"
        ),
    )
    .await;
    let (d_start_shifted, _, _, _, _) = booking_row(&client, tid, d).await;

    // Cancel the escalation — response row names the restored booking
    let rows = query(
        &client,
        &format!("DELETE FROM escalations WHERE id = '{eid}'"),
    )
    .await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0), Some(x.to_string().as_str()));

    // X restored to scheduled at its original time
    let (x_start, x_end, x_status, _, _) = booking_row(&client, tid, x).await;
    assert_eq!(x_status, "scheduled");
    assert_eq!((x_start, x_end), (now - 30 * M, now + 30 * M));

    // D remains at its shifted slot — reversal does not move it back
    let (d_start, _, d_status, _, _) = booking_row(&client, tid, d).await;
    assert_eq!(d_status, "scheduled");
    assert_eq!(d_start, d_start_shifted);

    // The emergency row is gone
    let bookings = query(
        &client,
        &format!("SELECT * FROM bookings WHERE theater_id = '{tid}'"),
    )
    .await;
    assert!(bookings
        .iter()
        .all(|r| r.get(0) != Some(eid.to_string().as_str())));

    // Cancelling again fails
    let result = client
        .batch_execute(&format!("DELETE FROM escalations WHERE id = '{eid}'"))
        .await;
    assert!(result.unwrap_err().to_string().contains("no emergency booking"));
}

#[tokio::test]
async fn reschedule_and_status_over_wire() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let tid = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO theaters (id) VALUES ('{tid}')"))
        .await
        .unwrap();

    let bid = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, theater_id, start, "end") VALUES ('{bid}', '{tid}', 1000, 2000)"#
        ))
        .await
        .unwrap();

    client
        .batch_execute(&format!(
            r#"UPDATE bookings SET start = 5000, "end" = 6000 WHERE id = '{bid}'"#
        ))
        .await
        .unwrap();
    let (start, end, _, _, _) = booking_row(&client, tid, bid).await;
    assert_eq!((start, end), (5000, 6000));

    client
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'completed' WHERE id = '{bid}'"
        ))
        .await
        .unwrap();
    let (_, _, status, _, _) = booking_row(&client, tid, bid).await;
    assert_eq!(status, "completed");

    // Terminal state: cancel (DELETE) is now an invalid transition
    let result = client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{bid}'"))
        .await;
    assert!(result.unwrap_err().to_string().contains("cannot transition"));
}

#[tokio::test]
async fn batch_insert_is_atomic_over_wire() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let tid = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO theaters (id) VALUES ('{tid}')"))
        .await
        .unwrap();

    // Two rows that collide with each other: nothing lands
    let result = client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, theater_id, start, "end") VALUES ('{}', '{tid}', 1000, 3000), ('{}', '{tid}', 2000, 4000)"#,
            Ulid::new(),
            Ulid::new(),
        ))
        .await;
    assert!(result.is_err());

    let bookings = query(
        &client,
        &format!("SELECT * FROM bookings WHERE theater_id = '{tid}'"),
    )
    .await;
    assert!(bookings.is_empty());
}
