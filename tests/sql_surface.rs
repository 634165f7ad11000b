use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use caresched::engine::Engine;
use caresched::notify::NotifyHub;
use caresched::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("caresched_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(
        Engine::new(dir.join("caresched.wal"), Arc::new(NotifyHub::new()), 3_600_000).unwrap(),
    );

    let server_engine = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = server_engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, "caresched".to_string(), None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("caresched")
        .user("clinic")
        .password("caresched");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// Doctor with a Monday 09:00-11:00 block in 30 minute tiles.
async fn seed_doctor(client: &Client) -> Ulid {
    let doctor = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO doctors (id, specialty) VALUES ('{doctor}', 'Cardiology')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO schedules (id, doctor_id, day_of_week, start_time, end_time, interval_minutes) \
             VALUES ('{}', '{doctor}', 0, '09:00', '11:00', 30)",
            Ulid::new()
        ))
        .await
        .unwrap();
    doctor
}

async fn book(client: &Client, id: Ulid, doctor: Ulid, start: &str, end: &str) -> Result<u64, tokio_postgres::Error> {
    client
        .execute(
            &format!(
                r#"INSERT INTO appointments (id, doctor_id, patient_id, "date", start_time, end_time, reason)
                   VALUES ('{id}', '{doctor}', '{}', '2024-01-01', '{start}', '{end}', 'follow-up')"#,
                Ulid::new()
            ),
            &[],
        )
        .await
}

fn slot_starts(rows: &[SimpleQueryRow]) -> Vec<String> {
    rows.iter()
        .map(|r| r.get("start_time").unwrap().to_string())
        .collect()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn doctors_listed_with_counts() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let doctor = seed_doctor(&client).await;

    let listed = rows(&client, "SELECT * FROM doctors").await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("id"), Some(doctor.to_string().as_str()));
    assert_eq!(listed[0].get("specialty"), Some("Cardiology"));
    assert_eq!(listed[0].get("schedule_count"), Some("1"));

    let schedules = rows(&client, &format!("SELECT * FROM schedules WHERE doctor_id = '{doctor}'")).await;
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0].get("start_time"), Some("09:00"));
    assert_eq!(schedules[0].get("active"), Some("t"));
}

#[tokio::test]
async fn availability_as_hhmm_text() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let doctor = seed_doctor(&client).await;

    let slots = rows(
        &client,
        &format!(r#"SELECT * FROM availability WHERE doctor_id = '{doctor}' AND "date" = '2024-01-01'"#),
    )
    .await;
    assert_eq!(slot_starts(&slots), ["09:00", "09:30", "10:00", "10:30"]);
    assert_eq!(slots[0].get("end_time"), Some("09:30"));
    assert_eq!(slots[0].get("date"), Some("2024-01-01"));

    // Tuesday has no schedule.
    let none = rows(
        &client,
        &format!(r#"SELECT * FROM availability WHERE doctor_id = '{doctor}' AND "date" = '2024-01-02'"#),
    )
    .await;
    assert!(none.is_empty());
}

#[tokio::test]
async fn booking_removes_slot_and_rejects_overlap() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let doctor = seed_doctor(&client).await;

    assert_eq!(book(&client, Ulid::new(), doctor, "09:30", "10:00").await.unwrap(), 1);

    let err = book(&client, Ulid::new(), doctor, "09:45", "10:15").await.unwrap_err();
    let db = err.as_db_error().expect("database error");
    assert_eq!(db.code().code(), "P0001");
    assert!(db.message().contains("conflict"), "{}", db.message());

    // Touching ranges are not overlaps.
    book(&client, Ulid::new(), doctor, "10:00", "10:30").await.unwrap();

    let slots = rows(
        &client,
        &format!(r#"SELECT * FROM availability WHERE doctor_id = '{doctor}' AND "date" = '2024-01-01'"#),
    )
    .await;
    assert_eq!(slot_starts(&slots), ["09:00", "10:30"]);
}

#[tokio::test]
async fn cancel_frees_slot_and_keeps_row() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let doctor = seed_doctor(&client).await;
    let appointment = Ulid::new();
    book(&client, appointment, doctor, "09:00", "09:30").await.unwrap();

    client
        .batch_execute(&format!("DELETE FROM appointments WHERE id = '{appointment}'"))
        .await
        .unwrap();

    let listed = rows(&client, &format!("SELECT * FROM appointments WHERE doctor_id = '{doctor}'")).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("status"), Some("CANCELLED"));
    assert_eq!(listed[0].get("reason"), Some("follow-up"));

    let slots = rows(
        &client,
        &format!(r#"SELECT * FROM availability WHERE doctor_id = '{doctor}' AND "date" = '2024-01-01'"#),
    )
    .await;
    assert_eq!(slot_starts(&slots)[0], "09:00");

    // The freed range can be booked again.
    book(&client, Ulid::new(), doctor, "09:00", "09:30").await.unwrap();
}

#[tokio::test]
async fn reschedule_via_on_conflict() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let doctor = seed_doctor(&client).await;
    let appointment = Ulid::new();
    book(&client, appointment, doctor, "09:00", "09:30").await.unwrap();

    client
        .batch_execute(&format!(
            r#"INSERT INTO appointments (id, doctor_id, patient_id, "date", start_time, end_time)
               VALUES ('{appointment}', '{doctor}', '{}', '2024-01-01', '10:00', '10:30')
               ON CONFLICT (id) DO UPDATE SET start_time = '10:00'"#,
            Ulid::new()
        ))
        .await
        .unwrap();

    let listed = rows(&client, &format!("SELECT * FROM appointments WHERE doctor_id = '{doctor}'")).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("start_time"), Some("10:00"));
}

#[tokio::test]
async fn confirm_token_over_wire() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let doctor = seed_doctor(&client).await;
    let appointment = Ulid::new();
    book(&client, appointment, doctor, "09:00", "09:30").await.unwrap();

    let confirmation = rows(
        &client,
        &format!("SELECT * FROM confirmations WHERE appointment_id = '{appointment}'"),
    )
    .await;
    assert_eq!(confirmation.len(), 1);
    assert_eq!(confirmation[0].get("confirmed"), Some("f"));
    let token = confirmation[0].get("token").unwrap().to_string();

    client
        .batch_execute(&format!("INSERT INTO confirmations (token) VALUES ('{token}')"))
        .await
        .unwrap();

    let listed = rows(&client, &format!("SELECT * FROM appointments WHERE doctor_id = '{doctor}'")).await;
    assert_eq!(listed[0].get("status"), Some("CONFIRMED"));

    let err = client
        .batch_execute("INSERT INTO confirmations (token) VALUES ('not-a-token')")
        .await
        .unwrap_err();
    assert_eq!(err.as_db_error().unwrap().code().code(), "P0001");
}

#[tokio::test]
async fn status_transition_and_bad_sql() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let doctor = seed_doctor(&client).await;
    let appointment = Ulid::new();
    book(&client, appointment, doctor, "09:00", "09:30").await.unwrap();

    client
        .batch_execute(&format!(
            "INSERT INTO appointment_status (appointment_id, status) VALUES ('{appointment}', 'COMPLETED')"
        ))
        .await
        .unwrap();
    let listed = rows(&client, &format!("SELECT * FROM appointments WHERE doctor_id = '{doctor}'")).await;
    assert_eq!(listed[0].get("status"), Some("COMPLETED"));

    let err = client
        .batch_execute("UPDATE appointments SET status = 'PENDING'")
        .await
        .unwrap_err();
    assert_eq!(err.as_db_error().unwrap().code().code(), "42601");
}

#[tokio::test]
async fn extended_protocol_parameters() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let doctor = seed_doctor(&client).await;

    let doctor_param = doctor.to_string();
    let date_param = "2024-01-01".to_string();
    let slots = client
        .query(
            r#"SELECT * FROM availability WHERE doctor_id = $1 AND "date" = $2"#,
            &[&doctor_param, &date_param],
        )
        .await
        .unwrap();
    let starts: Vec<String> = slots.iter().map(|r| r.get("start_time")).collect();
    assert_eq!(starts, ["09:00", "09:30", "10:00", "10:30"]);
}

#[tokio::test]
async fn extended_insert_keeps_dollar_text_in_values() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let doctor = seed_doctor(&client).await;

    let params: Vec<String> = vec![
        Ulid::new().to_string(),
        doctor.to_string(),
        Ulid::new().to_string(),
        "2024-01-01".into(),
        "09:00".into(),
        "09:30".into(),
        "copay $4 owed, see $2".into(),
    ];
    let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
        params.iter().map(|p| p as &(dyn tokio_postgres::types::ToSql + Sync)).collect();
    let inserted = client
        .execute(
            r#"INSERT INTO appointments (id, doctor_id, patient_id, "date", start_time, end_time, reason)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
            &refs,
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let listed = rows(&client, &format!("SELECT * FROM appointments WHERE doctor_id = '{doctor}'")).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("reason"), Some("copay $4 owed, see $2"));
    assert_eq!(listed[0].get("start_time"), Some("09:00"));
}

#[tokio::test]
async fn wrong_password_rejected() {
    let (addr, _engine) = start_test_server().await;
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .user("clinic")
        .password("wrong");
    assert!(config.connect(NoTls).await.is_err());
}
