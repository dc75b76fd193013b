use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use serialbook::config::EngineConfig;
use serialbook::tenant::{TenantManager, in_process_collaborators};
use serialbook::wire;

// ── Test infrastructure ──────────────────────────────────────

const PASSWORD: &str = "serialbook";
const MONDAY: &str = "2026-10-19";

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("serialbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(
        dir,
        1000,
        EngineConfig::default(),
        in_process_collaborators(),
    ));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, PASSWORD.to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, db: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(db)
        .user("clinic")
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn select(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn configure_doctor(client: &Client, total_slots: u32) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO configs VALUES ('{id}', 'individual_doctor', 'dr-1', NULL, {total_slots}, '09:00', '13:00', 500, 'mon,tue,wed,thu,fri')"
        ))
        .await
        .unwrap();
    id
}

const DOCTOR: &str = "provider_kind = 'individual_doctor' AND provider_id = 'dr-1'";

fn serials(rows: &[SimpleQueryRow]) -> Vec<u32> {
    rows.iter()
        .map(|r| r.get("serial").unwrap().parse().unwrap())
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> String {
    err.as_db_error().unwrap().code().code().to_string()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn config_round_trip() {
    let addr = start_test_server().await;
    let client = connect(addr, "clinic").await;
    let id = configure_doctor(&client, 10).await;

    let rows = select(&client, "SELECT * FROM configs").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(id.to_string().as_str()));
    assert_eq!(rows[0].get("available_days"), Some("mon,tue,wed,thu,fri"));
    assert_eq!(rows[0].get("is_active"), Some("t"));
}

#[tokio::test]
async fn settings_and_serials_for_open_day() {
    let addr = start_test_server().await;
    let client = connect(addr, "clinic").await;
    configure_doctor(&client, 8).await;

    let settings = select(
        &client,
        &format!("SELECT * FROM settings WHERE {DOCTOR} AND date = '{MONDAY}'"),
    )
    .await;
    assert_eq!(settings.len(), 1);
    assert_eq!(settings[0].get("total_slots"), Some("8"));
    assert_eq!(settings[0].get("bookable"), Some("t"));
    assert_eq!(settings[0].get("closure"), None);

    let rows = select(
        &client,
        &format!("SELECT * FROM serials WHERE {DOCTOR} AND date = '{MONDAY}'"),
    )
    .await;
    assert_eq!(serials(&rows), vec![2, 4, 6, 8]);
    // 4 hours over 8 serials: serial 2 gets the second half hour
    assert_eq!(rows[0].get("time_slot_start"), Some("09:30"));
    assert_eq!(rows[0].get("time_slot_end"), Some("10:00"));
}

#[tokio::test]
async fn weekend_is_closed() {
    let addr = start_test_server().await;
    let client = connect(addr, "clinic").await;
    configure_doctor(&client, 8).await;

    let sunday = "2026-10-25";
    let settings = select(
        &client,
        &format!("SELECT * FROM settings WHERE {DOCTOR} AND date = '{sunday}'"),
    )
    .await;
    assert_eq!(settings[0].get("bookable"), Some("f"));

    let rows = select(
        &client,
        &format!("SELECT * FROM serials WHERE {DOCTOR} AND date = '{sunday}'"),
    )
    .await;
    assert!(rows.is_empty());

    let err = client
        .batch_execute(&format!(
            "INSERT INTO bookings VALUES (NULL, 'individual_doctor', 'dr-1', NULL, '{sunday}', 2, 'p-1')"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "55000");
}

#[tokio::test]
async fn booking_then_conflict() {
    let addr = start_test_server().await;
    let client = connect(addr, "clinic").await;
    configure_doctor(&client, 8).await;

    let booking_id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO bookings VALUES ('{booking_id}', 'individual_doctor', 'dr-1', NULL, '{MONDAY}', 4, 'p-1')"
        ))
        .await
        .unwrap();

    let err = client
        .batch_execute(&format!(
            "INSERT INTO bookings VALUES (NULL, 'individual_doctor', 'dr-1', NULL, '{MONDAY}', 4, 'p-2')"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23505");
    assert!(
        err.as_db_error()
            .unwrap()
            .message()
            .starts_with("serial_already_booked")
    );

    let rows = select(
        &client,
        &format!("SELECT * FROM serials WHERE {DOCTOR} AND date = '{MONDAY}'"),
    )
    .await;
    assert_eq!(serials(&rows), vec![2, 6, 8]);

    let booked = select(
        &client,
        &format!("SELECT * FROM bookings WHERE id = '{booking_id}'"),
    )
    .await;
    assert_eq!(booked.len(), 1);
    assert_eq!(booked[0].get("status"), Some("pending"));
    assert_eq!(booked[0].get("fee"), Some("500"));
    assert_eq!(booked[0].get("source"), Some("self_service"));
}

#[tokio::test]
async fn resent_insert_with_client_id_is_idempotent() {
    let addr = start_test_server().await;
    let client = connect(addr, "clinic").await;
    configure_doctor(&client, 8).await;

    let booking_id = Ulid::new();
    let insert = format!(
        "INSERT INTO bookings VALUES ('{booking_id}', 'individual_doctor', 'dr-1', NULL, '{MONDAY}', 6, 'p-1')"
    );
    client.batch_execute(&insert).await.unwrap();
    // A retry after a lost reply gets the committed booking back
    client.batch_execute(&insert).await.unwrap();

    let day = select(
        &client,
        &format!("SELECT * FROM bookings WHERE {DOCTOR} AND booking_date = '{MONDAY}'"),
    )
    .await;
    assert_eq!(day.len(), 1);
    assert_eq!(day[0].get("id"), Some(booking_id.to_string().as_str()));
}

#[tokio::test]
async fn odd_serial_rejected_for_self_service() {
    let addr = start_test_server().await;
    let client = connect(addr, "clinic").await;
    configure_doctor(&client, 8).await;

    let err = client
        .batch_execute(&format!(
            "INSERT INTO bookings VALUES (NULL, 'individual_doctor', 'dr-1', NULL, '{MONDAY}', 3, 'p-1')"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "22023");
    assert!(
        err.as_db_error()
            .unwrap()
            .message()
            .starts_with("serial_must_be_even")
    );

    // Staff take the odd serial instead
    client
        .batch_execute(&format!(
            "INSERT INTO walk_ins VALUES (NULL, 'individual_doctor', 'dr-1', NULL, '{MONDAY}', 3, 'p-1')"
        ))
        .await
        .unwrap();
    let day = select(
        &client,
        &format!("SELECT * FROM bookings WHERE {DOCTOR} AND booking_date = '{MONDAY}'"),
    )
    .await;
    assert_eq!(day.len(), 1);
    assert_eq!(day[0].get("source"), Some("staff"));
}

#[tokio::test]
async fn status_changes_through_lifecycle() {
    let addr = start_test_server().await;
    let client = connect(addr, "clinic").await;
    configure_doctor(&client, 8).await;

    let booking_id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO bookings VALUES ('{booking_id}', 'individual_doctor', 'dr-1', NULL, '{MONDAY}', 2, 'p-1')"
        ))
        .await
        .unwrap();

    // Completing a pending booking skips acceptance
    let err = client
        .batch_execute(&format!(
            "INSERT INTO status_changes VALUES ('{booking_id}', 'completed', 'provider')"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "55000");

    client
        .batch_execute(&format!(
            "INSERT INTO status_changes VALUES ('{booking_id}', 'accepted', 'provider')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO status_changes VALUES ('{booking_id}', 'cancelled', 'patient', 'travelling')"
        ))
        .await
        .unwrap();

    let rows = select(
        &client,
        &format!("SELECT * FROM bookings WHERE id = '{booking_id}'"),
    )
    .await;
    assert_eq!(rows[0].get("status"), Some("cancelled"));
    assert_eq!(rows[0].get("cancelled_by"), Some("patient"));
    assert_eq!(rows[0].get("reason"), Some("travelling"));

    // Serial 2 is free again
    let open = select(
        &client,
        &format!("SELECT * FROM serials WHERE {DOCTOR} AND date = '{MONDAY}'"),
    )
    .await;
    assert_eq!(serials(&open), vec![2, 4, 6, 8]);
}

#[tokio::test]
async fn override_changes_capacity_for_one_date() {
    let addr = start_test_server().await;
    let client = connect(addr, "clinic").await;
    let config_id = configure_doctor(&client, 8).await;

    client
        .batch_execute(&format!(
            "INSERT INTO overrides VALUES ('{config_id}', '{MONDAY}', 4, NULL, NULL, NULL, 'half day', true)"
        ))
        .await
        .unwrap();

    let rows = select(
        &client,
        &format!("SELECT * FROM serials WHERE {DOCTOR} AND date = '{MONDAY}'"),
    )
    .await;
    assert_eq!(serials(&rows), vec![2, 4]);

    let overrides = select(
        &client,
        &format!("SELECT * FROM overrides WHERE config_id = '{config_id}'"),
    )
    .await;
    assert_eq!(overrides.len(), 1);
    assert_eq!(overrides[0].get("admin_note"), Some("half day"));
}

#[tokio::test]
async fn unconfigured_provider_errors() {
    let addr = start_test_server().await;
    let client = connect(addr, "clinic").await;

    let err = client
        .simple_query(&format!(
            "SELECT * FROM serials WHERE {DOCTOR} AND date = '{MONDAY}'"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42704");
}

#[tokio::test]
async fn tenants_are_isolated_by_database() {
    let addr = start_test_server().await;
    let clinic_a = connect(addr, "clinic_a").await;
    let clinic_b = connect(addr, "clinic_b").await;
    configure_doctor(&clinic_a, 8).await;

    assert_eq!(select(&clinic_a, "SELECT * FROM configs").await.len(), 1);
    assert!(select(&clinic_b, "SELECT * FROM configs").await.is_empty());
}

#[tokio::test]
async fn malformed_sql_is_a_syntax_error() {
    let addr = start_test_server().await;
    let client = connect(addr, "clinic").await;

    let err = client.batch_execute("INSERT INTO nowhere").await.unwrap_err();
    assert_eq!(sqlstate(&err), "42601");
}
