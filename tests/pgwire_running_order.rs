use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use lineup::auth::TokenAuthority;
use lineup::engine::Engine;
use lineup::notify::NotifyHub;
use lineup::wire::{self, LineupFactory};

const TOKEN: &str = "backstage";
/// 2025-07-12T20:00:00Z
const EVENING: i64 = 1_752_350_400_000;
const H: i64 = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("lineup_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("lineup.wal"), Arc::new(NotifyHub::new())).unwrap());
    let factory = Arc::new(LineupFactory::new(
        engine.clone(),
        &TokenAuthority::new(TOKEN, None),
    ));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory, None).await;
            });
        }
    });

    (addr, engine)
}

fn config(addr: SocketAddr, password: &str) -> Config {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("lineup")
        .user("backoffice")
        .password(password);
    config
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let (client, connection) = config(addr, TOKEN).connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.as_db_error().map(|e| e.code().code())
}

async fn seed(client: &tokio_postgres::Client) -> (Ulid, Ulid, Ulid) {
    let (nova, echo, main) = (Ulid::new(), Ulid::new(), Ulid::new());
    for sql in [
        format!("INSERT INTO artists (id, name) VALUES ('{nova}', 'Nova')"),
        format!("INSERT INTO artists (id, name, description) VALUES ('{echo}', 'Echo', 'Shoegaze')"),
        format!("INSERT INTO scenes (id, name, latitude, longitude) VALUES ('{main}', 'Main', 50.85, 4.35)"),
    ] {
        client.batch_execute(&sql).await.unwrap();
    }
    (nova, echo, main)
}

fn insert_booking(id: Ulid, artist: Ulid, stage: Ulid, start: i64, end: i64) -> String {
    format!(
        r#"INSERT INTO running_order (id, artist_id, stage_id, start, "end") VALUES ('{id}', '{artist}', '{stage}', {start}, {end})"#
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn wrong_password_is_refused() {
    let (addr, _engine) = start_test_server().await;
    assert!(config(addr, "not-the-token").connect(NoTls).await.is_err());
}

#[tokio::test]
async fn running_order_over_sql() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (nova, echo, main) = seed(&client).await;

    let first = Ulid::new();
    client
        .batch_execute(&insert_booking(first, nova, main, EVENING, EVENING + H))
        .await
        .unwrap();

    // Back-to-back on the same stage shares only the boundary.
    client
        .batch_execute(&insert_booking(Ulid::new(), echo, main, EVENING + H, EVENING + 2 * H))
        .await
        .unwrap();

    let listed = rows(client.simple_query("SELECT * FROM running_order").await.unwrap());
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].get("id"), Some(first.to_string().as_str()));
    assert_eq!(listed[0].get("artist_name"), Some("Nova"));
    assert_eq!(listed[1].get("stage_name"), Some("Main"));
    assert_eq!(listed[1].get("start"), Some((EVENING + H).to_string().as_str()));

    let filtered = rows(
        client
            .simple_query(&format!("SELECT * FROM bookings WHERE artist_id = '{echo}'"))
            .await
            .unwrap(),
    );
    assert_eq!(filtered.len(), 1);

    let artists = rows(client.simple_query("SELECT * FROM artists").await.unwrap());
    let names: Vec<_> = artists.iter().filter_map(|r| r.get("name")).collect();
    assert_eq!(names, vec!["Echo", "Nova"]);
    assert_eq!(artists[1].get("booking_count"), Some("1"));
}

#[tokio::test]
async fn overlapping_insert_is_an_exclusion_violation() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    let (nova, echo, main) = seed(&client).await;

    client
        .batch_execute(&insert_booking(Ulid::new(), nova, main, EVENING, EVENING + H))
        .await
        .unwrap();

    let err = client
        .batch_execute(&insert_booking(Ulid::new(), echo, main, EVENING + H / 2, EVENING + 2 * H))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23P01"));

    let err = client
        .batch_execute(&insert_booking(Ulid::new(), nova, main, EVENING + H, EVENING))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));

    let err = client.batch_execute("DROP TABLE artists").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));

    let err = client
        .simple_query(&format!("SELECT * FROM artists WHERE id = '{nova}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));

    assert_eq!(engine.booking_count(), 1);
}

#[tokio::test]
async fn conflicts_table_is_a_dry_run() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    let (nova, echo, main) = seed(&client).await;

    let booked = Ulid::new();
    client
        .batch_execute(&insert_booking(booked, nova, main, EVENING, EVENING + H))
        .await
        .unwrap();

    let conflicts_query = |artist: Ulid, exclude: Option<Ulid>| {
        let exclude = exclude.map_or(String::new(), |id| format!(" AND exclude_id = '{id}'"));
        format!(
            r#"SELECT * FROM conflicts WHERE artist_id = '{artist}' AND stage_id = '{main}' AND start >= {} AND "end" <= {}{exclude}"#,
            EVENING + H / 2,
            EVENING + H + H / 2,
        )
    };

    let hit = rows(client.simple_query(&conflicts_query(echo, None)).await.unwrap());
    assert_eq!(hit.len(), 1);
    assert_eq!(hit[0].get("axis"), Some("stage"));
    assert_eq!(hit[0].get("existing_id"), Some(booked.to_string().as_str()));

    let own = rows(client.simple_query(&conflicts_query(nova, Some(booked))).await.unwrap());
    assert!(own.is_empty());

    assert_eq!(engine.booking_count(), 1);
}

#[tokio::test]
async fn update_and_delete_over_sql() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    let (nova, _echo, main) = seed(&client).await;

    let id = Ulid::new();
    client
        .batch_execute(&insert_booking(id, nova, main, EVENING, EVENING + H))
        .await
        .unwrap();

    // Shrinking inside its own slot never conflicts with itself.
    client
        .batch_execute(&format!(
            r#"UPDATE running_order SET "end" = {} WHERE id = '{id}'"#,
            EVENING + H / 2
        ))
        .await
        .unwrap();
    assert_eq!(engine.get_booking(id).await.unwrap().end, EVENING + H / 2);

    client
        .batch_execute(&format!("UPDATE stages SET name = 'Main Stage' WHERE id = '{main}'"))
        .await
        .unwrap();
    assert_eq!(engine.get_booking(id).await.unwrap().stage_name, "Main Stage");

    let err = client
        .batch_execute(&format!("DELETE FROM scenes WHERE id = '{main}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23503"));

    client
        .batch_execute(&format!("DELETE FROM running_order WHERE id = '{id}'"))
        .await
        .unwrap();
    client
        .batch_execute(&format!("DELETE FROM scenes WHERE id = '{main}'"))
        .await
        .unwrap();

    let err = client
        .batch_execute(&format!("DELETE FROM running_order WHERE id = '{id}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("02000"));
    assert!(engine.list_stages().await.is_empty());
}
