use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, stream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::error::SqlState;
use tokio_postgres::{AsyncMessage, Config, NoTls, Notification, SimpleQueryMessage, SimpleQueryRow};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use slotbook::engine::EngineSettings;
use slotbook::notify::channel_name;
use slotbook::tenant::TenantManager;
use slotbook::wire;

const DATE: &str = "2025-03-10";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(
        dir,
        EngineSettings::default(),
        Duration::from_secs(1),
        1000,
        CancellationToken::new(),
    ));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "slotbook".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(addr: SocketAddr) -> (tokio_postgres::Client, mpsc::UnboundedReceiver<Notification>) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("slotbook")
        .user("slotbook")
        .password("slotbook");

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    (client, rx)
}

fn data_rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// Open 09:00-17:30 for the provider and generate the day's slots at `base_price`.
async fn open_and_generate(client: &tokio_postgres::Client, provider: Ulid, base_price: i64) -> Vec<SimpleQueryRow> {
    client
        .batch_execute(&format!(
            "INSERT INTO availability (id, provider_id, valid_from, valid_until, day, is_available, start_time, end_time) \
             VALUES ('{}', '{provider}', '{DATE}', '{DATE}', '{DATE}', true, '09:00', '17:30')",
            Ulid::new()
        ))
        .await
        .unwrap();
    data_rows(
        client
            .simple_query(&format!(
                "INSERT INTO slots (provider_id, date, base_price) VALUES ('{provider}', '{DATE}', {base_price})"
            ))
            .await
            .unwrap(),
    )
}

async fn recv_notification(rx: &mut mpsc::UnboundedReceiver<Notification>, timeout: Duration) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn generate_and_list_slots() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let provider = Ulid::new();

    let generated = open_and_generate(&client, provider, 120).await;
    assert_eq!(generated.len(), 17);
    assert_eq!(generated[0].get("time"), Some("09:00"));
    assert_eq!(generated[0].get("status"), Some("available"));
    assert_eq!(generated[0].get("base_price"), Some("120"));

    let available = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM available_slots WHERE provider_id = '{provider}' AND date = '{DATE}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(available.len(), 17);

    let opening = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM availability WHERE provider_id = '{provider}' AND date = '{DATE}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(opening.len(), 1);
    assert_eq!(opening[0].get("start_time"), Some("09:00"));
    assert_eq!(opening[0].get("end_time"), Some("17:30"));
}

#[tokio::test]
async fn hold_then_confirm_booking() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let provider = Ulid::new();
    let slots = open_and_generate(&client, provider, 120).await;
    let slot_id = slots[4].get("id").unwrap().to_string();
    let user = Ulid::new();
    let booking = Ulid::new();

    client
        .batch_execute(&format!("INSERT INTO holds (slot_id, user_id) VALUES ('{slot_id}', '{user}')"))
        .await
        .unwrap();
    let held = data_rows(client.simple_query(&format!("SELECT * FROM slots WHERE id = '{slot_id}'")).await.unwrap());
    assert_eq!(held[0].get("status"), Some("held"));
    assert_eq!(held[0].get("held_by"), Some(user.to_string().as_str()));

    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, slot_id, user_id) VALUES ('{booking}', '{slot_id}', '{user}')"
        ))
        .await
        .unwrap();
    let booked = data_rows(
        client
            .simple_query(&format!("SELECT * FROM bookings WHERE id = '{booking}'"))
            .await
            .unwrap(),
    );
    assert_eq!(booked.len(), 1);
    assert_eq!(booked[0].get("status"), Some("booked"));
    assert_eq!(booked[0].get("id"), Some(slot_id.as_str()));

    // Booked slot drops out of the available listing.
    let available = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM available_slots WHERE provider_id = '{provider}' AND date = '{DATE}'"
            ))
            .await
            .unwrap(),
    );
    assert!(available.iter().all(|row| row.get("id") != Some(slot_id.as_str())));
}

#[tokio::test]
async fn conflicting_hold_reports_lock_not_available() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let provider = Ulid::new();
    let slots = open_and_generate(&client, provider, 120).await;
    let slot_id = slots[0].get("id").unwrap().to_string();

    client
        .batch_execute(&format!("INSERT INTO holds (slot_id, user_id) VALUES ('{slot_id}', '{}')", Ulid::new()))
        .await
        .unwrap();

    let (other, _rx2) = connect(addr).await;
    let err = other
        .batch_execute(&format!("INSERT INTO holds (slot_id, user_id) VALUES ('{slot_id}', '{}')", Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::from_code("55P03")));
}

#[tokio::test]
async fn unknown_statement_is_syntax_error() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let err = client.batch_execute("SELEKT nothing").await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::from_code("42601")));

    // Connection stays usable after the error.
    client.batch_execute("UNLISTEN *").await.unwrap();
}

#[tokio::test]
async fn listen_receives_provider_events() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let (writer, _rx2) = connect(addr).await;

    let provider = Ulid::new();
    let slots = open_and_generate(&writer, provider, 120).await;
    let slot_id = slots[2].get("id").unwrap().to_string();
    let channel = channel_name(provider);

    listener.batch_execute(&format!("LISTEN {channel}")).await.unwrap();
    writer
        .batch_execute(&format!("INSERT INTO holds (slot_id, user_id) VALUES ('{slot_id}', '{}')", Ulid::new()))
        .await
        .unwrap();

    // Pending notifications go out with the listener's next round trip.
    listener
        .simple_query(&format!("SELECT * FROM slots WHERE id = '{slot_id}'"))
        .await
        .unwrap();

    let n = recv_notification(&mut rx, Duration::from_secs(2)).await.expect("notification");
    assert_eq!(n.channel(), channel);
    let json: serde_json::Value = serde_json::from_str(n.payload()).unwrap();
    assert_eq!(json["HoldPlaced"]["slot_id"], slot_id);
}

#[tokio::test]
async fn unlisten_stops_delivery() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let (writer, _rx2) = connect(addr).await;

    let provider = Ulid::new();
    let slots = open_and_generate(&writer, provider, 120).await;
    let channel = channel_name(provider);

    listener.batch_execute(&format!("LISTEN {channel}")).await.unwrap();
    listener.batch_execute(&format!("UNLISTEN {channel}")).await.unwrap();
    writer
        .batch_execute(&format!(
            "INSERT INTO holds (slot_id, user_id) VALUES ('{}', '{}')",
            slots[0].get("id").unwrap(),
            Ulid::new()
        ))
        .await
        .unwrap();
    listener.batch_execute("UNLISTEN *").await.unwrap();

    assert!(recv_notification(&mut rx, Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn listen_rejects_unknown_channel() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let err = client.batch_execute("LISTEN payroll").await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::from_code("42000")));
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let (addr, _tm) = start_test_server().await;
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("slotbook")
        .user("slotbook")
        .password("nope");
    assert!(config.connect(NoTls).await.is_err());
}
