use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use ulid::Ulid;

use innkeep::clock::{Clock, ManualClock};
use innkeep::engine::Engine;
use innkeep::handler::{Handler, HandlerError, Response};
use innkeep::throttle::StatusThrottle;
use innkeep::upcoming::UpcomingCache;

// ── Test infrastructure ──────────────────────────────────────

struct Desk {
    handler: Handler,
    clock: Arc<ManualClock>,
}

fn start() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2018-02-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn open_desk() -> Desk {
    let dir = std::env::temp_dir().join(format!("innkeep_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("innkeep.wal")).unwrap());
    let clock = Arc::new(ManualClock::new(start()));
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let throttle = Arc::new(StatusThrottle::new(1, Duration::from_secs(60)));
    let cache = UpcomingCache::spawn(engine.clone(), dyn_clock.clone(), 3);
    Desk {
        handler: Handler::new(engine, throttle, cache, dyn_clock),
        clock,
    }
}

impl Desk {
    async fn ok(&self, sql: &str) -> Response {
        match self.handler.execute(sql).await {
            Ok(r) => r,
            Err(e) => panic!("{sql}: {e}"),
        }
    }

    async fn err(&self, sql: &str) -> HandlerError {
        match self.handler.execute(sql).await {
            Ok(r) => panic!("{sql}: expected an error, got {r:?}"),
            Err(e) => e,
        }
    }

    async fn rows(&self, sql: &str) -> Vec<Value> {
        match self.ok(sql).await {
            Response::Rows(rows) => rows,
            other => panic!("{sql}: expected rows, got {other:?}"),
        }
    }

    async fn set_status(&self, id: Ulid, status: &str) -> Result<Response, HandlerError> {
        self.handler
            .execute(&format!("UPDATE reservations SET status = '{status}' WHERE id = '{id}'"))
            .await
    }

    async fn fresh_upcoming(&self) -> Vec<Value> {
        let seq = self.handler.engine().commit_seq();
        tokio::time::timeout(Duration::from_secs(5), self.handler.cache().wait_fresh(seq))
            .await
            .unwrap();
        self.rows("SELECT * FROM upcoming_reservations").await
    }
}

async fn seed(desk: &Desk) -> (Ulid, Ulid) {
    let guest = Ulid::new();
    let room = Ulid::new();
    desk.ok(&format!(
        "INSERT INTO guests (id, first_name, last_name) VALUES ('{guest}', 'Ada', 'Lovelace')"
    ))
    .await;
    desk.ok(&format!("INSERT INTO rooms (id, number) VALUES ('{room}', 101)"))
        .await;
    (guest, room)
}

async fn book(desk: &Desk, guest: Ulid, room: Ulid, arrival: &str, departure: &str) -> Result<Ulid, HandlerError> {
    let id = Ulid::new();
    desk.handler
        .execute(&format!(
            "INSERT INTO reservations (id, guest_id, room_id, arrival, departure) \
             VALUES ('{id}', '{guest}', '{room}', '{arrival}', '{departure}')"
        ))
        .await?;
    Ok(id)
}

// ── Scenarios ────────────────────────────────────────────────

#[tokio::test]
async fn front_desk_walkthrough() {
    let desk = open_desk();
    let (guest, room) = seed(&desk).await;

    let x = book(&desk, guest, room, "2018-02-01", "2018-02-10").await.unwrap();
    let y = book(&desk, guest, room, "2018-02-10", "2018-02-20").await.unwrap();
    let z = book(&desk, guest, room, "2018-02-01", "2018-02-02").await.unwrap_err();
    assert_eq!(z.code(), "23P01");
    assert!(z.to_string().contains(&x.to_string()));

    assert_eq!(
        desk.set_status(x, "checked_in").await.unwrap(),
        Response::Execution { tag: "UPDATE", rows: 1 }
    );

    // A second status change inside the window is throttled.
    let limited = desk.set_status(x, "checked_out").await.unwrap_err();
    assert_eq!(limited.code(), "53400");
    assert_eq!(limited.to_json()["retry_after_ms"], 60_000);

    desk.clock.advance(Duration::from_secs(61));
    desk.set_status(x, "checked_out").await.unwrap();

    desk.clock.advance(Duration::from_secs(61));
    let back = desk.set_status(x, "pending").await.unwrap_err();
    assert_eq!(back.code(), "P0001");

    let rows = desk
        .rows(&format!("SELECT * FROM reservations WHERE id = '{x}'"))
        .await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["status"], "checked_out");
    assert!(rows[0]["checkin_at"].is_string());
    assert!(rows[0]["checkout_at"].is_string());

    let rows = desk
        .rows(&format!("SELECT * FROM reservations WHERE id = '{y}'"))
        .await;
    assert_eq!(rows[0]["status"], "pending");
    assert_eq!(rows[0]["checkin_at"], Value::Null);
}

#[tokio::test]
async fn upcoming_view_follows_writes() {
    let desk = open_desk();
    let (guest, room) = seed(&desk).await;
    let x = book(&desk, guest, room, "2018-02-01", "2018-02-10").await.unwrap();
    book(&desk, guest, room, "2018-02-10", "2018-02-20").await.unwrap();

    let rows = desk.fresh_upcoming().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["reservation_id"], x.to_string());
    assert_eq!(rows[0]["room_number"], "101");
    assert_eq!(rows[0]["last_name"], "Lovelace");
    assert_eq!(rows[0]["status"], "pending");

    desk.set_status(x, "checked_in").await.unwrap();
    let rows = desk.fresh_upcoming().await;
    assert_eq!(rows[0]["status"], "checked_in");

    desk.ok(&format!("UPDATE rooms SET number = '12B' WHERE id = '{room}'"))
        .await;
    let rows = desk.fresh_upcoming().await;
    assert_eq!(rows[0]["room_number"], "12B");
}

#[tokio::test]
async fn non_status_updates_are_not_throttled() {
    let desk = open_desk();
    let (guest, room) = seed(&desk).await;
    let x = book(&desk, guest, room, "2018-02-01", "2018-02-10").await.unwrap();
    desk.set_status(x, "checked_in").await.unwrap();

    let other = Ulid::new();
    desk.ok(&format!("INSERT INTO rooms (id, number) VALUES ('{other}', '102')"))
        .await;
    for target in [other, room, other] {
        desk.ok(&format!("UPDATE reservations SET room_id = '{target}' WHERE id = '{x}'"))
            .await;
    }
    let rows = desk
        .rows(&format!("SELECT * FROM reservations WHERE room_id = '{other}'"))
        .await;
    assert_eq!(rows.len(), 1);

    // Other reservations have their own window.
    let y = book(&desk, guest, room, "2018-03-01", "2018-03-02").await.unwrap();
    desk.set_status(y, "checked_in").await.unwrap();
}

#[tokio::test]
async fn availability_query() {
    let desk = open_desk();
    let (guest, room) = seed(&desk).await;
    let x = book(&desk, guest, room, "2018-02-01", "2018-02-10").await.unwrap();

    let availability_sql = |arrival: &str, departure: &str, exclude: Option<Ulid>| {
        let mut sql = format!(
            "SELECT * FROM availability WHERE room_id = '{room}' \
             AND arrival = '{arrival}' AND departure = '{departure}'"
        );
        if let Some(id) = exclude {
            sql.push_str(&format!(" AND reservation_id = '{id}'"));
        }
        sql
    };

    let rows = desk.rows(&availability_sql("2018-02-05", "2018-02-12", None)).await;
    assert_eq!(rows[0]["available"], false);
    assert_eq!(rows[0]["conflicting_reservation_id"], x.to_string());

    let rows = desk.rows(&availability_sql("2018-02-10", "2018-02-12", None)).await;
    assert_eq!(rows[0]["available"], true);
    assert_eq!(rows[0]["conflicting_reservation_id"], Value::Null);

    let rows = desk.rows(&availability_sql("2018-02-05", "2018-02-12", Some(x))).await;
    assert_eq!(rows[0]["available"], true);

    let inverted = desk.err(&availability_sql("2018-02-12", "2018-02-05", None)).await;
    assert_eq!(inverted.code(), "23514");
}

#[tokio::test]
async fn error_codes_reach_the_client() {
    let desk = open_desk();
    let (guest, room) = seed(&desk).await;

    assert_eq!(desk.err("SELEKT * FROM rooms").await.code(), "42601");
    assert_eq!(desk.err("DELETE FROM rooms").await.code(), "42601");
    assert_eq!(
        desk.err(&format!("INSERT INTO rooms (id, number) VALUES ('{}', 101)", Ulid::new()))
            .await
            .code(),
        "23505"
    );
    assert_eq!(
        desk.err(&format!("INSERT INTO guests (id, first_name) VALUES ('{guest}', 'Bob')"))
            .await
            .code(),
        "23505"
    );
    let missing = Ulid::new();
    // Unknown ids are not found, however often they are retried.
    for _ in 0..3 {
        assert_eq!(desk.set_status(missing, "checked_in").await.unwrap_err().code(), "02000");
    }
    assert_eq!(
        book(&desk, missing, room, "2018-02-01", "2018-02-02").await.unwrap_err().code(),
        "02000"
    );
    assert_eq!(
        book(&desk, guest, room, "2018-02-05", "2018-02-01").await.unwrap_err().code(),
        "23514"
    );

    let x = book(&desk, guest, room, "2018-02-01", "2018-02-05").await.unwrap();
    let moved = desk
        .err(&format!("UPDATE reservations SET departure = '2018-02-06' WHERE id = '{x}'"))
        .await;
    assert_eq!(moved.code(), "23514");
    assert_eq!(desk.set_status(x, "checked_out").await.unwrap_err().code(), "P0001");

    let body = moved.to_json();
    assert_eq!(body["code"], "23514");
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn missing_rows_select_empty() {
    let desk = open_desk();
    seed(&desk).await;
    let rows = desk
        .rows(&format!("SELECT * FROM guests WHERE id = '{}'", Ulid::new()))
        .await;
    assert!(rows.is_empty());
    assert_eq!(desk.rows("SELECT * FROM rooms").await.len(), 1);
    assert!(desk.rows("SELECT * FROM reservations").await.is_empty());
}
