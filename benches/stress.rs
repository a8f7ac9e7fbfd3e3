use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use ulid::Ulid;

use innkeep::clock::{Clock, SystemClock};
use innkeep::engine::Engine;
use innkeep::handler::{Handler, HandlerError};
use innkeep::throttle::StatusThrottle;
use innkeep::upcoming::UpcomingCache;

fn base_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2018, 1, 1).unwrap()
}

fn day(offset: u64) -> NaiveDate {
    base_date() + Days::new(offset)
}

fn open_handler() -> Arc<Handler> {
    let dir = std::env::temp_dir().join(format!("innkeep_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("innkeep.wal")).expect("open engine"));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    // Status churn is the point of phase 5; the throttle stays out of the way.
    let throttle = Arc::new(StatusThrottle::new(u32::MAX, Duration::from_secs(60)));
    let cache = UpcomingCache::spawn(engine.clone(), clock.clone(), 3);
    Arc::new(Handler::new(engine, throttle, cache, clock))
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

struct Hotel {
    guest: Ulid,
    rooms: Vec<Ulid>,
}

async fn setup(handler: &Handler, n_rooms: usize) -> Hotel {
    let guest = Ulid::new();
    handler
        .execute(&format!(
            "INSERT INTO guests (id, first_name, last_name) VALUES ('{guest}', 'Bench', 'Guest')"
        ))
        .await
        .unwrap();
    let mut rooms = Vec::with_capacity(n_rooms);
    for n in 0..n_rooms {
        let id = Ulid::new();
        handler
            .execute(&format!("INSERT INTO rooms (id, number) VALUES ('{id}', '{}')", 100 + n))
            .await
            .unwrap();
        rooms.push(id);
    }
    println!("  created 1 guest, {n_rooms} rooms");
    Hotel { guest, rooms }
}

async fn book(
    handler: &Handler,
    guest: Ulid,
    room: Ulid,
    arrival: NaiveDate,
    departure: NaiveDate,
) -> Result<Ulid, HandlerError> {
    let id = Ulid::new();
    handler
        .execute(&format!(
            "INSERT INTO reservations (id, guest_id, room_id, arrival, departure) \
             VALUES ('{id}', '{guest}', '{room}', '{arrival}', '{departure}')"
        ))
        .await?;
    Ok(id)
}

async fn phase1_sequential(handler: &Handler, hotel: &Hotel) {
    let room = hotel.rooms[0];
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n as u64 {
        let t = Instant::now();
        book(handler, hotel.guest, room, day(i), day(i + 1)).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(handler: &Arc<Handler>, hotel: &Hotel) {
    let n_tasks = 10;
    let n_per_task = 200u64;

    let start = Instant::now();
    let mut handles = Vec::new();
    for i in 0..n_tasks {
        let handler = handler.clone();
        let guest = hotel.guest;
        // Room 0 belongs to phase 1.
        let room = hotel.rooms[1 + i % (hotel.rooms.len() - 1)];
        let offset = (i / (hotel.rooms.len() - 1)) as u64 * n_per_task * 2;
        handles.push(tokio::spawn(async move {
            for j in 0..n_per_task {
                let arrival = day(offset + j * 2);
                book(&handler, guest, room, arrival, arrival + Days::new(2))
                    .await
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks as u64 * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(handler: &Arc<Handler>, hotel: &Hotel) {
    let writer = {
        let handler = handler.clone();
        let guest = hotel.guest;
        let room = *hotel.rooms.last().unwrap();
        tokio::spawn(async move {
            // Far enough out to miss every earlier phase.
            for i in 0..1000u64 {
                let arrival = day(4000 + i);
                book(&handler, guest, room, arrival, arrival + Days::new(1))
                    .await
                    .unwrap();
            }
        })
    };

    let room = hotel.rooms[0];
    let mut cache_reads = Vec::new();
    let mut queries = Vec::new();
    let mut i = 0u64;
    while !writer.is_finished() {
        let t = Instant::now();
        handler.execute("SELECT * FROM upcoming_reservations").await.unwrap();
        cache_reads.push(t.elapsed());

        let arrival = day(i % 1999);
        let t = Instant::now();
        handler
            .execute(&format!(
                "SELECT * FROM availability WHERE room_id = '{room}' \
                 AND arrival = '{arrival}' AND departure = '{}'",
                arrival + Days::new(1)
            ))
            .await
            .unwrap();
        queries.push(t.elapsed());
        i += 1;
    }
    writer.await.unwrap();
    print_latency("upcoming view read", &mut cache_reads);
    print_latency("availability query", &mut queries);
    println!("  cache stale: {}", handler.cache().is_stale());
}

async fn phase4_contention(handler: &Arc<Handler>, hotel: &Hotel) {
    let rounds = 50;
    let racers = 16;
    let room = hotel.rooms[1];
    let start = Instant::now();
    let mut winners = 0;
    let mut conflicts = 0;

    for round in 0..rounds as u64 {
        let arrival = day(6000 + round * 10);
        let mut handles = Vec::new();
        for r in 0..racers as u64 {
            let handler = handler.clone();
            let guest = hotel.guest;
            handles.push(tokio::spawn(async move {
                // Every racer's stay covers `arrival + 4`.
                let a = arrival + Days::new(r % 4);
                book(&handler, guest, room, a, arrival + Days::new(5 + r % 3)).await
            }));
        }
        let mut round_winners = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => round_winners += 1,
                Err(e) if e.code() == "23P01" => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(round_winners, 1, "exactly one booking per contested range");
        winners += round_winners;
    }

    let elapsed = start.elapsed();
    println!(
        "  {rounds} rounds x {racers} racers: {winners} booked, {conflicts} rejected in {:.2}s",
        elapsed.as_secs_f64()
    );
}

async fn phase5_lifecycle(handler: &Arc<Handler>, hotel: &Hotel) {
    let room = hotel.rooms[2];
    let n = 500u64;
    let mut ids = Vec::with_capacity(n as usize);
    for i in 0..n {
        let arrival = day(8000 + i);
        ids.push(book(handler, hotel.guest, room, arrival, arrival + Days::new(1)).await.unwrap());
    }

    let mut latencies = Vec::with_capacity(ids.len() * 2);
    let start = Instant::now();
    for status in ["checked_in", "checked_out"] {
        for id in &ids {
            let t = Instant::now();
            handler
                .execute(&format!("UPDATE reservations SET status = '{status}' WHERE id = '{id}'"))
                .await
                .unwrap();
            latencies.push(t.elapsed());
        }
    }
    let elapsed = start.elapsed();
    let total = latencies.len();
    println!(
        "  {total} status transitions in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
    print_latency("transition latency", &mut latencies);
}

async fn phase6_compaction(handler: &Handler) {
    let engine = handler.engine();
    let appends = engine.wal_appends_since_compact().await;
    let start = Instant::now();
    engine.compact_wal().await.unwrap();
    println!(
        "  compacted {appends} appends ({} reservations) in {:.2}ms",
        engine.reservation_count(),
        start.elapsed().as_secs_f64() * 1000.0
    );
}

#[tokio::main]
async fn main() {
    println!("=== innkeep stress benchmark ===\n");

    let handler = open_handler();

    println!("[setup]");
    let hotel = setup(&handler, 11).await;

    println!("\n[phase 1] sequential booking throughput");
    phase1_sequential(&handler, &hotel).await;

    println!("\n[phase 2] concurrent booking throughput");
    phase2_concurrent(&handler, &hotel).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&handler, &hotel).await;

    println!("\n[phase 4] double-booking contention");
    phase4_contention(&handler, &hotel).await;

    println!("\n[phase 5] check-in / check-out churn");
    phase5_lifecycle(&handler, &hotel).await;

    println!("\n[phase 6] WAL compaction");
    phase6_compaction(&handler).await;

    println!("\n=== benchmark complete ===");
}
