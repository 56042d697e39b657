use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, FixedOffset, NaiveDate};
use ulid::Ulid;

use chairbook::clock::{ManualClock, local_instant};
use chairbook::engine::{Engine, EngineError, NewBooking, NewRule};
use chairbook::model::*;
use chairbook::outbound::{LogAuditSink, LogNotifier};
use chairbook::ports::Ports;
use chairbook::reminder::{ReminderConfig, ReminderScheduler};
use chairbook::store::MemoryStore;

const CHAIRS: usize = 50;
const DAYS: u64 = 7;
/// 00:00 through 23:00, one rule per weekday.
const SLOTS_PER_DAY: usize = 47;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn utc() -> FixedOffset {
    FixedOffset::east_opt(0).unwrap()
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 6).unwrap()
}

/// Start of slot `n` counted across every day of the horizon, beginning tomorrow.
fn slot_start(n: usize) -> Ms {
    let day = today() + Days::new(1 + (n / SLOTS_PER_DAY) as u64);
    let time = WallTime::from_minutes((n % SLOTS_PER_DAY) as u16 * SLOT_MINUTES).unwrap();
    local_instant(day, time, &utc())
}

struct Bench {
    store: Arc<MemoryStore>,
    ports: Ports,
    clock: Arc<ManualClock>,
    engine: Arc<Engine>,
    chairs: Vec<Ulid>,
}

async fn setup() -> Bench {
    let store = Arc::new(MemoryStore::new());
    let ports = Ports::from_store(store.clone(), Arc::new(LogAuditSink), Arc::new(LogNotifier));
    let clock = Arc::new(ManualClock::new(local_instant(today(), WallTime::MIDNIGHT, &utc())));
    let (engine, worker) = Engine::new(&ports, clock.clone(), utc());
    tokio::spawn(worker.run(tokio_util::sync::CancellationToken::new()));

    let mut chairs = Vec::with_capacity(CHAIRS);
    for _ in 0..CHAIRS {
        let id = Ulid::new();
        store
            .upsert_resource(Resource {
                id,
                name: None,
                status: ResourceStatus::Active,
            })
            .await
            .unwrap();
        for day in 0..7 {
            engine
                .create_availability_rule(NewRule {
                    resource_id: id,
                    day_of_week: day,
                    start_time: "00:00".into(),
                    end_time: "23:30".into(),
                    valid_from: None,
                    valid_to: None,
                })
                .await
                .unwrap();
        }
        chairs.push(id);
    }
    println!("  created {CHAIRS} chairs, {} rules", CHAIRS * 7);

    Bench {
        store,
        ports,
        clock,
        engine: Arc::new(engine),
        chairs,
    }
}

async fn new_user(store: &MemoryStore) -> Ulid {
    let id = Ulid::new();
    store
        .upsert_user(User {
            id,
            approval: ApprovalStatus::Approved,
        })
        .await
        .unwrap();
    id
}

async fn phase1_sequential(bench: &Bench) -> Vec<Booking> {
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let mut bookings = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let user_id = new_user(&bench.store).await;
        let req = NewBooking {
            user_id,
            resource_id: bench.chairs[i % CHAIRS],
            start_time: slot_start(i / CHAIRS),
            notes: None,
        };
        let t = Instant::now();
        bookings.push(bench.engine.create_booking(req).await.unwrap());
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("create latency", &mut latencies);
    bookings
}

/// Many users race for the same few slots; exactly one per slot may win.
async fn phase2_contended(bench: &Bench) {
    let n_tasks = 10;
    let n_per_task = 200;
    let hot_slots = 20;
    let wins = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let engine = bench.engine.clone();
        let store = bench.store.clone();
        let chair = bench.chairs[0];
        let wins = wins.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            for j in 0..n_per_task {
                let user_id = new_user(&store).await;
                // Past the slots phase 1 used on this chair.
                let start_time = slot_start(100 + j % hot_slots);
                match engine
                    .create_booking(NewBooking {
                        user_id,
                        resource_id: chair,
                        start_time,
                        notes: None,
                    })
                    .await
                {
                    Ok(_) => wins.fetch_add(1, Ordering::Relaxed),
                    Err(EngineError::Conflict(_)) => conflicts.fetch_add(1, Ordering::Relaxed),
                    Err(e) => panic!("unexpected error: {e}"),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let won = wins.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {n_per_task} attempts = {total} total in {:.2}s, {won} won, {} conflicts",
        elapsed.as_secs_f64(),
        conflicts.load(Ordering::Relaxed)
    );
    assert_eq!(won, hot_slots, "each hot slot must be won exactly once");
}

async fn phase3_slots_under_load(bench: &Bench) {
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let engine = bench.engine.clone();
        let store = bench.store.clone();
        let chair = bench.chairs[CHAIRS - 1 - w];
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let mut i = 0;
            while !stop.load(Ordering::Relaxed) && i < SLOTS_PER_DAY * DAYS as usize {
                let user_id = new_user(&store).await;
                let _ = engine
                    .create_booking(NewBooking {
                        user_id,
                        resource_id: chair,
                        start_time: slot_start(i),
                        notes: None,
                    })
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let engine = bench.engine.clone();
        let chair = bench.chairs[r % CHAIRS];
        reader_handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for k in 0..reads_per_reader {
                let date = today() + Days::new(1 + (k as u64 % DAYS));
                let t = Instant::now();
                engine.list_available_slots(chair, date).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }
    print_latency("slot listing", &mut all_latencies);
}

async fn phase4_reminder_pass(bench: &Bench, bookings: &[Booking]) {
    let tomorrow = today() + Days::new(1);
    let mut confirmed = 0;
    for b in bookings {
        if b.start() < local_instant(tomorrow + Days::new(1), WallTime::MIDNIGHT, &utc()) {
            bench.engine.confirm_presence(b.id).await.unwrap();
            confirmed += 1;
        }
    }

    let scheduler = ReminderScheduler::new(
        &bench.ports,
        bench.clock.clone(),
        ReminderConfig {
            hour: 18,
            tick: Duration::from_secs(3600),
            concurrency: 16,
            tz: utc(),
        },
    );
    let start = Instant::now();
    let report = scheduler.run_now().await.unwrap();
    println!(
        "  {confirmed} confirmed, {} found, {} sent, {} failed in {:.2}ms",
        report.found,
        report.sent,
        report.failed,
        start.elapsed().as_secs_f64() * 1000.0
    );
}

#[tokio::main]
async fn main() {
    println!("=== chairbook stress benchmark ===\n");

    println!("[setup]");
    let bench = setup().await;

    println!("\n[phase 1] sequential booking throughput");
    let bookings = phase1_sequential(&bench).await;

    println!("\n[phase 2] contended bookings");
    phase2_contended(&bench).await;

    println!("\n[phase 3] slot listing under write load");
    phase3_slots_under_load(&bench).await;

    println!("\n[phase 4] reminder pass");
    phase4_reminder_pass(&bench, &bookings).await;

    println!("\n  total bookings: {}", bench.store.booking_count());
    println!("\n=== benchmark complete ===");
}
