use std::sync::Arc;
use std::time::{Duration, Instant};

use ulid::Ulid;

use allotter::cache::AvailabilityCache;
use allotter::config::SchedulerConfig;
use allotter::model::*;
use allotter::notify::NotifyHub;
use allotter::recurrence::{Period, PeriodicTimeSpec, TimeSpec};
use allotter::storage::MemoryStorage;
use allotter::worker::{Coordinator, ExecutionLock};

const HOUR: i64 = 3_600_000; // 1 hour in ms
const DAY: i64 = 24 * HOUR;
/// 2025-01-06T00:00:00Z, a Monday.
const EPOCH: i64 = 1_736_121_600_000;

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
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
    );
}

struct Setup {
    storage: Arc<MemoryStorage>,
    cache: Arc<AvailabilityCache>,
    rooms: Vec<Ulid>,
    space: Ulid,
}

async fn setup() -> Setup {
    let storage = Arc::new(MemoryStorage::new());
    let cache = Arc::new(AvailabilityCache::new());

    let capacities = [5, 5, 10, 10, 20, 20, 50, 50, 100, 100];
    let mut rooms = Vec::new();
    for &licenses in &capacities {
        let room = Resource::new(Ulid::new(), format!("mcu-{licenses}"))
            .with_technology(Technology::H323)
            .with_technology(Technology::Sip)
            .with_capability(Capability::RoomProviding {
                license_count: licenses,
            });
        rooms.push(room.id);
        cache.add_resource(room.clone()).await.unwrap();
        storage.save_resource(room).await.unwrap();
    }

    let space = Resource::new(Ulid::new(), "numbers").with_capability(Capability::ValueProviding {
        patterns: vec!["950{digit:4}".into()],
        allow_any_requested_value: false,
        scope: ValueScope::Shared,
    });
    let space_id = space.id;
    cache.add_resource(space.clone()).await.unwrap();
    storage.save_resource(space).await.unwrap();

    println!("  created {} rooms and 1 value-space", rooms.len());
    Setup {
        storage,
        cache,
        rooms,
        space: space_id,
    }
}

/// Weekly meetings spread over the working week, half rooms and half numbers.
async fn seed_requests(setup: &Setup, n: usize) {
    for i in 0..n {
        let weekday = (i % 5) as i64;
        let hour = 8 + (i % 9) as i64;
        let start = EPOCH + weekday * DAY + hour * HOUR;
        let specification = if i % 2 == 0 {
            Specification::Room {
                technologies: [Technology::H323].into(),
                license_count: 1 + (i % 4) as u32,
                provider: None,
            }
        } else {
            Specification::Value {
                provider: setup.space,
                value: None,
            }
        };
        let set = RequestSet {
            id: Ulid::new(),
            slots: vec![SlotSpec {
                start: TimeSpec::Periodic(PeriodicTimeSpec::new(start, Period::weeks(1))),
                duration: Period::hours(1),
            }],
            specification,
            created_at: EPOCH,
        };
        setup.storage.save_request_set(set).await.unwrap();
    }
    println!("  seeded {n} weekly request sets");
}

#[tokio::main]
async fn main() {
    let sets: usize = std::env::var("BENCH_SETS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(500);
    let cycles: usize = std::env::var("BENCH_CYCLES")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(50);

    println!("=== allotter scheduling benchmark ===");
    println!("sets: {sets}, cycles: {cycles}\n");

    println!("[setup]");
    let setup = setup().await;
    seed_requests(&setup, sets).await;

    let hub = Arc::new(NotifyHub::new());
    let coordinator = Coordinator::new(
        setup.storage.clone(),
        setup.cache.clone(),
        hub,
        ExecutionLock::new(),
        SchedulerConfig::default(),
    );

    println!("\n[phase 1] cold cycle");
    let start = Instant::now();
    let report = coordinator.run_cycle(EPOCH).await.unwrap();
    let elapsed = start.elapsed();
    println!(
        "  {} children, {} allocated, {} failed in {:.2}s",
        report.preprocess.created,
        report.schedule.allocated,
        report.schedule.failed,
        elapsed.as_secs_f64()
    );
    println!(
        "  {} reservations over {} rooms",
        setup.storage.reservation_count(),
        setup.rooms.len()
    );

    println!("\n[phase 2] steady-state cycles");
    let mut latencies = Vec::with_capacity(cycles);
    for i in 0..cycles {
        let now = EPOCH + (i as i64) * HOUR;
        let start = Instant::now();
        coordinator.run_cycle(now).await.unwrap();
        latencies.push(start.elapsed());
    }
    print_latency("run_cycle", &mut latencies);
    println!("  final request count: {}", setup.storage.request_count());
}
