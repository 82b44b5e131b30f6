//! Mural convergence simulator
//!
//! Wires two painting sessions to one shared in-memory store and change
//! bus, drives both sync runtimes, and reports whether their caches
//! converged. A quick end-to-end smoke run of the whole engine stack.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use mural_engine::{
    CellColor, ChangeBus, ChargePolicy, Engine, EngineConfig, GridStore, MemoryBus, MemoryStore,
    Owner, SyncRuntime,
};
use mural_grid::Cell;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args: Vec<String> = env::args().collect();
    let strokes: u32 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(25);

    let bus = Arc::new(MemoryBus::default());
    let store = Arc::new(MemoryStore::with_bus(Arc::clone(&bus)));

    let config = EngineConfig::default()
        .with_flush_delay(Duration::from_millis(80))
        .with_charge_policy(ChargePolicy::Unlimited);

    let alice = new_session("alice", &store, &bus, config.clone());
    let bob = new_session("bob", &store, &bus, config);

    let runtimes = [
        tokio::spawn(SyncRuntime::new(Arc::clone(&alice)).run()),
        tokio::spawn(SyncRuntime::new(Arc::clone(&bob)).run()),
    ];

    info!(strokes, "Painting from both sessions");
    for i in 0..strokes {
        {
            let mut alice = alice.lock().await;
            alice.stroke_to(Cell::new(i, i / 2), CellColor::Rgb(255, 69, 0));
        }
        {
            let mut bob = bob.lock().await;
            bob.stroke_to(Cell::new(i, 40 - i / 2), CellColor::Rgb(0, 128, 255));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    alice.lock().await.end_stroke();
    bob.lock().await.end_stroke();

    // Broadcasts ride the same bus but never touch cell state.
    alice
        .lock()
        .await
        .broadcast(serde_json::json!({ "status": "strokes_done" }));

    // Let the flush and delivery cycles settle.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let stored = store.len();
    let (alice_cells, bob_cells) = (alice.lock().await, bob.lock().await);
    let diverged = count_divergence(&alice_cells, &bob_cells, &store);

    println!("Mural convergence simulation");
    println!("============================");
    println!("  Stored rows:    {stored}");
    println!("  Alice cache:    {} cells", alice_cells.cache_len());
    println!("  Bob cache:      {} cells", bob_cells.cache_len());
    println!("  Diverged cells: {diverged}");

    for runtime in runtimes {
        runtime.abort();
    }

    if diverged > 0 {
        std::process::exit(1);
    }
}

fn new_session(
    id: &str,
    store: &Arc<MemoryStore>,
    bus: &Arc<MemoryBus>,
    config: EngineConfig,
) -> Arc<Mutex<Engine>> {
    Arc::new(Mutex::new(Engine::new(
        config,
        Owner::new(id, id),
        Arc::clone(store) as Arc<dyn GridStore>,
        Arc::clone(bus) as Arc<dyn ChangeBus>,
    )))
}

fn count_divergence(alice: &Engine, bob: &Engine, store: &MemoryStore) -> usize {
    store
        .query(None)
        .map(|rows| {
            rows.into_iter()
                .filter(|row| {
                    let cell = row.cell();
                    alice.cell(&cell).map(|r| &r.color) != bob.cell(&cell).map(|r| &r.color)
                })
                .count()
        })
        .unwrap_or(usize::MAX)
}
