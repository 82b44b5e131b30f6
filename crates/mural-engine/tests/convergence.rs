//! Multi-session convergence tests.
//!
//! Two or more engines share one in-memory store and bus, exactly the
//! topology the simulator wires up. These tests drive the sync loop both
//! manually (deterministic interleavings) and through the async runtime.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mural_engine::{
    CellColor, ChangeBus, ChargePolicy, Engine, EngineConfig, GridStore, MemoryBus, MemoryStore,
    Owner, SyncRuntime,
};
use mural_grid::Cell;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::broadcast::error::TryRecvError;

fn shared_world() -> (Arc<MemoryStore>, Arc<MemoryBus>) {
    let bus = Arc::new(MemoryBus::default());
    let store = Arc::new(MemoryStore::with_bus(Arc::clone(&bus)));
    (store, bus)
}

fn session(
    id: &str,
    store: &Arc<MemoryStore>,
    bus: &Arc<MemoryBus>,
    config: EngineConfig,
) -> Engine {
    Engine::new(
        config,
        Owner::new(id, id),
        Arc::clone(store) as Arc<dyn GridStore>,
        Arc::clone(bus) as Arc<dyn ChangeBus>,
    )
}

fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_flush_delay(Duration::from_millis(10))
        .with_charge_policy(ChargePolicy::Unlimited)
}

/// Drain every queued bus event into an engine.
fn pump(engine: &mut Engine, rx: &mut tokio::sync::broadcast::Receiver<mural_engine::ChangeEvent>) {
    loop {
        match rx.try_recv() {
            Ok(event) => {
                engine.handle_remote_event(&event);
            }
            Err(TryRecvError::Empty) => break,
            Err(other) => panic!("bus receiver failed: {other}"),
        }
    }
}

fn flush(engine: &mut Engine) {
    engine.poll_flush(Instant::now() + Duration::from_secs(1));
}

fn paint_of(engine: &Engine, cell: Cell) -> Option<CellColor> {
    engine.cell(&cell).map(|r| r.color)
}

#[tokio::test]
async fn edits_propagate_between_sessions() {
    let (store, bus) = shared_world();
    let mut alice = session("alice", &store, &bus, fast_config());
    let mut bob = session("bob", &store, &bus, fast_config());
    let mut alice_rx = alice.subscribe();
    let mut bob_rx = bob.subscribe();

    let red = CellColor::Rgb(255, 0, 0);
    assert!(alice.paint(Cell::new(10, 10), red));
    flush(&mut alice);

    pump(&mut bob, &mut bob_rx);
    pump(&mut alice, &mut alice_rx);

    assert_eq!(paint_of(&bob, Cell::new(10, 10)), Some(red));
    // Alice's own echo changed nothing.
    assert_eq!(paint_of(&alice, Cell::new(10, 10)), Some(red));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn concurrent_edits_converge_to_the_last_writer() {
    let (store, bus) = shared_world();
    let mut alice = session("alice", &store, &bus, fast_config());
    let mut bob = session("bob", &store, &bus, fast_config());
    let mut alice_rx = alice.subscribe();
    let mut bob_rx = bob.subscribe();

    let cell = Cell::new(5, 5);
    assert!(alice.paint(cell, CellColor::Rgb(1, 1, 1)));
    // Ensure bob's write carries a strictly later timestamp.
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(bob.paint(cell, CellColor::Rgb(2, 2, 2)));

    // Flush in both orders relative to event delivery.
    flush(&mut alice);
    pump(&mut bob, &mut bob_rx);
    flush(&mut bob);
    pump(&mut alice, &mut alice_rx);
    pump(&mut bob, &mut bob_rx);

    assert_eq!(paint_of(&alice, cell), Some(CellColor::Rgb(2, 2, 2)));
    assert_eq!(paint_of(&bob, cell), Some(CellColor::Rgb(2, 2, 2)));
}

#[tokio::test]
async fn confirmed_erase_propagates_to_peers() {
    let (store, bus) = shared_world();
    let mut alice = session("alice", &store, &bus, fast_config());
    let mut bob = session("bob", &store, &bus, fast_config());
    let mut alice_rx = alice.subscribe();
    let mut bob_rx = bob.subscribe();

    let red = CellColor::Rgb(255, 0, 0);
    let cell = Cell::new(7, 3);
    assert!(alice.paint(cell, red));
    flush(&mut alice);
    pump(&mut alice, &mut alice_rx);
    pump(&mut bob, &mut bob_rx);
    assert_eq!(paint_of(&bob, cell), Some(red));

    // The delete event is stamped with the erase's version, so bob's
    // copy of the paint loses the merge instead of shrugging it off as
    // a replay.
    assert!(alice.erase(cell));
    flush(&mut alice);
    pump(&mut alice, &mut alice_rx);
    pump(&mut bob, &mut bob_rx);

    assert_eq!(paint_of(&alice, cell), Some(CellColor::Erased));
    assert_eq!(paint_of(&bob, cell), Some(CellColor::Erased));

    // A late joiner resyncs the tombstone from the store as well.
    let mut carol = session("carol", &store, &bus, fast_config());
    carol.handle_connected().unwrap();
    assert_eq!(paint_of(&carol, cell), Some(CellColor::Erased));
}

#[tokio::test]
async fn foreign_erase_is_a_no_op_everywhere() {
    let (store, bus) = shared_world();
    let mut alice = session("alice", &store, &bus, fast_config());
    let mut bob = session("bob", &store, &bus, fast_config());
    let mut alice_rx = alice.subscribe();
    let mut bob_rx = bob.subscribe();

    let red = CellColor::Rgb(255, 0, 0);
    let cell = Cell::new(4, 9);
    assert!(alice.paint(cell, red));
    flush(&mut alice);
    pump(&mut alice, &mut alice_rx);
    pump(&mut bob, &mut bob_rx);

    // Bob cannot erase alice's paint; nothing changes anywhere.
    assert!(!bob.erase(cell));
    flush(&mut bob);
    pump(&mut alice, &mut alice_rx);
    pump(&mut bob, &mut bob_rx);

    assert_eq!(paint_of(&alice, cell), Some(red));
    assert_eq!(paint_of(&bob, cell), Some(red));
    assert_eq!(store.query(None).unwrap()[0].color.as_deref(), Some("#FF0000"));
}

#[tokio::test]
async fn random_interleavings_always_converge() {
    for seed in 0..5u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let (store, bus) = shared_world();
        let mut alice = session("alice", &store, &bus, fast_config());
        let mut bob = session("bob", &store, &bus, fast_config());
        let mut alice_rx = alice.subscribe();
        let mut bob_rx = bob.subscribe();

        for round in 0..40 {
            let cell = Cell::new(rng.gen_range(0..6), rng.gen_range(0..6));
            let color = CellColor::Rgb(rng.gen(), rng.gen(), rng.gen());
            let actor = if rng.gen_bool(0.5) { &mut alice } else { &mut bob };
            // Erase attempts on cells the actor does not own are denied
            // or rolled back, so they are safe to mix in blindly.
            if rng.gen_bool(0.25) {
                actor.erase(cell);
            } else {
                actor.paint(cell, color);
            }

            // Irregular flush/delivery cadence.
            if rng.gen_bool(0.4) {
                flush(&mut alice);
            }
            if rng.gen_bool(0.4) {
                flush(&mut bob);
            }
            if round % 3 == 0 {
                pump(&mut alice, &mut alice_rx);
            }
            if round % 4 == 0 {
                pump(&mut bob, &mut bob_rx);
            }
        }

        // Settle: flush everything, deliver everything.
        flush(&mut alice);
        flush(&mut bob);
        pump(&mut alice, &mut alice_rx);
        pump(&mut bob, &mut bob_rx);

        for row in store.query(None).unwrap() {
            let cell = row.cell();
            assert_eq!(
                paint_of(&alice, cell),
                paint_of(&bob, cell),
                "diverged at {cell} (seed={seed})"
            );
        }
    }
}

#[tokio::test]
async fn late_joiner_resyncs_from_the_store() {
    let (store, bus) = shared_world();
    let mut alice = session("alice", &store, &bus, fast_config());

    let teal = CellColor::Rgb(0, 128, 128);
    for x in 0..5 {
        alice.paint(Cell::new(x, 0), teal);
    }
    flush(&mut alice);

    // Carol subscribes after the fact; the bus replays nothing, the
    // mandatory resync on connect recovers the state.
    let mut carol = session("carol", &store, &bus, fast_config());
    let applied = carol.handle_connected().unwrap();
    assert_eq!(applied, 5);
    for x in 0..5 {
        assert_eq!(paint_of(&carol, Cell::new(x, 0)), Some(teal));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runtime_driven_sessions_converge() {
    let (store, bus) = shared_world();
    let alice = Arc::new(tokio::sync::Mutex::new(session(
        "alice",
        &store,
        &bus,
        fast_config(),
    )));
    let bob = Arc::new(tokio::sync::Mutex::new(session(
        "bob",
        &store,
        &bus,
        fast_config(),
    )));

    let alice_task = tokio::spawn(
        SyncRuntime::new(Arc::clone(&alice))
            .with_flush_tick(Duration::from_millis(5))
            .run(),
    );
    let bob_task = tokio::spawn(
        SyncRuntime::new(Arc::clone(&bob))
            .with_flush_tick(Duration::from_millis(5))
            .run(),
    );

    let gold = CellColor::Rgb(255, 215, 0);
    {
        let mut alice = alice.lock().await;
        alice.stroke_to(Cell::new(0, 0), gold);
        alice.stroke_to(Cell::new(3, 1), gold);
        alice.end_stroke();
    }

    // Give the runtimes a few flush/delivery cycles.
    tokio::time::sleep(Duration::from_millis(300)).await;

    {
        let bob = bob.lock().await;
        for cell in [
            Cell::new(0, 0),
            Cell::new(1, 0),
            Cell::new(2, 1),
            Cell::new(3, 1),
        ] {
            assert_eq!(
                bob.cell(&cell).map(|r| r.color),
                Some(gold),
                "bob missing {cell}"
            );
        }
    }
    assert_eq!(store.len(), 4);

    alice_task.abort();
    bob_task.abort();
}
