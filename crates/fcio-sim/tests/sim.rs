use fcio_buffers::Generation;
use fcio_core::{
    AbortOutcome, Cdb, CompletionResult, CompletionSink, DataDirection, Engine, EngineConfig,
    HostStatus, MemoryRegion, ScsiRequest, TargetParams,
};
use fcio_proto::PortId;
use fcio_sim::{FaultRates, SimConfig, SimRing, SimWorkers};
use futures::executor::block_on;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

fn port() -> PortId {
    PortId::new(0x020300).unwrap()
}

fn start(generation: Generation, faults: FaultRates) -> (Arc<Engine>, Arc<SimRing>, SimWorkers) {
    let ring = Arc::new(
        SimRing::new(SimConfig {
            min_latency_us: 10,
            max_latency_us: 100,
            faults,
            ..SimConfig::default()
        })
        .unwrap(),
    );
    let config = EngineConfig {
        generation,
        hba_queue_depth: 256,
        discovery_reserve: 16,
        devloss_timeout_ms: 500,
        ..EngineConfig::default()
    };
    let engine = Arc::new(Engine::new(config, ring.clone()).unwrap());
    let sink: Weak<dyn CompletionSink> = Arc::<Engine>::downgrade(&engine);
    assert!(ring.attach(sink));
    engine.add_target(port(), TargetParams::default());
    engine.add_lun(port(), 0).unwrap();
    let workers = ring.start().unwrap();
    (engine, ring, workers)
}

fn write(lba: u8) -> ScsiRequest {
    ScsiRequest::with_data(
        port(),
        0,
        Cdb::new(&[0x2a, 0, 0, 0, 0, lba, 0, 0, 8, 0]).unwrap(),
        DataDirection::ToDevice,
        vec![MemoryRegion::new(0x40_0000, 4096)],
    )
    .unwrap()
}

fn settle(engine: &Engine) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let pool = engine.pool_snapshot();
        if pool.in_use == 0 && pool.busy == 0 {
            return;
        }
        assert!(Instant::now() < deadline, "pool never settled: {pool:?}");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn clean_workload_completes_everything() {
    let (engine, ring, workers) = start(Generation::Modern, FaultRates::default());
    let tickets: Vec<_> = (0..16).map(|i| engine.dispatch(write(i)).unwrap()).collect();
    for ticket in tickets {
        let completion = block_on(ticket.completion).unwrap();
        assert!(completion.is_success(), "{completion:?}");
    }
    settle(&engine);
    let sim = ring.snapshot();
    assert_eq!(sim.submitted, 16);
    assert_eq!(sim.outstanding, 0);
    assert!(sim.registered > 0);
    drop(workers);
}

#[test]
fn exchange_busy_closes_are_confirmed() {
    let faults = FaultRates {
        exchange_busy: 1.0,
        ..FaultRates::default()
    };
    let (engine, ring, _workers) = start(Generation::Modern, faults);
    let before = engine.pool_snapshot();
    let tickets: Vec<_> = (0..8).map(|i| engine.dispatch(write(i)).unwrap()).collect();
    for ticket in tickets {
        assert!(block_on(ticket.completion).unwrap().is_success());
    }
    settle(&engine);
    assert_eq!(ring.snapshot().exchange_busy, 8);
    assert_eq!(engine.pool_snapshot().free, before.free);
}

#[test]
fn dropped_exchange_is_recovered_by_abort() {
    let faults = FaultRates {
        dropped: 1.0,
        ..FaultRates::default()
    };
    let (engine, ring, _workers) = start(Generation::Legacy, faults);
    let ticket = engine.dispatch(write(0)).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while ring.snapshot().dropped == 0 {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(engine.abort(ticket.handle).unwrap(), AbortOutcome::Aborted);
    let completion = block_on(ticket.completion).unwrap();
    assert_eq!(completion.result, CompletionResult::Timeout);
    assert_eq!(completion.host_status, HostStatus::Aborted);
    settle(&engine);
}

#[test]
fn queue_full_storm_keeps_depth_in_bounds() {
    let faults = FaultRates {
        queue_full: 0.5,
        ..FaultRates::default()
    };
    let (engine, _ring, _workers) = start(Generation::Modern, faults);
    let worker = engine.start_worker().unwrap();
    let lun = engine.target(port()).unwrap().lun(0);
    let mut completed = 0;
    for round in 0..8u8 {
        let tickets: Vec<_> = (0..4)
            .filter_map(|i| engine.dispatch(write(round * 4 + i)).ok())
            .collect();
        for ticket in tickets {
            block_on(ticket.completion).unwrap();
            completed += 1;
        }
        let depth = lun.depth();
        assert!((1..=lun.ceiling()).contains(&depth));
    }
    assert!(completed > 0);
    drop(worker);
    settle(&engine);
}

#[test]
fn offline_ring_rejects_submission() {
    let (engine, ring, _workers) = start(Generation::Modern, FaultRates::default());
    let before = engine.pool_snapshot();
    ring.set_link_up(false);
    assert!(engine.dispatch(write(0)).is_err());
    assert_eq!(engine.pool_snapshot(), before);
}
