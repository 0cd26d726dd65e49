/// Integration tests for admission, batching and the request partition.
use proptest::prelude::*;
use servesim_core::request::RequestState;
use servesim_core::scheduler::{Scheduler, SchedulerConfig};
use std::collections::HashSet;

fn scenario_scheduler() -> Scheduler {
    Scheduler::new(SchedulerConfig {
        capacity_blocks: 100,
        baseline_blocks: 10,
        block_size: 8,
        max_batch: Some(2),
        ..SchedulerConfig::default()
    })
}

/// Feed back every dispatched step at 1us intervals until nothing runs.
fn run_to_idle(scheduler: &mut Scheduler, mut now: u64) -> u64 {
    let mut step = 0;
    loop {
        match scheduler.schedule(now, 0, step) {
            Some(batch) => step = batch.step_id,
            None => return now,
        }
        now += 1_000;
        scheduler.record_completion(0, step, now);
    }
}

#[test]
fn test_oversized_request_waits_behind_capacity() {
    let mut s = scenario_scheduler();
    let a = s.admit("m", 8, 16, 0).unwrap();
    let b = s.admit("m", 8, 16, 0).unwrap();
    let c = s.admit("m", 800, 816, 0).unwrap();

    let batch = s.schedule(0, 0, 0).unwrap();
    let ids: Vec<u64> = batch.requests.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![a, b]);
    assert_eq!(s.status().memory_used, 12);
    assert_eq!(s.waiting_ids(), vec![c]);

    run_to_idle(&mut s, 0);

    let done: HashSet<u64> = s.done().iter().map(|r| r.id).collect();
    assert_eq!(done, HashSet::from([a, b]));
    // 100 blocks never fit in the 90 left after weights.
    assert_eq!(s.request(c).unwrap().state, RequestState::Waiting);
    assert_eq!(s.unservable_head(), Some(c));
    assert!(s.is_leak_free());
}

#[test]
fn test_unknown_event_is_ignored() {
    let mut s = scenario_scheduler();
    s.admit("m", 8, 16, 0).unwrap();
    let batch = s.schedule(0, 0, 0).unwrap();
    let before = s.request(0).unwrap().clone();

    let outcome = s.record_completion(0, batch.step_id + 100, 50);
    assert_eq!(outcome.prompt_tokens + outcome.generated_tokens, 0);
    assert_eq!(s.record_completion(9, batch.step_id, 50).finished, 0);
    assert!(s.schedule(50, 0, batch.step_id + 100).is_none());

    let after = s.request(0).unwrap();
    assert_eq!(after.generated, before.generated);
    assert_eq!(after.allocated_blocks, before.allocated_blocks);
    assert_eq!(after.state, RequestState::Running);
    assert_eq!(s.outstanding_step(0), Some(batch.step_id));
}

#[test]
fn test_continuous_batching_refills_freed_slots() {
    let mut s = scenario_scheduler();
    let short = s.admit("m", 8, 8, 0).unwrap();
    let long = s.admit("m", 8, 20, 0).unwrap();
    let late = s.admit("m", 8, 20, 0).unwrap();

    let first = s.schedule(0, 0, 0).unwrap();
    assert_eq!(first.requests.len(), 2);
    s.record_completion(0, first.step_id, 1_000);
    assert_eq!(s.done()[0].id, short);

    let second = s.schedule(1_000, 0, first.step_id).unwrap();
    let ids: Vec<u64> = second.requests.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![long, late]);
    assert_eq!(second.prompt_count(), 1);
}

#[test]
fn test_units_batch_independently() {
    let mut s = Scheduler::new(SchedulerConfig {
        units: 2,
        max_batch: Some(1),
        ..SchedulerConfig::default()
    });
    let a = s.admit("m", 8, 16, 0).unwrap();
    let b = s.admit("m", 8, 16, 0).unwrap();

    let on0 = s.schedule(0, 0, 0).unwrap();
    let on1 = s.schedule(0, 1, 0).unwrap();
    assert_eq!(on0.requests[0].id, a);
    assert_eq!(on1.requests[0].id, b);
    assert_ne!(on0.step_id, on1.step_id);
    assert_eq!(s.inflight_ids(1), vec![b]);
}

#[test]
fn test_drained_run_is_leak_free() {
    let mut s = Scheduler::new(SchedulerConfig {
        capacity_blocks: 20,
        baseline_blocks: 4,
        ..SchedulerConfig::default()
    });
    for i in 0..12 {
        s.admit("m", 10 + i, 40 + i, (i as u64) * 500).unwrap();
    }
    let mut now = 0;
    while !s.is_queue_empty() {
        now = run_to_idle(&mut s, now) + 1_000;
    }
    assert_eq!(s.done().len(), 12);
    assert!(s.is_leak_free());
    assert!(s.preemptions > 0);
    assert!(s.done().iter().all(|r| r.generated == r.output_len - r.input_len));
}

proptest! {
    #[test]
    fn prop_waiting_is_fifo(arrivals in proptest::collection::vec(0u64..1_000, 1..40)) {
        let mut s = scenario_scheduler();
        for &arrival in &arrivals {
            s.admit("m", 8, 16, arrival).unwrap();
        }
        let ids = s.waiting_ids();
        let keys: Vec<(u64, u64)> = ids
            .iter()
            .map(|&id| (s.request(id).unwrap().arrival_ns, id))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        prop_assert_eq!(keys, sorted);
    }

    #[test]
    fn prop_partition_holds_every_round(
        lengths in proptest::collection::vec((1u32..64, 0u32..48), 1..24),
        max_batch in 1usize..6,
        capacity in 12u64..40,
    ) {
        let mut s = Scheduler::new(SchedulerConfig {
            capacity_blocks: capacity,
            baseline_blocks: 2,
            block_size: 8,
            max_batch: Some(max_batch),
            ..SchedulerConfig::default()
        });
        let mut ids = Vec::new();
        for (i, &(input, extra)) in lengths.iter().enumerate() {
            ids.push(s.admit("m", input, input + extra, i as u64).unwrap());
        }

        let mut now = 0;
        let mut step = 0;
        for _ in 0..400 {
            now += 100;
            s.record_completion(0, step, now);
            if let Some(batch) = s.schedule(now, 0, step) {
                step = batch.step_id;
            }

            let waiting: HashSet<u64> = s.waiting_ids().into_iter().collect();
            let running: HashSet<u64> = s.inflight_ids(0).into_iter().collect();
            let done: HashSet<u64> = s.done().iter().map(|r| r.id).collect();
            prop_assert_eq!(waiting.len() + running.len() + done.len(), ids.len());
            for id in &ids {
                let homes = [waiting.contains(id), running.contains(id), done.contains(id)];
                prop_assert_eq!(homes.iter().filter(|&&h| h).count(), 1);
            }
            prop_assert!(running.len() <= max_batch);
            let status = s.status();
            prop_assert!(status.memory_used <= status.memory_total);
        }
    }
}
