//! Dataset loading, request injection and the completed-request log.

use servesim_core::config::SimConfig;
use servesim_core::ingest::RequestApi;
use servesim_core::request::CompletedRequest;
use servesim_core::scheduler::{Scheduler, SchedulerConfig};
use servesim_core::trace::{self, SyntheticSpec};
use std::path::Path;
use std::sync::Arc;

fn config_with_trace(trace: &str) -> SimConfig {
    SimConfig::from_str(&format!(
        r#"
[model]
name = "gpt3-6.7b"

[cluster]
capacity_blocks = 1000
weight_blocks = 100

[peer]
binary = "engine"

{trace}
"#
    ))
    .unwrap()
}

fn write(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_tsv_dataset_with_poisson_arrivals() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(
        dir.path(),
        "share.tsv",
        "input_toks\toutput_toks\n100\t20\n200\t40\n300\t60\n400\t80\n",
    );
    let config = config_with_trace(&format!(
        "[trace]\nformat = \"tsv\"\npath = \"{}\"\nreq_num = 3\nrate = 10.0\n",
        path.display()
    ));

    let requests = servesim_core::load_requests(&config, None).unwrap();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].input_len, 100);
    assert_eq!(requests[0].output_len, 120);
    assert_eq!(requests[2].output_len, 360);
    assert!(requests[0].arrival_ns > 0);
    assert!(requests.windows(2).all(|w| w[0].arrival_ns < w[1].arrival_ns));
    assert!(requests.iter().all(|r| r.model == "gpt3-6.7b"));
}

#[test]
fn test_poisson_arrivals_are_seeded() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(
        dir.path(),
        "share.tsv",
        "input_toks\toutput_toks\n10\t1\n10\t1\n10\t1\n",
    );
    let config = config_with_trace(&format!(
        "[trace]\nformat = \"tsv\"\npath = \"{}\"\nrate = 2.0\n",
        path.display()
    ));
    let first = servesim_core::load_requests(&config, None).unwrap();
    let second = servesim_core::load_requests(&config, None).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_dataset_override_beats_config_path() {
    let dir = tempfile::tempdir().unwrap();
    let configured = write(
        dir.path(),
        "configured.jsonl",
        "{\"input_toks\": 1, \"output_toks\": 1}\n",
    );
    let override_path = write(
        dir.path(),
        "override.jsonl",
        "{\"input_toks\": 64, \"output_toks\": 8, \"arrival_time_ns\": 500, \"model\": \"llama-7b\"}\n\
         {\"input_toks\": 32, \"output_toks\": 4, \"arrival_time_ns\": 100}\n",
    );
    let config = config_with_trace(&format!(
        "[trace]\nformat = \"jsonl\"\npath = \"{}\"\n",
        configured.display()
    ));

    let requests = servesim_core::load_requests(&config, Some(&override_path)).unwrap();
    assert_eq!(requests.len(), 2);
    // Sorted by arrival.
    assert_eq!(requests[0].arrival_ns, 100);
    assert_eq!(requests[0].model, "gpt3-6.7b");
    assert_eq!(requests[1].model, "llama-7b");
    assert_eq!(requests[1].output_len, 72);
}

#[test]
fn test_default_batch_without_dataset() {
    let config = config_with_trace("");
    let requests = servesim_core::load_requests(&config, None).unwrap();
    assert_eq!(requests.len(), 16);
    assert!(requests
        .iter()
        .all(|r| r.input_len == 128 && r.output_len == 129 && r.arrival_ns == 0));
}

#[test]
fn test_malformed_tsv_row_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "bad.tsv", "input_toks\toutput_toks\n12\tabc\n");
    let result = trace::load_trace(&path, "tsv");
    assert!(matches!(
        result,
        Err(trace::TraceError::TsvParse { line: 2, .. })
    ));
}

#[test]
fn test_generated_trace_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("synthetic.jsonl");
    let records = trace::generate_synthetic(&SyntheticSpec {
        count: 25,
        rate: Some(5.0),
        input_mean: 128.0,
        input_std: 32.0,
        output_mean: 64.0,
        output_std: 16.0,
        seed: 7,
    });
    trace::write_jsonl(&records, &path).unwrap();

    let loaded = trace::load_trace(&path, "jsonl").unwrap();
    assert_eq!(loaded, records);
    assert!(loaded.iter().all(|r| r.input_toks >= 96 && r.input_toks <= 160));
}

#[test]
fn test_injected_requests_reach_the_scheduler() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(
        dir.path(),
        "inject.json",
        r#"[
  {"model": "gpt3-6.7b", "input_length": 16, "output_length": 32, "arrival_time": 0},
  {"model": "gpt3-6.7b", "input_length": 8, "output_length": 9, "arrival_time": 0}
]"#,
    );
    let config = config_with_trace("");
    let scheduler = Arc::new(parking_lot::Mutex::new(Scheduler::new(
        config.scheduler_config().unwrap(),
    )));
    let api = RequestApi::new(Arc::clone(&scheduler));

    let ids = api.load_requests_from_file(&path).unwrap();
    assert_eq!(ids, vec![0, 1]);
    let status = api.status();
    assert_eq!(status.pending_requests, 2);
    assert_eq!(status.memory_total, 1000);
    assert_eq!(status.memory_available, 900);
    assert_eq!(scheduler.lock().waiting_ids(), vec![0, 1]);
}

#[test]
fn test_request_log_lines_match_done_log() {
    let mut scheduler = Scheduler::new(SchedulerConfig::default());
    scheduler.admit("gpt3-6.7b", 8, 9, 0).unwrap();
    scheduler.admit("gpt3-6.7b", 4, 5, 0).unwrap();
    let batch = scheduler.schedule(0, 0, 0).unwrap();
    assert!(scheduler.schedule(1_000, 0, batch.step_id).is_none());
    assert_eq!(scheduler.done().len(), 2);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("requests.jsonl");
    trace::write_request_log(scheduler.done(), &path).unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    let logged: Vec<CompletedRequest> = content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(logged.len(), 2);
    for (entry, done) in logged.iter().zip(scheduler.done()) {
        assert_eq!(entry.id, done.id);
        assert_eq!(entry.end_ns, 1_000);
        assert_eq!(entry.latency_ns(), 1_000);
    }
}
