//! Fake timing engines for integration tests.
//!
//! Each peer is a POSIX `sh` script speaking the engine's line protocol:
//! it reports `sys[..], id: .., cycle: ..` followed by `Waiting` once at
//! start-up and once per input line, advancing its clock by 1us per round.
#![allow(dead_code)]

use servesim_core::link::PeerCommand;
use std::path::Path;

/// Reads the seed workload's `start_ns` from the `--workload-configuration=` argument.
const PREAMBLE: &str = r#"
seed=""
for arg in "$@"; do
  case "$arg" in
    --workload-configuration=*) seed=${arg#*=} ;;
  esac
done
cycle=0
if [ -n "$seed" ] && [ -f "$seed" ]; then
  cycle=$(sed -n 's/.*"start_ns": *\([0-9]*\).*/\1/p' "$seed")
fi
"#;

/// Single-unit engine. Reports the step id found in each workload file name.
pub const ECHO_PEER: &str = r#"
echo "engine ready"
echo "sys[0], id: 0, cycle: $cycle"
echo "Waiting"
last=0
while IFS= read -r line; do
  case "$line" in
    exit)
      echo "Checking Non-Exited Systems ..."
      exit 0
      ;;
    pass) ;;
    *)
      last=${line##*step}
      last=${last%.json}
      ;;
  esac
  cycle=$((cycle + 1000))
  echo "graph executed"
  echo "sys[0], id: $last, cycle: $cycle"
  echo "Waiting"
done
"#;

/// Like [`ECHO_PEER`] but fails its shutdown with exit status 1.
pub const FAILING_EXIT_PEER: &str = r#"
echo "sys[0], id: 0, cycle: $cycle"
echo "Waiting"
last=0
while IFS= read -r line; do
  case "$line" in
    exit)
      echo "Checking Non-Exited Systems ..."
      echo "boom" >&2
      exit 1
      ;;
    pass) ;;
    *)
      last=${line##*step}
      last=${last%.json}
      ;;
  esac
  cycle=$((cycle + 1000))
  echo "sys[0], id: $last, cycle: $cycle"
  echo "Waiting"
done
"#;

/// Never produces a completion line.
pub const NOISY_PEER: &str = r#"
echo "loading topology"
echo "Waiting"
while IFS= read -r line; do
  case "$line" in
    exit)
      echo "Checking Non-Exited Systems ..."
      exit 0
      ;;
  esac
  echo "still compiling"
  echo "Waiting"
done
"#;

/// Two execution units reporting in alternation. A workload is recorded
/// against the unit whose event it answers.
pub const TWO_UNIT_PEER: &str = r#"
cur=0
id0=0
id1=0
echo "sys[0], id: 0, cycle: $cycle"
echo "Waiting"
while IFS= read -r line; do
  case "$line" in
    exit)
      echo "Checking Non-Exited Systems ..."
      exit 0
      ;;
    pass) ;;
    *)
      nid=${line##*step}
      nid=${nid%.json}
      if [ "$cur" -eq 0 ]; then id0=$nid; else id1=$nid; fi
      ;;
  esac
  cur=$((1 - cur))
  if [ "$cur" -eq 0 ]; then id=$id0; else id=$id1; fi
  cycle=$((cycle + 1000))
  echo "sys[$cur], id: $id, cycle: $cycle"
  echo "Waiting"
done
"#;

/// Write `body` as a script under `dir` and return the command that runs it.
pub fn write_peer(dir: &Path, name: &str, body: &str) -> PeerCommand {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{PREAMBLE}\n{body}")).unwrap();
    PeerCommand::new("sh").arg(path.display().to_string())
}

/// Minimal run config against `peer`, with explicit per-unit memory.
pub fn config_toml(dir: &Path, peer: &PeerCommand, units: u32, max_batch: usize) -> String {
    format!(
        r#"
[simulation]
name = "it"
log_interval_sec = 0.000002
idle_poll_ms = 5
desync_tolerance = 3

[cluster]
npu_num = {units}
npu_group = {units}
capacity_blocks = 100
weight_blocks = 10
block_size = 8
max_batch = {max_batch}

[peer]
binary = "{program}"
args = ["{script}"]
workload_dir = "{workloads}"
"#,
        program = peer.program,
        script = peer.args[0],
        workloads = dir.join("workloads").display(),
    )
}
