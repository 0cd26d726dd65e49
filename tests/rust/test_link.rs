//! Line-protocol tests against scripted timing engines.

mod common;

use common::{write_peer, ECHO_PEER, NOISY_PEER};
use servesim_core::link::{CompletionEvent, LinkError, RoundInput, SimulationLink};
use std::path::PathBuf;

#[test]
fn test_receive_parses_last_line_before_terminator() {
    let dir = tempfile::tempdir().unwrap();
    let peer = write_peer(
        dir.path(),
        "peer.sh",
        r#"
echo "sys[9], id: 1, cycle: 1"
echo "info: not the event"
echo "sys[1], id: 5, cycle: 42"
echo "Waiting"
read -r line
echo "Checking Non-Exited Systems ..."
"#,
    );
    let mut link = SimulationLink::spawn(&peer, 3).unwrap();
    let event = link.receive().unwrap();
    assert_eq!(
        event,
        Some(CompletionEvent {
            sys: 1,
            id: 5,
            clock_ns: 42
        })
    );
    assert_eq!(link.rounds(), 1);
    link.send(&RoundInput::Exit).unwrap();
    link.verify_shutdown().unwrap();
}

#[test]
fn test_workload_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let peer = write_peer(dir.path(), "peer.sh", ECHO_PEER);
    let mut link = SimulationLink::spawn(&peer, 3).unwrap();

    let first = link.receive().unwrap().unwrap();
    assert_eq!((first.sys, first.id, first.clock_ns), (0, 0, 0));

    let workload = PathBuf::from("/tmp/workloads/sys0_step7.json");
    link.send(&RoundInput::Workload(workload)).unwrap();
    let event = link.receive().unwrap().unwrap();
    assert_eq!((event.sys, event.id, event.clock_ns), (0, 7, 1000));

    link.send(&RoundInput::Pass).unwrap();
    let event = link.receive().unwrap().unwrap();
    assert_eq!((event.id, event.clock_ns), (7, 2000));

    link.send(&RoundInput::Exit).unwrap();
    link.verify_shutdown().unwrap();
    assert_eq!(link.rounds(), 3);
}

#[test]
fn test_eof_mid_round_is_peer_closed() {
    let dir = tempfile::tempdir().unwrap();
    let peer = write_peer(dir.path(), "peer.sh", "echo \"half a round\"\n");
    let mut link = SimulationLink::spawn(&peer, 3).unwrap();
    assert!(matches!(link.receive(), Err(LinkError::PeerClosed)));
}

#[test]
fn test_desync_after_tolerance() {
    let dir = tempfile::tempdir().unwrap();
    let peer = write_peer(dir.path(), "peer.sh", NOISY_PEER);
    let mut link = SimulationLink::spawn(&peer, 1).unwrap();

    assert_eq!(link.receive().unwrap(), None);
    link.send(&RoundInput::Pass).unwrap();
    match link.receive() {
        Err(LinkError::ProtocolDesync { misses }) => assert_eq!(misses, 2),
        other => panic!("expected desync, got {other:?}"),
    }
    link.send(&RoundInput::Exit).unwrap();
    link.verify_shutdown().unwrap();
}

#[test]
fn test_parsed_event_resets_miss_count() {
    let dir = tempfile::tempdir().unwrap();
    let peer = write_peer(
        dir.path(),
        "peer.sh",
        r#"
while true; do
  echo "noise"
  echo "Waiting"
  read -r line || exit 0
  echo "sys[0], id: 1, cycle: 10"
  echo "Waiting"
  read -r line || exit 0
done
"#,
    );
    let mut link = SimulationLink::spawn(&peer, 1).unwrap();
    for _ in 0..3 {
        assert_eq!(link.receive().unwrap(), None);
        link.send(&RoundInput::Pass).unwrap();
        assert!(link.receive().unwrap().is_some());
        link.send(&RoundInput::Pass).unwrap();
    }
}

#[test]
fn test_shutdown_failure_carries_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let peer = write_peer(
        dir.path(),
        "peer.sh",
        r#"
echo "sys[0], id: 0, cycle: 0"
echo "Waiting"
read -r line
echo "boom" >&2
exit 1
"#,
    );
    let mut link = SimulationLink::spawn(&peer, 3).unwrap();
    link.receive().unwrap();
    link.send(&RoundInput::Exit).unwrap();
    match link.verify_shutdown() {
        Err(LinkError::PeerShutdownFailure { status, stderr }) => {
            assert!(status.contains('1'), "status was {status}");
            assert!(stderr.contains("boom"), "stderr was {stderr}");
        }
        other => panic!("expected shutdown failure, got {other:?}"),
    }
}

#[test]
fn test_drop_kills_running_peer() {
    let dir = tempfile::tempdir().unwrap();
    let peer = write_peer(dir.path(), "peer.sh", "while true; do sleep 1; done\n");
    let link = SimulationLink::spawn(&peer, 3).unwrap();
    drop(link);
}
