mod common;

use std::time::Duration;

use common::{addr, fast_config, init_logs, Room};
use luxnet_core::protocol::kind;
use luxnet_core::{compose, CalibrationState, Config, ConsoleError, Field, Reply, Stage};

const STEP: Duration = Duration::from_millis(2);

fn three_desks() -> Room {
    let coupling = vec![
        vec![60.0, 12.0, 3.0],
        vec![10.0, 55.0, 9.0],
        vec![2.0, 14.0, 70.0],
    ];
    Room::new(&[1, 2, 3], coupling, 5.0, fast_config())
}

#[test]
fn three_nodes_boot_and_calibrate_in_turn() {
    init_logs();
    let mut room = three_desks();

    let booted = room.run_until(STEP, Duration::from_secs(1), |r| {
        r.nodes.iter().all(|n| n.stage() != Stage::Booting)
    });
    assert!(booted);
    for node in &room.nodes {
        assert_eq!(node.peers().to_vec(), vec![addr(1), addr(2), addr(3)]);
    }

    let mut max_active = 0;
    let deadline = room.now + Duration::from_secs(5);
    while room.now < deadline && !room.nodes.iter().all(|n| n.is_running()) {
        room.round(STEP);
        let active = room
            .nodes
            .iter()
            .filter_map(|n| n.calibration())
            .filter(|c| c.state() != CalibrationState::Idle)
            .count();
        assert!(active <= 1, "two nodes outside Idle at once");
        max_active = max_active.max(active);
    }
    assert_eq!(max_active, 1);

    for (i, node) in room.nodes.iter().enumerate() {
        assert!(node.is_running(), "node {} still {:?}", i + 1, node.stage());
        assert!(node.calibration().unwrap().is_complete());
        let row = node.gains().expect("gains applied");
        for (j, expected) in room.coupling[i].iter().enumerate() {
            let got = row.gain_for(addr(j as u8 + 1)).unwrap();
            assert!(
                (got - expected).abs() < 1e-2,
                "K[{}][{}] = {got}, expected {expected}",
                i + 1,
                j + 1
            );
        }
        assert!((node.desk().gain - room.coupling[i][i]).abs() < 1e-2);
        assert!(!node.desk().manual);
    }
}

#[test]
fn calibration_survives_a_lost_done_light() {
    init_logs();
    let mut room = three_desks();
    let booted = room.run_until(STEP, Duration::from_secs(1), |r| {
        r.nodes.iter().all(|n| n.stage() != Stage::Booting)
    });
    assert!(booted);

    let first_done = compose(kind::DONE_LIGHT, 1);
    let victim = room.nodes[2].transport().bus().index();
    let mut dropped = false;
    let deadline = room.now + Duration::from_secs(3);
    while room.now < deadline && !room.nodes.iter().all(|n| n.is_running()) {
        let now = room.now;
        room.nodes[0].poll(now);
        if !dropped
            && room
                .medium
                .transmitted()
                .iter()
                .any(|(_, id, _)| *id == first_done)
        {
            // desk 3 never sees desk 1 hand over the turn
            room.medium.discard_pending(victim);
            dropped = true;
        }
        room.nodes[1].poll(now);
        room.nodes[2].poll(now);
        room.settle_light();
        room.now += STEP;
    }

    assert!(dropped);
    for node in &room.nodes {
        assert!(node.is_running());
        assert!(node.calibration().unwrap().is_complete());
    }
    let row = room.nodes[2].gains().expect("gains applied");
    for (j, expected) in room.coupling[2].iter().enumerate() {
        let got = row.gain_for(addr(j as u8 + 1)).unwrap();
        assert!((got - expected).abs() < 1e-2, "K[3][{}] = {got}", j + 1);
    }
}

fn running_pair() -> Room {
    let config = Config {
        calibrate: false,
        ..fast_config()
    };
    let mut room = Room::new(&[1, 2], vec![vec![50.0, 0.0], vec![0.0, 50.0]], 0.0, config);
    let up = room.run_until(STEP, Duration::from_secs(1), |r| {
        r.nodes.iter().all(|n| n.is_running())
    });
    assert!(up);
    room
}

#[test]
fn remote_get_against_silent_node_times_out_once() {
    init_logs();
    let mut room = running_pair();
    // node 2 goes quiet: it stays on the bus but is never polled again
    let silent = room.nodes.remove(1);

    let before = room.medium.transmitted().len();
    room.nodes[0].submit_line("g y 2");
    let t0 = room.now;
    assert!(room.nodes[0].poll(t0).is_empty());

    let sent = room.medium.transmitted();
    assert_eq!(sent.len(), before + 1);
    let (_, id, data) = &sent[before];
    assert_eq!(*id, compose(kind::GET_BASE + Field::Illuminance.index(), 1));
    assert_eq!(data, &vec![2]);

    assert!(room.nodes[0]
        .poll(t0 + Duration::from_millis(99))
        .is_empty());
    let out = room.nodes[0].poll(t0 + Duration::from_millis(100));
    assert_eq!(out, vec![Reply::Error(ConsoleError::Timeout(addr(2)))]);
    assert_eq!(out[0].to_string(), "err no response from desk 2");

    assert!(room.nodes[0].poll(t0 + Duration::from_secs(1)).is_empty());
    assert_eq!(room.medium.transmitted().len(), before + 1);
    drop(silent);
}

#[test]
fn local_command_stays_off_the_bus() {
    let mut room = running_pair();
    let before = room.medium.transmitted().len();
    room.nodes[0].desk_mut().lux = 42.0;
    room.nodes[0].submit_line("g y 1");
    let out = room.nodes[0].poll(room.now);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].to_string(), "y 1 42.00");
    assert_eq!(room.medium.transmitted().len(), before);
}

#[test]
fn remote_set_and_get_round_trip() {
    init_logs();
    let mut room = running_pair();

    room.nodes[0].submit_line("O 2 7.5");
    room.nodes[0].submit_line("g O 2");
    let mut printed = Vec::new();
    for _ in 0..10 {
        for replies in room.round(STEP) {
            printed.extend(replies.into_iter().map(|r| r.to_string()));
        }
    }
    assert_eq!(printed, vec!["ack".to_string(), "O 2 7.50".to_string()]);
    assert_eq!(room.nodes[1].desk().lower_bound_occupied, 7.5);
}

#[test]
fn remote_duty_set_puts_peer_in_manual_mode() {
    let mut room = running_pair();
    room.nodes[0].submit_line("u 2 0.4");
    for _ in 0..5 {
        room.round(STEP);
    }
    let desk = room.nodes[1].desk();
    assert!(desk.manual);
    assert_eq!(desk.duty, 0.4);

    room.nodes[0].submit_line("u 2 -1");
    let mut printed = Vec::new();
    for _ in 0..5 {
        for replies in room.round(STEP) {
            printed.extend(replies);
        }
    }
    assert_eq!(
        printed,
        vec![Reply::Ack {
            note: Some("manual mode disabled")
        }]
    );
    assert!(!room.nodes[1].desk().manual);
}

#[test]
fn queued_lines_run_in_order_after_reply() {
    let mut room = running_pair();
    room.nodes[1].desk_mut().reference = 20.0;
    room.nodes[0].submit_line("g r 2");
    room.nodes[0].submit_line("r 1 11");
    room.nodes[0].submit_line("g r 1");
    let mut printed = Vec::new();
    for _ in 0..10 {
        for replies in room.round(STEP) {
            printed.extend(replies.into_iter().map(|r| r.to_string()));
        }
    }
    assert_eq!(printed, vec!["r 2 20.00", "ack", "r 1 11.00"]);
}

#[test]
fn late_peer_can_be_added_by_hand() {
    let mut room = running_pair();
    room.nodes[0].submit_line("g y 7");
    let out = room.nodes[0].poll(room.now);
    assert_eq!(out, vec![Reply::Error(ConsoleError::UnknownDesk(addr(7)))]);

    assert!(room.nodes[0].add_peer(addr(7)));
    assert!(!room.nodes[0].add_peer(addr(7)));
    assert!(room.nodes[0].peers().contains(addr(7)));
}

#[test]
fn duplicate_boot_frames_do_not_grow_peer_set() {
    let mut room = Room::new(
        &[4, 9],
        vec![vec![1.0, 0.0], vec![0.0, 1.0]],
        0.0,
        Config {
            calibrate: false,
            ..fast_config()
        },
    );
    // resend interval is well below the listen window, so several duplicates arrive
    room.run_until(STEP, Duration::from_secs(1), |r| {
        r.nodes.iter().all(|n| n.is_running())
    });
    let boots = room
        .medium
        .transmitted()
        .iter()
        .filter(|(_, id, _)| *id == 0x100)
        .count();
    assert!(boots > 2);
    for node in &room.nodes {
        assert_eq!(node.peers().len(), 2);
    }
}
