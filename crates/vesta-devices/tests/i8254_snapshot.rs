mod common;

use common::{pit_1to1, program, read_word, record_edges, run_until};
use vesta_devices::i8254::{I8254, PIT_CONTROL, PIT_COUNTER0, PIT_COUNTER1, PIT_COUNTER2};
use vesta_io_snapshot::io::state::codec::Encoder;
use vesta_io_snapshot::io::state::{IoSnapshot, SnapshotError, SnapshotVersion, SnapshotWriter};
use vesta_time::{ManualClock, SystemClock};

const TAG_CHANNELS: u16 = 1;

fn busy_pit() -> (ManualClock, I8254<ManualClock>) {
    let clock = ManualClock::new(3_000_000);
    let mut pit = I8254::new(clock.clone(), 1_000_000);

    program(&mut pit, 0, 3, 7);
    program(&mut pit, 1, 2, 40);
    pit.set_gate(2, false);
    program(&mut pit, 2, 1, 9);

    run_until(&clock, &mut pit, 20);
    pit.write(PIT_CONTROL, 0x40);
    // Half of a 16-bit write on counter 0 is pending at save time.
    pit.write(PIT_COUNTER0, 11);
    run_until(&clock, &mut pit, 41);
    (clock, pit)
}

#[test]
fn restored_pit_continues_identically() {
    let (clock_a, mut a) = busy_pit();
    let snap = a.save_state();

    let clock_b = ManualClock::new(3_000_000);
    clock_b.set_system_time(clock_a.system_time());
    let mut b = I8254::new(clock_b.clone(), 1_000_000);
    b.load_state(&snap).unwrap();

    assert_eq!(a.next_deadline(), b.next_deadline());

    let edges_a: Vec<_> = (0..3).map(|ch| record_edges(&mut a, ch)).collect();
    let edges_b: Vec<_> = (0..3).map(|ch| record_edges(&mut b, ch)).collect();

    for pit in [&mut a, &mut b] {
        pit.write(PIT_COUNTER0, 0);
        pit.set_gate(2, true);
    }
    run_until(&clock_a, &mut a, 600);
    run_until(&clock_b, &mut b, 600);

    for (ea, eb) in edges_a.iter().zip(&edges_b) {
        assert!(!ea.borrow().is_empty());
        assert_eq!(*ea.borrow(), *eb.borrow());
    }
    for port in [PIT_COUNTER0, PIT_COUNTER1, PIT_COUNTER2] {
        assert_eq!(read_word(&mut a, port), read_word(&mut b, port));
    }
}

#[test]
fn restore_preserves_pending_latches() {
    let (clock_a, mut a) = busy_pit();
    let snap = a.save_state();

    let clock_b = ManualClock::new(3_000_000);
    clock_b.set_system_time(clock_a.system_time());
    let mut b = I8254::new(clock_b, 1_000_000);
    b.load_state(&snap).unwrap();

    // Counter 1 was latched at t=20 system cycles; the count is still frozen.
    assert_eq!(read_word(&mut a, PIT_COUNTER1), read_word(&mut b, PIT_COUNTER1));
}

#[test]
fn save_is_deterministic() {
    let (_clock, a) = busy_pit();
    assert_eq!(a.save_state(), a.save_state());

    let (_clock, b) = busy_pit();
    assert_eq!(a.save_state(), b.save_state());
}

#[test]
fn snapshot_for_other_device_is_rejected_without_side_effects() {
    let (_clock, mut pit) = busy_pit();
    let before = pit.save_state();

    let w = SnapshotWriter::new(*b"HPET", SnapshotVersion::new(1, 0));
    let err = pit.load_state(&w.finish()).unwrap_err();
    assert_eq!(
        err,
        SnapshotError::DeviceIdMismatch {
            expected: *b"8254",
            found: *b"HPET",
        }
    );

    assert_eq!(pit.save_state(), before);
}

#[test]
fn newer_major_version_is_rejected() {
    let w = SnapshotWriter::new(*b"8254", SnapshotVersion::new(2, 0));
    let mut pit = I8254::new(ManualClock::new(1_000), 1_000);
    assert_eq!(
        pit.load_state(&w.finish()),
        Err(SnapshotError::UnsupportedDeviceMajorVersion {
            found: 2,
            supported: 1,
        })
    );
}

#[test]
fn truncated_channel_blob_leaves_device_unchanged() {
    let (_clock, mut pit) = busy_pit();
    let before = pit.save_state();

    let mut w = SnapshotWriter::new(*b"8254", SnapshotVersion::new(1, 0));
    w.field_bytes(TAG_CHANNELS, Encoder::new().u32(1).u16(5).finish());
    assert_eq!(
        pit.load_state(&w.finish()),
        Err(SnapshotError::UnexpectedEof)
    );
    assert_eq!(pit.save_state(), before);
}

/// Fields of a channel record that a damaged snapshot may carry out of range.
struct RawChannel {
    counting_element: i32,
    read_phase: u8,
    control_word: u8,
    mode: u8,
    out_phase: u8,
    end_out_phase1: i32,
    end_out_phase2: i32,
}

/// Snapshot holding only counter 0, laid out field by field like the saved channel records.
fn single_channel_snapshot(raw: &RawChannel) -> Vec<u8> {
    let channel = Encoder::new()
        .u32(1)
        .u16(0)
        .i32(raw.counting_element)
        .u16(0)
        .u8(0)
        .bool(false)
        .bool(false)
        .u8(raw.read_phase)
        .u8(0)
        .u8(raw.control_word)
        .u8(raw.mode)
        .bool(true)
        .bool(true)
        .u8(raw.out_phase)
        .i32(raw.end_out_phase1)
        .i32(raw.end_out_phase2)
        .u64(0)
        .u64(0)
        .bool(false)
        .u64(0)
        .finish();

    let mut w = SnapshotWriter::new(*b"8254", SnapshotVersion::new(1, 0));
    w.field_bytes(TAG_CHANNELS, channel);
    w.finish()
}

/// Reprograms counter 0 as a divide-by-3 rate generator and checks the edges that follow.
fn assert_counter0_recovers(clock: &ManualClock, pit: &mut I8254<ManualClock>) {
    let t = clock.system_time();
    let edges = record_edges(pit, 0);
    program(pit, 0, 2, 3);
    run_until(clock, pit, t + 9);

    let after: Vec<_> = edges.borrow().iter().copied().filter(|e| e.0 > t).collect();
    assert_eq!(
        after,
        vec![
            (t + 2, false),
            (t + 3, true),
            (t + 5, false),
            (t + 6, true),
            (t + 8, false),
            (t + 9, true),
        ]
    );
}

#[test]
fn restore_with_out_of_range_counts_keeps_running() {
    let (clock, mut pit) = pit_1to1();
    let snap = single_channel_snapshot(&RawChannel {
        counting_element: i32::MIN,
        read_phase: 0,
        control_word: 0x36,
        mode: 3,
        out_phase: 1,
        end_out_phase1: 1,
        end_out_phase2: i32::MAX,
    });
    pit.load_state(&snap).unwrap();

    clock.advance(1);
    pit.read(PIT_COUNTER0);
    pit.read(PIT_COUNTER0);
    run_until(&clock, &mut pit, 200_000);
    let _ = pit.output(0);

    assert_counter0_recovers(&clock, &mut pit);
}

#[test]
fn restore_masks_enumerated_fields_into_range() {
    let (clock, mut pit) = pit_1to1();
    let snap = single_channel_snapshot(&RawChannel {
        counting_element: 100,
        read_phase: 5,
        control_word: 0x36,
        mode: 7,
        out_phase: 9,
        end_out_phase1: 50,
        end_out_phase2: 0,
    });
    pit.load_state(&snap).unwrap();

    // Unknown output phase restores as expired: no deadline, the element free-runs.
    run_until(&clock, &mut pit, 10);
    assert_eq!(pit.next_deadline(), None);

    pit.write(PIT_CONTROL, 0b1110_0010);
    assert_eq!(pit.read(PIT_COUNTER0), 0x80 | 0x36);
    // Unknown byte phase restores as low byte first.
    assert_eq!(read_word(&mut pit, PIT_COUNTER0), 90);

    assert_counter0_recovers(&clock, &mut pit);
}

#[test]
fn snapshot_without_channel_field_keeps_current_state() {
    let (_clock, mut pit) = busy_pit();
    let before = pit.save_state();

    let mut w = SnapshotWriter::new(*b"8254", SnapshotVersion::new(1, 3));
    w.field_u32(0x7777, 0xDEAD_BEEF);
    pit.load_state(&w.finish()).unwrap();
    assert_eq!(pit.save_state(), before);
}
