use pretty_assertions::assert_eq;
use wasmer::Pages;
use wasmer_bridge::{BoundaryViolation, BridgeError, GuestBuffer, LoadOptions, Loader, LoaderConfig};

mod common;

use common::instantiate;

#[test]
fn freed_blocks_are_reused_without_corrupting_neighbours() {
    let mut handle = instantiate();

    let first = handle.pass_bytes(&[0xaa; 16]).unwrap();
    let second = handle.pass_bytes(&[0xbb; 16]).unwrap();
    assert_ne!(first.offset, second.offset);

    handle.free(first.offset, first.len).unwrap();
    let third = handle.allocate(16).unwrap();

    assert_eq!(third, first.offset);
    assert_eq!(handle.read_bytes(second.offset, 16).unwrap(), [0xbb_u8; 16]);
}

#[test]
fn allocations_do_not_overlap() {
    let mut handle = instantiate();

    let buffers: Vec<GuestBuffer> = (0..8_u8)
        .map(|i| handle.pass_bytes(&[i; 24]).unwrap())
        .collect();

    for (i, buffer) in buffers.iter().enumerate() {
        assert_eq!(
            handle.read_bytes(buffer.offset, buffer.len).unwrap(),
            [i as u8; 24]
        );
    }
}

#[test]
fn zero_sized_allocations_get_a_valid_offset() {
    let mut handle = instantiate();

    let offset = handle.allocate(0).unwrap();

    assert_eq!(handle.read_bytes(offset, 0).unwrap(), Vec::<u8>::new());
    handle.free(offset, 0).unwrap();
}

#[test]
fn reallocate_preserves_the_common_prefix() {
    let mut handle = instantiate();
    let buffer = handle.pass_str("hello world").unwrap();

    let shrunk = handle.reallocate(buffer.offset, 11, 5).unwrap();
    assert_eq!(handle.read_string(shrunk, 5).unwrap(), "hello");

    let grown = handle.reallocate(shrunk, 5, 64).unwrap();
    assert_eq!(handle.read_string(grown, 5).unwrap(), "hello");

    let emptied = handle.reallocate(grown, 64, 0).unwrap();
    handle.free(emptied, 0).unwrap();
    assert_eq!(handle.tracked_allocations(), Some(0));
}

#[test]
fn empty_allocations_can_be_grown() {
    let mut handle = instantiate();
    let empty = handle.allocate(0).unwrap();

    let grown = handle.reallocate(empty, 0, 24).unwrap();
    handle.write_bytes(grown, b"twenty-four bytes, exact").unwrap();

    assert_eq!(
        handle.read_bytes(grown, 24).unwrap(),
        b"twenty-four bytes, exact"
    );
    handle.free(grown, 24).unwrap();
    assert_eq!(handle.tracked_allocations(), Some(0));
}

#[test]
fn mismatched_free_is_caught_before_the_module_sees_it() {
    let mut handle = instantiate();
    let offset = handle.allocate(16).unwrap();

    let err = handle.free(offset, 8).unwrap_err();

    assert!(
        matches!(
            err,
            BridgeError::BoundaryViolation(BoundaryViolation::MismatchedFree {
                size: 8,
                expected: 16,
                ..
            })
        ),
        "{err:?}"
    );
    assert_eq!(handle.tracked_allocations(), Some(1));

    handle.free(offset, 16).unwrap();
    assert_eq!(handle.tracked_allocations(), Some(0));
}

#[test]
fn mismatched_reallocate_is_caught_too() {
    let mut handle = instantiate();
    let offset = handle.allocate(32).unwrap();

    let err = handle.reallocate(offset, 16, 64).unwrap_err();

    assert!(
        matches!(
            err,
            BridgeError::BoundaryViolation(BoundaryViolation::MismatchedFree { .. })
        ),
        "{err:?}"
    );
}

#[test]
fn ledger_can_be_turned_off() {
    let config = LoaderConfig {
        track_allocations: false,
        ..LoaderConfig::default()
    };
    let mut handle = Loader::new(config)
        .load_sync(common::wasm(), LoadOptions::default())
        .unwrap();

    let offset = handle.allocate(16).unwrap();

    assert_eq!(handle.tracked_allocations(), None);
    handle.free(offset, 16).unwrap();
}

#[test]
fn impossible_sizes_fail_to_allocate() {
    let mut handle = instantiate();

    let err = handle.allocate(usize::MAX).unwrap_err();
    assert!(
        matches!(
            err,
            BridgeError::AllocationFailed {
                size: usize::MAX,
                source: None
            }
        ),
        "{err:?}"
    );

    let err = handle.allocate(0x8000_0000).unwrap_err();
    assert!(
        matches!(
            err,
            BridgeError::AllocationFailed {
                size: 0x8000_0000,
                source: Some(_)
            }
        ),
        "{err:?}"
    );

    // The module is still usable afterwards
    let offset = handle.allocate(8).unwrap();
    handle.free(offset, 8).unwrap();
}

#[test]
fn allocating_past_the_end_grows_memory() {
    let mut handle = instantiate();
    assert_eq!(handle.memory_size(), Pages(1));

    let len = 200_000_u32;
    let offset = handle.allocate(len as usize).unwrap();
    handle.write_bytes(offset + len - 4, b"tail").unwrap();

    assert!(handle.memory_size() >= Pages(4));
    assert_eq!(handle.read_bytes(offset + len - 4, 4).unwrap(), b"tail");
}

#[test]
fn strings_round_trip_through_linear_memory() {
    let mut handle = instantiate();

    let buffer = handle.pass_str("héllo, wörld").unwrap();
    assert_eq!(buffer.len as usize, "héllo, wörld".len());

    assert_eq!(handle.take_string(buffer).unwrap(), "héllo, wörld");
    assert_eq!(handle.tracked_allocations(), Some(0));
}

#[test]
fn data_the_module_owns_can_be_read() {
    let handle = instantiate();
    // The fixture's data segment stands in for a buffer the module produced.
    let buffer = GuestBuffer::new(16, common::FAILURE_MESSAGE.len() as u32);

    let message = handle.read_string(buffer.offset, buffer.len).unwrap();

    assert_eq!(message, common::FAILURE_MESSAGE);
}

#[test]
fn out_of_bounds_accesses_are_violations() {
    let handle = instantiate();
    let page = 64 * 1024;

    let err = handle.read_bytes(page - 2, 4).unwrap_err();
    assert!(
        matches!(
            err,
            BridgeError::BoundaryViolation(BoundaryViolation::OutOfBounds { .. })
        ),
        "{err:?}"
    );

    let err = handle.write_bytes(u32::MAX, b"x").unwrap_err();
    assert!(
        matches!(
            err,
            BridgeError::BoundaryViolation(BoundaryViolation::OutOfBounds { .. })
        ),
        "{err:?}"
    );
}
