//! Property-Based Tests for Memory Module
//!
//! Drives the allocator with random operation sequences and checks it against
//! a simple model of which handles are live, freed or reclaimed.

use proptest::prelude::*;

use crate::error::AccessError;
use crate::mem::{AllocFlags, Allocator, MemHandle};

// == Strategies ==
#[derive(Debug, Clone)]
enum MemOp {
    Alloc { size: usize, flags: AllocFlags },
    Free { pick: usize },
    Access { pick: usize },
    Autoclean,
}

fn flags_strategy() -> impl Strategy<Value = AllocFlags> {
    (0u32..16).prop_map(AllocFlags::from_bits_truncate)
}

fn mem_op_strategy() -> impl Strategy<Value = MemOp> {
    prop_oneof![
        3 => (0usize..2048, flags_strategy()).prop_map(|(size, flags)| MemOp::Alloc { size, flags }),
        2 => any::<usize>().prop_map(|pick| MemOp::Free { pick }),
        2 => any::<usize>().prop_map(|pick| MemOp::Access { pick }),
        1 => Just(MemOp::Autoclean),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Model {
    Live,
    Dirty,
    Reclaimed,
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    // **Property 1: Handle Validity Tracks Lifecycle**
    // *For any* sequence of alloc, free, access and autoclean operations, a
    // handle validates exactly while its block is live; afterwards it reports
    // use-after-free, and the dirty set holds exactly the freed, unreclaimed
    // handles.
    #[test]
    fn prop_handle_validity_tracks_lifecycle(ops in prop::collection::vec(mem_op_strategy(), 1..80)) {
        let allocator = Allocator::new();
        let mut issued: Vec<(MemHandle, Model, u8)> = Vec::new();
        let mut marker: u8 = 0;

        for op in ops {
            match op {
                MemOp::Alloc { size, flags } => {
                    let handle = allocator.alloc_with_flags(size, flags).unwrap();
                    prop_assert!(
                        issued.iter().all(|(h, _, _)| *h != handle),
                        "handle {} issued twice", handle
                    );
                    marker = marker.wrapping_add(1);
                    allocator.access(handle).unwrap().write().fill(marker);
                    issued.push((handle, Model::Live, marker));
                }
                MemOp::Free { pick } if !issued.is_empty() => {
                    let index = pick % issued.len();
                    let (handle, state, _) = issued[index];
                    let result = allocator.free(handle);
                    match state {
                        Model::Live => {
                            prop_assert_eq!(result, Ok(()));
                            issued[index].1 = Model::Dirty;
                        }
                        Model::Dirty | Model::Reclaimed => {
                            prop_assert_eq!(result, Err(AccessError::UseAfterFree(handle)));
                        }
                    }
                }
                MemOp::Access { pick } if !issued.is_empty() => {
                    let (handle, state, expected) = issued[pick % issued.len()];
                    match (state, allocator.access(handle)) {
                        (Model::Live, Ok(block)) => {
                            prop_assert!(block.read().iter().all(|&b| b == expected));
                        }
                        (Model::Live, Err(err)) => {
                            prop_assert!(false, "live handle {} rejected: {}", handle, err);
                        }
                        (_, Ok(_)) => {
                            prop_assert!(false, "stale handle {} accepted", handle);
                        }
                        (_, Err(err)) => {
                            prop_assert_eq!(err, AccessError::UseAfterFree(handle));
                        }
                    }
                }
                MemOp::Autoclean => {
                    let expected = issued.iter().filter(|(_, s, _)| *s == Model::Dirty).count();
                    prop_assert_eq!(allocator.autoclean_dirty_pointers(), expected);
                    for entry in issued.iter_mut().filter(|(_, s, _)| *s == Model::Dirty) {
                        entry.1 = Model::Reclaimed;
                    }
                }
                _ => {}
            }

            let mut dirty: Vec<MemHandle> = allocator.inspect_dirty_pointers().map(|s| s.handle).collect();
            dirty.sort();
            let mut expected_dirty: Vec<MemHandle> = issued
                .iter()
                .filter(|(_, s, _)| *s == Model::Dirty)
                .map(|(h, _, _)| *h)
                .collect();
            expected_dirty.sort();
            prop_assert_eq!(dirty, expected_dirty);

            let live = issued.iter().filter(|(_, s, _)| *s == Model::Live).count();
            prop_assert_eq!(allocator.stats().live_allocations, live);
        }
    }

    // **Property 2: Realloc Preserves The Common Prefix**
    // *For any* original and new size, the first min(old, new) bytes survive
    // a realloc and the remainder of a grown block is zeroed.
    #[test]
    fn prop_realloc_preserves_prefix(old_size in 0usize..4096, new_size in 0usize..4096, fill in any::<u8>()) {
        let allocator = Allocator::new();
        let handle = allocator.alloc(old_size, AllocFlags::DEFAULT).unwrap();
        allocator.access(handle).unwrap().write().fill(fill);

        let moved = allocator.realloc(handle, new_size, AllocFlags::DEFAULT).unwrap();
        let bytes = allocator.access(moved).unwrap().to_vec();
        let kept = old_size.min(new_size);

        prop_assert_eq!(bytes.len(), new_size);
        prop_assert!(bytes[..kept].iter().all(|&b| b == fill));
        prop_assert!(bytes[kept..].iter().all(|&b| b == 0));
        prop_assert!(allocator.access(handle).is_err());
    }

    // **Property 3: Requested Alignment Is Honored**
    // *For any* power-of-two alignment up to 4096, strict or not, the block
    // address is a multiple of the alignment.
    #[test]
    fn prop_alignment_honored(size in 0usize..1024, shift in 0u32..13, strict in any::<bool>()) {
        let allocator = Allocator::new();
        let align = 1usize << shift;
        let flags = if strict { AllocFlags::STRICT_CHECK } else { AllocFlags::DEFAULT };

        let handle = allocator.alloc_aligned(size, align, flags).unwrap();
        let block = allocator.access(handle).unwrap();
        prop_assert_eq!(block.addr() % align, 0);
        prop_assert_eq!(block.len(), size);
    }
}
