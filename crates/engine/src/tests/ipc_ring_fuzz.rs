// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Random interleavings of the four ring operations of an adapter pair.
//!
//! Every slot index must be in exactly one place at all times: the out side's
//! free list, the forward ring, held by the in side, or the reverse ring.

use super::init_tracing;
use crate::constants::DEFAULT_IPC_REGION_BASE;
use framelink_core::ipc::{IpcChannelConfig, IpcChannelId, IpcChannelTable};
use framelink_core::{Exhausted, LinkId, LocalAddr, OffsetMapping};
use std::collections::VecDeque;

/// Deterministic xorshift64.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    #[allow(clippy::cast_possible_truncation)]
    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

struct Model {
    free: Vec<u32>,
    forward: VecDeque<u32>,
    held: Vec<u32>,
    reverse: VecDeque<u32>,
}

impl Model {
    fn assert_each_slot_once(&self, slots: usize, step: usize) {
        let mut refs = vec![0u32; slots];
        for &index in self.free.iter().chain(&self.forward).chain(&self.held).chain(&self.reverse) {
            refs[index as usize] += 1;
        }
        assert!(refs.iter().all(|&r| r == 1), "step {step}: slot references {refs:?}");
    }
}

fn fuzz(config: IpcChannelConfig, seed: u64, steps: usize) {
    let table = IpcChannelTable::new(LocalAddr(DEFAULT_IPC_REGION_BASE));
    let channel = table.create(Some(IpcChannelId(1)), &config, LinkId(1), LinkId(2)).unwrap();
    let platform = OffsetMapping::identity();
    #[allow(clippy::cast_possible_truncation)]
    let mut model = Model {
        free: (0..config.slots as u32).collect(),
        forward: VecDeque::new(),
        held: Vec::new(),
        reverse: VecDeque::new(),
    };
    let mut rng = XorShift(seed);
    let mut ring_full = 0;

    for step in 0..steps {
        match rng.below(4) {
            0 => {
                if let Some(index) = model.free.pop() {
                    match channel.forward().push(&platform, index) {
                        Ok(()) => model.forward.push_back(index),
                        Err(kind) => {
                            assert!(matches!(kind, Exhausted::RingFull));
                            assert_eq!(model.forward.len(), channel.forward().usable());
                            ring_full += 1;
                            model.free.push(index);
                        },
                    }
                }
            },
            1 => {
                let popped = channel.forward().pop(&platform);
                assert_eq!(popped, model.forward.pop_front(), "step {step}: forward ring order");
                model.held.extend(popped);
            },
            2 => {
                if !model.held.is_empty() {
                    let index = model.held.swap_remove(rng.below(model.held.len()));
                    channel.reverse().push(&platform, index).expect("reverse ring holds every slot");
                    model.reverse.push_back(index);
                }
            },
            _ => {
                let popped = channel.reverse().pop(&platform);
                assert_eq!(popped, model.reverse.pop_front(), "step {step}: reverse ring order");
                model.free.extend(popped);
            },
        }

        assert_eq!(channel.forward().len(), model.forward.len());
        assert_eq!(channel.reverse().len(), model.reverse.len());
        model.assert_each_slot_once(config.slots, step);
    }
    tracing::debug!(seed, steps, ring_full, "Ring fuzz finished");
}

#[test]
fn test_slots_live_in_exactly_one_place() {
    init_tracing();
    for seed in [0x9E37_79B9_7F4A_7C15, 0xDEAD_BEEF, 42] {
        fuzz(IpcChannelConfig { ring_capacity: 4, slots: 8 }, seed, 20_000);
    }
}

#[test]
fn test_forward_ring_as_large_as_slot_count() {
    init_tracing();
    fuzz(IpcChannelConfig { ring_capacity: 9, slots: 8 }, 7, 20_000);
}
