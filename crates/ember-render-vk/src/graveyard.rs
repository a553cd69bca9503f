// SPDX-License-Identifier: CEPL-1.0
//! Generation-tagged deferred destruction.
//!
//! A generation is one completed frame-slot fence wait. An item retired at
//! generation `G` comes back out of [`Graveyard::advance`] once the counter
//! reaches `G + DEPTH`, by which point every command buffer recorded before
//! the retirement has finished on the GPU.

use crate::FRAMES_IN_FLIGHT;

pub const GRAVEYARD_DEPTH: usize = 4;

const _: () = assert!(GRAVEYARD_DEPTH > FRAMES_IN_FLIGHT);

struct Retired<T> {
    generation: u64,
    item: T,
}

pub struct Graveyard<T> {
    slots: [Vec<Retired<T>>; GRAVEYARD_DEPTH],
    generation: u64,
}

impl<T> Default for Graveyard<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Graveyard<T> {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Vec::new()),
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn retire(&mut self, item: T) {
        let slot = (self.generation % GRAVEYARD_DEPTH as u64) as usize;
        self.slots[slot].push(Retired {
            generation: self.generation,
            item,
        });
    }

    /// Moves to the next generation and hands back everything that is now
    /// safe to destroy.
    pub fn advance(&mut self) -> Vec<T> {
        self.generation += 1;
        let slot = (self.generation % GRAVEYARD_DEPTH as u64) as usize;
        let now = self.generation;
        self.slots[slot]
            .drain(..)
            .map(|r| {
                debug_assert!(now - r.generation >= GRAVEYARD_DEPTH as u64);
                r.item
            })
            .collect()
    }

    /// Everything still pending; only valid once the device is idle.
    pub fn drain_all(&mut self) -> Vec<T> {
        self.slots
            .iter_mut()
            .flat_map(|s| s.drain(..).map(|r| r.item))
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashSet, VecDeque};

    #[test]
    fn item_returns_after_exactly_depth_generations() {
        let mut g = Graveyard::new();
        g.retire("a");
        for _ in 0..GRAVEYARD_DEPTH - 1 {
            assert!(g.advance().is_empty());
        }
        assert_eq!(g.advance(), vec!["a"]);
        assert_eq!(g.pending(), 0);
    }

    #[test]
    fn drain_all_empties_every_slot() {
        let mut g = Graveyard::new();
        g.retire(1);
        g.advance();
        g.retire(2);
        let mut all = g.drain_all();
        all.sort();
        assert_eq!(all, vec![1, 2]);
        assert_eq!(g.pending(), 0);
    }

    /// Simulates a queue with up to FRAMES_IN_FLIGHT submitted frames. Each
    /// frame references whatever buffer was live while it was recorded.
    /// Buffers are swapped out at irregular frames and must never be freed
    /// while an in-flight frame still references them.
    #[test]
    fn retired_buffers_outlive_every_in_flight_reference() {
        let mut g: Graveyard<u32> = Graveyard::new();
        let mut in_flight: VecDeque<Vec<u32>> = VecDeque::new();
        let mut freed: HashSet<u32> = HashSet::new();
        let mut live = 0u32;
        let mut next_id = 1u32;

        for frame in 0..500u32 {
            // begin_frame: wait for the oldest slot when the ring is full
            if in_flight.len() == FRAMES_IN_FLIGHT {
                in_flight.pop_front();
                for dead in g.advance() {
                    for refs in &in_flight {
                        assert!(!refs.contains(&dead), "buffer {dead} freed while in flight");
                    }
                    freed.insert(dead);
                }
            }

            let mut refs = vec![live];
            // grow a few times mid-frame, pseudo-randomly
            let grows = (frame.wrapping_mul(2654435761) >> 28) % 3;
            for _ in 0..grows {
                g.retire(live);
                live = next_id;
                next_id += 1;
                refs.push(live);
            }
            assert!(!freed.contains(&live));
            in_flight.push_back(refs);
        }
        assert!(!freed.is_empty());
    }
}
