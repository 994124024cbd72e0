//! Epoch tracking for safe memory reclamation.
//!
//! The writer publishes a current generation and bumps it when a commit
//! makes new structures visible. Readers pin the generation that was
//! current when they started; memory freed at generation `g` may be
//! reused only once the oldest pinned generation is past `g`.
//!
//! Pinning takes a short mutex on acquire and release; the data path a
//! guard protects is read without any lock.

use lodestone_core::Generation;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct PinTable {
    // generation -> number of outstanding guards
    pins: Mutex<BTreeMap<Generation, usize>>,
}

/// Tracks the current generation and the set of pinned reader generations.
pub struct GenerationHandler {
    current: AtomicU64,
    table: Arc<PinTable>,
}

impl Default for GenerationHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationHandler {
    /// Start at generation 1; generation 0 is "before any commit".
    pub fn new() -> Self {
        GenerationHandler {
            current: AtomicU64::new(1),
            table: Arc::new(PinTable::default()),
        }
    }

    /// The generation new readers will pin.
    pub fn current_generation(&self) -> Generation {
        self.current.load(Ordering::Acquire)
    }

    /// Advance the generation; called by the writer after a commit.
    pub fn increment_generation(&self) -> Generation {
        self.current.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Pin the current generation for reading.
    pub fn take_guard(&self) -> GenerationGuard {
        let mut pins = self.table.pins.lock();
        // Re-read under the lock so a concurrent increment cannot leave the
        // guard pinned to a generation the writer already considers drained.
        let gen = self.current.load(Ordering::Acquire);
        *pins.entry(gen).or_insert(0) += 1;
        GenerationGuard {
            table: Arc::clone(&self.table),
            generation: gen,
        }
    }

    /// The oldest generation any reader still holds, or the current
    /// generation when nothing is pinned. Memory tagged with a generation
    /// strictly below this value is safe to reuse.
    pub fn oldest_used_generation(&self) -> Generation {
        let pins = self.table.pins.lock();
        match pins.keys().next() {
            Some(oldest) => *oldest,
            None => self.current.load(Ordering::Acquire),
        }
    }

    /// Number of outstanding guards, all generations.
    pub fn guard_count(&self) -> usize {
        self.table.pins.lock().values().sum()
    }
}

/// RAII pin of one generation. Dropping releases the pin.
pub struct GenerationGuard {
    table: Arc<PinTable>,
    generation: Generation,
}

impl GenerationGuard {
    /// The pinned generation.
    pub fn generation(&self) -> Generation {
        self.generation
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        let mut pins = self.table.pins.lock();
        if let Some(count) = pins.get_mut(&self.generation) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&self.generation);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_at_generation_one() {
        let handler = GenerationHandler::new();
        assert_eq!(handler.current_generation(), 1);
        assert_eq!(handler.oldest_used_generation(), 1);
    }

    #[test]
    fn test_guard_pins_oldest_generation() {
        let handler = GenerationHandler::new();
        let guard = handler.take_guard();
        assert_eq!(guard.generation(), 1);
        handler.increment_generation();
        handler.increment_generation();
        assert_eq!(handler.current_generation(), 3);
        // The reader at generation 1 keeps the floor down.
        assert_eq!(handler.oldest_used_generation(), 1);
        drop(guard);
        assert_eq!(handler.oldest_used_generation(), 3);
    }

    #[test]
    fn test_multiple_guards_release_in_any_order() {
        let handler = GenerationHandler::new();
        let g1 = handler.take_guard();
        handler.increment_generation();
        let g2 = handler.take_guard();
        assert_eq!(g2.generation(), 2);
        assert_eq!(handler.oldest_used_generation(), 1);
        drop(g1);
        assert_eq!(handler.oldest_used_generation(), 2);
        drop(g2);
        assert_eq!(handler.oldest_used_generation(), 2);
        assert_eq!(handler.guard_count(), 0);
    }

    #[test]
    fn test_guards_from_threads() {
        let handler = Arc::new(GenerationHandler::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let h = Arc::clone(&handler);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let guard = h.take_guard();
                    assert!(guard.generation() <= h.current_generation());
                }
            }));
        }
        for _ in 0..100 {
            handler.increment_generation();
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(handler.guard_count(), 0);
        assert_eq!(
            handler.oldest_used_generation(),
            handler.current_generation()
        );
    }
}
