//! Typed arena buffers with two-stage hold lists.
//!
//! A `DataStore<T>` owns a set of buffers, each bound to one registered
//! type (a fixed capacity profile). At most one buffer per type is the
//! allocation target; allocation is a bump pointer. Entries are addressed
//! by a 32-bit `EntryRef` packing buffer id and offset.
//!
//! Freeing is logical and deferred: freed runs go on a stage-1 hold list,
//! are tagged with the commit generation when the writer calls
//! `transfer_hold_lists`, and become reusable (free list) or dead
//! (compaction fodder) once `trim_hold_lists` observes that every reader
//! has moved past that generation. Whole buffers follow the same path:
//! Active -> Hold -> Free, never Active -> Free.
//!
//! Allocation does not fail logically: the store switches or grows
//! buffers as needed, and an OS-level memory refusal aborts the process
//! (Rust's default allocation failure behavior), which is the intended
//! fatal condition for the node.

use crate::generation::GenerationHandler;
use lodestone_core::Generation;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use tracing::debug;

/// Bits of an `EntryRef` used for the in-buffer offset.
pub const OFFSET_BITS: u32 = 22;
/// Bits of an `EntryRef` used for the buffer id.
pub const BUFFER_BITS: u32 = 10;

const OFFSET_MASK: u32 = (1 << OFFSET_BITS) - 1;

/// Reference to a run of elements inside a `DataStore`.
///
/// The zero value is reserved as the invalid reference; the store never
/// hands out buffer 0 / offset 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryRef(u32);

impl EntryRef {
    /// Pack a buffer id and offset.
    pub fn new(buffer_id: u32, offset: u32) -> Self {
        debug_assert!(buffer_id < (1 << BUFFER_BITS));
        debug_assert!(offset <= OFFSET_MASK);
        EntryRef((buffer_id << OFFSET_BITS) | offset)
    }

    /// The invalid reference.
    pub fn invalid() -> Self {
        EntryRef(0)
    }

    /// True unless this is the invalid reference.
    pub fn valid(&self) -> bool {
        self.0 != 0
    }

    /// The buffer id component.
    pub fn buffer_id(&self) -> u32 {
        self.0 >> OFFSET_BITS
    }

    /// The offset component.
    pub fn offset(&self) -> u32 {
        self.0 & OFFSET_MASK
    }
}

impl fmt::Display for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref({},{})", self.buffer_id(), self.offset())
    }
}

/// Registered buffer type handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(u32);

impl TypeId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Store-wide tuning knobs.
#[derive(Debug, Clone)]
pub struct DataStoreConfig {
    /// Maximum number of buffers; when exhausted, types that permit it
    /// fall back to resizing their active buffer in place.
    pub max_buffers: u32,
}

impl Default for DataStoreConfig {
    fn default() -> Self {
        DataStoreConfig {
            max_buffers: 1 << BUFFER_BITS,
        }
    }
}

struct TypeSpec {
    elems_per_buffer: usize,
    allow_fallback_resize: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferPhase {
    Free,
    Active,
    Hold,
}

struct Buffer<T> {
    data: Vec<T>,
    type_id: u32,
    phase: BufferPhase,
    used: usize,
    dead: usize,
    hold_elems: usize,
    compacting: bool,
}

impl<T> Buffer<T> {
    fn remaining(&self) -> usize {
        self.data.capacity() - self.used
    }
}

struct ElemHold {
    entry: EntryRef,
    len: usize,
}

struct ElemHold2 {
    entry: EntryRef,
    len: usize,
    generation: Generation,
}

/// Aggregated memory accounting snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemStats {
    /// Elements allocated (capacity) across all buffers.
    pub alloc_elems: usize,
    /// Elements handed out and still considered live or on hold.
    pub used_elems: usize,
    /// Elements freed past their hold period and not reusable.
    pub dead_elems: usize,
    /// Elements on the hold lists.
    pub hold_elems: usize,
    /// Buffers in the free state.
    pub free_buffers: u32,
    /// Buffers in the active state.
    pub active_buffers: u32,
    /// Buffers in the hold state.
    pub hold_buffers: u32,
}

/// Arena store of `T` runs. Single writer; see the module docs for the
/// reclamation protocol.
pub struct DataStore<T> {
    config: DataStoreConfig,
    types: Vec<TypeSpec>,
    buffers: Vec<Buffer<T>>,
    active_buffer: Vec<Option<u32>>, // per type
    free_buffer_ids: Vec<u32>,
    free_lists: Vec<BTreeMap<usize, Vec<EntryRef>>>, // per type, keyed by run length
    free_lists_enabled: bool,
    elem_hold1: Vec<ElemHold>,
    elem_hold2: VecDeque<ElemHold2>,
    buffer_hold1: Vec<u32>,
    buffer_hold2: VecDeque<(u32, Generation)>,
    compaction_count: u64,
}

impl<T: Clone + Default> DataStore<T> {
    /// Create an empty store.
    pub fn new(config: DataStoreConfig) -> Self {
        DataStore {
            config,
            types: Vec::new(),
            buffers: Vec::new(),
            active_buffer: Vec::new(),
            free_buffer_ids: Vec::new(),
            free_lists: Vec::new(),
            free_lists_enabled: true,
            elem_hold1: Vec::new(),
            elem_hold2: VecDeque::new(),
            buffer_hold1: Vec::new(),
            buffer_hold2: VecDeque::new(),
            compaction_count: 0,
        }
    }

    /// Register a buffer type with the given per-buffer element capacity.
    pub fn register_type(&mut self, elems_per_buffer: usize, allow_fallback_resize: bool) -> TypeId {
        assert!(elems_per_buffer > 0 && elems_per_buffer <= (OFFSET_MASK as usize) + 1);
        let id = TypeId(self.types.len() as u32);
        self.types.push(TypeSpec {
            elems_per_buffer,
            allow_fallback_resize,
        });
        self.active_buffer.push(None);
        self.free_lists.push(BTreeMap::new());
        id
    }

    /// Disable free-list reuse; freed runs become dead instead.
    pub fn disable_free_lists(&mut self) {
        self.free_lists_enabled = false;
        for fl in &mut self.free_lists {
            fl.clear();
        }
    }

    fn new_buffer(&mut self, type_id: TypeId, min_capacity: usize) -> Option<u32> {
        let id = match self.free_buffer_ids.pop() {
            Some(id) => id,
            None => {
                if self.buffers.len() as u32 >= self.config.max_buffers {
                    return None;
                }
                let id = self.buffers.len() as u32;
                self.buffers.push(Buffer {
                    data: Vec::new(),
                    type_id: type_id.0,
                    phase: BufferPhase::Free,
                    used: 0,
                    dead: 0,
                    hold_elems: 0,
                    compacting: false,
                });
                id
            }
        };
        // Element 0 of buffer 0 is reserved so EntryRef(0) stays invalid.
        let reserve = usize::from(id == 0);
        let spec = &self.types[type_id.index()];
        let capacity = spec.elems_per_buffer.max(min_capacity + reserve);
        let buffer = &mut self.buffers[id as usize];
        debug_assert_eq!(buffer.phase, BufferPhase::Free);
        buffer.data = Vec::with_capacity(capacity);
        buffer.data.resize(reserve, T::default());
        buffer.type_id = type_id.0;
        buffer.phase = BufferPhase::Active;
        buffer.used = reserve;
        buffer.dead = reserve;
        buffer.hold_elems = 0;
        buffer.compacting = false;
        Some(id)
    }

    fn switch_or_grow_active(&mut self, type_id: TypeId, elems_needed: usize) {
        let allow_resize = self.types[type_id.index()].allow_fallback_resize;
        match self.new_buffer(type_id, elems_needed) {
            Some(id) => {
                self.active_buffer[type_id.index()] = Some(id);
            }
            None => {
                assert!(
                    allow_resize,
                    "data store buffer space exhausted for a type without fallback resize"
                );
                let active = self.active_buffer[type_id.index()]
                    .expect("fallback resize requires an active buffer");
                let buffer = &mut self.buffers[active as usize];
                buffer.data.reserve(elems_needed.max(buffer.data.capacity()));
            }
        }
    }

    /// Guarantee the active buffer for `type_id` has at least
    /// `elems_needed` free elements, switching or growing if not.
    pub fn ensure_capacity(&mut self, type_id: TypeId, elems_needed: usize) {
        match self.active_buffer[type_id.index()] {
            Some(id) if self.buffers[id as usize].remaining() >= elems_needed => {}
            _ => self.switch_or_grow_active(type_id, elems_needed),
        }
    }

    /// Allocate a run of `len` default-initialized elements.
    ///
    /// Reuses an exact-length free-list entry when one exists; otherwise
    /// bump-allocates in the active buffer.
    pub fn allocate(&mut self, type_id: TypeId, len: usize) -> EntryRef {
        assert!(len > 0, "zero-length allocation");
        if self.free_lists_enabled {
            if let Some(entries) = self.free_lists[type_id.index()].get_mut(&len) {
                if let Some(entry) = entries.pop() {
                    for slot in self.slice_mut_raw(entry, len) {
                        *slot = T::default();
                    }
                    return entry;
                }
            }
        }
        self.ensure_capacity(type_id, len);
        let id = self.active_buffer[type_id.index()].expect("ensure_capacity set an active buffer");
        let buffer = &mut self.buffers[id as usize];
        let offset = buffer.used as u32;
        buffer
            .data
            .resize(buffer.used + len, T::default());
        buffer.used += len;
        EntryRef::new(id, offset)
    }

    fn slice_mut_raw(&mut self, entry: EntryRef, len: usize) -> &mut [T] {
        let buffer = &mut self.buffers[entry.buffer_id() as usize];
        let start = entry.offset() as usize;
        &mut buffer.data[start..start + len]
    }

    /// Read one element.
    pub fn get(&self, entry: EntryRef) -> &T {
        &self.buffers[entry.buffer_id() as usize].data[entry.offset() as usize]
    }

    /// Read a run of `len` elements.
    pub fn slice(&self, entry: EntryRef, len: usize) -> &[T] {
        let buffer = &self.buffers[entry.buffer_id() as usize];
        let start = entry.offset() as usize;
        &buffer.data[start..start + len]
    }

    /// Write access to a run of `len` elements.
    pub fn slice_mut(&mut self, entry: EntryRef, len: usize) -> &mut [T] {
        self.slice_mut_raw(entry, len)
    }

    /// Logically free a run. The memory stays dereferenceable until the
    /// hold lists are transferred and trimmed past every reader.
    pub fn free(&mut self, entry: EntryRef, len: usize) {
        debug_assert!(entry.valid());
        self.buffers[entry.buffer_id() as usize].hold_elems += len;
        self.elem_hold1.push(ElemHold { entry, len });
    }

    /// Tag stage-1 holds (elements and buffers) with `generation` and move
    /// them to stage 2. Called by the writer at commit time.
    pub fn transfer_hold_lists(&mut self, generation: Generation) {
        for hold in self.elem_hold1.drain(..) {
            self.elem_hold2.push_back(ElemHold2 {
                entry: hold.entry,
                len: hold.len,
                generation,
            });
        }
        for buffer_id in self.buffer_hold1.drain(..) {
            self.buffer_hold2.push_back((buffer_id, generation));
        }
    }

    /// Release stage-2 holds tagged with a generation every reader has
    /// moved past (`tag < oldest_used`).
    pub fn trim_hold_lists(&mut self, oldest_used: Generation) {
        while let Some(front) = self.elem_hold2.front() {
            if front.generation >= oldest_used {
                break;
            }
            let hold = self.elem_hold2.pop_front().expect("front exists");
            let buffer = &mut self.buffers[hold.entry.buffer_id() as usize];
            buffer.hold_elems -= hold.len;
            let type_id = buffer.type_id as usize;
            if self.free_lists_enabled && buffer.phase == BufferPhase::Active && !buffer.compacting
            {
                self.free_lists[type_id]
                    .entry(hold.len)
                    .or_default()
                    .push(hold.entry);
            } else {
                buffer.dead += hold.len;
            }
        }
        while let Some((buffer_id, generation)) = self.buffer_hold2.front().copied() {
            if generation >= oldest_used {
                break;
            }
            self.buffer_hold2.pop_front();
            let buffer = &mut self.buffers[buffer_id as usize];
            debug_assert_eq!(buffer.phase, BufferPhase::Hold);
            buffer.data = Vec::new();
            buffer.phase = BufferPhase::Free;
            buffer.used = 0;
            buffer.dead = 0;
            buffer.hold_elems = 0;
            buffer.compacting = false;
            self.free_buffer_ids.push(buffer_id);
        }
    }

    /// Shorthand: transfer at the handler's current generation, bump it,
    /// and trim at the oldest still-used generation.
    pub fn reclaim_through(&mut self, handler: &GenerationHandler) {
        self.transfer_hold_lists(handler.current_generation());
        handler.increment_generation();
        self.trim_hold_lists(handler.oldest_used_generation());
    }

    /// Move a buffer from Active to Hold. Its memory is released once the
    /// hold generation drains. Live data must already have been copied out
    /// by the owning structure.
    pub fn hold_buffer(&mut self, buffer_id: u32) {
        let type_index;
        {
            let buffer = &mut self.buffers[buffer_id as usize];
            assert_eq!(
                buffer.phase,
                BufferPhase::Active,
                "only active buffers can be held"
            );
            buffer.phase = BufferPhase::Hold;
            type_index = buffer.type_id as usize;
        }
        // Free-list entries pointing into a held buffer must not be reused.
        let lens: Vec<usize> = self.free_lists[type_index].keys().copied().collect();
        for len in lens {
            if let Some(entries) = self.free_lists[type_index].get_mut(&len) {
                entries.retain(|e| e.buffer_id() != buffer_id);
                if entries.is_empty() {
                    self.free_lists[type_index].remove(&len);
                }
            }
        }
        if self.active_buffer[type_index] == Some(buffer_id) {
            self.active_buffer[type_index] = None;
        }
        self.buffer_hold1.push(buffer_id);
    }

    /// Pick the buffer of `type_id` with the highest dead:used ratio and
    /// mark it compacting. Returns the buffer id, or `None` when nothing
    /// is worth compacting. The owning structure must copy live entries
    /// elsewhere, then call [`DataStore::hold_buffer`].
    pub fn start_compact_worst_buffer(&mut self, type_id: TypeId) -> Option<u32> {
        let mut worst: Option<(u32, f64)> = None;
        for (id, buffer) in self.buffers.iter().enumerate() {
            if buffer.phase != BufferPhase::Active
                || buffer.type_id != type_id.0
                || buffer.compacting
                || buffer.dead == 0
            {
                continue;
            }
            let ratio = buffer.dead as f64 / buffer.used.max(1) as f64;
            if worst.map_or(true, |(_, w)| ratio > w) {
                worst = Some((id as u32, ratio));
            }
        }
        let (id, ratio) = worst?;
        debug!(buffer_id = id, dead_ratio = ratio, "starting buffer compaction");
        self.buffers[id as usize].compacting = true;
        // Stop allocating into a compacting buffer.
        if self.active_buffer[type_id.index()] == Some(id) {
            self.active_buffer[type_id.index()] = None;
        }
        // Its free-list entries would resurrect dead space.
        let lens: Vec<usize> = self.free_lists[type_id.index()].keys().copied().collect();
        for len in lens {
            if let Some(entries) = self.free_lists[type_id.index()].get_mut(&len) {
                entries.retain(|e| e.buffer_id() != id);
            }
        }
        self.compaction_count += 1;
        Some(id)
    }

    /// Number of compactions started.
    pub fn compaction_count(&self) -> u64 {
        self.compaction_count
    }

    /// True when stage-1 holds are pending transfer.
    pub fn has_hold1(&self) -> bool {
        !self.elem_hold1.is_empty() || !self.buffer_hold1.is_empty()
    }

    /// Memory accounting snapshot.
    pub fn mem_stats(&self) -> MemStats {
        let mut stats = MemStats::default();
        for buffer in &self.buffers {
            match buffer.phase {
                BufferPhase::Free => stats.free_buffers += 1,
                BufferPhase::Active => stats.active_buffers += 1,
                BufferPhase::Hold => stats.hold_buffers += 1,
            }
            stats.alloc_elems += buffer.data.capacity();
            stats.used_elems += buffer.used;
            stats.dead_elems += buffer.dead;
            stats.hold_elems += buffer.hold_elems;
        }
        stats
    }
}
