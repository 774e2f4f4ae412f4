//! Garbage-collected heap for strand processes.
//!
//! Each process owns one `Heap`. Objects live in a slot vector with a free
//! list; a `Handle` is a slot index plus the slot's generation, so a handle
//! kept across a free-and-reuse cycle is detected instead of silently
//! aliasing the new occupant.
//!
//! # Design
//!
//! - Allocation never collects. The owning process decides when to collect
//!   (it knows the roots: stack, mailbox) and calls [`Heap::collect`] at
//!   instruction boundaries or right before a large reservation.
//! - Every allocation is checked against a byte limit first. A failed
//!   reservation leaves the heap exactly as it was.
//! - Growable buffers are a wrapper object pointing at a fixed region.
//!   Growing allocates a new region, copies the live bytes forward, repoints
//!   the wrapper and frees the old region, all inside one call.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use smallvec::SmallVec;
use tracing::debug;

use crate::error::RuntimeError;
use crate::module::Prototype;
use crate::value::{HeapRef, ObjectKind, Value};

/// Smallest capacity a growing buffer jumps to.
pub const MIN_BUFFER_GROW: usize = 64;

/// Capacity multiplier applied until the requested size fits.
pub const BUFFER_GROW_FACTOR: usize = 2;

/// Generation-checked index of a heap slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Growable buffer header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcBuffer {
    /// Logical size, always `<= capacity`.
    pub size: usize,
    pub capacity: usize,
    /// Backing `FixedBuffer` region of exactly `capacity` bytes.
    pub storage: Handle,
}

/// A closure: prototype plus captured upvalues.
#[derive(Clone, Debug)]
pub struct GcClosure {
    pub prototype: Arc<Prototype>,
    pub upvalues: SmallVec<[Value; 4]>,
}

/// The data stored in a heap object.
#[derive(Clone, Debug)]
pub enum HeapData {
    FixedBuffer(Vec<u8>),
    Buffer(GcBuffer),
    Closure(GcClosure),
    String(String),
}

impl HeapData {
    pub fn kind(&self) -> ObjectKind {
        match self {
            HeapData::FixedBuffer(_) => ObjectKind::FixedBuffer,
            HeapData::Buffer(_) => ObjectKind::Buffer,
            HeapData::Closure(_) => ObjectKind::Closure,
            HeapData::String(_) => ObjectKind::String,
        }
    }

    /// Push every handle this object references onto `out`.
    fn gc_pointers(&self, out: &mut Vec<Handle>) {
        match self {
            HeapData::FixedBuffer(_) | HeapData::String(_) => {}
            HeapData::Buffer(b) => out.push(b.storage),
            HeapData::Closure(c) => {
                out.extend(c.upvalues.iter().filter_map(|v| v.heap_ref()).map(|r| r.handle));
            }
        }
    }

    /// Bytes charged against the heap limit.
    pub fn estimate_size(&self) -> usize {
        match self {
            HeapData::FixedBuffer(bytes) => bytes.len(),
            HeapData::Buffer(_) => std::mem::size_of::<GcBuffer>(),
            HeapData::Closure(c) => closure_size(c.upvalues.len()),
            HeapData::String(s) => s.len(),
        }
    }
}

pub(crate) fn closure_size(upvalues: usize) -> usize {
    std::mem::size_of::<GcClosure>() + upvalues * std::mem::size_of::<Value>()
}

/// A heap object with GC metadata.
#[derive(Clone)]
pub struct GcObject {
    pub data: HeapData,
    /// Bytes charged for this object.
    pub size: usize,
}

impl fmt::Debug for GcObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcObject")
            .field("kind", &self.data.kind())
            .field("size", &self.size)
            .finish()
    }
}

#[derive(Clone, Debug)]
struct Slot {
    generation: u32,
    marked: bool,
    object: Option<GcObject>,
}

/// Statistics about GC activity.
#[derive(Clone, Debug, Default)]
pub struct GcStats {
    pub collections: u64,
    pub total_allocated: u64,
    pub total_freed: u64,
    pub total_bytes_allocated: u64,
    pub total_bytes_freed: u64,
    pub peak_bytes: usize,
}

/// Configuration for a process heap.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Maximum bytes the heap may hold.
    pub heap_limit: usize,
    /// Bytes allocated before a collection is due.
    pub gc_threshold: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            heap_limit: 64 * 1024 * 1024,
            gc_threshold: 1024 * 1024,
        }
    }
}

/// A garbage-collected heap.
pub struct Heap {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    used: usize,
    bytes_since_gc: usize,
    config: GcConfig,
    stats: GcStats,
}

impl Heap {
    pub fn new() -> Self {
        Self::with_config(GcConfig::default())
    }

    pub fn with_config(config: GcConfig) -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            used: 0,
            bytes_since_gc: 0,
            config,
            stats: GcStats::default(),
        }
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Bytes currently held by live objects.
    pub fn used_bytes(&self) -> usize {
        self.used
    }

    /// Bytes that can still be allocated before hitting the limit.
    pub fn available(&self) -> usize {
        self.config.heap_limit.saturating_sub(self.used)
    }

    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|s| s.object.is_some()).count()
    }

    /// True once enough has been allocated since the last collection.
    pub fn should_collect(&self) -> bool {
        self.bytes_since_gc >= self.config.gc_threshold
    }

    /// Check that `bytes` more can be allocated.
    pub fn reserve(&self, bytes: usize) -> Result<(), RuntimeError> {
        if bytes > self.available() {
            return Err(RuntimeError::OutOfMemory {
                requested: bytes,
                available: self.available(),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Store `data`; callers must have reserved its size already.
    fn insert(&mut self, data: HeapData) -> Handle {
        let size = data.estimate_size();
        let object = GcObject { data, size };

        self.used += size;
        self.bytes_since_gc += size;
        self.stats.total_allocated += 1;
        self.stats.total_bytes_allocated += size as u64;
        self.stats.peak_bytes = self.stats.peak_bytes.max(self.used);

        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.object.is_none(), "free list points at live slot");
            slot.object = Some(object);
            slot.marked = false;
            Handle::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                marked: false,
                object: Some(object),
            });
            Handle::new(index, 0)
        }
    }

    /// Allocate a byte-backed object of `kind` with room for `size` bytes.
    ///
    /// `FixedBuffer` is zero-filled, `Buffer` starts empty with capacity
    /// `size`, `String` starts empty. Closures need a prototype and go
    /// through [`Heap::alloc_closure`].
    pub fn allocate(&mut self, kind: ObjectKind, size: usize) -> Result<HeapRef, RuntimeError> {
        match kind {
            ObjectKind::FixedBuffer => {
                self.reserve(size)?;
                let handle = self.insert(HeapData::FixedBuffer(vec![0; size]));
                Ok(HeapRef::new(kind, handle))
            }
            ObjectKind::Buffer => self.alloc_buffer(size),
            ObjectKind::String => {
                self.reserve(size)?;
                let handle = self.insert(HeapData::String(String::with_capacity(size)));
                Ok(HeapRef::new(kind, handle))
            }
            ObjectKind::Closure => Err(RuntimeError::runtime(
                "closures must be allocated with a prototype",
            )),
        }
    }

    pub fn alloc_string(&mut self, s: impl Into<String>) -> Result<HeapRef, RuntimeError> {
        let s = s.into();
        self.reserve(s.len())?;
        let handle = self.insert(HeapData::String(s));
        Ok(HeapRef::new(ObjectKind::String, handle))
    }

    /// Allocate an empty growable buffer with `capacity` bytes of storage.
    pub fn alloc_buffer(&mut self, capacity: usize) -> Result<HeapRef, RuntimeError> {
        // Header and storage are reserved together so neither is created
        // when the pair does not fit.
        self.reserve(capacity + std::mem::size_of::<GcBuffer>())?;
        let storage = self.insert(HeapData::FixedBuffer(vec![0; capacity]));
        let handle = self.insert(HeapData::Buffer(GcBuffer {
            size: 0,
            capacity,
            storage,
        }));
        Ok(HeapRef::new(ObjectKind::Buffer, handle))
    }

    pub fn alloc_closure(
        &mut self,
        prototype: Arc<Prototype>,
        upvalues: &[Value],
    ) -> Result<HeapRef, RuntimeError> {
        self.reserve(closure_size(upvalues.len()))?;
        let handle = self.insert(HeapData::Closure(GcClosure {
            prototype,
            upvalues: SmallVec::from_slice(upvalues),
        }));
        Ok(HeapRef::new(ObjectKind::Closure, handle))
    }

    /// Release one object immediately.
    pub fn free(&mut self, handle: Handle) {
        let Some(slot) = self.slots.get_mut(handle.index as usize) else {
            return;
        };
        if slot.generation != handle.generation {
            return;
        }
        if let Some(object) = slot.object.take() {
            slot.generation = slot.generation.wrapping_add(1);
            self.used -= object.size;
            self.stats.total_freed += 1;
            self.stats.total_bytes_freed += object.size as u64;
            self.free_list.push(handle.index);
        }
    }

    // ------------------------------------------------------------------
    // Access
    // ------------------------------------------------------------------

    fn object(&self, handle: Handle) -> Result<&GcObject, RuntimeError> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.object.as_ref())
            .ok_or(RuntimeError::StaleHandle)
    }

    fn object_mut(&mut self, handle: Handle) -> Result<&mut GcObject, RuntimeError> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.object.as_mut())
            .ok_or(RuntimeError::StaleHandle)
    }

    /// Resolve a reference, checking that its kind tag matches the slot.
    pub fn get(&self, r: HeapRef) -> Result<&HeapData, RuntimeError> {
        let data = &self.object(r.handle)?.data;
        if data.kind() != r.kind {
            return Err(RuntimeError::TypeMismatch {
                expected: r.kind.name(),
                found: data.kind().name(),
            });
        }
        Ok(data)
    }

    pub fn string(&self, r: HeapRef) -> Result<&str, RuntimeError> {
        match self.get(r)? {
            HeapData::String(s) => Ok(s),
            other => Err(kind_mismatch(ObjectKind::String, other)),
        }
    }

    pub fn closure(&self, r: HeapRef) -> Result<&GcClosure, RuntimeError> {
        match self.get(r)? {
            HeapData::Closure(c) => Ok(c),
            other => Err(kind_mismatch(ObjectKind::Closure, other)),
        }
    }

    pub fn fixed_buffer(&self, r: HeapRef) -> Result<&[u8], RuntimeError> {
        match self.get(r)? {
            HeapData::FixedBuffer(bytes) => Ok(bytes),
            other => Err(kind_mismatch(ObjectKind::FixedBuffer, other)),
        }
    }

    pub fn fixed_buffer_mut(&mut self, r: HeapRef) -> Result<&mut [u8], RuntimeError> {
        if r.kind != ObjectKind::FixedBuffer {
            return Err(RuntimeError::TypeMismatch {
                expected: ObjectKind::FixedBuffer.name(),
                found: r.kind.name(),
            });
        }
        Ok(self.region_mut(r.handle)?.as_mut_slice())
    }

    pub fn buffer(&self, r: HeapRef) -> Result<&GcBuffer, RuntimeError> {
        match self.get(r)? {
            HeapData::Buffer(b) => Ok(b),
            other => Err(kind_mismatch(ObjectKind::Buffer, other)),
        }
    }

    fn buffer_mut(&mut self, r: HeapRef) -> Result<&mut GcBuffer, RuntimeError> {
        if r.kind != ObjectKind::Buffer {
            return Err(RuntimeError::TypeMismatch {
                expected: ObjectKind::Buffer.name(),
                found: r.kind.name(),
            });
        }
        match &mut self.object_mut(r.handle)?.data {
            HeapData::Buffer(b) => Ok(b),
            other => Err(kind_mismatch(ObjectKind::Buffer, other)),
        }
    }

    fn region(&self, handle: Handle) -> Result<&[u8], RuntimeError> {
        match &self.object(handle)?.data {
            HeapData::FixedBuffer(bytes) => Ok(bytes),
            other => Err(kind_mismatch(ObjectKind::FixedBuffer, other)),
        }
    }

    fn region_mut(&mut self, handle: Handle) -> Result<&mut Vec<u8>, RuntimeError> {
        match &mut self.object_mut(handle)?.data {
            HeapData::FixedBuffer(bytes) => Ok(bytes),
            other => Err(kind_mismatch(ObjectKind::FixedBuffer, other)),
        }
    }

    // ------------------------------------------------------------------
    // Growable buffers
    // ------------------------------------------------------------------

    /// The live `size` bytes of a buffer.
    pub fn buffer_bytes(&self, r: HeapRef) -> Result<&[u8], RuntimeError> {
        let b = self.buffer(r)?;
        let size = b.size;
        Ok(&self.region(b.storage)?[..size])
    }

    pub fn buffer_bytes_mut(&mut self, r: HeapRef) -> Result<&mut [u8], RuntimeError> {
        let b = self.buffer(r)?;
        let (size, storage) = (b.size, b.storage);
        Ok(&mut self.region_mut(storage)?[..size])
    }

    /// Grow capacity to at least `capacity` bytes. Never shrinks.
    pub fn buffer_reserve(&mut self, r: HeapRef, capacity: usize) -> Result<(), RuntimeError> {
        if self.buffer(r)?.capacity < capacity {
            self.set_buffer_capacity(r, capacity)?;
        }
        Ok(())
    }

    /// Set the logical size, growing from `MIN_BUFFER_GROW` by doubling
    /// when the current capacity is too small. New bytes read as zero.
    pub fn buffer_resize(&mut self, r: HeapRef, size: usize) -> Result<(), RuntimeError> {
        let capacity = self.buffer(r)?.capacity;
        if capacity < size {
            let mut new_capacity = capacity.max(MIN_BUFFER_GROW);
            while new_capacity < size {
                new_capacity = new_capacity.saturating_mul(BUFFER_GROW_FACTOR);
            }
            self.set_buffer_capacity(r, new_capacity)?;
        }
        let b = self.buffer_mut(r)?;
        let old_size = b.size;
        b.size = size;
        let storage = b.storage;
        if size > old_size {
            // Bytes past the old size may hold data from an earlier shrink.
            self.region_mut(storage)?[old_size..size].fill(0);
        }
        Ok(())
    }

    /// Reallocate storage down to exactly the current size.
    pub fn buffer_shrink_to_fit(&mut self, r: HeapRef) -> Result<(), RuntimeError> {
        let size = self.buffer(r)?.size;
        self.set_buffer_capacity(r, size)
    }

    /// Move a buffer's storage to a fresh region of `capacity` bytes.
    ///
    /// The new region is reserved before anything changes; on failure the
    /// buffer keeps its old storage.
    fn set_buffer_capacity(&mut self, r: HeapRef, capacity: usize) -> Result<(), RuntimeError> {
        let (size, old_storage) = {
            let b = self.buffer(r)?;
            (b.size, b.storage)
        };
        debug_assert!(capacity >= size, "capacity below live size");
        self.reserve(capacity)?;

        let mut region = vec![0u8; capacity];
        region[..size].copy_from_slice(&self.region(old_storage)?[..size]);
        let new_storage = self.insert(HeapData::FixedBuffer(region));

        let b = self.buffer_mut(r)?;
        b.storage = new_storage;
        b.capacity = capacity;
        self.free(old_storage);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// Mark everything reachable from `roots` and free the rest.
    /// Returns the number of objects freed.
    pub fn collect<'a>(&mut self, roots: impl IntoIterator<Item = &'a Value>) -> usize {
        self.stats.collections += 1;
        let before = self.used;

        for slot in &mut self.slots {
            slot.marked = false;
        }

        let mut worklist: Vec<Handle> = roots
            .into_iter()
            .filter_map(|v| v.heap_ref())
            .map(|r| r.handle)
            .collect();

        while let Some(handle) = worklist.pop() {
            let Some(slot) = self.slots.get_mut(handle.index as usize) else {
                continue;
            };
            if slot.generation != handle.generation || slot.marked {
                continue;
            }
            if let Some(object) = &slot.object {
                slot.marked = true;
                object.data.gc_pointers(&mut worklist);
            }
        }

        let mut freed = 0;
        for index in 0..self.slots.len() {
            let slot = &self.slots[index];
            if slot.object.is_some() && !slot.marked {
                let handle = Handle::new(index as u32, slot.generation);
                self.free(handle);
                freed += 1;
            }
        }

        self.bytes_since_gc = 0;
        debug!(
            collection = self.stats.collections,
            freed,
            bytes_freed = before - self.used,
            live = self.used,
            "heap collected"
        );
        freed
    }

    /// Drop every object.
    pub fn clear(&mut self) {
        self.slots = Vec::new();
        self.free_list = Vec::new();
        self.used = 0;
        self.bytes_since_gc = 0;
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("live_objects", &self.live_objects())
            .field("used", &self.used)
            .field("limit", &self.config.heap_limit)
            .finish()
    }
}

fn kind_mismatch(expected: ObjectKind, found: &HeapData) -> RuntimeError {
    RuntimeError::TypeMismatch {
        expected: expected.name(),
        found: found.kind().name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_heap(limit: usize) -> Heap {
        Heap::with_config(GcConfig {
            heap_limit: limit,
            gc_threshold: limit,
        })
    }

    fn fill(heap: &mut Heap, r: HeapRef, bytes: &[u8]) {
        heap.buffer_resize(r, bytes.len()).unwrap();
        heap.buffer_bytes_mut(r).unwrap().copy_from_slice(bytes);
    }

    // ============================================================
    // Allocation
    // ============================================================

    #[test]
    fn test_alloc_string() {
        let mut heap = Heap::new();
        let r = heap.alloc_string("hello").unwrap();
        assert_eq!(heap.string(r).unwrap(), "hello");
        assert_eq!(heap.live_objects(), 1);
        assert_eq!(heap.used_bytes(), 5);
    }

    #[test]
    fn test_allocate_fixed_buffer_is_zeroed() {
        let mut heap = Heap::new();
        let r = heap.allocate(ObjectKind::FixedBuffer, 16).unwrap();
        assert_eq!(heap.fixed_buffer(r).unwrap(), &[0u8; 16][..]);
    }

    #[test]
    fn test_allocate_closure_kind_is_rejected() {
        let mut heap = Heap::new();
        assert!(heap.allocate(ObjectKind::Closure, 0).is_err());
    }

    #[test]
    fn test_kind_tag_is_checked() {
        let mut heap = Heap::new();
        let r = heap.alloc_string("x").unwrap();
        let wrong = HeapRef::new(ObjectKind::Buffer, r.handle);
        assert!(matches!(
            heap.buffer(wrong),
            Err(RuntimeError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_out_of_memory_leaves_heap_unchanged() {
        let mut heap = small_heap(256);
        let a = heap.alloc_string("keep me").unwrap();
        let b = heap.alloc_buffer(32).unwrap();
        fill(&mut heap, b, b"abc");
        let used = heap.used_bytes();
        let live = heap.live_objects();

        let err = heap.allocate(ObjectKind::FixedBuffer, 1024).unwrap_err();
        assert!(matches!(err, RuntimeError::OutOfMemory { requested: 1024, .. }));
        assert!(heap.alloc_buffer(1024).is_err());

        assert_eq!(heap.used_bytes(), used);
        assert_eq!(heap.live_objects(), live);
        assert_eq!(heap.string(a).unwrap(), "keep me");
        assert_eq!(heap.buffer_bytes(b).unwrap(), b"abc");
    }

    // ============================================================
    // Buffers
    // ============================================================

    #[test]
    fn test_resize_grows_from_minimum_by_doubling() {
        let mut heap = Heap::new();
        let r = heap.alloc_buffer(0).unwrap();
        heap.buffer_resize(r, 10).unwrap();
        assert_eq!(heap.buffer(r).unwrap().capacity, MIN_BUFFER_GROW);
        heap.buffer_resize(r, 65).unwrap();
        assert_eq!(heap.buffer(r).unwrap().capacity, 128);
        heap.buffer_resize(r, 300).unwrap();
        assert_eq!(heap.buffer(r).unwrap().capacity, 512);
        assert_eq!(heap.buffer(r).unwrap().size, 300);
    }

    #[test]
    fn test_resize_preserves_prefix() {
        let mut heap = Heap::new();
        let r = heap.alloc_buffer(4).unwrap();
        fill(&mut heap, r, &[1, 2, 3, 4]);
        let old_storage = heap.buffer(r).unwrap().storage;

        heap.buffer_resize(r, 100).unwrap();
        let b = heap.buffer(r).unwrap();
        assert_eq!(b.size, 100);
        assert!(b.capacity >= 100);
        assert_ne!(b.storage, old_storage);
        assert_eq!(&heap.buffer_bytes(r).unwrap()[..4], &[1, 2, 3, 4]);
        assert!(heap.buffer_bytes(r).unwrap()[4..].iter().all(|b| *b == 0));

        // The old region is released and its handle is stale.
        assert_eq!(heap.fixed_buffer(HeapRef::new(ObjectKind::FixedBuffer, old_storage)),
            Err(RuntimeError::StaleHandle));
    }

    #[test]
    fn test_shrink_then_grow_reads_zero() {
        let mut heap = Heap::new();
        let r = heap.alloc_buffer(8).unwrap();
        fill(&mut heap, r, &[9; 8]);
        heap.buffer_resize(r, 2).unwrap();
        heap.buffer_resize(r, 8).unwrap();
        assert_eq!(heap.buffer_bytes(r).unwrap(), &[9, 9, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_reserve_never_shrinks() {
        let mut heap = Heap::new();
        let r = heap.alloc_buffer(100).unwrap();
        heap.buffer_reserve(r, 10).unwrap();
        assert_eq!(heap.buffer(r).unwrap().capacity, 100);
        heap.buffer_reserve(r, 150).unwrap();
        assert_eq!(heap.buffer(r).unwrap().capacity, 150);
    }

    #[test]
    fn test_shrink_to_fit() {
        let mut heap = Heap::new();
        let r = heap.alloc_buffer(100).unwrap();
        fill(&mut heap, r, b"hello");
        heap.buffer_shrink_to_fit(r).unwrap();
        let b = heap.buffer(r).unwrap();
        assert_eq!(b.capacity, 5);
        assert_eq!(heap.buffer_bytes(r).unwrap(), b"hello");
    }

    #[test]
    fn test_failed_growth_keeps_old_storage() {
        let mut heap = small_heap(200);
        let r = heap.alloc_buffer(16).unwrap();
        fill(&mut heap, r, b"data");
        let before = heap.buffer(r).unwrap().clone();
        assert!(heap.buffer_resize(r, 4096).is_err());
        assert_eq!(heap.buffer(r).unwrap(), &before);
        assert_eq!(heap.buffer_bytes(r).unwrap(), b"data");
    }

    // ============================================================
    // Collection
    // ============================================================

    #[test]
    fn test_collect_frees_unreachable() {
        let mut heap = Heap::new();
        let keep = heap.alloc_string("keep").unwrap();
        let _drop = heap.alloc_string("drop").unwrap();
        let roots = [Value::Heap(keep), Value::Int(3)];

        let freed = heap.collect(roots.iter());
        assert_eq!(freed, 1);
        assert_eq!(heap.live_objects(), 1);
        assert_eq!(heap.string(keep).unwrap(), "keep");
        assert_eq!(heap.used_bytes(), 4);
    }

    #[test]
    fn test_collect_traces_buffer_storage_and_upvalues() {
        let mut heap = Heap::new();
        let buf = heap.alloc_buffer(8).unwrap();
        let proto = Arc::new(Prototype::default());
        let clo = heap.alloc_closure(proto, &[Value::Heap(buf)]).unwrap();

        heap.collect([Value::Heap(clo)].iter());
        assert_eq!(heap.live_objects(), 3);
        assert!(heap.buffer(buf).is_ok());

        heap.collect(std::iter::empty());
        assert_eq!(heap.live_objects(), 0);
        assert_eq!(heap.used_bytes(), 0);
    }

    #[test]
    fn test_reused_slot_detects_stale_handle() {
        let mut heap = Heap::new();
        let old = heap.alloc_string("old").unwrap();
        heap.collect(std::iter::empty());
        let new = heap.alloc_string("new").unwrap();
        assert_eq!(old.handle.index(), new.handle.index());
        assert_eq!(heap.string(old), Err(RuntimeError::StaleHandle));
        assert_eq!(heap.string(new).unwrap(), "new");
    }
}
