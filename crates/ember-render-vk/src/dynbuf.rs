// SPDX-License-Identifier: CEPL-1.0
//! Per-frame-slot bump arenas for vertex, index and uniform data.
//!
//! Each kind owns one buffer per frame slot. Offsets rewind when a slot is
//! reused, which only happens after that slot's fence has signaled. When a
//! request does not fit, every instance of the kind is replaced by larger
//! buffers and the old ones go to the graveyard.

use crate::descriptors;
use crate::device::Device;
use crate::error::{CheckVk, VkError, VkResult};
use crate::fan::{FanPrefix, INITIAL_FAN_TRIANGLES};
use crate::graveyard::Graveyard;
use crate::FRAMES_IN_FLIGHT;
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::info;

pub const VERTEX_BUFFER_INITIAL: u64 = 1 << 20;
pub const INDEX_BUFFER_INITIAL: u64 = 2 << 10;
pub const UNIFORM_BUFFER_INITIAL: u64 = 2 << 20;
/// Range of every dynamic uniform descriptor; also the largest uniform block.
pub const UNIFORM_ALLOC_SIZE: u64 = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DynamicKind {
    Vertex,
    Index,
    Uniform,
}

impl DynamicKind {
    pub const ALL: [DynamicKind; 3] = [DynamicKind::Vertex, DynamicKind::Index, DynamicKind::Uniform];

    pub fn alignment(self) -> u64 {
        match self {
            DynamicKind::Vertex => 1,
            DynamicKind::Index => 4,
            DynamicKind::Uniform => 256,
        }
    }

    pub fn initial_capacity(self) -> u64 {
        match self {
            DynamicKind::Vertex => VERTEX_BUFFER_INITIAL,
            DynamicKind::Index => INDEX_BUFFER_INITIAL,
            DynamicKind::Uniform => UNIFORM_BUFFER_INITIAL,
        }
    }

    pub fn usage(self) -> vk::BufferUsageFlags {
        match self {
            DynamicKind::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            DynamicKind::Index => vk::BufferUsageFlags::INDEX_BUFFER,
            DynamicKind::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    fn name(self) -> &'static str {
        match self {
            DynamicKind::Vertex => "vertex",
            DynamicKind::Index => "index",
            DynamicKind::Uniform => "uniform",
        }
    }
}

pub fn align_up(v: u64, align: u64) -> u64 {
    v.next_multiple_of(align.max(1))
}

/// `max(2 * current, nextPow2(request))`, doubled further while
/// `end` (aligned offset + request) would still overflow.
pub fn grown_capacity(current: u64, request: u64, end: u64) -> u64 {
    let mut cap = (current * 2).max(request.next_power_of_two());
    while cap < end {
        cap *= 2;
    }
    cap
}

/// One persistently mapped buffer instance.
pub struct ArenaBuffer<M> {
    pub buffer: vk::Buffer,
    /// Dynamic UBO set for uniform arenas, null otherwise.
    pub descriptor_set: vk::DescriptorSet,
    pub capacity: u64,
    pub mapped: NonNull<u8>,
    pub memory: M,
}

/// Creates and destroys arena buffers and keeps host writes visible.
pub trait ArenaBackend {
    type Memory;

    fn create(&mut self, kind: DynamicKind, capacity: u64) -> VkResult<ArenaBuffer<Self::Memory>>;
    fn destroy(&mut self, buffer: ArenaBuffer<Self::Memory>);
    /// Makes `[0, len)` host writes visible to the device.
    fn flush(&self, buffer: &ArenaBuffer<Self::Memory>, len: u64) -> VkResult<()>;
    /// Makes device writes visible to the host before reuse.
    fn invalidate(&self, buffer: &ArenaBuffer<Self::Memory>, len: u64) -> VkResult<()>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    pub current: u64,
    pub peak: u64,
    pub capacity: u64,
}

impl Usage {
    fn record(&mut self, current: u64) {
        self.current = current;
        self.peak = self.peak.max(current);
    }
}

/// Diagnostics for an on-screen overlay. Byte counts for the arenas, index
/// counts for the fan.
#[derive(Clone, Copy, Debug, Default)]
pub struct BufferStats {
    pub vertex: Usage,
    pub index: Usage,
    pub uniform: Usage,
    pub fan: Usage,
}

/// A region handed out for the current frame. The pointer stays valid until
/// the slot comes around again, even across growth, because retired
/// buffers are only destroyed once no frame can reference them.
#[derive(Debug)]
pub struct Suballocation {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub descriptor_set: vk::DescriptorSet,
    pub len: u64,
    ptr: NonNull<u8>,
}

impl Suballocation {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn write_bytes(&self, bytes: &[u8]) {
        debug_assert!(bytes.len() as u64 <= self.len);
        let n = bytes.len().min(self.len as usize);
        // SAFETY: the arena reserved `len` bytes at `ptr` for this frame.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr(), n) };
    }

    pub fn write<T: bytemuck::Pod>(&self, data: &[T]) {
        self.write_bytes(bytemuck::cast_slice(data));
    }

    /// Offset for the dynamic uniform descriptor. Dynamic offsets are 32-bit,
    /// so uniform arenas are bounded at 4 GiB.
    pub fn dynamic_offset(&self) -> u32 {
        let offset = u32::try_from(self.offset);
        debug_assert!(offset.is_ok(), "dynamic offset {} past 4 GiB", self.offset);
        offset.unwrap_or(u32::MAX)
    }
}

struct Arena<M> {
    kind: DynamicKind,
    instances: Vec<ArenaBuffer<M>>,
    capacity: u64,
    offset: u64,
    usage: Usage,
}

pub struct DynamicBuffers<B: ArenaBackend> {
    backend: B,
    arenas: [Arena<B::Memory>; 3],
    graveyard: Graveyard<ArenaBuffer<B::Memory>>,
    fan: FanPrefix,
    fan_usage: Usage,
    slot: usize,
}

impl<B: ArenaBackend> DynamicBuffers<B> {
    pub fn new(mut backend: B) -> VkResult<Self> {
        let fan = FanPrefix::new(INITIAL_FAN_TRIANGLES);
        let mut make = |kind: DynamicKind| -> VkResult<Arena<B::Memory>> {
            let capacity = kind.initial_capacity();
            let instances = (0..FRAMES_IN_FLIGHT)
                .map(|_| backend.create(kind, capacity))
                .collect::<VkResult<Vec<_>>>()?;
            Ok(Arena {
                kind,
                instances,
                capacity,
                offset: 0,
                usage: Usage {
                    capacity,
                    ..Default::default()
                },
            })
        };
        let arenas = [
            make(DynamicKind::Vertex)?,
            make(DynamicKind::Index)?,
            make(DynamicKind::Uniform)?,
        ];
        let mut bufs = Self {
            backend,
            arenas,
            graveyard: Graveyard::new(),
            fan,
            fan_usage: Usage {
                capacity: fan.index_capacity() as u64,
                ..Default::default()
            },
            slot: 0,
        };
        bufs.write_fan_prefix()?;
        bufs.arenas[DynamicKind::Index.index()].offset = fan.reserved_bytes();
        Ok(bufs)
    }

    /// Rewinds the slot about to be recorded. Its fence must have signaled.
    pub fn begin_frame(&mut self, slot: usize) -> VkResult<()> {
        self.slot = slot % FRAMES_IN_FLIGHT;
        let prefix = self.fan.reserved_bytes();
        for arena in &mut self.arenas {
            arena.offset = if arena.kind == DynamicKind::Index {
                prefix
            } else {
                0
            };
            arena.usage.current = 0;
            self.backend
                .invalidate(&arena.instances[self.slot], arena.capacity)?;
        }
        self.fan_usage.current = 0;
        Ok(())
    }

    /// Advances the graveyard by one completed frame and destroys what it
    /// releases. Returns how many buffers were destroyed.
    pub fn release_retired(&mut self) -> usize {
        let dead = self.graveyard.advance();
        let n = dead.len();
        for b in dead {
            self.backend.destroy(b);
        }
        n
    }

    pub fn allocate(&mut self, kind: DynamicKind, size: u64) -> VkResult<Suballocation> {
        if kind == DynamicKind::Uniform && size > UNIFORM_ALLOC_SIZE {
            return Err(VkError::UniformTooLarge {
                size,
                max: UNIFORM_ALLOC_SIZE,
            });
        }
        let align = kind.alignment();
        let padded = align_up(size.max(1), align);
        // a uniform descriptor always reads a full range from its offset
        let reserve = if kind == DynamicKind::Uniform {
            UNIFORM_ALLOC_SIZE.max(padded)
        } else {
            padded
        };

        let offset = align_up(self.arenas[kind.index()].offset, align);
        if offset + reserve > self.arenas[kind.index()].capacity {
            let cur = self.arenas[kind.index()].capacity;
            let cap = grown_capacity(cur, reserve, offset + reserve);
            info!(
                "vk: growing {} buffers {} -> {} bytes",
                kind.name(),
                cur,
                cap
            );
            self.replace_instances(kind, cap)?;
        }

        let slot = self.slot;
        let arena = &mut self.arenas[kind.index()];
        arena.offset = offset + padded;
        let used = arena.usage.current + padded;
        arena.usage.record(used);
        let inst = &arena.instances[slot];
        // SAFETY: offset + padded <= capacity, so the pointer stays in the mapping.
        let ptr = unsafe { NonNull::new_unchecked(inst.mapped.as_ptr().add(offset as usize)) };
        Ok(Suballocation {
            buffer: inst.buffer,
            offset,
            descriptor_set: inst.descriptor_set,
            len: size,
            ptr,
        })
    }

    pub fn vertex(&mut self, size: u64) -> VkResult<Suballocation> {
        self.allocate(DynamicKind::Vertex, size)
    }

    pub fn index(&mut self, size: u64) -> VkResult<Suballocation> {
        self.allocate(DynamicKind::Index, size)
    }

    pub fn uniform(&mut self, size: u64) -> VkResult<Suballocation> {
        self.allocate(DynamicKind::Uniform, size)
    }

    /// Index buffer whose head holds at least `index_count` fan indices.
    pub fn triangle_fan(&mut self, index_count: u32) -> VkResult<vk::Buffer> {
        self.fan_usage.record(self.fan_usage.current.max(index_count as u64));
        if let Some(grown) = self.fan.grown_for(index_count)? {
            info!(
                "vk: growing triangle fan {} -> {} triangles",
                self.fan.triangles(),
                grown.triangles()
            );
            let arena = &self.arenas[DynamicKind::Index.index()];
            let tail = arena.offset.saturating_sub(self.fan.reserved_bytes());
            let need = grown.reserved_bytes() + tail;
            let mut cap = arena.capacity;
            while cap < need {
                cap *= 2;
            }
            self.fan = grown;
            self.fan_usage.capacity = grown.index_capacity() as u64;
            self.replace_instances(DynamicKind::Index, cap)?;
            let arena = &mut self.arenas[DynamicKind::Index.index()];
            arena.offset = arena.offset.max(grown.reserved_bytes());
        }
        Ok(self.arenas[DynamicKind::Index.index()].instances[self.slot].buffer)
    }

    /// Flushes this slot's written ranges before submission.
    pub fn flush(&self) -> VkResult<()> {
        for arena in &self.arenas {
            if arena.offset > 0 {
                self.backend
                    .flush(&arena.instances[self.slot], arena.offset)?;
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            vertex: self.arenas[DynamicKind::Vertex.index()].usage,
            index: self.arenas[DynamicKind::Index.index()].usage,
            uniform: self.arenas[DynamicKind::Uniform.index()].usage,
            fan: self.fan_usage,
        }
    }

    pub fn capacity(&self, kind: DynamicKind) -> u64 {
        self.arenas[kind.index()].capacity
    }

    pub fn fan_prefix(&self) -> FanPrefix {
        self.fan
    }

    pub fn retired(&self) -> usize {
        self.graveyard.pending()
    }

    /// Swaps in fresh instances of `capacity`; the old set is retired.
    fn replace_instances(&mut self, kind: DynamicKind, capacity: u64) -> VkResult<()> {
        let fresh = (0..FRAMES_IN_FLIGHT)
            .map(|_| self.backend.create(kind, capacity))
            .collect::<VkResult<Vec<_>>>()?;
        let arena = &mut self.arenas[kind.index()];
        let old = std::mem::replace(&mut arena.instances, fresh);
        arena.capacity = capacity;
        arena.usage.capacity = capacity;
        for b in old {
            self.graveyard.retire(b);
        }
        if kind == DynamicKind::Index {
            self.write_fan_prefix()?;
        }
        Ok(())
    }

    fn write_fan_prefix(&mut self) -> VkResult<()> {
        let len = self.fan.reserved_bytes();
        for inst in &self.arenas[DynamicKind::Index.index()].instances {
            debug_assert!(inst.capacity >= len);
            // SAFETY: index instances are always at least `len` bytes.
            unsafe { self.fan.write_to(inst.mapped.as_ptr()) };
            self.backend.flush(inst, len)?;
        }
        Ok(())
    }

    /// Destroys everything, retired or live. The device must be idle.
    pub fn destroy(&mut self) {
        for b in self.graveyard.drain_all() {
            self.backend.destroy(b);
        }
        for arena in &mut self.arenas {
            for b in arena.instances.drain(..) {
                self.backend.destroy(b);
            }
        }
    }
}

impl<B: ArenaBackend> Drop for DynamicBuffers<B> {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Host-visible arenas allocated through the device allocator.
pub struct VkArenaBackend {
    device: Arc<Device>,
    pool: vk::DescriptorPool,
    ubo_layout: vk::DescriptorSetLayout,
    atom: u64,
}

impl VkArenaBackend {
    pub fn new(
        device: Arc<Device>,
        pool: vk::DescriptorPool,
        ubo_layout: vk::DescriptorSetLayout,
    ) -> Self {
        let atom = device.limits().non_coherent_atom_size.max(1);
        Self {
            device,
            pool,
            ubo_layout,
            atom,
        }
    }

    fn range(&self, buffer: &ArenaBuffer<Allocation>) -> Option<vk::MappedMemoryRange<'static>> {
        let alloc = &buffer.memory;
        if alloc
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            return None;
        }
        let offset = alloc.offset() - alloc.offset() % self.atom;
        Some(vk::MappedMemoryRange {
            s_type: vk::StructureType::MAPPED_MEMORY_RANGE,
            memory: unsafe { alloc.memory() },
            offset,
            size: vk::WHOLE_SIZE,
            ..Default::default()
        })
    }
}

impl ArenaBackend for VkArenaBackend {
    type Memory = Allocation;

    fn create(&mut self, kind: DynamicKind, capacity: u64) -> VkResult<ArenaBuffer<Allocation>> {
        let d = self.device.raw();
        let bci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size: capacity,
            usage: kind.usage(),
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let buffer = unsafe { d.create_buffer(&bci, None) }.check("vkCreateBuffer")?;
        let requirements = unsafe { d.get_buffer_memory_requirements(buffer) };
        let memory = match self.device.allocate(&AllocationCreateDesc {
            name: kind.name(),
            requirements,
            location: MemoryLocation::CpuToGpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(m) => m,
            Err(e) => {
                unsafe { d.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        let bound = unsafe { d.bind_buffer_memory(buffer, memory.memory(), memory.offset()) }
            .check("vkBindBufferMemory");
        let mapped = memory.mapped_ptr().map(|p| p.cast::<u8>());
        let (mapped, descriptor_set) = match (bound, mapped) {
            (Ok(()), Some(mapped)) => {
                let set = if kind == DynamicKind::Uniform {
                    descriptors::allocate_set(&self.device, self.pool, self.ubo_layout)
                        .inspect(|&set| {
                            descriptors::write_dynamic_ubo(
                                &self.device,
                                set,
                                buffer,
                                UNIFORM_ALLOC_SIZE,
                            )
                        })
                } else {
                    Ok(vk::DescriptorSet::null())
                };
                match set {
                    Ok(set) => (mapped, set),
                    Err(e) => {
                        unsafe { d.destroy_buffer(buffer, None) };
                        self.device.free(memory);
                        return Err(e);
                    }
                }
            }
            (bound, _) => {
                unsafe { d.destroy_buffer(buffer, None) };
                self.device.free(memory);
                bound?;
                return Err(VkError::Api {
                    call: "vkMapMemory",
                    result: vk::Result::ERROR_MEMORY_MAP_FAILED,
                });
            }
        };
        Ok(ArenaBuffer {
            buffer,
            descriptor_set,
            capacity,
            mapped,
            memory,
        })
    }

    fn destroy(&mut self, buffer: ArenaBuffer<Allocation>) {
        if buffer.descriptor_set != vk::DescriptorSet::null() {
            descriptors::free_set(&self.device, self.pool, buffer.descriptor_set);
        }
        unsafe { self.device.raw().destroy_buffer(buffer.buffer, None) };
        self.device.free(buffer.memory);
    }

    fn flush(&self, buffer: &ArenaBuffer<Allocation>, _len: u64) -> VkResult<()> {
        match self.range(buffer) {
            Some(r) => unsafe { self.device.raw().flush_mapped_memory_ranges(&[r]) }
                .check("vkFlushMappedMemoryRanges"),
            None => Ok(()),
        }
    }

    fn invalidate(&self, buffer: &ArenaBuffer<Allocation>, _len: u64) -> VkResult<()> {
        match self.range(buffer) {
            Some(r) => unsafe { self.device.raw().invalidate_mapped_memory_ranges(&[r]) }
                .check("vkInvalidateMappedMemoryRanges"),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Log {
        created: Vec<(DynamicKind, u64, u64)>,
        destroyed: Vec<u64>,
        flushes: usize,
    }

    /// Heap-backed arenas; buffer handles are sequential ids.
    struct FakeBackend {
        next: u64,
        log: Rc<RefCell<Log>>,
    }

    impl FakeBackend {
        fn new() -> (Self, Rc<RefCell<Log>>) {
            let log = Rc::new(RefCell::new(Log::default()));
            (
                Self {
                    next: 1,
                    log: log.clone(),
                },
                log,
            )
        }
    }

    impl ArenaBackend for FakeBackend {
        type Memory = Vec<u8>;

        fn create(&mut self, kind: DynamicKind, capacity: u64) -> VkResult<ArenaBuffer<Vec<u8>>> {
            let id = self.next;
            self.next += 1;
            self.log.borrow_mut().created.push((kind, capacity, id));
            let mut memory = vec![0xAAu8; capacity as usize];
            let mapped = NonNull::new(memory.as_mut_ptr()).unwrap();
            Ok(ArenaBuffer {
                buffer: vk::Buffer::from_raw(id),
                descriptor_set: if kind == DynamicKind::Uniform {
                    vk::DescriptorSet::from_raw(id)
                } else {
                    vk::DescriptorSet::null()
                },
                capacity,
                mapped,
                memory,
            })
        }

        fn destroy(&mut self, buffer: ArenaBuffer<Vec<u8>>) {
            self.log.borrow_mut().destroyed.push(buffer.buffer.as_raw());
        }

        fn flush(&self, _buffer: &ArenaBuffer<Vec<u8>>, _len: u64) -> VkResult<()> {
            self.log.borrow_mut().flushes += 1;
            Ok(())
        }

        fn invalidate(&self, _buffer: &ArenaBuffer<Vec<u8>>, _len: u64) -> VkResult<()> {
            Ok(())
        }
    }

    fn buffers() -> (DynamicBuffers<FakeBackend>, Rc<RefCell<Log>>) {
        let (backend, log) = FakeBackend::new();
        let mut b = DynamicBuffers::new(backend).unwrap();
        b.begin_frame(0).unwrap();
        (b, log)
    }

    fn prefix_of(b: &DynamicBuffers<FakeBackend>, slot: usize) -> Vec<u16> {
        let arena = &b.arenas[DynamicKind::Index.index()];
        let bytes = &arena.instances[slot].memory[..b.fan.index_capacity() as usize * 2];
        bytemuck::pod_collect_to_vec(bytes)
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let (mut b, _) = buffers();
        let sizes = [1u64, 3, 17, 255, 256, 257, 1000, 4, 9, 64];
        for kind in DynamicKind::ALL {
            let mut ranges: Vec<(u64, u64)> = Vec::new();
            for &s in sizes.iter().cycle().take(40) {
                let size = if kind == DynamicKind::Uniform { s.min(UNIFORM_ALLOC_SIZE) } else { s };
                let a = b.allocate(kind, size).unwrap();
                assert_eq!(a.offset % kind.alignment(), 0, "{kind:?} misaligned");
                assert!(a.offset + a.len <= b.capacity(kind));
                for &(o, l) in &ranges {
                    assert!(a.offset >= o + l || a.offset + a.len <= o, "{kind:?} overlap");
                }
                ranges.push((a.offset, a.len));
            }
        }
    }

    #[test]
    fn index_data_never_overlaps_fan_prefix() {
        let (mut b, _) = buffers();
        let a = b.index(6).unwrap();
        assert!(a.offset >= b.fan_prefix().reserved_bytes());
        b.begin_frame(1).unwrap();
        assert_eq!(b.index(2).unwrap().offset, b.fan_prefix().reserved_bytes());
    }

    #[test]
    fn vertex_growth_scenario() {
        let (mut b, log) = buffers();
        let before: Vec<u64> = b.arenas[0].instances.iter().map(|i| i.buffer.as_raw()).collect();

        let a = b.vertex(3 << 19).unwrap(); // 1.5 MiB
        assert_eq!(b.capacity(DynamicKind::Vertex), 2 << 20);
        assert_eq!(a.offset, 0);
        assert_eq!(b.retired(), FRAMES_IN_FLIGHT);
        assert!(!before.contains(&a.buffer.as_raw()));
        assert!(log.borrow().destroyed.is_empty());

        // no further growth until usage passes the new capacity
        let created = log.borrow().created.len();
        b.vertex(256 << 10).unwrap();
        assert_eq!(log.borrow().created.len(), created);
    }

    #[test]
    fn growth_accounts_for_current_offset() {
        let (mut b, _) = buffers();
        b.vertex(900 << 10).unwrap();
        let a = b.vertex(1200 << 10).unwrap();
        // max(2 MiB, nextPow2(1.2 MiB)) = 2 MiB, but 900K + 1.2M needs 4 MiB
        assert_eq!(b.capacity(DynamicKind::Vertex), 4 << 20);
        assert_eq!(a.offset, 900 << 10);
        assert!(a.offset + a.len <= b.capacity(DynamicKind::Vertex));
    }

    #[test]
    fn dynamic_offset_is_the_arena_offset() {
        let (mut b, _) = buffers();
        b.uniform(16).unwrap();
        let a = b.uniform(16).unwrap();
        assert_eq!(u64::from(a.dynamic_offset()), a.offset);
        assert_ne!(a.dynamic_offset(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "past 4 GiB")]
    fn dynamic_offset_past_u32_is_caught() {
        let (mut b, _) = buffers();
        let mut a = b.uniform(16).unwrap();
        a.offset = u64::from(u32::MAX) + 256;
        a.dynamic_offset();
    }

    #[test]
    fn uniform_reserves_full_descriptor_range() {
        let (mut b, _) = buffers();
        let cap = b.capacity(DynamicKind::Uniform);
        let n = (cap - UNIFORM_ALLOC_SIZE) / 256 + 2;
        for _ in 0..n {
            let a = b.uniform(64).unwrap();
            assert!(a.offset + UNIFORM_ALLOC_SIZE <= b.capacity(DynamicKind::Uniform));
            assert_ne!(a.descriptor_set, vk::DescriptorSet::null());
        }
        assert!(b.capacity(DynamicKind::Uniform) > cap);
        assert!(matches!(
            b.uniform(UNIFORM_ALLOC_SIZE + 1),
            Err(VkError::UniformTooLarge { .. })
        ));
    }

    #[test]
    fn retired_buffers_destroyed_after_graveyard_depth() {
        let (mut b, log) = buffers();
        b.vertex(3 << 20).unwrap();
        for _ in 0..crate::graveyard::GRAVEYARD_DEPTH - 1 {
            assert_eq!(b.release_retired(), 0);
        }
        assert_eq!(b.release_retired(), FRAMES_IN_FLIGHT);
        assert_eq!(log.borrow().destroyed.len(), FRAMES_IN_FLIGHT);
    }

    #[test]
    fn fan_prefix_survives_index_growth() {
        let (mut b, _) = buffers();
        let expect = b.fan_prefix().indices();
        b.index(8 << 10).unwrap();
        assert!(b.capacity(DynamicKind::Index) > INDEX_BUFFER_INITIAL);
        for slot in 0..FRAMES_IN_FLIGHT {
            assert_eq!(prefix_of(&b, slot), expect);
        }
    }

    #[test]
    fn fan_rebuild_updates_every_instance() {
        let (mut b, log) = buffers();
        b.index(100).unwrap();
        let old = b.triangle_fan(300).unwrap();
        assert_eq!(b.retired(), 0);

        let new = b.triangle_fan(3000).unwrap();
        assert_ne!(old, new);
        assert_eq!(b.fan_prefix().triangles(), 1600);
        assert_eq!(b.retired(), FRAMES_IN_FLIGHT);
        let expect = b.fan_prefix().indices();
        for slot in 0..FRAMES_IN_FLIGHT {
            assert_eq!(prefix_of(&b, slot), expect);
        }
        // later index data lands after the larger prefix
        assert!(b.index(4).unwrap().offset >= b.fan_prefix().reserved_bytes());
        assert!(log.borrow().flushes >= FRAMES_IN_FLIGHT);

        let s = b.stats();
        assert_eq!(s.fan.current, 3000);
        assert_eq!(s.fan.capacity, 4800);
    }

    #[test]
    fn usage_counters_reset_per_frame_but_keep_peak() {
        let (mut b, _) = buffers();
        b.vertex(100).unwrap();
        b.vertex(50).unwrap();
        assert_eq!(b.stats().vertex.current, 150);
        b.begin_frame(1).unwrap();
        b.vertex(10).unwrap();
        let s = b.stats().vertex;
        assert_eq!((s.current, s.peak, s.capacity), (10, 150, VERTEX_BUFFER_INITIAL));
    }

    #[test]
    fn suballocation_writes_land_in_slot_instance() {
        let (mut b, _) = buffers();
        b.begin_frame(1).unwrap();
        let a = b.vertex(8).unwrap();
        a.write(&[1.0f32, 2.0]);
        let mem = &b.arenas[0].instances[1].memory;
        let got: Vec<f32> =
            bytemuck::pod_collect_to_vec(&mem[a.offset as usize..a.offset as usize + 8]);
        assert_eq!(got, vec![1.0, 2.0]);
    }

    #[test]
    fn grown_capacity_rules() {
        assert_eq!(grown_capacity(1 << 20, 3 << 19, 3 << 19), 2 << 20);
        assert_eq!(grown_capacity(1 << 20, 5 << 20, 5 << 20), 8 << 20);
        assert_eq!(grown_capacity(2048, 100, 2148), 4096);
        assert_eq!(grown_capacity(2048, 100, 5000), 8192);
        assert_eq!(align_up(5, 4), 8);
        assert_eq!(align_up(7, 1), 7);
    }
}
