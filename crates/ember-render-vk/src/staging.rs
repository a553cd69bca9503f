// SPDX-License-Identifier: CEPL-1.0
//! Upload ring: a pair of host-visible buffers, each with its own command
//! buffer and fence. Writes land in the active instance; when it fills up it
//! is submitted and the next one takes over, waiting for its previous
//! submission first.

use crate::device::Device;
use crate::dynbuf::align_up;
use crate::error::{CheckVk, VkError, VkResult};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::debug;

pub const STAGING_BUFFER_MAX: u64 = 8 << 20;
pub const STAGING_INSTANCES: usize = 2;

/// GPU side of the ring, addressed by instance index.
pub trait StagingDevice {
    fn command_buffer(&self, index: usize) -> vk::CommandBuffer;
    fn buffer(&self, index: usize) -> vk::Buffer;
    fn mapped(&self, index: usize) -> NonNull<u8>;
    /// Record the upload barrier, end recording and submit with the fence.
    fn submit(&mut self, index: usize) -> VkResult<()>;
    /// Wait for the fence, reset it, and begin a fresh recording.
    fn restart(&mut self, index: usize) -> VkResult<()>;
}

/// A writable region of the active staging buffer. Copy commands reading it
/// go into `command_buffer`.
#[derive(Clone, Copy, Debug)]
pub struct StagingRegion {
    pub ptr: NonNull<u8>,
    pub command_buffer: vk::CommandBuffer,
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub len: u64,
}

impl StagingRegion {
    pub fn write(&self, bytes: &[u8]) {
        let n = bytes.len().min(self.len as usize);
        // SAFETY: the region lies inside the persistent mapping and the
        // instance has not been submitted since it was handed out.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr(), n) };
    }
}

#[derive(Clone, Copy, Default, Debug)]
struct Instance {
    offset: u64,
    submitted: bool,
}

pub struct StagingRing<D: StagingDevice> {
    device: D,
    instances: [Instance; STAGING_INSTANCES],
    active: usize,
    max: u64,
}

impl<D: StagingDevice> StagingRing<D> {
    pub fn new(device: D) -> Self {
        Self::with_capacity(device, STAGING_BUFFER_MAX)
    }

    pub(crate) fn with_capacity(device: D, max: u64) -> Self {
        Self {
            device,
            instances: [Instance::default(); STAGING_INSTANCES],
            active: 0,
            max,
        }
    }

    pub fn region(&mut self, size: u64, alignment: u64) -> VkResult<StagingRegion> {
        if size > self.max {
            return Err(VkError::StagingOverflow {
                requested: size,
                max: self.max,
            });
        }
        self.reclaim_active()?;
        let mut offset = align_up(self.instances[self.active].offset, alignment.max(1));
        if offset + size > self.max {
            self.submit_active()?;
            self.reclaim_active()?;
            offset = 0;
        }

        let idx = self.active;
        self.instances[idx].offset = offset + size;
        let base = self.device.mapped(idx);
        // SAFETY: offset + size <= max, the mapping length.
        let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) };
        Ok(StagingRegion {
            ptr,
            command_buffer: self.device.command_buffer(idx),
            buffer: self.device.buffer(idx),
            offset,
            len: size,
        })
    }

    /// A previously submitted instance is waited for and rewound before reuse.
    fn reclaim_active(&mut self) -> VkResult<()> {
        if self.instances[self.active].submitted {
            self.device.restart(self.active)?;
            self.instances[self.active] = Instance::default();
        }
        Ok(())
    }

    /// Submit the active instance if it holds writes nobody has submitted.
    pub fn submit_all(&mut self) -> VkResult<()> {
        let inst = self.instances[self.active];
        if inst.offset > 0 && !inst.submitted {
            self.submit_active()?;
        }
        Ok(())
    }

    fn submit_active(&mut self) -> VkResult<()> {
        let idx = self.active;
        debug!("vk: staging submit #{idx} ({} bytes)", self.instances[idx].offset);
        self.device.submit(idx)?;
        self.instances[idx].submitted = true;
        self.active = (idx + 1) % STAGING_INSTANCES;
        Ok(())
    }

    /// Submit pending writes and block until every instance has completed.
    pub fn flush_and_wait(&mut self) -> VkResult<()> {
        self.submit_all()?;
        for idx in 0..STAGING_INSTANCES {
            if self.instances[idx].submitted {
                self.device.restart(idx)?;
                self.instances[idx] = Instance::default();
            }
        }
        Ok(())
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn device(&self) -> &D {
        &self.device
    }
}

struct VkStagingInstance {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    mapped: NonNull<u8>,
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
}

/// Staging instances on the graphics queue.
pub struct VkStaging {
    device: Arc<Device>,
    pool: vk::CommandPool,
    instances: Vec<VkStagingInstance>,
}

impl VkStaging {
    pub fn new(device: Arc<Device>) -> VkResult<Self> {
        Self::with_size(device, STAGING_BUFFER_MAX)
    }

    fn with_size(device: Arc<Device>, size: u64) -> VkResult<Self> {
        let pool_ci = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            queue_family_index: device.families().graphics,
            ..Default::default()
        };
        let pool = unsafe { device.raw().create_command_pool(&pool_ci, None) }
            .check("vkCreateCommandPool")?;
        let mut out = Self {
            device,
            pool,
            instances: Vec::with_capacity(STAGING_INSTANCES),
        };
        for _ in 0..STAGING_INSTANCES {
            let inst = out.create_instance(size)?;
            out.instances.push(inst);
        }
        for i in 0..STAGING_INSTANCES {
            out.begin(i)?;
        }
        Ok(out)
    }

    fn create_instance(&self, size: u64) -> VkResult<VkStagingInstance> {
        let d = self.device.raw();
        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let cmd = unsafe { d.allocate_command_buffers(&alloc_info) }
            .check("vkAllocateCommandBuffers")?[0];
        let fence_ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            ..Default::default()
        };
        let fence = unsafe { d.create_fence(&fence_ci, None) }.check("vkCreateFence")?;

        let bci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let mut inst = VkStagingInstance {
            buffer: vk::Buffer::null(),
            allocation: None,
            mapped: NonNull::dangling(),
            cmd,
            fence,
        };
        let made = (|| -> VkResult<()> {
            inst.buffer = unsafe { d.create_buffer(&bci, None) }.check("vkCreateBuffer")?;
            let requirements = unsafe { d.get_buffer_memory_requirements(inst.buffer) };
            let allocation = self.device.allocate(&AllocationCreateDesc {
                name: "staging",
                requirements,
                location: MemoryLocation::CpuToGpu,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })?;
            let bound =
                unsafe { d.bind_buffer_memory(inst.buffer, allocation.memory(), allocation.offset()) };
            let mapped = allocation.mapped_ptr().map(|p| p.cast::<u8>());
            inst.allocation = Some(allocation);
            bound.check("vkBindBufferMemory")?;
            inst.mapped = mapped.ok_or(VkError::Api {
                call: "vkMapMemory",
                result: vk::Result::ERROR_MEMORY_MAP_FAILED,
            })?;
            Ok(())
        })();
        if let Err(e) = made {
            self.destroy_instance(inst);
            return Err(e);
        }
        Ok(inst)
    }

    fn destroy_instance(&self, mut inst: VkStagingInstance) {
        let d = self.device.raw();
        unsafe {
            d.destroy_fence(inst.fence, None);
            d.free_command_buffers(self.pool, &[inst.cmd]);
            if inst.buffer != vk::Buffer::null() {
                d.destroy_buffer(inst.buffer, None);
            }
        }
        if let Some(a) = inst.allocation.take() {
            self.device.free(a);
        }
    }

    fn begin(&self, index: usize) -> VkResult<()> {
        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        unsafe {
            self.device
                .raw()
                .begin_command_buffer(self.instances[index].cmd, &begin)
        }
        .check("vkBeginCommandBuffer")
    }
}

impl StagingDevice for VkStaging {
    fn command_buffer(&self, index: usize) -> vk::CommandBuffer {
        self.instances[index].cmd
    }

    fn buffer(&self, index: usize) -> vk::Buffer {
        self.instances[index].buffer
    }

    fn mapped(&self, index: usize) -> NonNull<u8> {
        self.instances[index].mapped
    }

    fn submit(&mut self, index: usize) -> VkResult<()> {
        let d = self.device.raw();
        let inst = &self.instances[index];
        // Memory is host-coherent; only the GPU-side visibility needs a barrier.
        let barrier = vk::MemoryBarrier {
            s_type: vk::StructureType::MEMORY_BARRIER,
            src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
            dst_access_mask: vk::AccessFlags::VERTEX_ATTRIBUTE_READ | vk::AccessFlags::INDEX_READ,
            ..Default::default()
        };
        unsafe {
            d.cmd_pipeline_barrier(
                inst.cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::VERTEX_INPUT,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
            d.end_command_buffer(inst.cmd).check("vkEndCommandBuffer")?;
        }
        let cmds = [inst.cmd];
        let submit = vk::SubmitInfo::default().command_buffers(&cmds);
        unsafe { d.queue_submit(self.device.graphics_queue(), &[submit], inst.fence) }
            .check("vkQueueSubmit")
    }

    fn restart(&mut self, index: usize) -> VkResult<()> {
        let d = self.device.raw();
        let inst = &self.instances[index];
        unsafe {
            d.wait_for_fences(&[inst.fence], true, u64::MAX)
                .check("vkWaitForFences")?;
            d.reset_fences(&[inst.fence]).check("vkResetFences")?;
            d.reset_command_buffer(inst.cmd, vk::CommandBufferResetFlags::empty())
                .check("vkResetCommandBuffer")?;
        }
        self.begin(index)
    }
}

impl Drop for VkStaging {
    fn drop(&mut self) {
        for inst in std::mem::take(&mut self.instances) {
            self.destroy_instance(inst);
        }
        unsafe { self.device.raw().destroy_command_pool(self.pool, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    const MIB: u64 = 1 << 20;

    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    enum Op {
        Submit(usize),
        Restart(usize),
    }

    struct FakeStaging {
        memory: Vec<Vec<u8>>,
        ops: Vec<Op>,
        // instances currently owned by the GPU
        in_flight: [bool; STAGING_INSTANCES],
    }

    impl FakeStaging {
        fn new(size: u64) -> Self {
            Self {
                memory: (0..STAGING_INSTANCES).map(|_| vec![0u8; size as usize]).collect(),
                ops: Vec::new(),
                in_flight: [false; STAGING_INSTANCES],
            }
        }
    }

    impl StagingDevice for FakeStaging {
        fn command_buffer(&self, index: usize) -> vk::CommandBuffer {
            assert!(!self.in_flight[index], "handed out a submitted instance");
            vk::CommandBuffer::from_raw(index as u64 + 1)
        }

        fn buffer(&self, index: usize) -> vk::Buffer {
            vk::Buffer::from_raw(index as u64 + 100)
        }

        fn mapped(&self, index: usize) -> NonNull<u8> {
            NonNull::new(self.memory[index].as_ptr() as *mut u8).unwrap()
        }

        fn submit(&mut self, index: usize) -> VkResult<()> {
            assert!(!self.in_flight[index]);
            self.in_flight[index] = true;
            self.ops.push(Op::Submit(index));
            Ok(())
        }

        fn restart(&mut self, index: usize) -> VkResult<()> {
            self.in_flight[index] = false;
            self.ops.push(Op::Restart(index));
            Ok(())
        }
    }

    fn ring() -> StagingRing<FakeStaging> {
        StagingRing::with_capacity(FakeStaging::new(8 * MIB), 8 * MIB)
    }

    #[test]
    fn overflowing_request_rotates_to_a_new_command_buffer() {
        let mut r = ring();
        let a = r.region(5 * MIB, 4).unwrap();
        let b = r.region(5 * MIB, 4).unwrap();
        assert_ne!(a.command_buffer, b.command_buffer);
        assert_eq!(b.offset, 0);
        assert_eq!(r.device().ops, vec![Op::Submit(0)]);
    }

    #[test]
    fn reused_instance_waits_for_its_fence() {
        let mut r = ring();
        r.region(5 * MIB, 4).unwrap();
        r.region(5 * MIB, 4).unwrap();
        let c = r.region(5 * MIB, 4).unwrap();
        assert_eq!(c.command_buffer, vk::CommandBuffer::from_raw(1));
        assert_eq!(
            r.device().ops,
            vec![Op::Submit(0), Op::Submit(1), Op::Restart(0)]
        );
    }

    #[test]
    fn requests_larger_than_an_instance_fail() {
        let mut r = ring();
        let err = r.region(8 * MIB + 1, 4).unwrap_err();
        assert!(matches!(err, VkError::StagingOverflow { .. }));
        assert!(err.is_fatal());
        // exactly full is fine
        assert!(r.region(8 * MIB, 4).is_ok());
    }

    #[test]
    fn small_requests_share_an_instance_with_alignment() {
        let mut r = ring();
        let a = r.region(3, 1).unwrap();
        let b = r.region(16, 16).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 16);
        assert_eq!(a.command_buffer, b.command_buffer);
        assert!(r.device().ops.is_empty());
    }

    #[test]
    fn submit_all_only_submits_pending_writes() {
        let mut r = ring();
        r.submit_all().unwrap();
        assert!(r.device().ops.is_empty());

        r.region(64, 4).unwrap();
        r.submit_all().unwrap();
        r.submit_all().unwrap();
        assert_eq!(r.device().ops, vec![Op::Submit(0)]);
        assert_eq!(r.active(), 1);
    }

    #[test]
    fn writes_land_at_the_region_offset() {
        let mut r = ring();
        r.region(10, 1).unwrap();
        let reg = r.region(4, 4).unwrap();
        reg.write(&[1, 2, 3, 4]);
        assert_eq!(&r.device().memory[0][12..16], &[1, 2, 3, 4]);
    }

    #[test]
    fn flush_and_wait_leaves_every_instance_idle() {
        let mut r = ring();
        r.region(5 * MIB, 4).unwrap();
        r.region(5 * MIB, 4).unwrap();
        r.flush_and_wait().unwrap();
        assert_eq!(r.device().in_flight, [false, false]);
        // the ring is usable afterwards without further waits
        let before = r.device().ops.len();
        r.region(MIB, 4).unwrap();
        assert_eq!(r.device().ops.len(), before);
    }
}
