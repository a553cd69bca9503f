// SPDX-License-Identifier: CEPL-1.0
//! Triangle-fan emulation: a shared `(0, i+1, i+2)` index prefix that sits at
//! the head of every dynamic index buffer, so fans draw as triangle lists.

use crate::error::{VkError, VkResult};

pub const INITIAL_FAN_TRIANGLES: u32 = 200;
/// Highest vertex index a fan can reference is `triangles + 1`.
const MAX_FAN_TRIANGLES: u32 = u16::MAX as u32 - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FanPrefix {
    triangles: u32,
}

impl FanPrefix {
    pub fn new(triangles: u32) -> Self {
        Self {
            triangles: triangles.clamp(1, MAX_FAN_TRIANGLES),
        }
    }

    pub fn triangles(&self) -> u32 {
        self.triangles
    }

    /// Number of fan indices the prefix can serve.
    pub fn index_capacity(&self) -> u32 {
        self.triangles * 3
    }

    /// Bytes reserved at the head of each index buffer; real index data
    /// starts here, 4-byte aligned.
    pub fn reserved_bytes(&self) -> u64 {
        let raw = self.index_capacity() as u64 * std::mem::size_of::<u16>() as u64;
        raw.next_multiple_of(4)
    }

    pub fn indices(&self) -> Vec<u16> {
        (0..self.triangles)
            .flat_map(|i| [0, (i + 1) as u16, (i + 2) as u16])
            .collect()
    }

    /// Prefix that serves `index_count`, doubling the triangle count.
    /// `None` when the current prefix already suffices.
    pub fn grown_for(&self, index_count: u32) -> VkResult<Option<FanPrefix>> {
        if index_count <= self.index_capacity() {
            return Ok(None);
        }
        if index_count.div_ceil(3) > MAX_FAN_TRIANGLES {
            return Err(VkError::FanTooLarge {
                requested: index_count,
            });
        }
        let mut triangles = self.triangles;
        while triangles * 3 < index_count {
            triangles = (triangles * 2).min(MAX_FAN_TRIANGLES);
        }
        Ok(Some(FanPrefix { triangles }))
    }

    /// # Safety
    /// `dst` must be valid for `reserved_bytes()` bytes of writes.
    pub unsafe fn write_to(&self, dst: *mut u8) {
        let idx = self.indices();
        let bytes: &[u8] = bytemuck::cast_slice(&idx);
        // SAFETY: caller guarantees room for the full reserved prefix.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            let pad = self.reserved_bytes() as usize - bytes.len();
            std::ptr::write_bytes(dst.add(bytes.len()), 0, pad);
        }
    }
}
