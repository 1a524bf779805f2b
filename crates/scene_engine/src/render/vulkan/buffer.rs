//! Buffer and memory primitives
//!
//! Raw device-memory allocation with explicit memory-type selection, the
//! host-side staging ring used for per-frame uniform data, and the staged
//! vertex/index upload path.

use ash::{vk, Device};

use super::commands::CommandPool;
use super::device::PhysicalDeviceInfo;
use super::error::{VulkanError, VulkanResult};

/// Default alignment for uniform-buffer offsets when the device reports
/// something smaller
pub const DEFAULT_UBO_ALIGNMENT: u64 = 256;

/// Default size of the shared per-frame UBO ring buffer
pub const DEFAULT_UBO_RING_SIZE: u64 = 512 * 2048;

/// Write cursor over a staging area, handing out aligned offsets.
///
/// Offsets advance sequentially through the buffer and are reset to zero at
/// the top of each frame. Every offset returned is a multiple of the
/// alignment, including the first.
#[derive(Debug)]
pub struct RingCursor {
    position: u64,
    alignment: u64,
    capacity: u64,
}

impl RingCursor {
    /// Create a cursor with the given alignment and capacity
    pub fn new(alignment: u64, capacity: u64) -> Self {
        Self {
            position: 0,
            alignment: alignment.max(1),
            capacity,
        }
    }

    /// Pad the cursor forward to the next aligned position and return it
    pub fn current_offset(&mut self) -> u64 {
        let rem = self.position % self.alignment;
        if rem != 0 {
            self.position += self.alignment - rem;
        }
        self.position
    }

    /// Claim `size` bytes at the next aligned position, returning the offset
    /// of the claimed region
    pub fn advance(&mut self, size: u64) -> VulkanResult<u64> {
        let offset = self.current_offset();
        if offset + size > self.capacity {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "UBO ring overflow: offset {offset} + {size} exceeds capacity {}",
                    self.capacity
                ),
            });
        }
        self.position = offset + size;
        Ok(offset)
    }

    /// Rewind to the start of the buffer (once per frame)
    pub fn reset(&mut self) {
        self.position = 0;
    }

    /// Configured alignment
    pub fn alignment(&self) -> u64 {
        self.alignment
    }
}

/// Buffer with dedicated device-memory allocation and RAII cleanup
pub struct VulkanBuffer {
    device: Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    allocated_size: vk::DeviceSize,
    alignment: vk::DeviceSize,
}

impl VulkanBuffer {
    /// Allocate a buffer of `size` bytes with the given usage and memory
    /// properties; the allocation is padded to the reported alignment
    pub fn new(
        device: Device,
        physical: &PhysicalDeviceInfo,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device
                .create_buffer(&buffer_info, None)
                .map_err(VulkanError::from)?
        };

        let reqs = unsafe { device.get_buffer_memory_requirements(buffer) };

        let allocated_size = if reqs.size % reqs.alignment == 0 {
            reqs.size
        } else {
            reqs.size + reqs.alignment - (reqs.size % reqs.alignment)
        };

        let memory_type_index = physical.find_memory_type(reqs.memory_type_bits, properties)?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(allocated_size)
            .memory_type_index(memory_type_index);

        let memory = unsafe {
            device.allocate_memory(&alloc_info, None).map_err(|e| {
                if e == vk::Result::ERROR_OUT_OF_DEVICE_MEMORY {
                    VulkanError::OutOfDeviceMemory {
                        requested: allocated_size,
                    }
                } else {
                    VulkanError::from(e)
                }
            })?
        };

        unsafe {
            device
                .bind_buffer_memory(buffer, memory, 0)
                .map_err(VulkanError::from)?;
        }

        Ok(Self {
            device,
            buffer,
            memory,
            size,
            allocated_size,
            alignment: reqs.alignment,
        })
    }

    /// Copy host bytes into the buffer: map, memcpy, unmap.
    ///
    /// No persistent mapping is retained; the pointer is released before
    /// returning.
    pub fn copy_from(&self, data: &[u8], offset: vk::DeviceSize) -> VulkanResult<()> {
        if offset + data.len() as vk::DeviceSize > self.size {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "Write of {} bytes at offset {offset} exceeds buffer size {}",
                    data.len(),
                    self.size
                ),
            });
        }

        unsafe {
            let ptr = self
                .device
                .map_memory(
                    self.memory,
                    offset,
                    data.len() as vk::DeviceSize,
                    vk::MemoryMapFlags::empty(),
                )
                .map_err(VulkanError::from)?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.cast::<u8>(), data.len());
            self.device.unmap_memory(self.memory);
        }

        Ok(())
    }

    /// Read the buffer contents back to host memory (debug/readback path)
    pub fn copy_to(&self, dest: &mut [u8]) -> VulkanResult<()> {
        let len = dest.len().min(self.size as usize);
        unsafe {
            let ptr = self
                .device
                .map_memory(
                    self.memory,
                    0,
                    len as vk::DeviceSize,
                    vk::MemoryMapFlags::empty(),
                )
                .map_err(VulkanError::from)?;
            std::ptr::copy_nonoverlapping(ptr.cast::<u8>(), dest.as_mut_ptr(), len);
            self.device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Get the buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Requested size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Actual allocation size after alignment padding
    pub fn allocated_size(&self) -> vk::DeviceSize {
        self.allocated_size
    }

    /// Device-reported alignment for this buffer
    pub fn alignment(&self) -> vk::DeviceSize {
        self.alignment
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// Interleaved vertex/index block ready for a single device-local upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedGeometry {
    /// `[vertex data][padding][index data]`, index segment 4-byte aligned
    pub bytes: Vec<u8>,
    /// Byte offset of the index segment within `bytes`
    pub index_offset: u64,
    /// Number of indices
    pub index_count: u32,
}

/// Pack interleaved vertex bytes and a `u32` index list into one contiguous
/// block, aligning the index segment to 4 bytes
pub fn pack_geometry(vertex_data: &[u8], indices: &[u32]) -> PackedGeometry {
    let mut index_offset = vertex_data.len();
    if index_offset % 4 != 0 {
        index_offset += 4 - index_offset % 4;
    }

    let mut bytes = Vec::with_capacity(index_offset + indices.len() * 4);
    bytes.extend_from_slice(vertex_data);
    bytes.resize(index_offset, 0);
    bytes.extend_from_slice(bytemuck::cast_slice(indices));

    PackedGeometry {
        bytes,
        index_offset: index_offset as u64,
        index_count: indices.len() as u32,
    }
}

/// Upload `data` into a new device-local buffer through a TRANSFER_SRC
/// staging buffer and a one-shot copy command
pub fn upload_device_local(
    device: Device,
    physical: &PhysicalDeviceInfo,
    pool: &CommandPool,
    queue: vk::Queue,
    data: &[u8],
    usage: vk::BufferUsageFlags,
) -> VulkanResult<VulkanBuffer> {
    let size = data.len() as vk::DeviceSize;

    let staging = VulkanBuffer::new(
        device.clone(),
        physical,
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;
    staging.copy_from(data, 0)?;

    let destination = VulkanBuffer::new(
        device,
        physical,
        size,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;

    pool.one_shot(queue, |dev, command_buffer| {
        let region = vk::BufferCopy::builder().size(size).build();
        unsafe {
            dev.cmd_copy_buffer(
                command_buffer,
                staging.handle(),
                destination.handle(),
                &[region],
            );
        }
    })?;

    Ok(destination)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_offset_is_aligned() {
        let mut cursor = RingCursor::new(256, 4096);
        assert_eq!(cursor.current_offset(), 0);
        assert_eq!(cursor.current_offset() % 256, 0);
    }

    #[test]
    fn test_offsets_stay_aligned_across_advances() {
        let mut cursor = RingCursor::new(256, 1 << 20);
        for size in [4u64, 63, 64, 1, 255, 256, 257, 1000] {
            let offset = cursor.advance(size).unwrap();
            assert_eq!(offset % 256, 0, "offset {offset} not aligned after {size}");
        }
    }

    #[test]
    fn test_advance_claims_disjoint_regions() {
        let mut cursor = RingCursor::new(256, 4096);
        let a = cursor.advance(64).unwrap();
        let b = cursor.advance(64).unwrap();
        assert!(b >= a + 64);
    }

    #[test]
    fn test_reset_rewinds_to_zero() {
        let mut cursor = RingCursor::new(256, 4096);
        cursor.advance(300).unwrap();
        cursor.reset();
        assert_eq!(cursor.current_offset(), 0);
    }

    #[test]
    fn test_ring_overflow_is_an_error() {
        let mut cursor = RingCursor::new(256, 512);
        cursor.advance(256).unwrap();
        assert!(cursor.advance(512).is_err());
    }

    #[test]
    fn test_pack_geometry_layout_round_trip() {
        // 3 vertices of 32 bytes each (position+normal+texcoord), 3 indices
        let vertex_data: Vec<u8> = (0..96).map(|i| i as u8).collect();
        let indices = [0u32, 1, 2];

        let packed = pack_geometry(&vertex_data, &indices);

        assert_eq!(packed.index_offset, 96);
        assert_eq!(packed.index_count, 3);
        assert_eq!(&packed.bytes[..96], &vertex_data[..]);
        let index_bytes: &[u8] = bytemuck::cast_slice(&indices);
        assert_eq!(&packed.bytes[96..], index_bytes);
    }

    #[test]
    fn test_pack_geometry_pads_index_segment_to_four_bytes() {
        // 10 bytes of vertex data forces 2 bytes of padding
        let vertex_data = [1u8; 10];
        let indices = [7u32];

        let packed = pack_geometry(&vertex_data, &indices);

        assert_eq!(packed.index_offset, 12);
        assert_eq!(packed.index_offset % 4, 0);
        assert_eq!(&packed.bytes[10..12], &[0, 0]);
        assert_eq!(&packed.bytes[12..16], &7u32.to_ne_bytes());
    }

    #[test]
    fn test_pack_geometry_empty_indices() {
        let packed = pack_geometry(&[1, 2, 3, 4], &[]);
        assert_eq!(packed.index_count, 0);
        assert_eq!(packed.bytes.len(), 4);
    }
}
