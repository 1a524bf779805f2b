//! Uniform buffer layout and the per-frame uniform ring
//!
//! Fixed uniform blocks (camera, object transforms) are plain `#[repr(C)]`
//! structs serialized with bytemuck. Render-pass parameter blocks come from
//! the render config at runtime, so their layout is computed member by
//! member with std140 rules.

use bytemuck::{Pod, Zeroable};
use nalgebra::{Matrix4, Vector2, Vector3, Vector4};

use ash::vk;

use super::buffer::{RingCursor, VulkanBuffer};
use super::error::VulkanResult;

/// Camera uniforms written once per frame and shared by every draw
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FrameUniforms {
    pub view: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
    pub camera_position: [f32; 4],
}

impl FrameUniforms {
    pub fn new(view: &Matrix4<f32>, projection: &Matrix4<f32>, camera_position: &Vector3<f32>) -> Self {
        Self {
            view: (*view).into(),
            projection: (*projection).into(),
            camera_position: [camera_position.x, camera_position.y, camera_position.z, 1.0],
        }
    }
}

/// Per-object uniforms, one aligned slice of the ring per object per frame
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ObjectUniforms {
    pub model: [[f32; 4]; 4],
    pub is_billboard: i32,
    pub _padding: [i32; 3],
}

impl ObjectUniforms {
    pub fn new(model: &Matrix4<f32>, is_billboard: bool) -> Self {
        Self {
            model: (*model).into(),
            is_billboard: i32::from(is_billboard),
            _padding: [0; 3],
        }
    }
}

/// A single member of a runtime-defined uniform block
#[derive(Debug, Clone, PartialEq)]
pub enum UboMember {
    Float(f32),
    Int(i32),
    UInt(u32),
    Vec2(Vector2<f32>),
    Vec3(Vector3<f32>),
    Vec4(Vector4<f32>),
    Mat4(Matrix4<f32>),
}

impl UboMember {
    /// std140 size and base alignment in bytes
    pub fn size_and_alignment(&self) -> (usize, usize) {
        match self {
            UboMember::Float(_) | UboMember::Int(_) | UboMember::UInt(_) => (4, 4),
            UboMember::Vec2(_) => (8, 8),
            UboMember::Vec3(_) => (12, 16),
            UboMember::Vec4(_) => (16, 16),
            UboMember::Mat4(_) => (64, 16),
        }
    }

    fn write_into(&self, out: &mut Vec<u8>) {
        match self {
            UboMember::Float(v) => out.extend_from_slice(&v.to_ne_bytes()),
            UboMember::Int(v) => out.extend_from_slice(&v.to_ne_bytes()),
            UboMember::UInt(v) => out.extend_from_slice(&v.to_ne_bytes()),
            UboMember::Vec2(v) => out.extend_from_slice(bytemuck::cast_slice(v.as_slice())),
            UboMember::Vec3(v) => out.extend_from_slice(bytemuck::cast_slice(v.as_slice())),
            UboMember::Vec4(v) => out.extend_from_slice(bytemuck::cast_slice(v.as_slice())),
            UboMember::Mat4(v) => out.extend_from_slice(bytemuck::cast_slice(v.as_slice())),
        }
    }
}

/// Uniform block whose members are declared at runtime, in order.
///
/// Member order matters: it must match the declaration order in the shader.
#[derive(Debug, Clone, Default)]
pub struct UboLayout {
    members: Vec<(String, UboMember)>,
}

impl UboLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a member; layout position follows insertion order
    pub fn add(&mut self, name: impl Into<String>, member: UboMember) {
        self.members.push((name.into(), member));
    }

    /// Replace the value of an existing member, keeping its position
    pub fn set(&mut self, name: &str, member: UboMember) -> bool {
        for (n, m) in &mut self.members {
            if n == name {
                *m = member;
                return true;
            }
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Total std140 size of the block in bytes
    pub fn size(&self) -> usize {
        let mut offset = 0usize;
        for (_, member) in &self.members {
            let (size, alignment) = member.size_and_alignment();
            offset = align_up(offset, alignment) + size;
        }
        offset
    }

    /// Serialize all members with std140 offsets into a byte vector
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        for (_, member) in &self.members {
            let (_, alignment) = member.size_and_alignment();
            let aligned = align_up(out.len(), alignment);
            out.resize(aligned, 0);
            member.write_into(&mut out);
        }
        out
    }
}

fn align_up(value: usize, alignment: usize) -> usize {
    let rem = value % alignment;
    if rem == 0 {
        value
    } else {
        value + alignment - rem
    }
}

/// Location of a uniform block inside a backing buffer
#[derive(Debug, Clone, Copy)]
pub struct UboDescriptor {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub range: vk::DeviceSize,
}

/// Host-visible buffer plus write cursor for one frame's uniform data.
///
/// Reset at the top of each frame; slices are claimed in draw order and
/// bound with dynamic offsets.
pub struct UboRing {
    buffer: VulkanBuffer,
    cursor: RingCursor,
}

impl UboRing {
    pub fn new(buffer: VulkanBuffer, alignment: u64) -> Self {
        let capacity = buffer.size();
        Self {
            buffer,
            cursor: RingCursor::new(alignment, capacity),
        }
    }

    /// Claim an aligned slice and fill it with `data`
    pub fn push(&mut self, data: &[u8]) -> VulkanResult<UboDescriptor> {
        let offset = self.cursor.advance(data.len() as u64)?;
        self.buffer.copy_from(data, offset)?;
        Ok(UboDescriptor {
            buffer: self.buffer.handle(),
            offset,
            range: data.len() as vk::DeviceSize,
        })
    }

    /// Rewind the cursor for the next frame
    pub fn reset(&mut self) {
        self.cursor.reset();
    }

    pub fn buffer(&self) -> &VulkanBuffer {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix4;

    #[test]
    fn test_frame_uniforms_size() {
        // two mat4 + one vec4
        assert_eq!(std::mem::size_of::<FrameUniforms>(), 64 + 64 + 16);
    }

    #[test]
    fn test_object_uniforms_size() {
        assert_eq!(std::mem::size_of::<ObjectUniforms>(), 64 + 16);
    }

    #[test]
    fn test_layout_size_applies_std140_alignment() {
        let mut layout = UboLayout::new();
        layout.add("intensity", UboMember::Float(1.0));
        layout.add("direction", UboMember::Vec3(Vector3::new(0.0, 1.0, 0.0)));
        // float at 0..4, vec3 aligned to 16: 16..28
        assert_eq!(layout.size(), 28);
    }

    #[test]
    fn test_layout_bytes_match_size_offsets() {
        let mut layout = UboLayout::new();
        layout.add("scale", UboMember::Float(2.0));
        layout.add("tint", UboMember::Vec4(Vector4::new(1.0, 0.5, 0.25, 1.0)));
        layout.add("transform", UboMember::Mat4(Matrix4::identity()));

        let bytes = layout.to_bytes();
        assert_eq!(bytes.len(), layout.size());
        assert_eq!(&bytes[0..4], &2.0f32.to_ne_bytes());
        // vec4 lands at offset 16 after padding
        assert_eq!(&bytes[16..20], &1.0f32.to_ne_bytes());
        // mat4 follows at offset 32, identity starts with 1.0
        assert_eq!(&bytes[32..36], &1.0f32.to_ne_bytes());
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut layout = UboLayout::new();
        layout.add("intensity", UboMember::Float(1.0));
        assert!(layout.set("intensity", UboMember::Float(3.0)));
        assert!(!layout.set("missing", UboMember::Float(0.0)));
        assert_eq!(&layout.to_bytes()[0..4], &3.0f32.to_ne_bytes());
    }
}
