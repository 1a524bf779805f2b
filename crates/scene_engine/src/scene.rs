//! Scene graph boundary
//!
//! Nodes live in a slotmap arena and carry everything the renderer needs:
//! transform, geometry, and material. Structural changes (nodes added or
//! removed, geometry replaced) bump a revision counter; the renderer
//! re-records its command buffers when the revision it recorded against
//! goes stale. Transform updates alone do not bump the revision, they only
//! flow through the per-frame uniform ring.

use std::collections::HashMap;
use std::path::PathBuf;

use bytemuck::{Pod, Zeroable};
use nalgebra::{Matrix4, Point3, Vector3};
use slotmap::{new_key_type, SlotMap};

use crate::render::vulkan::pipeline::VertexLayout;

new_key_type! {
    /// Stable handle to a scene node
    pub struct NodeKey;
}

/// Interleaved vertex as uploaded to the GPU
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub texcoord: [f32; 2],
}

/// Primitive topology at the scene boundary, mapped to Vulkan by the
/// renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    TriangleList,
    TriangleStrip,
    LineList,
    PointList,
}

/// Host-side geometry: interleaved vertex bytes plus an index list
#[derive(Debug, Clone)]
pub struct Geometry {
    pub data: Vec<u8>,
    pub layout: VertexLayout,
    pub indices: Vec<u32>,
    pub topology: Topology,
}

impl Geometry {
    pub fn from_vertices(vertices: &[Vertex], indices: Vec<u32>) -> Self {
        Self {
            data: bytemuck::cast_slice(vertices).to_vec(),
            layout: VertexLayout::PositionNormalTexcoord,
            indices,
            topology: Topology::TriangleList,
        }
    }

    pub fn vertex_count(&self) -> u32 {
        let stride = self.layout.stride();
        if stride == 0 {
            0
        } else {
            (self.data.len() / stride as usize) as u32
        }
    }
}

/// Material texture slots, keyed by slot name (`diffuse`, `normal`, ...)
#[derive(Debug, Clone, Default)]
pub struct Material {
    pub textures: HashMap<String, PathBuf>,
}

/// One renderable node of the scene graph
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub transform: Matrix4<f32>,
    pub geometry: Option<Geometry>,
    pub material: Material,
    pub visible: bool,
    pub is_billboard: bool,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transform: Matrix4::identity(),
            geometry: None,
            material: Material::default(),
            visible: true,
            is_billboard: false,
        }
    }

    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = Some(geometry);
        self
    }
}

/// Viewpoint the frame uniforms are built from
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Point3<f32>,
    pub target: Point3<f32>,
    pub up: Vector3<f32>,
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Camera {
    pub fn view_matrix(&self) -> Matrix4<f32> {
        Matrix4::look_at_rh(&self.position, &self.target, &self.up)
    }

    /// Perspective projection with the Y axis flipped for Vulkan clip space
    pub fn projection_matrix(&self, aspect: f32) -> Matrix4<f32> {
        let mut projection = Matrix4::new_perspective(aspect, self.fov_y, self.near, self.far);
        projection[(1, 1)] *= -1.0;
        projection
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Point3::new(0.0, 0.0, 5.0),
            target: Point3::origin(),
            up: Vector3::y(),
            fov_y: std::f32::consts::FRAC_PI_4,
            near: 0.1,
            far: 1000.0,
        }
    }
}

/// Node arena plus the structural revision counter
pub struct Scene {
    nodes: SlotMap<NodeKey, Node>,
    revision: u64,
    pub camera: Camera,
}

impl Scene {
    pub fn new() -> Self {
        Self {
            nodes: SlotMap::with_key(),
            revision: 0,
            camera: Camera::default(),
        }
    }

    /// Insert a node; structural change, bumps the revision
    pub fn add(&mut self, node: Node) -> NodeKey {
        self.revision += 1;
        self.nodes.insert(node)
    }

    /// Remove a node; structural change, bumps the revision
    pub fn remove(&mut self, key: NodeKey) -> Option<Node> {
        let removed = self.nodes.remove(key);
        if removed.is_some() {
            self.revision += 1;
        }
        removed
    }

    pub fn get(&self, key: NodeKey) -> Option<&Node> {
        self.nodes.get(key)
    }

    /// Mutable access for transform animation; does not bump the revision
    pub fn get_mut(&mut self, key: NodeKey) -> Option<&mut Node> {
        self.nodes.get_mut(key)
    }

    /// Replace a node's geometry; structural change, bumps the revision
    pub fn set_geometry(&mut self, key: NodeKey, geometry: Geometry) -> bool {
        match self.nodes.get_mut(key) {
            Some(node) => {
                node.geometry = Some(geometry);
                self.revision += 1;
                true
            }
            None => false,
        }
    }

    /// Force command re-recording on the next frame
    pub fn mark_dirty(&mut self) {
        self.revision += 1;
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Visible nodes with geometry, in arena order
    pub fn renderable(&self) -> impl Iterator<Item = (NodeKey, &Node)> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.visible && node.geometry.is_some())
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn triangle() -> Geometry {
        let vertices = [
            Vertex {
                position: [0.0, 0.0, 0.0],
                normal: [0.0, 0.0, 1.0],
                texcoord: [0.0, 0.0],
            },
            Vertex {
                position: [1.0, 0.0, 0.0],
                normal: [0.0, 0.0, 1.0],
                texcoord: [1.0, 0.0],
            },
            Vertex {
                position: [0.0, 1.0, 0.0],
                normal: [0.0, 0.0, 1.0],
                texcoord: [0.0, 1.0],
            },
        ];
        Geometry::from_vertices(&vertices, vec![0, 1, 2])
    }

    #[test]
    fn test_vertex_is_32_bytes() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
    }

    #[test]
    fn test_add_and_remove_bump_revision() {
        let mut scene = Scene::new();
        assert_eq!(scene.revision(), 0);

        let key = scene.add(Node::new("cube").with_geometry(triangle()));
        assert_eq!(scene.revision(), 1);

        scene.remove(key);
        assert_eq!(scene.revision(), 2);

        // removing a stale key is not a structural change
        scene.remove(key);
        assert_eq!(scene.revision(), 2);
    }

    #[test]
    fn test_transform_update_keeps_revision() {
        let mut scene = Scene::new();
        let key = scene.add(Node::new("cube").with_geometry(triangle()));
        let before = scene.revision();

        scene.get_mut(key).unwrap().transform =
            Matrix4::new_translation(&Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(scene.revision(), before);
    }

    #[test]
    fn test_set_geometry_bumps_revision() {
        let mut scene = Scene::new();
        let key = scene.add(Node::new("cube"));
        let before = scene.revision();

        assert!(scene.set_geometry(key, triangle()));
        assert_eq!(scene.revision(), before + 1);
    }

    #[test]
    fn test_renderable_skips_hidden_and_empty_nodes() {
        let mut scene = Scene::new();
        scene.add(Node::new("empty"));
        let hidden = scene.add(Node::new("hidden").with_geometry(triangle()));
        scene.get_mut(hidden).unwrap().visible = false;
        scene.add(Node::new("visible").with_geometry(triangle()));

        let names: Vec<&str> = scene.renderable().map(|(_, n)| n.name.as_str()).collect();
        assert_eq!(names, vec!["visible"]);
    }

    #[test]
    fn test_camera_projection_flips_y() {
        let camera = Camera::default();
        let standard = Matrix4::new_perspective(16.0 / 9.0, camera.fov_y, camera.near, camera.far);
        let projection = camera.projection_matrix(16.0 / 9.0);
        assert_relative_eq!(projection[(1, 1)], -standard[(1, 1)]);
    }

    #[test]
    fn test_geometry_vertex_count() {
        assert_eq!(triangle().vertex_count(), 3);
    }
}
