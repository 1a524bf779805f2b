//! Minimal viewer: a spinning textured cube
//!
//! Reads `settings.toml` from the working directory when present and runs
//! the render loop until the window closes.

use std::path::Path;

use nalgebra::{Matrix4, Vector3};

use scene_engine::scene::{Geometry, Node, Scene, Vertex};
use scene_engine::settings::RendererSettings;
use scene_engine::VulkanRenderer;

fn cube() -> Geometry {
    let faces: [([f32; 3], [[f32; 3]; 4]); 6] = [
        ([0.0, 0.0, 1.0], [
            [-1.0, -1.0, 1.0],
            [1.0, -1.0, 1.0],
            [1.0, 1.0, 1.0],
            [-1.0, 1.0, 1.0],
        ]),
        ([0.0, 0.0, -1.0], [
            [1.0, -1.0, -1.0],
            [-1.0, -1.0, -1.0],
            [-1.0, 1.0, -1.0],
            [1.0, 1.0, -1.0],
        ]),
        ([1.0, 0.0, 0.0], [
            [1.0, -1.0, 1.0],
            [1.0, -1.0, -1.0],
            [1.0, 1.0, -1.0],
            [1.0, 1.0, 1.0],
        ]),
        ([-1.0, 0.0, 0.0], [
            [-1.0, -1.0, -1.0],
            [-1.0, -1.0, 1.0],
            [-1.0, 1.0, 1.0],
            [-1.0, 1.0, -1.0],
        ]),
        ([0.0, 1.0, 0.0], [
            [-1.0, 1.0, 1.0],
            [1.0, 1.0, 1.0],
            [1.0, 1.0, -1.0],
            [-1.0, 1.0, -1.0],
        ]),
        ([0.0, -1.0, 0.0], [
            [-1.0, -1.0, -1.0],
            [1.0, -1.0, -1.0],
            [1.0, -1.0, 1.0],
            [-1.0, -1.0, 1.0],
        ]),
    ];
    let texcoords = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (face, (normal, corners)) in faces.iter().enumerate() {
        let base = (face * 4) as u32;
        for (corner, position) in corners.iter().enumerate() {
            vertices.push(Vertex {
                position: *position,
                normal: *normal,
                texcoord: texcoords[corner],
            });
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }

    Geometry::from_vertices(&vertices, indices)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let settings_path = Path::new("settings.toml");
    let settings = if settings_path.exists() {
        RendererSettings::from_file(settings_path)?
    } else {
        RendererSettings::default()
    };

    let mut renderer = VulkanRenderer::new(settings)?;

    let mut scene = Scene::new();
    let key = scene.add(Node::new("cube").with_geometry(cube()));

    let start = std::time::Instant::now();
    while !renderer.window().should_close() {
        renderer.window_mut().poll_events();

        let angle = start.elapsed().as_secs_f32() * 0.8;
        if let Some(node) = scene.get_mut(key) {
            node.transform = Matrix4::from_axis_angle(&Vector3::y_axis(), angle)
                * Matrix4::from_axis_angle(&Vector3::x_axis(), angle * 0.5);
        }

        renderer.draw_frame(&scene)?;
    }

    Ok(())
}
