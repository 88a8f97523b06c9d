use std::sync::Arc;

use ash::vk;
use cadence::{
    render::{
        FrameContext, Gpu, PipelineFactory, QueueFamily, Submit, Timeline,
        timeline::{BoundResource, DrawCall, Drawable, ResourceDependency},
    },
    resource::{ResourceDescriptor, ResourceKey, ResourceTable},
};

use super::pipeline::QuadPipeline;

pub const VIEW: ResourceKey = ResourceKey::new(0);
pub const QUADS: ResourceKey = ResourceKey::new(1);
pub const INDICES: ResourceKey = ResourceKey::new(2);

const MAX_QUADS: usize = 64;
const GRID: usize = 6;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub pos: [f32; 2],
    pub color: [f32; 4],
}

pub fn resource_table() -> anyhow::Result<Arc<ResourceTable>> {
    let vertex_bytes = (MAX_QUADS * 4 * std::mem::size_of::<Vertex>()) as u64;
    let index_bytes = (MAX_QUADS * 6 * std::mem::size_of::<u32>()) as u64;
    let table = ResourceTable::builder()
        .declare(
            VIEW,
            ResourceDescriptor::push_constant(8, vk::ShaderStageFlags::VERTEX),
        )
        .declare(
            QUADS,
            ResourceDescriptor::shared(vk::BufferUsageFlags::VERTEX_BUFFER, vertex_bytes).multi(),
        )
        .declare(
            INDICES,
            ResourceDescriptor::gpu_local(vk::BufferUsageFlags::INDEX_BUFFER, index_bytes)
                .single()
                .fixed(),
        )
        .build()?;
    Ok(Arc::new(table))
}

/// Index uploads run on the transfer lane and are handed to the graphics lane before drawing.
pub fn timeline() -> anyhow::Result<Timeline> {
    let upload = |family: QueueFamily| {
        ResourceDependency::new(
            family,
            (
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
            ),
            (
                vk::PipelineStageFlags2::INDEX_INPUT,
                vk::AccessFlags2::INDEX_READ,
            ),
            [INDICES],
        )
    };

    Timeline::builder()
        .acquire_image()
        .initialize(QueueFamily::Transfer)
        .commit_transfers(QueueFamily::Transfer)
        .dependency(upload(QueueFamily::Transfer))
        .submit(Submit::new(QueueFamily::Transfer).signal_at(vk::PipelineStageFlags2::TRANSFER))
        .initialize(QueueFamily::Graphics)
        .dependency(upload(QueueFamily::Graphics))
        .draw(QueueFamily::Graphics, Quads)
        .submit(
            Submit::new(QueueFamily::Graphics)
                .wait_for(
                    vk::PipelineStageFlags2::INDEX_INPUT
                        | vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                )
                .present(),
        )
        .build()
}

struct Quads;

impl Drawable for Quads {
    fn name(&self) -> &str {
        "quads"
    }

    fn bindings(&self) -> &[ResourceKey] {
        &[VIEW, QUADS, INDICES]
    }

    fn pipeline(&self) -> &dyn PipelineFactory {
        &QuadPipeline
    }

    fn draw_call(&self, bound: &[BoundResource]) -> DrawCall {
        let quads = bound
            .iter()
            .find(|resource| resource.key == QUADS)
            .map_or(0, |resource| resource.count_of::<Vertex>() / 4);
        if quads == 0 {
            return DrawCall::Skip;
        }
        DrawCall::Indexed {
            index_count: quads * 6,
            instance_count: 1,
        }
    }
}

/// Staged once; the first frame's transfer group uploads it.
pub fn upload_indices<G: Gpu>(frame: &mut FrameContext<G>) -> anyhow::Result<()> {
    let indices = quad_indices(MAX_QUADS);
    frame.segment_mut(INDICES)?.extend_from_slice(&indices)
}

fn quad_indices(quads: usize) -> Vec<u32> {
    (0..quads as u32)
        .flat_map(|quad| {
            let base = quad * 4;
            [base, base + 1, base + 2, base + 2, base + 3, base]
        })
        .collect()
}

/// Fills the current slot's segments. The slot must already be free.
pub fn update<G: Gpu>(
    frame: &mut FrameContext<G>,
    extent: vk::Extent2D,
    seconds: f32,
) -> anyhow::Result<()> {
    let view = [extent.width as f32, extent.height as f32];
    let mut segment = frame.segment_mut(VIEW)?;
    segment.clear()?;
    segment.push_back(&view)?;

    let mut segment = frame.segment_mut(QUADS)?;
    segment.clear()?;
    segment.try_extend_from_slice(&quad_grid(view, seconds))
}

fn quad_grid(view: [f32; 2], seconds: f32) -> Vec<Vertex> {
    let cell = [view[0] / GRID as f32, view[1] / GRID as f32];
    let mut vertices = Vec::with_capacity(GRID * GRID * 4);
    for row in 0..GRID {
        for column in 0..GRID {
            let phase = seconds * 1.5 + (row * GRID + column) as f32 * 0.35;
            let scale = 0.3 + 0.15 * phase.sin();
            let center = [
                (column as f32 + 0.5) * cell[0],
                (row as f32 + 0.5) * cell[1],
            ];
            let half = [cell[0] * scale, cell[1] * scale];
            let color = [
                column as f32 / GRID as f32,
                row as f32 / GRID as f32,
                0.5 + 0.5 * phase.cos(),
                0.9,
            ];
            for corner in [[-1.0, -1.0], [1.0, -1.0], [1.0, 1.0], [-1.0, 1.0]] {
                vertices.push(Vertex {
                    pos: [
                        center[0] + corner[0] * half[0],
                        center[1] + corner[1] * half[1],
                    ],
                    color,
                });
            }
        }
    }
    vertices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_matches_pipeline() {
        assert_eq!(std::mem::size_of::<Vertex>(), 24);
        assert_eq!(std::mem::offset_of!(Vertex, color), 8);
    }

    #[test]
    fn indices_form_two_triangles_per_quad() {
        let indices = quad_indices(2);
        assert_eq!(indices, vec![0, 1, 2, 2, 3, 0, 4, 5, 6, 6, 7, 4]);
    }

    #[test]
    fn grid_fits_in_the_vertex_segment() {
        let vertices = quad_grid([800.0, 600.0], 0.0);
        assert_eq!(vertices.len(), GRID * GRID * 4);
        assert!(vertices.len() <= MAX_QUADS * 4);
    }

    #[test]
    fn demo_timeline_is_valid() {
        let timeline = timeline().unwrap();
        assert_eq!(
            timeline.group_families(),
            &[None, Some(QueueFamily::Transfer), Some(QueueFamily::Graphics)]
        );
    }
}
