use std::mem::offset_of;

use ash::vk;
use cadence::render::{Pipeline, PipelineFactory, RenderTargets};

use super::scene::Vertex;

const VERT_SPV: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/quad.vert.spv"));
const FRAG_SPV: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/quad.frag.spv"));

fn spv_u32(bytes: &[u8]) -> anyhow::Result<Vec<u32>> {
    // include_bytes! data is only byte aligned.
    if bytes.len() % 4 != 0 {
        anyhow::bail!("invalid SPIR-V bytecode length {}", bytes.len());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|word| bytemuck::pod_read_unaligned::<u32>(word))
        .collect())
}

/// Colored quads in window pixel coordinates, scaled by an 8-byte `extent` push constant.
pub struct QuadPipeline;

impl PipelineFactory for QuadPipeline {
    fn create(&self, device: &ash::Device, targets: &RenderTargets) -> anyhow::Result<Pipeline> {
        let push_constants = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .offset(0)
            .size(8)];
        let layout = unsafe {
            device.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::default().push_constant_ranges(&push_constants),
                None,
            )?
        };

        let vert_module = create_shader_module(device, &spv_u32(VERT_SPV)?);
        let frag_module = create_shader_module(device, &spv_u32(FRAG_SPV)?);
        let pipeline = match (&vert_module, &frag_module) {
            (Ok(vert), Ok(frag)) => create_pipeline(device, targets, layout, *vert, *frag),
            (Err(e), _) | (_, Err(e)) => {
                Err(anyhow::anyhow!("failed to create quad shader module: {:#}", e))
            }
        };

        unsafe {
            if let Ok(module) = vert_module {
                device.destroy_shader_module(module, None);
            }
            if let Ok(module) = frag_module {
                device.destroy_shader_module(module, None);
            }
        }

        match pipeline {
            Ok(pipeline) => Ok(Pipeline {
                pipeline,
                layout,
                bind_point: vk::PipelineBindPoint::GRAPHICS,
            }),
            Err(e) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                Err(e)
            }
        }
    }
}

fn create_pipeline(
    device: &ash::Device,
    targets: &RenderTargets,
    layout: vk::PipelineLayout,
    vert_module: vk::ShaderModule,
    frag_module: vk::ShaderModule,
) -> anyhow::Result<vk::Pipeline> {
    let formats = [targets.color_format];
    let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
        .color_attachment_formats(&formats)
        .depth_attachment_format(targets.depth_format);

    let bindings = [vk::VertexInputBindingDescription::default()
        .binding(0)
        .stride(std::mem::size_of::<Vertex>() as u32)
        .input_rate(vk::VertexInputRate::VERTEX)];
    let attributes = [
        vk::VertexInputAttributeDescription::default()
            .location(0)
            .binding(0)
            .format(vk::Format::R32G32_SFLOAT)
            .offset(offset_of!(Vertex, pos) as u32),
        vk::VertexInputAttributeDescription::default()
            .location(1)
            .binding(0)
            .format(vk::Format::R32G32B32A32_SFLOAT)
            .offset(offset_of!(Vertex, color) as u32),
    ];
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let raster = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);

    let multisample = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(false)
        .depth_write_enable(false);

    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::default()
        .blend_enable(true)
        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
        .alpha_blend_op(vk::BlendOp::ADD)
        .color_write_mask(vk::ColorComponentFlags::RGBA);
    let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
        .attachments(std::slice::from_ref(&color_blend_attachment));

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert_module)
            .name(c"main"),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag_module)
            .name(c"main"),
    ];

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .input_assembly_state(&input_assembly)
        .vertex_input_state(&vertex_input)
        .viewport_state(&viewport_state)
        .rasterization_state(&raster)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    let pipelines = unsafe {
        device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|(_, e)| anyhow::anyhow!("failed to create quad pipeline: {:?}", e))?
    };

    pipelines
        .first()
        .copied()
        .ok_or_else(|| anyhow::anyhow!("no pipeline returned from create_graphics_pipelines"))
}

fn create_shader_module(device: &ash::Device, code: &[u32]) -> anyhow::Result<vk::ShaderModule> {
    Ok(unsafe {
        device.create_shader_module(&vk::ShaderModuleCreateInfo::default().code(code), None)?
    })
}
