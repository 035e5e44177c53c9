//! WGSL to SPIR-V translation and graphics pipeline creation.

use std::ffi::CString;

use ash::vk;

use crate::backend::{BackendError, BackendResult};
use crate::pipeline::RenderPipelineDescriptor;
use crate::shader::{has_entry_point, parse_wgsl};

use super::conversion::{
    convert_compare_function, convert_cull_mode, convert_front_face, convert_texture_format,
    convert_topology, convert_vertex_format,
};
use super::device::VkShader;

/// Translate WGSL into a shader module holding every entry point.
///
/// Unlike wgpu this fails eagerly: there is no SPIR-V without a valid module.
pub fn compile_shader(device: &ash::Device, source: &str) -> BackendResult<VkShader> {
    let parsed = parse_wgsl(source).map_err(|diagnostics| {
        let message = diagnostics
            .first()
            .map(ToString::to_string)
            .unwrap_or_else(|| "invalid WGSL".to_string());
        BackendError::ShaderCompilationFailed(message)
    })?;

    // No coordinate adjustment: the Y flip happens in the viewport.
    let options = naga::back::spv::Options {
        lang_version: (1, 3),
        flags: naga::back::spv::WriterFlags::empty(),
        ..Default::default()
    };
    let spv = naga::back::spv::write_vec(&parsed.module, &parsed.info, &options, None).map_err(
        |e| BackendError::ShaderCompilationFailed(format!("SPIR-V generation error: {e}")),
    )?;

    let create_info = vk::ShaderModuleCreateInfo::default().code(&spv);
    let module = unsafe { device.create_shader_module(&create_info, None) }.map_err(|e| {
        BackendError::ShaderCompilationFailed(format!("Failed to create shader module: {:?}", e))
    })?;

    Ok(VkShader {
        module,
        naga: parsed.module,
    })
}

/// Build a pipeline for dynamic rendering against a single color target.
pub fn create_graphics_pipeline(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    descriptor: &RenderPipelineDescriptor,
    vertex: &VkShader,
    fragment: &VkShader,
) -> BackendResult<vk::Pipeline> {
    let stages = [
        (vertex, &descriptor.vertex.entry_point, naga::ShaderStage::Vertex),
        (fragment, &descriptor.fragment.entry_point, naga::ShaderStage::Fragment),
    ];
    for (shader, entry_point, stage) in stages {
        if !has_entry_point(&shader.naga, entry_point, stage) {
            return Err(BackendError::PipelineCreationFailed(format!(
                "Entry point '{}' not found for stage {:?}",
                entry_point, stage
            )));
        }
    }

    let entry_name = |name: &str| {
        CString::new(name).map_err(|e| {
            BackendError::PipelineCreationFailed(format!("Invalid entry point name: {}", e))
        })
    };
    let vertex_entry = entry_name(&descriptor.vertex.entry_point)?;
    let fragment_entry = entry_name(&descriptor.fragment.entry_point)?;

    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex.module)
            .name(&vertex_entry),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(fragment.module)
            .name(&fragment_entry),
    ];

    let layout_desc = &descriptor.vertex_layout;
    let binding_descriptions = [vk::VertexInputBindingDescription::default()
        .binding(0)
        .stride(layout_desc.array_stride as u32)
        .input_rate(vk::VertexInputRate::VERTEX)];
    let attribute_descriptions: Vec<vk::VertexInputAttributeDescription> = layout_desc
        .attributes
        .iter()
        .map(|attr| {
            vk::VertexInputAttributeDescription::default()
                .location(attr.location)
                .binding(0)
                .format(convert_vertex_format(attr.format))
                .offset(attr.offset as u32)
        })
        .collect();

    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&binding_descriptions)
        .vertex_attribute_descriptions(&attribute_descriptions);

    let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(convert_topology(descriptor.primitive_topology))
        .primitive_restart_enable(false);

    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(convert_cull_mode(descriptor.cull_mode))
        .front_face(convert_front_face(descriptor.front_face))
        .depth_bias_enable(false);

    let multisample = descriptor.multisample.unwrap_or_default();
    let sample_mask = [multisample.mask as u32];
    let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::from_raw(multisample.count))
        .sample_mask(&sample_mask)
        .alpha_to_coverage_enable(multisample.alpha_to_coverage_enabled);

    let depth_stencil_state = match descriptor.depth_stencil {
        Some(ds) => vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(true)
            .depth_write_enable(ds.depth_write_enabled)
            .depth_compare_op(convert_compare_function(ds.depth_compare)),
        None => vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(false)
            .depth_write_enable(false),
    }
    .depth_bounds_test_enable(false)
    .stencil_test_enable(false);

    let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)];
    let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let color_attachment_formats = [convert_texture_format(descriptor.color_format)];
    let depth_attachment_format = descriptor
        .depth_stencil
        .map(|ds| convert_texture_format(ds.format))
        .unwrap_or(vk::Format::UNDEFINED);
    let stencil_attachment_format = descriptor
        .depth_stencil
        .filter(|ds| ds.format.has_stencil())
        .map(|ds| convert_texture_format(ds.format))
        .unwrap_or(vk::Format::UNDEFINED);

    let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
        .color_attachment_formats(&color_attachment_formats)
        .depth_attachment_format(depth_attachment_format)
        .stencil_attachment_format(stencil_attachment_format);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_state)
        .input_assembly_state(&input_assembly_state)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization_state)
        .multisample_state(&multisample_state)
        .depth_stencil_state(&depth_stencil_state)
        .color_blend_state(&color_blend_state)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    let pipelines = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    }
    .map_err(|(_, e)| {
        BackendError::PipelineCreationFailed(format!("Failed to create graphics pipeline: {:?}", e))
    })?;

    pipelines.into_iter().next().ok_or_else(|| {
        BackendError::PipelineCreationFailed("driver returned no pipeline".to_string())
    })
}
