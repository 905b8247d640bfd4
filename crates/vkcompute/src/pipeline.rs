//! Compute pipeline construction from SPIR-V.

use std::ffi::CString;

use ash::vk;
use scopeguard::ScopeGuard;
use tracing::{debug, info, warn};

use crate::descriptor::DescriptorLayout;
use crate::device::DeviceContext;
use crate::error::{ComputeError, Result, VkResultExt};
use crate::spirv::SpirvModule;

/// Shader module, pipeline layout and compute pipeline, created and
/// destroyed together.
#[derive(Debug)]
pub struct ComputePipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    module: vk::ShaderModule,
    entry_point: String,
    workgroup_size: [u32; 3],
    released: bool,
}

impl ComputePipeline {
    /// Validate `bytecode` and build a pipeline over exactly one descriptor
    /// set layout.
    pub fn build(
        ctx: &DeviceContext,
        bytecode: &[u8],
        entry_point: &str,
        layout: &DescriptorLayout,
    ) -> Result<Self> {
        let module = SpirvModule::parse(bytecode)?;
        Self::from_module(ctx, &module, entry_point, layout)
    }

    /// Like [`build`](Self::build) for an already parsed module.
    pub fn from_module(
        ctx: &DeviceContext,
        spirv: &SpirvModule,
        entry_point: &str,
        layout: &DescriptorLayout,
    ) -> Result<Self> {
        let ep = spirv.compute_entry_point(entry_point)?;
        let workgroup_size = ep.workgroup_size()?;
        let entry_name = CString::new(entry_point)
            .map_err(|_| ComputeError::shader("entry point name contains a NUL byte"))?;
        let device = ctx.device();

        let module_info = vk::ShaderModuleCreateInfo::default().code(spirv.words());
        // SAFETY: the words passed header and instruction-stream checks.
        let module = unsafe { device.create_shader_module(&module_info, None) }
            .or_shader("vkCreateShaderModule")?;
        // SAFETY: on early return the module is not referenced by anything.
        let module =
            scopeguard::guard(module, |m| unsafe { device.destroy_shader_module(m, None) });

        let set_layouts = [layout.handle()];
        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        // SAFETY: the descriptor set layout is live.
        let pipeline_layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .or_init("vkCreatePipelineLayout")?;
        // SAFETY: as above, unused on early return.
        let pipeline_layout = scopeguard::guard(pipeline_layout, |l| unsafe {
            device.destroy_pipeline_layout(l, None)
        });

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(*module)
            .name(&entry_name);
        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(*pipeline_layout);
        // SAFETY: module, layout and name outlive the call.
        let pipelines = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
        }
        .map_err(|(_, e)| e)
        .or_shader("vkCreateComputePipelines")?;
        let pipeline = pipelines
            .into_iter()
            .next()
            .ok_or_else(|| ComputeError::shader("vkCreateComputePipelines returned no pipeline"))?;

        info!(
            entry_point,
            workgroup_size = ?workgroup_size,
            words = spirv.words().len(),
            "built compute pipeline"
        );
        Ok(Self {
            pipeline,
            layout: ScopeGuard::into_inner(pipeline_layout),
            module: ScopeGuard::into_inner(module),
            entry_point: entry_point.to_string(),
            workgroup_size,
            released: false,
        })
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Workgroup size declared by the entry point.
    pub fn workgroup_size(&self) -> [u32; 3] {
        self.workgroup_size
    }

    /// Destroy pipeline, pipeline layout and shader module.
    pub fn destroy(mut self, ctx: &DeviceContext) {
        let device = ctx.device();
        // SAFETY: no submitted command buffer still references the pipeline.
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
            device.destroy_shader_module(self.module, None);
        }
        self.released = true;
        debug!(entry_point = %self.entry_point, "destroyed compute pipeline");
    }

    /// Destroy this pipeline, then build a new one.
    pub fn rebuild(
        self,
        ctx: &DeviceContext,
        bytecode: &[u8],
        entry_point: &str,
        layout: &DescriptorLayout,
    ) -> Result<Self> {
        self.destroy(ctx);
        Self::build(ctx, bytecode, entry_point, layout)
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        if !self.released {
            warn!(entry_point = %self.entry_point, "compute pipeline dropped without destroy");
        }
    }
}
