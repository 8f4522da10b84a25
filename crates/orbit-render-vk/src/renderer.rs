// SPDX-License-Identifier: CEPL-1.0
use crate::command::CommandRecorder;
use crate::context::{ContextDesc, GraphicsContext};
use crate::descriptors::{FrameDescriptors, FrameUniforms};
use crate::mesh::Mesh;
use crate::pipeline::{PipelineState, ShaderStages};
use crate::swapchain::{PresentPreference, SurfaceChain};
use crate::sync::FrameSync;
use crate::targets::RenderTargets;
use crate::texture::Texture;
use anyhow::{Context, Result};
use ash::vk;
use orbit_math::SceneUniforms;
use orbit_render::{
    Acquired, ChainStatus, FrameBackend, MeshData, RenderError, RenderSize, TextureData,
    MAX_FRAMES_IN_FLIGHT,
};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::info;

pub struct RendererDesc<'a> {
    pub size: RenderSize,
    pub app_name: &'a str,
    pub validation: bool,
    pub force_render_pass: bool,
    pub present: PresentPreference,
    pub clear_color: [f32; 4],
    pub shaders: ShaderStages,
    pub mesh: &'a MeshData,
    pub texture: &'a TextureData,
}

/// The Vulkan side of [`orbit_render::FrameLoop`].
///
/// Field order is teardown order: everything created from the device goes
/// before the swapchain, and the context goes last.
pub struct VkRenderer {
    sync: FrameSync,
    commands: CommandRecorder,
    uniforms: FrameUniforms,
    descriptors: FrameDescriptors,
    mesh: Mesh,
    // sampled through the descriptor sets
    _texture: Texture,
    targets: RenderTargets,
    pipeline: PipelineState,
    chain: SurfaceChain,
    shaders: ShaderStages,
    clear: [f32; 4],
    ctx: GraphicsContext,
}

impl VkRenderer {
    pub fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        desc: RendererDesc<'_>,
    ) -> Result<Self> {
        // STRICT ORDER:
        // 1) context (instance -> surface -> device)
        // 2) swapchain from the context's surface
        // 3) command pool: uploads need it
        // 4) mesh + texture through staging
        // 5) per-slot uniform buffers
        // 6) depth (+ render pass / framebuffers) sized by the chain
        // 7) pipeline against those attachments
        // 8) descriptor sets: uniforms + texture, laid out by the pipeline
        // 9) sync objects, render-finished per chain image
        let ctx = GraphicsContext::new(
            window,
            display,
            &ContextDesc {
                app_name: desc.app_name,
                validation: desc.validation,
                force_render_pass: desc.force_render_pass,
            },
        )
        .context("graphics context")?;

        let mut chain = SurfaceChain::new(&ctx, desc.present);
        chain.create(&ctx, desc.size).context("swapchain")?;

        let commands = CommandRecorder::new(
            ctx.device(),
            ctx.queue(),
            ctx.queue_family(),
            MAX_FRAMES_IN_FLIGHT,
        )?;
        let mesh = Mesh::upload(&ctx, &commands, desc.mesh).context("mesh upload")?;
        let texture = Texture::upload(&ctx, &commands, desc.texture).context("texture upload")?;
        let uniforms = FrameUniforms::new(&ctx, MAX_FRAMES_IN_FLIGHT)?;
        let targets = RenderTargets::new(&ctx, &chain).context("render targets")?;
        let pipeline = PipelineState::build(ctx.device(), &desc.shaders, targets.attachment_target())
            .context("graphics pipeline")?;
        let descriptors = FrameDescriptors::new(
            ctx.device(),
            pipeline.set_layout(),
            &uniforms,
            texture.view(),
            texture.sampler(),
        )?;
        let sync = FrameSync::new(ctx.device(), MAX_FRAMES_IN_FLIGHT, chain.image_count())?;

        info!(
            adapter = ctx.adapter_name(),
            path = ?ctx.render_path(),
            depth = ?targets.depth_format(),
            indices = mesh.index_count(),
            "vk: renderer ready"
        );

        Ok(Self {
            sync,
            commands,
            uniforms,
            descriptors,
            mesh,
            _texture: texture,
            targets,
            pipeline,
            chain,
            shaders: desc.shaders,
            clear: desc.clear_color,
            ctx,
        })
    }

    pub fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear = rgba;
    }

    pub fn context(&self) -> &GraphicsContext {
        &self.ctx
    }

    pub fn chain(&self) -> &SurfaceChain {
        &self.chain
    }

    fn record_draw(&mut self, cb: vk::CommandBuffer, slot: usize, image: u32) -> Result<(), RenderError> {
        let device = self.ctx.device();
        let extent = self.chain.extent();

        self.targets
            .begin(&self.ctx, cb, &self.chain, image, self.clear)?;
        self.pipeline.bind(cb);

        // projection already flips Y, so the viewport stays positive
        let vp = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let sc = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        unsafe {
            device.cmd_set_viewport(cb, 0, std::slice::from_ref(&vp));
            device.cmd_set_scissor(cb, 0, std::slice::from_ref(&sc));
        }

        self.descriptors.bind(cb, self.pipeline.layout(), slot);
        self.mesh.bind(device, cb)?;
        self.mesh.draw(device, cb)?;

        self.targets.end(&self.ctx, cb, &self.chain, image);
        Ok(())
    }
}

impl FrameBackend for VkRenderer {
    fn frames_in_flight(&self) -> usize {
        self.sync.frames()
    }

    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        Ok(self.sync.wait_for_fence(slot)?)
    }

    fn acquire_image(&mut self, slot: usize) -> Result<Acquired> {
        let (image, status) = self
            .chain
            .acquire_next_image(u64::MAX, self.sync.image_available(slot))?;
        Ok(Acquired { image, status })
    }

    fn write_uniforms(&mut self, slot: usize, uniforms: &SceneUniforms) -> Result<()> {
        Ok(self.uniforms.write(slot, uniforms)?)
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        Ok(self.sync.reset_fence(slot)?)
    }

    fn record(&mut self, slot: usize, image: u32) -> Result<()> {
        let cb = self.commands.begin_frame(slot)?;
        let drawn = self.record_draw(cb, slot, image);
        // end even if recording failed
        let ended = self.commands.end_frame(slot);
        drawn?;
        Ok(ended?)
    }

    fn submit(&mut self, slot: usize, image: u32) -> Result<()> {
        let wait_semaphores = [self.sync.image_available(slot)];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [self.sync.render_finished(image)];
        let cbs = [self.commands.buffer(slot)];
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: wait_semaphores.as_ptr(),
            p_wait_dst_stage_mask: wait_stages.as_ptr(),
            command_buffer_count: 1,
            p_command_buffers: cbs.as_ptr(),
            signal_semaphore_count: 1,
            p_signal_semaphores: signal_semaphores.as_ptr(),
            ..Default::default()
        };
        unsafe {
            self.ctx
                .device()
                .queue_submit(self.ctx.queue(), &[submit], self.sync.in_flight(slot))
        }
        .map_err(|e| RenderError::driver("vkQueueSubmit", e))?;
        Ok(())
    }

    fn present(&mut self, image: u32) -> Result<ChainStatus> {
        Ok(self
            .chain
            .present(self.ctx.queue(), self.sync.render_finished(image), image)?)
    }

    fn recreate_chain(&mut self, size: RenderSize) -> Result<()> {
        // STRICT ORDER:
        // 1) chain (waits for device idle, then rebuilds views + chain)
        // 2) render-finished semaphores to the new image count
        // 3) depth + framebuffers (+ render pass on a color format change)
        // 4) pipeline, only when the color format changed
        self.chain.recreate(&self.ctx, size)?;
        self.sync.resize_images(self.chain.image_count())?;
        if self.targets.rebuild(&self.ctx, &self.chain)? {
            info!(format = ?self.chain.format(), "vk: color format changed, rebuilding pipeline");
            self.pipeline
                .rebuild_pipeline(&self.shaders, self.targets.attachment_target())?;
        }
        Ok(())
    }

    fn extent(&self) -> RenderSize {
        self.chain.render_size()
    }

    fn wait_idle(&mut self) -> Result<()> {
        Ok(self.ctx.wait_idle()?)
    }
}

impl Drop for VkRenderer {
    fn drop(&mut self) {
        // fields drop after this, in declaration order
        self.ctx.wait_idle().ok();
    }
}
