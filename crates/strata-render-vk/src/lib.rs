// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend: device context, swapchain, terrain buffers and the
//! GPU half of the frames-in-flight protocol.

use std::path::PathBuf;
use std::sync::mpsc::{Receiver, Sender};
use std::time::Duration;

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use strata_render::frame::{Acquired, FenceWait, Presented, Rebuild, DEFAULT_GPU_TIMEOUT};
use strata_render::{
    render_events, FrameOutcome, FrameSynchronizer, FrameTarget, RenderEvent, RenderSize,
    Renderer, TerrainMesh, TerrainSource, UniformFrameData, Viewport,
};
use tracing::{debug, info, warn};

pub mod buffer;
pub mod device;
pub mod pipeline;
pub mod swapchain;
pub mod sync;
pub mod uniforms;

use buffer::TerrainBuffers;
use device::{vk_failure, DeviceContext};
pub use pipeline::ShaderSource;
use pipeline::{load_pipeline_cache, pipeline_cache_path, save_pipeline_cache};
use swapchain::{
    buildable_extent, pick_depth_format, SurfaceSupport, SwapchainSettings, SwapchainState,
};
pub use swapchain::VsyncMode;
use sync::FrameSyncSet;
use uniforms::{create_uniform_set_layout, FrameUniforms};

#[derive(Clone, Debug)]
pub struct VkRendererOptions {
    pub clear_color: [f32; 4],
    pub vsync: VsyncMode,
    /// Requests `VK_LAYER_KHRONOS_validation`; ignored if it is not installed.
    pub validation: bool,
    /// Upper bound on every fence wait and image acquisition.
    pub fence_timeout: Duration,
    pub shaders: ShaderSource,
    pub show_grid: bool,
    /// Persist the driver's pipeline cache in the working directory.
    pub pipeline_cache: bool,
}

impl Default for VkRendererOptions {
    fn default() -> Self {
        Self {
            clear_color: [0.02, 0.02, 0.04, 1.0],
            vsync: VsyncMode::default(),
            validation: cfg!(debug_assertions),
            fence_timeout: DEFAULT_GPU_TIMEOUT,
            shaders: ShaderSource::default(),
            show_grid: true,
            pipeline_cache: true,
        }
    }
}

fn timeout_ns(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

fn clear_value(rgba: [f32; 4]) -> vk::ClearValue {
    vk::ClearValue {
        color: vk::ClearColorValue { float32: rgba },
    }
}

/// Every GPU object the renderer owns besides the device itself.
///
/// `swapchain` is `None` while the surface has no presentable area; the
/// frame synchronizer keeps asking for a rebuild until it does.
struct GpuState {
    settings: SwapchainSettings,
    size: RenderSize,
    pipeline_cache: vk::PipelineCache,
    cache_path: Option<PathBuf>,
    set_layout: vk::DescriptorSetLayout,
    swapchain: Option<SwapchainState>,
    uniforms: Option<FrameUniforms>,
    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    sync: FrameSyncSet,
    terrain: Option<TerrainBuffers>,
    viewport: Viewport,
    clear: vk::ClearValue,
    // Dropped last; everything above is destroyed in `Drop` first.
    ctx: DeviceContext,
}

impl GpuState {
    // STRICT ORDER:
    // device -> pipeline cache -> set layout -> command pool -> sync -> swapchain (+ uniforms)
    unsafe fn new(ctx: DeviceContext, size: RenderSize, options: &VkRendererOptions) -> Result<Self> {
        let device = &ctx.device;

        let depth_format = pick_depth_format(|format| {
            ctx.instance
                .get_physical_device_format_properties(ctx.phys, format)
                .optimal_tiling_features
        })?;
        let settings = SwapchainSettings {
            vsync: options.vsync,
            show_grid: options.show_grid,
            shaders: options.shaders.clone(),
            depth_format,
        };

        let cache_path = if options.pipeline_cache {
            std::env::current_dir()
                .ok()
                .map(|dir| pipeline_cache_path(&dir, &ctx.props))
        } else {
            None
        };
        let pipeline_cache = load_pipeline_cache(device, cache_path.as_deref())?;
        let set_layout = create_uniform_set_layout(device)?;

        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            queue_family_index: ctx.queues.graphics,
            ..Default::default()
        };
        let command_pool = device
            .create_command_pool(&pool_info, None)
            .context("create_command_pool")?;
        ctx.set_name(command_pool, "graphics command pool");

        let sync = FrameSyncSet::new(&ctx)?;

        let mut state = Self {
            settings,
            size,
            pipeline_cache,
            cache_path,
            set_layout,
            swapchain: None,
            uniforms: None,
            command_pool,
            command_buffers: Vec::new(),
            sync,
            terrain: None,
            viewport: Viewport::default(),
            clear: clear_value(options.clear_color),
            ctx,
        };
        // A zero-sized surface at startup just leaves the swapchain stale.
        if let Rebuild::Deferred = state.rebuild_swapchain()? {
            info!("vk: surface has no area yet, swapchain deferred");
        }
        Ok(state)
    }

    fn image_count(&self) -> usize {
        self.swapchain.as_ref().map_or(0, SwapchainState::image_count)
    }

    unsafe fn rebuild_swapchain(&mut self) -> Result<Rebuild> {
        let support = SurfaceSupport::query(&self.ctx)?;
        if buildable_extent(&support, self.size).is_none() {
            return Ok(Rebuild::Deferred);
        }

        self.ctx.wait_idle()?;
        self.release_swapchain();

        let state = SwapchainState::build(
            &self.ctx,
            self.size,
            &self.settings,
            self.set_layout,
            self.pipeline_cache,
        )?;
        let image_count = state.image_count();
        self.swapchain = Some(state);
        self.uniforms = Some(FrameUniforms::new(&self.ctx, self.set_layout, image_count)?);

        if self.command_buffers.len() != image_count {
            self.free_command_buffers();
            let alloc_info = vk::CommandBufferAllocateInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
                command_pool: self.command_pool,
                level: vk::CommandBufferLevel::PRIMARY,
                command_buffer_count: image_count as u32,
                ..Default::default()
            };
            self.command_buffers = self
                .ctx
                .device
                .allocate_command_buffers(&alloc_info)
                .context("allocate_command_buffers")?;
        }
        self.record_commands()?;
        Ok(Rebuild::Done { image_count })
    }

    /// Device must be idle.
    unsafe fn release_swapchain(&mut self) {
        if let Some(mut uniforms) = self.uniforms.take() {
            uniforms.destroy(&self.ctx.device);
        }
        if let Some(mut state) = self.swapchain.take() {
            state.destroy(&self.ctx);
        }
    }

    unsafe fn free_command_buffers(&mut self) {
        if !self.command_buffers.is_empty() {
            self.ctx
                .device
                .free_command_buffers(self.command_pool, &self.command_buffers);
            self.command_buffers.clear();
        }
    }

    /// Pre-records one command buffer per swapchain image. The device must be
    /// idle, since buffers still pending on the GPU cannot be re-recorded.
    unsafe fn record_commands(&mut self) -> Result<()> {
        let (Some(state), Some(uniforms)) = (&self.swapchain, &self.uniforms) else {
            return Ok(());
        };
        let device = &self.ctx.device;
        let extent = state.extent();

        for (i, &cmd) in self.command_buffers.iter().enumerate() {
            let begin = vk::CommandBufferBeginInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
                ..Default::default()
            };
            device
                .begin_command_buffer(cmd, &begin)
                .context("begin_command_buffer")?;

            let clears = [
                self.clear,
                vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 1.0,
                        stencil: 0,
                    },
                },
            ];
            let rp_begin = vk::RenderPassBeginInfo {
                s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
                render_pass: state.render_pass,
                framebuffer: state.images[i].framebuffer,
                render_area: vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                },
                clear_value_count: clears.len() as u32,
                p_clear_values: clears.as_ptr(),
                ..Default::default()
            };
            device.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);

            // Y is flipped in the projection, so the viewport stays positive.
            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            };
            let pipelines = &state.pipelines;
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipelines.surface);
            device.cmd_set_viewport(cmd, 0, std::slice::from_ref(&viewport));
            device.cmd_set_scissor(cmd, 0, std::slice::from_ref(&scissor));
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pipelines.layout,
                0,
                &[uniforms.set(i)],
                &[],
            );

            if let Some(terrain) = &self.terrain {
                device.cmd_bind_vertex_buffers(cmd, 0, &[terrain.vertices.buffer.buffer], &[0]);
                device.cmd_bind_index_buffer(
                    cmd,
                    terrain.surface.buffer.buffer,
                    0,
                    vk::IndexType::UINT32,
                );
                device.cmd_draw_indexed(cmd, terrain.surface.count, 1, 0, 0, 0);

                if let Some(grid) = pipelines.grid.filter(|_| terrain.grid.count > 0) {
                    device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, grid);
                    device.cmd_bind_index_buffer(
                        cmd,
                        terrain.grid.buffer.buffer,
                        0,
                        vk::IndexType::UINT32,
                    );
                    device.cmd_draw_indexed(cmd, terrain.grid.count, 1, 0, 0, 0);
                }
            }

            device.cmd_end_render_pass(cmd);
            device
                .end_command_buffer(cmd)
                .context("end_command_buffer")?;
        }
        debug!("vk: recorded {} command buffers", self.command_buffers.len());
        Ok(())
    }

    unsafe fn replace_terrain(&mut self, mesh: &TerrainMesh) -> Result<()> {
        self.ctx.wait_idle()?;
        if let Some(mut old) = self.terrain.take() {
            old.destroy(&self.ctx.device);
        }
        self.terrain = TerrainBuffers::upload(&self.ctx, self.command_pool, mesh)?;
        self.record_commands()
    }
}

impl FrameTarget for GpuState {
    type Fence = vk::Fence;

    fn in_flight_fence(&self, slot: usize) -> vk::Fence {
        self.sync.in_flight[slot]
    }

    fn wait_fence(&mut self, fence: vk::Fence, timeout: Duration) -> Result<FenceWait> {
        let waited = unsafe {
            self.ctx
                .device
                .wait_for_fences(&[fence], true, timeout_ns(timeout))
        };
        match waited {
            Ok(()) => Ok(FenceWait::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(FenceWait::TimedOut),
            Err(e) => Err(vk_failure("wait_for_fences", e)),
        }
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
        unsafe { self.ctx.device.reset_fences(&[fence]) }
            .map_err(|e| vk_failure("reset_fences", e))
    }

    fn acquire(&mut self, slot: usize, timeout: Duration) -> Result<Acquired> {
        let Some(state) = &self.swapchain else {
            return Ok(Acquired::OutOfDate);
        };
        let acquired = unsafe {
            self.ctx.swapchain_loader.acquire_next_image(
                state.swapchain,
                timeout_ns(timeout),
                self.sync.image_available[slot],
                vk::Fence::null(),
            )
        };
        match acquired {
            Ok((index, suboptimal)) => Ok(Acquired::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquired::OutOfDate),
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => {
                Err(strata_render::RenderError::GpuTimeout {
                    what: "swapchain image",
                    timeout,
                }
                .into())
            }
            Err(e) => Err(vk_failure("acquire_next_image", e)),
        }
    }

    fn prepare(&mut self, image_index: u32) -> Result<()> {
        let (Some(state), Some(uniforms)) = (&self.swapchain, &self.uniforms) else {
            return Ok(());
        };
        let extent = state.extent();
        let data = UniformFrameData::for_viewport(&self.viewport, extent.width, extent.height);
        unsafe { uniforms.write(&self.ctx.device, image_index as usize, &data) }
    }

    fn submit(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let cmd = *self
            .command_buffers
            .get(image_index as usize)
            .with_context(|| format!("no command buffer for image {image_index}"))?;
        let wait_semaphores = [self.sync.image_available[slot]];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [self.sync.render_finished[slot]];

        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: wait_semaphores.len() as u32,
            p_wait_semaphores: wait_semaphores.as_ptr(),
            p_wait_dst_stage_mask: wait_stages.as_ptr(),
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            signal_semaphore_count: signal_semaphores.len() as u32,
            p_signal_semaphores: signal_semaphores.as_ptr(),
            ..Default::default()
        };
        unsafe {
            self.ctx.device.queue_submit(
                self.ctx.graphics_queue,
                std::slice::from_ref(&submit),
                self.sync.in_flight[slot],
            )
        }
        .map_err(|e| vk_failure("queue_submit", e))
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<Presented> {
        let Some(state) = &self.swapchain else {
            return Ok(Presented::OutOfDate);
        };
        let wait_semaphores = [self.sync.render_finished[slot]];
        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: wait_semaphores.len() as u32,
            p_wait_semaphores: wait_semaphores.as_ptr(),
            swapchain_count: 1,
            p_swapchains: &state.swapchain,
            p_image_indices: &image_index,
            ..Default::default()
        };
        let presented = unsafe {
            self.ctx
                .swapchain_loader
                .queue_present(self.ctx.present_queue, &present)
        };
        match presented {
            Ok(false) => Ok(Presented::Done),
            Ok(true) => Ok(Presented::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Presented::OutOfDate),
            Err(e) => Err(vk_failure("queue_present", e)),
        }
    }

    fn rebuild(&mut self, size: Option<RenderSize>) -> Result<Rebuild> {
        if let Some(size) = size {
            self.size = size;
        }
        unsafe { self.rebuild_swapchain() }
    }
}

// STRICT TEARDOWN ORDER (reverse of creation), device context last.
impl Drop for GpuState {
    fn drop(&mut self) {
        unsafe {
            self.ctx.wait_idle().ok();
            if let Some(path) = &self.cache_path {
                save_pipeline_cache(&self.ctx.device, self.pipeline_cache, path);
            }

            let device = &self.ctx.device;
            if let Some(mut terrain) = self.terrain.take() {
                terrain.destroy(device);
            }
            self.release_swapchain();
            let device = &self.ctx.device;
            device.destroy_command_pool(self.command_pool, None);
            self.sync.destroy(device);
            device.destroy_descriptor_set_layout(self.set_layout, None);
            device.destroy_pipeline_cache(self.pipeline_cache, None);
        }
    }
}

pub struct VkRenderer {
    frames: FrameSynchronizer<vk::Fence>,
    events_tx: Sender<RenderEvent>,
    events_rx: Receiver<RenderEvent>,
    gpu: GpuState,
}

impl VkRenderer {
    /// Handle for queuing resize or surface-lost notifications from elsewhere.
    pub fn events(&self) -> Sender<RenderEvent> {
        self.events_tx.clone()
    }

    pub fn rebuilds(&self) -> u64 {
        self.frames.rebuilds()
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames.frames_presented()
    }

    pub fn device_name(&self) -> String {
        self.gpu
            .ctx
            .props
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl Renderer for VkRenderer {
    type Options = VkRendererOptions;

    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        options: VkRendererOptions,
    ) -> Result<Self> {
        let ctx = DeviceContext::new(window, display, options.validation)?;
        let gpu = unsafe { GpuState::new(ctx, size, &options)? };

        let mut frames = FrameSynchronizer::new(gpu.image_count(), options.fence_timeout);
        if gpu.swapchain.is_none() {
            frames.handle_event(RenderEvent::SurfaceLost);
        }
        let (events_tx, events_rx) = render_events();

        if let Some(state) = &gpu.swapchain {
            let extent = state.extent();
            info!(
                "vk: renderer ready ({}x{}, {} images, {} frames in flight)",
                extent.width,
                extent.height,
                state.image_count(),
                strata_render::MAX_FRAMES_IN_FLIGHT,
            );
        }
        Ok(Self {
            frames,
            events_tx,
            events_rx,
            gpu,
        })
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        self.events_tx
            .send(RenderEvent::Resized(size))
            .context("render event channel closed")
    }

    fn render(&mut self, viewport: &Viewport) -> Result<FrameOutcome> {
        self.gpu.viewport = *viewport;
        self.frames
            .draw_frame(&mut self.gpu, self.events_rx.try_iter())
    }

    fn upload_terrain(&mut self, terrain: &dyn TerrainSource) -> Result<()> {
        let mesh = TerrainMesh::build(terrain)?;
        unsafe { self.gpu.replace_terrain(&mesh) }
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.gpu.clear = clear_value(rgba);
        let rerecorded = self
            .gpu
            .ctx
            .wait_idle()
            .and_then(|()| unsafe { self.gpu.record_commands() });
        if let Err(e) = rerecorded {
            warn!("vk: clear colour change not applied: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_saturates() {
        assert_eq!(timeout_ns(Duration::from_millis(5)), 5_000_000);
        assert_eq!(timeout_ns(Duration::MAX), u64::MAX);
    }

    #[test]
    fn default_options() {
        let opts = VkRendererOptions::default();
        assert_eq!(opts.fence_timeout, DEFAULT_GPU_TIMEOUT);
        assert_eq!(opts.vsync, VsyncMode::Mailbox);
        assert_eq!(opts.shaders, ShaderSource::Embedded);
        assert!(opts.show_grid);
    }

    #[test]
    fn clear_value_carries_rgba() {
        let v = clear_value([0.1, 0.2, 0.3, 1.0]);
        assert_eq!(unsafe { v.color.float32 }, [0.1, 0.2, 0.3, 1.0]);
    }
}
