// SPDX-License-Identifier: CEPL-1.0
//! Swapchain policy and the swapchain-scoped resource bundle.
//!
//! Everything that depends on the surface extent or format lives in
//! [`SwapchainState`] and is rebuilt as a unit.

use anyhow::{ensure, Context, Result};
use ash::vk;
use strata_render::{RenderError, RenderSize};
use tracing::info;

use crate::device::DeviceContext;
use crate::pipeline::{create_pipelines, create_render_pass, Pipelines, ShaderSource};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VsyncMode {
    /// Low latency, uncapped; falls back to FIFO.
    #[default]
    Mailbox,
    /// Locked to the display refresh.
    Fifo,
}

/// What the surface offers, queried fresh before every (re)build.
#[derive(Clone, Debug, Default)]
pub struct SurfaceSupport {
    pub caps: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub unsafe fn query(ctx: &DeviceContext) -> Result<Self> {
        let loader = &ctx.surface_loader;
        Ok(Self {
            caps: loader
                .get_physical_device_surface_capabilities(ctx.phys, ctx.surface)
                .context("get_physical_device_surface_capabilities")?,
            formats: loader
                .get_physical_device_surface_formats(ctx.phys, ctx.surface)
                .context("get_physical_device_surface_formats")?,
            present_modes: loader
                .get_physical_device_surface_present_modes(ctx.phys, ctx.surface)
                .context("get_physical_device_surface_present_modes")?,
        })
    }

    /// A fixed current extent of zero means the window is minimised.
    pub fn is_zero_extent(&self) -> bool {
        self.caps.current_extent.width == 0 || self.caps.current_extent.height == 0
    }
}

/// Creation parameters derived from [`SurfaceSupport`]; pure, so the same
/// inputs always give the same plan.
#[derive(Clone, Copy, Debug)]
pub struct SwapchainPlan {
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
}

impl SwapchainPlan {
    pub fn new(support: &SurfaceSupport, want: RenderSize, vsync: VsyncMode) -> Result<Self> {
        let format = choose_surface_format(&support.formats)
            .context("surface reports no formats")?;
        let caps = &support.caps;

        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        Ok(Self {
            format,
            present_mode: choose_present_mode(&support.present_modes, vsync),
            extent: extent_from_caps(caps, want),
            image_count: image_count(caps),
            pre_transform,
            composite_alpha: choose_composite_alpha(caps.supported_composite_alpha),
        })
    }
}

/// 8-bit sRGB with the sRGB non-linear colour space, else whatever comes first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            matches!(
                f.format,
                vk::Format::B8G8R8A8_SRGB | vk::Format::R8G8B8A8_SRGB
            ) && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: VsyncMode) -> vk::PresentModeKHR {
    match vsync {
        VsyncMode::Mailbox if modes.contains(&vk::PresentModeKHR::MAILBOX) => {
            vk::PresentModeKHR::MAILBOX
        }
        // FIFO is the only mode every implementation must support.
        _ => vk::PresentModeKHR::FIFO,
    }
}

pub fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    let min = caps.min_image_extent;
    let max = caps.max_image_extent;
    vk::Extent2D {
        width: want.width.clamp(min.width, max.width.max(min.width)).max(1),
        height: want
            .height
            .clamp(min.height, max.height.max(min.height))
            .max(1),
    }
}

/// Extent to build at, or `None` while the surface is minimised.
/// A free-extent surface always builds, clamped up to its minimum.
pub fn buildable_extent(support: &SurfaceSupport, want: RenderSize) -> Option<vk::Extent2D> {
    if support.is_zero_extent() {
        return None;
    }
    Some(extent_from_caps(&support.caps, want))
}

/// One more than the minimum, capped by the maximum (0 means no maximum).
pub fn image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let want = caps.min_image_count + 1;
    if caps.max_image_count == 0 {
        want
    } else {
        want.min(caps.max_image_count)
    }
}

fn choose_composite_alpha(supported: vk::CompositeAlphaFlagsKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ]
    .into_iter()
    .find(|&a| supported.contains(a))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

const DEPTH_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// First depth format whose optimal-tiling features allow a depth attachment.
pub fn pick_depth_format(
    optimal_features: impl Fn(vk::Format) -> vk::FormatFeatureFlags,
) -> Result<vk::Format> {
    DEPTH_CANDIDATES
        .into_iter()
        .find(|&f| optimal_features(f).contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT))
        .ok_or_else(|| RenderError::NoDepthFormat.into())
}

// Info only
pub fn fmt_name(f: vk::Format) -> &'static str {
    match f {
        vk::Format::B8G8R8A8_UNORM => "B8G8R8A8_UNORM",
        vk::Format::B8G8R8A8_SRGB => "B8G8R8A8_SRGB",
        vk::Format::R8G8B8A8_SRGB => "R8G8B8A8_SRGB",
        vk::Format::R8G8B8A8_UNORM => "R8G8B8A8_UNORM",
        vk::Format::D32_SFLOAT => "D32_SFLOAT",
        vk::Format::D32_SFLOAT_S8_UINT => "D32_SFLOAT_S8_UINT",
        vk::Format::D24_UNORM_S8_UINT => "D24_UNORM_S8_UINT",
        _ => "OTHER",
    }
}

pub fn pm_name(m: vk::PresentModeKHR) -> &'static str {
    match m {
        vk::PresentModeKHR::FIFO => "FIFO",
        vk::PresentModeKHR::MAILBOX => "MAILBOX",
        vk::PresentModeKHR::IMMEDIATE => "IMMEDIATE",
        vk::PresentModeKHR::FIFO_RELAXED => "FIFO_RELAXED",
        _ => "OTHER",
    }
}

/// Swapchain settings that survive rebuilds.
#[derive(Clone, Debug, Default)]
pub struct SwapchainSettings {
    pub vsync: VsyncMode,
    pub show_grid: bool,
    pub shaders: ShaderSource,
    pub depth_format: vk::Format,
}

pub struct DepthBuffer {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
}

impl DepthBuffer {
    unsafe fn new(ctx: &DeviceContext, extent: vk::Extent2D, format: vk::Format) -> Result<Self> {
        let device = &ctx.device;
        let img_ci = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let image = device
            .create_image(&img_ci, None)
            .context("create_image(depth)")?;

        let req = device.get_image_memory_requirements(image);
        let alloc = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index: ctx
                .find_memory_type(req.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)?,
            ..Default::default()
        };
        let memory = device
            .allocate_memory(&alloc, None)
            .context("allocate_memory(depth)")?;
        device
            .bind_image_memory(image, memory, 0)
            .context("bind_image_memory(depth)")?;

        let view_ci = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::DEPTH,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        let view = device
            .create_image_view(&view_ci, None)
            .context("create_image_view(depth)")?;

        ctx.set_name(image, "depth image");
        Ok(Self {
            image,
            memory,
            view,
        })
    }

    unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_image_view(self.view, None);
        device.destroy_image(self.image, None);
        device.free_memory(self.memory, None);
        self.view = vk::ImageView::null();
        self.image = vk::Image::null();
        self.memory = vk::DeviceMemory::null();
    }
}

/// Image, view and framebuffer are stored together so their counts can't
/// drift apart.
pub struct SwapchainImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub framebuffer: vk::Framebuffer,
}

pub struct SwapchainState {
    pub swapchain: vk::SwapchainKHR,
    pub plan: SwapchainPlan,
    pub images: Vec<SwapchainImage>,
    pub depth: DepthBuffer,
    pub render_pass: vk::RenderPass,
    pub pipelines: Pipelines,
}

impl SwapchainState {
    // STRICT ORDER (build):
    // swapchain -> image views -> render pass -> depth -> pipelines -> framebuffers
    // The caller re-records command buffers afterwards.
    pub unsafe fn build(
        ctx: &DeviceContext,
        want: RenderSize,
        settings: &SwapchainSettings,
        set_layout: vk::DescriptorSetLayout,
        pipeline_cache: vk::PipelineCache,
    ) -> Result<Self> {
        let device = &ctx.device;
        let support = SurfaceSupport::query(ctx)?;
        let plan = SwapchainPlan::new(&support, want, settings.vsync)?;

        info!(
            "vk: swapchain format: {} present_mode: {} extent: {}x{} images(min={} -> picked={})",
            fmt_name(plan.format.format),
            pm_name(plan.present_mode),
            plan.extent.width,
            plan.extent.height,
            support.caps.min_image_count,
            plan.image_count,
        );

        let family_indices = [ctx.queues.graphics, ctx.queues.present];
        let (sharing_mode, index_count) = if ctx.queues.is_shared() {
            (vk::SharingMode::EXCLUSIVE, 0)
        } else {
            (vk::SharingMode::CONCURRENT, family_indices.len() as u32)
        };

        let swap_info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: ctx.surface,
            min_image_count: plan.image_count,
            image_format: plan.format.format,
            image_color_space: plan.format.color_space,
            image_extent: plan.extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: sharing_mode,
            queue_family_index_count: index_count,
            p_queue_family_indices: family_indices.as_ptr(),
            pre_transform: plan.pre_transform,
            composite_alpha: plan.composite_alpha,
            present_mode: plan.present_mode,
            clipped: vk::TRUE,
            old_swapchain: vk::SwapchainKHR::null(),
            ..Default::default()
        };
        let swapchain = ctx
            .swapchain_loader
            .create_swapchain(&swap_info, None)
            .context("create_swapchain")?;
        let raw_images = ctx
            .swapchain_loader
            .get_swapchain_images(swapchain)
            .context("get_swapchain_images")?;

        let mut views = Vec::with_capacity(raw_images.len());
        for &image in &raw_images {
            let iv_info = vk::ImageViewCreateInfo {
                s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                image,
                view_type: vk::ImageViewType::TYPE_2D,
                format: plan.format.format,
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                ..Default::default()
            };
            views.push(
                device
                    .create_image_view(&iv_info, None)
                    .context("create_image_view(swapchain)")?,
            );
        }

        let render_pass = create_render_pass(device, plan.format.format, settings.depth_format)?;
        let depth = DepthBuffer::new(ctx, plan.extent, settings.depth_format)?;
        let pipelines = create_pipelines(
            device,
            pipeline_cache,
            render_pass,
            set_layout,
            &settings.shaders,
            settings.show_grid,
        )?;

        let mut images = Vec::with_capacity(raw_images.len());
        for (i, (&image, view)) in raw_images.iter().zip(views).enumerate() {
            let attachments = [view, depth.view];
            let fb_info = vk::FramebufferCreateInfo {
                s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
                render_pass,
                attachment_count: attachments.len() as u32,
                p_attachments: attachments.as_ptr(),
                width: plan.extent.width,
                height: plan.extent.height,
                layers: 1,
                ..Default::default()
            };
            let framebuffer = device
                .create_framebuffer(&fb_info, None)
                .context("create_framebuffer")?;
            ctx.set_name(image, &format!("swapchain image {i}"));
            images.push(SwapchainImage {
                image,
                view,
                framebuffer,
            });
        }
        ensure!(!images.is_empty(), "swapchain returned no images");

        ctx.set_name(swapchain, "swapchain");
        ctx.set_name(render_pass, "main render pass");

        Ok(Self {
            swapchain,
            plan,
            images,
            depth,
            render_pass,
            pipelines,
        })
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.plan.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Destroys everything in reverse build order. The device must be idle.
    /// Handles are nulled, so a second call is a no-op.
    pub unsafe fn destroy(&mut self, ctx: &DeviceContext) {
        let device = &ctx.device;
        for img in self.images.drain(..) {
            device.destroy_framebuffer(img.framebuffer, None);
            device.destroy_image_view(img.view, None);
        }
        self.pipelines.destroy(device);
        self.depth.destroy(device);
        device.destroy_render_pass(self.render_pass, None);
        self.render_pass = vk::RenderPass::null();
        ctx.swapchain_loader.destroy_swapchain(self.swapchain, None);
        self.swapchain = vk::SwapchainKHR::null();
    }
}
