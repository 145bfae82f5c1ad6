// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use strata_render::TerrainMesh;
use tracing::info;

use crate::device::DeviceContext;

/// A buffer with its own dedicated allocation.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
}

impl GpuBuffer {
    pub unsafe fn new(
        ctx: &DeviceContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        props: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let device = &ctx.device;
        let bci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let buffer = device.create_buffer(&bci, None).context("create_buffer")?;
        let req = device.get_buffer_memory_requirements(buffer);
        let memory_type_index = match ctx.find_memory_type(req.memory_type_bits, props) {
            Ok(i) => i,
            Err(e) => {
                device.destroy_buffer(buffer, None);
                return Err(e);
            }
        };
        let mai = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index,
            ..Default::default()
        };
        let memory = device.allocate_memory(&mai, None).context("allocate_memory")?;
        device
            .bind_buffer_memory(buffer, memory, 0)
            .context("bind_buffer_memory")?;
        Ok(Self {
            buffer,
            memory,
            size,
        })
    }

    /// Map, copy, unmap. Memory must be host-visible and coherent.
    pub unsafe fn write<T: Pod>(&self, device: &ash::Device, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        anyhow::ensure!(
            bytes.len() as vk::DeviceSize <= self.size,
            "write of {} bytes into a {}-byte buffer",
            bytes.len(),
            self.size
        );
        let ptr = device
            .map_memory(
                self.memory,
                0,
                bytes.len() as vk::DeviceSize,
                vk::MemoryMapFlags::empty(),
            )
            .context("map_memory")?;
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
        device.unmap_memory(self.memory);
        Ok(())
    }

    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_buffer(self.buffer, None);
        device.free_memory(self.memory, None);
        self.buffer = vk::Buffer::null();
        self.memory = vk::DeviceMemory::null();
    }
}

/// One-shot staging upload: host -> staging, then staging -> dst (device-local).
/// Uses the graphics queue and a one-time command buffer; waits until done.
pub unsafe fn upload_via_staging(
    ctx: &DeviceContext,
    cmd_pool: vk::CommandPool,
    dst: &GpuBuffer,
    src_data: &[u8],
) -> Result<()> {
    let device = &ctx.device;

    // 1) staging buffer (HOST_VISIBLE|COHERENT)
    let mut staging = GpuBuffer::new(
        ctx,
        src_data.len() as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;
    let copied = staging.write(device, src_data).and_then(|()| {
        // 2) record one-time copy
        let ai = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: cmd_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let cmd = device
            .allocate_command_buffers(&ai)
            .context("allocate_command_buffers(upload)")?[0];
        let bi = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        device.begin_command_buffer(cmd, &bi)?;
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: src_data.len() as vk::DeviceSize,
        };
        device.cmd_copy_buffer(cmd, staging.buffer, dst.buffer, std::slice::from_ref(&region));
        device.end_command_buffer(cmd)?;

        // 3) submit and wait
        let si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            ..Default::default()
        };
        let done = device
            .queue_submit(ctx.graphics_queue, std::slice::from_ref(&si), vk::Fence::null())
            .context("queue_submit(upload)")
            .and_then(|()| {
                device
                    .queue_wait_idle(ctx.graphics_queue)
                    .context("queue_wait_idle(upload)")
            });
        device.free_command_buffers(cmd_pool, std::slice::from_ref(&cmd));
        done
    });

    // 4) staging is freed whatever happened
    staging.destroy(device);
    copied
}

/// Device-local buffer plus the number of elements it holds.
pub struct GeometryBuffer {
    pub buffer: GpuBuffer,
    pub count: u32,
}

impl GeometryBuffer {
    pub unsafe fn upload<T: Pod>(
        ctx: &DeviceContext,
        cmd_pool: vk::CommandPool,
        usage: vk::BufferUsageFlags,
        data: &[T],
        name: &str,
    ) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mut buffer = GpuBuffer::new(
            ctx,
            bytes.len() as vk::DeviceSize,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        if let Err(e) = upload_via_staging(ctx, cmd_pool, &buffer, bytes) {
            buffer.destroy(&ctx.device);
            return Err(e);
        }
        ctx.set_name(buffer.buffer, name);
        Ok(Self {
            buffer,
            count: data.len() as u32,
        })
    }

    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        self.buffer.destroy(device);
        self.count = 0;
    }
}

/// GPU copy of a [`TerrainMesh`].
pub struct TerrainBuffers {
    pub vertices: GeometryBuffer,
    pub surface: GeometryBuffer,
    pub grid: GeometryBuffer,
}

impl TerrainBuffers {
    /// `None` for an empty mesh: there is nothing to draw and Vulkan does not
    /// allow zero-sized buffers.
    pub unsafe fn upload(
        ctx: &DeviceContext,
        cmd_pool: vk::CommandPool,
        mesh: &TerrainMesh,
    ) -> Result<Option<Self>> {
        if mesh.is_empty() {
            info!("vk: terrain is empty, nothing to upload");
            return Ok(None);
        }
        let mut vertices = GeometryBuffer::upload(
            ctx,
            cmd_pool,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &mesh.vertices,
            "terrain vertices",
        )?;
        let mut surface = match GeometryBuffer::upload(
            ctx,
            cmd_pool,
            vk::BufferUsageFlags::INDEX_BUFFER,
            &mesh.surface_indices,
            "terrain surface indices",
        ) {
            Ok(b) => b,
            Err(e) => {
                vertices.destroy(&ctx.device);
                return Err(e);
            }
        };
        let grid = match GeometryBuffer::upload(
            ctx,
            cmd_pool,
            vk::BufferUsageFlags::INDEX_BUFFER,
            &mesh.grid_indices,
            "terrain grid indices",
        ) {
            Ok(b) => b,
            Err(e) => {
                surface.destroy(&ctx.device);
                vertices.destroy(&ctx.device);
                return Err(e);
            }
        };

        let (w, h) = mesh.size();
        info!(
            "vk: terrain {}x{} uploaded ({} vertices, {} surface indices, {} grid indices)",
            w, h, vertices.count, surface.count, grid.count
        );
        Ok(Some(Self {
            vertices,
            surface,
            grid,
        }))
    }

    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        self.grid.destroy(device);
        self.surface.destroy(device);
        self.vertices.destroy(device);
    }
}
