// SPDX-License-Identifier: CEPL-1.0
use std::mem::size_of;

use anyhow::{Context, Result};
use ash::vk;
use strata_render::UniformFrameData;

use crate::buffer::GpuBuffer;
use crate::device::DeviceContext;

/// Set 0, binding 0: the camera block, read by the vertex stage.
pub unsafe fn create_uniform_set_layout(device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
    let binding = vk::DescriptorSetLayoutBinding {
        binding: 0,
        descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
        descriptor_count: 1,
        stage_flags: vk::ShaderStageFlags::VERTEX,
        ..Default::default()
    };
    let ci = vk::DescriptorSetLayoutCreateInfo {
        s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
        binding_count: 1,
        p_bindings: &binding,
        ..Default::default()
    };
    device
        .create_descriptor_set_layout(&ci, None)
        .context("create_descriptor_set_layout")
}

/// One host-visible uniform buffer and descriptor set per swapchain image.
///
/// An image's buffer is only written after the fence guarding that image
/// has signalled, so the GPU never reads a half-written block.
pub struct FrameUniforms {
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    buffers: Vec<GpuBuffer>,
}

impl FrameUniforms {
    pub unsafe fn new(
        ctx: &DeviceContext,
        set_layout: vk::DescriptorSetLayout,
        image_count: usize,
    ) -> Result<Self> {
        let device = &ctx.device;
        let ubo_size = size_of::<UniformFrameData>() as vk::DeviceSize;

        // 1) UBOs
        let mut buffers = Vec::with_capacity(image_count);
        for i in 0..image_count {
            let ubo = GpuBuffer::new(
                ctx,
                ubo_size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?;
            ctx.set_name(ubo.buffer, &format!("camera ubo {i}"));
            buffers.push(ubo);
        }

        // 2) Pool
        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: image_count as u32,
        }];
        let pool_ci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: image_count as u32,
            pool_size_count: pool_sizes.len() as u32,
            p_pool_sizes: pool_sizes.as_ptr(),
            ..Default::default()
        };
        let pool = device
            .create_descriptor_pool(&pool_ci, None)
            .context("create_descriptor_pool")?;

        // 3) Sets
        let layouts = vec![set_layout; image_count];
        let alloc = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: pool,
            descriptor_set_count: image_count as u32,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };
        let sets = device
            .allocate_descriptor_sets(&alloc)
            .context("allocate_descriptor_sets")?;

        // 4) Point each set at its buffer
        let infos: Vec<vk::DescriptorBufferInfo> = buffers
            .iter()
            .map(|b| vk::DescriptorBufferInfo {
                buffer: b.buffer,
                offset: 0,
                range: ubo_size,
            })
            .collect();
        let writes: Vec<vk::WriteDescriptorSet> = sets
            .iter()
            .zip(&infos)
            .map(|(&set, info)| vk::WriteDescriptorSet {
                s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                dst_set: set,
                dst_binding: 0,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                p_buffer_info: info,
                ..Default::default()
            })
            .collect();
        device.update_descriptor_sets(&writes, &[]);

        // Every block starts as identity until the first frame writes it.
        let initial = UniformFrameData::default();
        for ubo in &buffers {
            ubo.write(device, std::slice::from_ref(&initial))?;
        }

        Ok(Self {
            pool,
            sets,
            buffers,
        })
    }

    pub fn set(&self, image_index: usize) -> vk::DescriptorSet {
        self.sets[image_index]
    }

    pub unsafe fn write(
        &self,
        device: &ash::Device,
        image_index: usize,
        data: &UniformFrameData,
    ) -> Result<()> {
        let ubo = self
            .buffers
            .get(image_index)
            .with_context(|| format!("no uniform buffer for image {image_index}"))?;
        ubo.write(device, std::slice::from_ref(data))
    }

    /// Sets are freed with their pool.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_descriptor_pool(self.pool, None);
        self.pool = vk::DescriptorPool::null();
        self.sets.clear();
        for mut ubo in self.buffers.drain(..) {
            ubo.destroy(device);
        }
    }
}
