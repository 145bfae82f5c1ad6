// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use ash::vk;
use strata_render::MAX_FRAMES_IN_FLIGHT;

use crate::device::DeviceContext;

/// Per-slot synchronisation objects. Slot `f` owns `image_available[f]`,
/// `render_finished[f]` and `in_flight[f]`; nothing is shared across slots.
pub struct FrameSyncSet {
    pub image_available: [vk::Semaphore; MAX_FRAMES_IN_FLIGHT],
    pub render_finished: [vk::Semaphore; MAX_FRAMES_IN_FLIGHT],
    pub in_flight: [vk::Fence; MAX_FRAMES_IN_FLIGHT],
}

impl FrameSyncSet {
    pub unsafe fn new(ctx: &DeviceContext) -> Result<Self> {
        let device = &ctx.device;
        let sem_ci = vk::SemaphoreCreateInfo::default();
        // Signalled so the first wait on each slot returns immediately.
        let fence_ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };

        let mut set = Self {
            image_available: [vk::Semaphore::null(); MAX_FRAMES_IN_FLIGHT],
            render_finished: [vk::Semaphore::null(); MAX_FRAMES_IN_FLIGHT],
            in_flight: [vk::Fence::null(); MAX_FRAMES_IN_FLIGHT],
        };
        for slot in 0..MAX_FRAMES_IN_FLIGHT {
            set.image_available[slot] = device
                .create_semaphore(&sem_ci, None)
                .context("create_semaphore(image_available)")?;
            set.render_finished[slot] = device
                .create_semaphore(&sem_ci, None)
                .context("create_semaphore(render_finished)")?;
            set.in_flight[slot] = device
                .create_fence(&fence_ci, None)
                .context("create_fence(in_flight)")?;

            ctx.set_name(set.image_available[slot], &format!("image available {slot}"));
            ctx.set_name(set.render_finished[slot], &format!("render finished {slot}"));
            ctx.set_name(set.in_flight[slot], &format!("in flight {slot}"));
        }
        Ok(set)
    }

    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for slot in 0..MAX_FRAMES_IN_FLIGHT {
            device.destroy_fence(self.in_flight[slot], None);
            device.destroy_semaphore(self.render_finished[slot], None);
            device.destroy_semaphore(self.image_available[slot], None);
            self.in_flight[slot] = vk::Fence::null();
            self.render_finished[slot] = vk::Semaphore::null();
            self.image_available[slot] = vk::Semaphore::null();
        }
    }
}
