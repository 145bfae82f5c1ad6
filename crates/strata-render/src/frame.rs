// SPDX-License-Identifier: CEPL-1.0
//! Bounded frames-in-flight protocol.
//!
//! The synchronizer owns the bookkeeping (current slot, which fence guards
//! which swapchain image, whether the swapchain is stale) while a
//! [`FrameTarget`] owns the actual GPU objects. Per frame slot `f`:
//!
//! 1. wait for `in_flight[f]`
//! 2. acquire an image; if another slot still renders into it, wait for that
//!    slot's fence as well
//! 3. write the per-image uniforms
//! 4. reset `in_flight[f]`, submit, present
//! 5. `f = (f + 1) % MAX_FRAMES_IN_FLIGHT`
//!
//! The CPU therefore never runs more than [`MAX_FRAMES_IN_FLIGHT`] frames
//! ahead of the GPU.

use std::fmt;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::{debug, info, trace};

use crate::{RenderError, RenderEvent, RenderSize};

pub const MAX_FRAMES_IN_FLIGHT: usize = 2;
pub const DEFAULT_GPU_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStage {
    Idle,
    Acquiring,
    WaitingForFence,
    Recording,
    Submitted,
    Presenting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame reached the presentation engine.
    Presented,
    /// The swapchain was rebuilt; the frame will be drawn next time.
    Dropped,
    /// The surface has no presentable area; nothing was done.
    Deferred,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquired {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presented {
    Done,
    Suboptimal,
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceWait {
    Signaled,
    TimedOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rebuild {
    Done { image_count: usize },
    /// The surface currently cannot back a swapchain (e.g. zero extent).
    Deferred,
}

/// GPU side of the frame protocol.
///
/// Slots are in `0..MAX_FRAMES_IN_FLIGHT`; image indices are whatever the
/// swapchain hands out.
pub trait FrameTarget {
    type Fence: Copy + PartialEq + fmt::Debug;

    fn in_flight_fence(&self, slot: usize) -> Self::Fence;
    fn wait_fence(&mut self, fence: Self::Fence, timeout: Duration) -> Result<FenceWait>;
    fn reset_fence(&mut self, fence: Self::Fence) -> Result<()>;

    /// Requests the next image, signalling the slot's image-available semaphore.
    fn acquire(&mut self, slot: usize, timeout: Duration) -> Result<Acquired>;
    /// Writes per-frame data (uniforms) for `image_index`.
    fn prepare(&mut self, image_index: u32) -> Result<()>;
    /// Submits the image's commands, signalling the slot's fence.
    fn submit(&mut self, slot: usize, image_index: u32) -> Result<()>;
    fn present(&mut self, slot: usize, image_index: u32) -> Result<Presented>;

    /// Tears down and rebuilds every swapchain-dependent resource.
    fn rebuild(&mut self, size: Option<RenderSize>) -> Result<Rebuild>;
}

pub struct FrameSynchronizer<F> {
    slot: usize,
    images_in_flight: Vec<Option<F>>,
    stage: FrameStage,
    stale: bool,
    pending_size: Option<RenderSize>,
    rebuilds: u64,
    presented: u64,
    timeout: Duration,
}

impl<F: Copy + PartialEq + fmt::Debug> FrameSynchronizer<F> {
    pub fn new(image_count: usize, timeout: Duration) -> Self {
        Self {
            slot: 0,
            images_in_flight: vec![None; image_count],
            stage: FrameStage::Idle,
            stale: false,
            pending_size: None,
            rebuilds: 0,
            presented: 0,
            timeout,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn stage(&self) -> FrameStage {
        self.stage
    }

    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    pub fn frames_presented(&self) -> u64 {
        self.presented
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn images_in_flight(&self) -> &[Option<F>] {
        &self.images_in_flight
    }

    pub fn handle_event(&mut self, event: RenderEvent) {
        match event {
            RenderEvent::Resized(size) => {
                debug!("resize to {}x{} queued", size.width, size.height);
                self.pending_size = Some(size);
            }
            RenderEvent::SurfaceLost => debug!("surface marked stale"),
        }
        self.stale = true;
    }

    /// Runs one iteration of the frame loop against `target`.
    pub fn draw_frame<T>(
        &mut self,
        target: &mut T,
        events: impl IntoIterator<Item = RenderEvent>,
    ) -> Result<FrameOutcome>
    where
        T: FrameTarget<Fence = F>,
    {
        for event in events {
            self.handle_event(event);
        }
        if self.stale {
            return self.rebuild(target);
        }

        let slot = self.slot;
        let frame_fence = target.in_flight_fence(slot);

        self.enter(FrameStage::WaitingForFence);
        self.wait(target, frame_fence, "frame fence")?;

        self.enter(FrameStage::Acquiring);
        let (image_index, suboptimal) = match target.acquire(slot, self.timeout)? {
            Acquired::Image { index, suboptimal } => (index, suboptimal),
            Acquired::OutOfDate => {
                debug!("acquire: swapchain out of date");
                self.stale = true;
                self.enter(FrameStage::Idle);
                return self.rebuild(target);
            }
        };

        let image = image_index as usize;
        let Some(owner) = self.images_in_flight.get(image).copied() else {
            bail!(
                "acquired image {image} but the swapchain has {} images",
                self.images_in_flight.len()
            );
        };
        if let Some(fence) = owner.filter(|&f| f != frame_fence) {
            self.enter(FrameStage::WaitingForFence);
            self.wait(target, fence, "image fence")?;
        }
        self.images_in_flight[image] = Some(frame_fence);

        self.enter(FrameStage::Recording);
        target.prepare(image_index)?;

        target.reset_fence(frame_fence)?;
        target.submit(slot, image_index)?;
        self.enter(FrameStage::Submitted);

        self.enter(FrameStage::Presenting);
        let presented = target.present(slot, image_index)?;
        self.slot = (slot + 1) % MAX_FRAMES_IN_FLIGHT;
        self.enter(FrameStage::Idle);

        match presented {
            Presented::Done if !suboptimal => {
                self.presented += 1;
                Ok(FrameOutcome::Presented)
            }
            Presented::Done | Presented::Suboptimal => {
                debug!("swapchain suboptimal, rebuilding after present");
                self.presented += 1;
                self.stale = true;
                self.rebuild(target)?;
                Ok(FrameOutcome::Presented)
            }
            Presented::OutOfDate => {
                debug!("present: swapchain out of date");
                self.stale = true;
                self.rebuild(target)
            }
        }
    }

    fn rebuild<T>(&mut self, target: &mut T) -> Result<FrameOutcome>
    where
        T: FrameTarget<Fence = F>,
    {
        match target.rebuild(self.pending_size)? {
            Rebuild::Done { image_count } => {
                self.rebuilds += 1;
                self.stale = false;
                self.pending_size = None;
                self.images_in_flight = vec![None; image_count];
                info!(
                    "swapchain rebuilt ({} images, rebuild #{})",
                    image_count, self.rebuilds
                );
                Ok(FrameOutcome::Dropped)
            }
            Rebuild::Deferred => {
                trace!("swapchain rebuild deferred");
                Ok(FrameOutcome::Deferred)
            }
        }
    }

    fn wait<T>(&self, target: &mut T, fence: F, what: &'static str) -> Result<()>
    where
        T: FrameTarget<Fence = F>,
    {
        match target.wait_fence(fence, self.timeout)? {
            FenceWait::Signaled => Ok(()),
            FenceWait::TimedOut => Err(RenderError::GpuTimeout {
                what,
                timeout: self.timeout,
            }
            .into()),
        }
    }

    fn enter(&mut self, stage: FrameStage) {
        trace!(slot = self.slot, ?stage, "frame stage");
        self.stage = stage;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    const LATENCY: u64 = 10;

    #[derive(Clone, Copy, Debug, PartialEq)]
    enum MockFence {
        Signaled,
        Unsignaled,
        Pending { done_at: u64 },
    }

    /// GPU stand-in with a tick clock: every acquire costs the CPU one tick
    /// and every submit completes `LATENCY` ticks later. Waiting on a pending
    /// fence jumps the clock forward and is recorded as a block.
    struct MockGpu {
        clock: u64,
        images: usize,
        next_image: u32,
        fences: [MockFence; MAX_FRAMES_IN_FLIGHT],
        surface_stale: bool,
        defer_rebuild: bool,
        hang: bool,
        acquire_script: VecDeque<Acquired>,
        present_script: VecDeque<Presented>,
        blocked_on: Vec<usize>,
        prepared: Vec<u32>,
        submits: Vec<(usize, u32)>,
        rebuilds: Vec<Option<RenderSize>>,
    }

    impl MockGpu {
        fn new(images: usize) -> Self {
            Self {
                clock: 0,
                images,
                next_image: 0,
                fences: [MockFence::Signaled; MAX_FRAMES_IN_FLIGHT],
                surface_stale: false,
                defer_rebuild: false,
                hang: false,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                blocked_on: Vec::new(),
                prepared: Vec::new(),
                submits: Vec::new(),
                rebuilds: Vec::new(),
            }
        }

        fn pending_fences(&self) -> usize {
            self.fences
                .iter()
                .filter(|f| matches!(f, MockFence::Pending { done_at } if *done_at > self.clock))
                .count()
        }
    }

    impl FrameTarget for MockGpu {
        type Fence = usize;

        fn in_flight_fence(&self, slot: usize) -> usize {
            slot
        }

        fn wait_fence(&mut self, fence: usize, _timeout: Duration) -> Result<FenceWait> {
            match self.fences[fence] {
                MockFence::Signaled => Ok(FenceWait::Signaled),
                MockFence::Pending { done_at } if done_at <= self.clock => {
                    self.fences[fence] = MockFence::Signaled;
                    Ok(FenceWait::Signaled)
                }
                MockFence::Pending { .. } if self.hang => Ok(FenceWait::TimedOut),
                MockFence::Pending { done_at } => {
                    self.blocked_on.push(fence);
                    self.clock = done_at;
                    self.fences[fence] = MockFence::Signaled;
                    Ok(FenceWait::Signaled)
                }
                MockFence::Unsignaled => Ok(FenceWait::TimedOut),
            }
        }

        fn reset_fence(&mut self, fence: usize) -> Result<()> {
            self.fences[fence] = MockFence::Unsignaled;
            Ok(())
        }

        fn acquire(&mut self, _slot: usize, _timeout: Duration) -> Result<Acquired> {
            self.clock += 1;
            if self.surface_stale {
                return Ok(Acquired::OutOfDate);
            }
            if let Some(scripted) = self.acquire_script.pop_front() {
                return Ok(scripted);
            }
            let index = self.next_image;
            self.next_image = (self.next_image + 1) % self.images as u32;
            Ok(Acquired::Image {
                index,
                suboptimal: false,
            })
        }

        fn prepare(&mut self, image_index: u32) -> Result<()> {
            self.prepared.push(image_index);
            Ok(())
        }

        fn submit(&mut self, slot: usize, image_index: u32) -> Result<()> {
            assert_eq!(self.fences[slot], MockFence::Unsignaled);
            self.fences[slot] = MockFence::Pending {
                done_at: self.clock + LATENCY,
            };
            self.submits.push((slot, image_index));
            Ok(())
        }

        fn present(&mut self, _slot: usize, _image_index: u32) -> Result<Presented> {
            Ok(self.present_script.pop_front().unwrap_or(Presented::Done))
        }

        fn rebuild(&mut self, size: Option<RenderSize>) -> Result<Rebuild> {
            if self.defer_rebuild {
                return Ok(Rebuild::Deferred);
            }
            self.surface_stale = false;
            self.next_image = 0;
            self.rebuilds.push(size);
            Ok(Rebuild::Done {
                image_count: self.images,
            })
        }
    }

    fn sync(gpu: &MockGpu) -> FrameSynchronizer<usize> {
        FrameSynchronizer::new(gpu.images, DEFAULT_GPU_TIMEOUT)
    }

    fn no_events() -> Vec<RenderEvent> {
        Vec::new()
    }

    #[test]
    fn third_frame_blocks_on_first_fence() {
        let mut gpu = MockGpu::new(3);
        let mut sync = sync(&gpu);

        for _ in 0..2 {
            let out = sync.draw_frame(&mut gpu, no_events()).unwrap();
            assert_eq!(out, FrameOutcome::Presented);
            assert!(gpu.pending_fences() <= MAX_FRAMES_IN_FLIGHT);
        }
        assert!(gpu.blocked_on.is_empty());
        assert_eq!(gpu.pending_fences(), 2);

        sync.draw_frame(&mut gpu, no_events()).unwrap();
        assert_eq!(gpu.blocked_on, vec![0]);
        // frame 1 was submitted at tick 1
        assert!(gpu.clock >= 1 + LATENCY);
        assert_eq!(gpu.submits, vec![(0, 0), (1, 1), (0, 2)]);
        assert_eq!(sync.slot(), 1);
    }

    #[test]
    fn in_flight_never_exceeds_bound() {
        let mut gpu = MockGpu::new(4);
        let mut sync = sync(&gpu);
        for _ in 0..32 {
            sync.draw_frame(&mut gpu, no_events()).unwrap();
            assert!(gpu.pending_fences() <= MAX_FRAMES_IN_FLIGHT);
            assert_eq!(sync.stage(), FrameStage::Idle);
        }
        assert_eq!(sync.frames_presented(), 32);
    }

    #[test]
    fn reused_image_waits_for_its_previous_fence() {
        let mut gpu = MockGpu::new(3);
        gpu.acquire_script.extend([
            Acquired::Image {
                index: 0,
                suboptimal: false,
            },
            Acquired::Image {
                index: 0,
                suboptimal: false,
            },
        ]);
        let mut sync = sync(&gpu);

        sync.draw_frame(&mut gpu, no_events()).unwrap();
        assert_eq!(sync.images_in_flight()[0], Some(0));
        assert!(gpu.blocked_on.is_empty());

        // slot 1's own fence is free, but image 0 is still owned by slot 0
        sync.draw_frame(&mut gpu, no_events()).unwrap();
        assert_eq!(gpu.blocked_on, vec![0]);
        assert_eq!(sync.images_in_flight()[0], Some(1));
        assert_eq!(gpu.prepared, vec![0, 0]);
    }

    #[test]
    fn out_of_date_acquire_rebuilds_once() {
        let mut gpu = MockGpu::new(3);
        let mut sync = sync(&gpu);
        sync.draw_frame(&mut gpu, no_events()).unwrap();

        gpu.surface_stale = true;
        let out = sync.draw_frame(&mut gpu, no_events()).unwrap();
        assert_eq!(out, FrameOutcome::Dropped);
        assert_eq!(sync.rebuilds(), 1);
        assert_eq!(gpu.submits.len(), 1);

        let out = sync.draw_frame(&mut gpu, no_events()).unwrap();
        assert_eq!(out, FrameOutcome::Presented);
        assert_eq!(sync.rebuilds(), 1);
        assert_eq!(gpu.rebuilds.len(), 1);
        assert_eq!(gpu.submits.len(), 2);
    }

    #[test]
    fn out_of_date_present_rebuilds() {
        let mut gpu = MockGpu::new(2);
        gpu.present_script.push_back(Presented::OutOfDate);
        let mut sync = sync(&gpu);

        let out = sync.draw_frame(&mut gpu, no_events()).unwrap();
        assert_eq!(out, FrameOutcome::Dropped);
        assert_eq!(sync.rebuilds(), 1);
        // the submit went through, so the slot still advances
        assert_eq!(sync.slot(), 1);
        assert!(sync.images_in_flight().iter().all(Option::is_none));
    }

    #[test]
    fn suboptimal_acquire_presents_then_rebuilds() {
        let mut gpu = MockGpu::new(3);
        gpu.acquire_script.push_back(Acquired::Image {
            index: 0,
            suboptimal: true,
        });
        let mut sync = sync(&gpu);

        let out = sync.draw_frame(&mut gpu, no_events()).unwrap();
        assert_eq!(out, FrameOutcome::Presented);
        assert_eq!(gpu.submits, vec![(0, 0)]);
        assert_eq!(sync.rebuilds(), 1);
    }

    #[test]
    fn resize_events_coalesce_with_out_of_date() {
        let mut gpu = MockGpu::new(3);
        gpu.surface_stale = true;
        let mut sync = sync(&gpu);

        let events = [
            RenderEvent::Resized(RenderSize::new(800, 600)),
            RenderEvent::Resized(RenderSize::new(1024, 768)),
        ];
        let out = sync.draw_frame(&mut gpu, events).unwrap();
        assert_eq!(out, FrameOutcome::Dropped);
        assert_eq!(gpu.rebuilds, vec![Some(RenderSize::new(1024, 768))]);

        let out = sync.draw_frame(&mut gpu, no_events()).unwrap();
        assert_eq!(out, FrameOutcome::Presented);
        assert_eq!(sync.rebuilds(), 1);
    }

    #[test]
    fn minimised_window_keeps_running() {
        let mut gpu = MockGpu::new(3);
        let mut sync = sync(&gpu);
        sync.draw_frame(&mut gpu, no_events()).unwrap();

        let out = sync
            .draw_frame(&mut gpu, [RenderEvent::Resized(RenderSize::new(0, 0))])
            .unwrap();
        assert_eq!(out, FrameOutcome::Dropped);
        assert_eq!(gpu.rebuilds, vec![Some(RenderSize::new(0, 0))]);

        for _ in 0..4 {
            let out = sync.draw_frame(&mut gpu, no_events()).unwrap();
            assert_eq!(out, FrameOutcome::Presented);
        }
    }

    #[test]
    fn deferred_rebuild_stays_stale() {
        let mut gpu = MockGpu::new(3);
        gpu.defer_rebuild = true;
        let mut sync = sync(&gpu);

        let out = sync
            .draw_frame(&mut gpu, [RenderEvent::SurfaceLost])
            .unwrap();
        assert_eq!(out, FrameOutcome::Deferred);
        assert!(sync.is_stale());
        assert_eq!(sync.rebuilds(), 0);
        assert!(gpu.submits.is_empty());

        gpu.defer_rebuild = false;
        let out = sync.draw_frame(&mut gpu, no_events()).unwrap();
        assert_eq!(out, FrameOutcome::Dropped);
        assert!(!sync.is_stale());
        assert_eq!(sync.rebuilds(), 1);
    }

    #[test]
    fn rebuild_resizes_image_table() {
        let mut gpu = MockGpu::new(2);
        let mut sync = sync(&gpu);
        sync.draw_frame(&mut gpu, no_events()).unwrap();
        assert_eq!(sync.images_in_flight().len(), 2);

        gpu.images = 4;
        sync.draw_frame(&mut gpu, [RenderEvent::SurfaceLost]).unwrap();
        assert_eq!(sync.images_in_flight().len(), 4);
        assert!(sync.images_in_flight().iter().all(Option::is_none));
    }

    #[test]
    fn stuck_gpu_is_a_timeout() {
        let mut gpu = MockGpu::new(3);
        gpu.hang = true;
        let mut sync = sync(&gpu);
        sync.draw_frame(&mut gpu, no_events()).unwrap();
        sync.draw_frame(&mut gpu, no_events()).unwrap();

        let err = sync.draw_frame(&mut gpu, no_events()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RenderError>(),
            Some(RenderError::GpuTimeout {
                what: "frame fence",
                ..
            })
        ));
    }

    #[test]
    fn out_of_range_image_is_an_error() {
        let mut gpu = MockGpu::new(2);
        gpu.acquire_script.push_back(Acquired::Image {
            index: 7,
            suboptimal: false,
        });
        let mut sync = sync(&gpu);
        assert!(sync.draw_frame(&mut gpu, no_events()).is_err());
    }
}
