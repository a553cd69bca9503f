// SPDX-License-Identifier: CEPL-1.0
//! Frame lifecycle: Idle -> Begun -> Ended -> Idle.
//!
//! The protocol lives here once, written against [`FrameOps`]; the renderer
//! supplies the GPU side.

use crate::error::{VkError, VkResult};
use crate::FRAMES_IN_FLIGHT;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    Begun,
    Ended,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquired {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentStatus {
    Optimal,
    Suboptimal,
    OutOfDate,
}

/// GPU-side steps of a frame, each addressed by frame slot.
pub trait FrameOps {
    /// Block until the slot's last submission has completed.
    fn wait_fence(&mut self, slot: usize) -> VkResult<()>;
    fn reset_fence(&mut self, slot: usize) -> VkResult<()>;
    /// Acquire the next image, signaling the slot's image-available semaphore.
    fn acquire(&mut self, slot: usize) -> VkResult<Acquired>;
    fn recreate_swapchain(&mut self) -> VkResult<()>;
    /// Slot is free: recycle its buffers and start recording.
    fn begin_recording(&mut self, slot: usize, image: u32) -> VkResult<()>;
    /// Close out every pass, flush uploads and end recording.
    fn finish_recording(&mut self, slot: usize, image: u32, force: bool) -> VkResult<()>;
    /// Submit the slot's command buffer, signaling its fence.
    fn submit(&mut self, slot: usize) -> VkResult<()>;
    fn present(&mut self, slot: usize, image: u32) -> VkResult<PresentStatus>;
    /// Drop a frame that failed after its fence was reset: consume the
    /// image-available semaphore and signal the fence with an empty submit.
    fn abandon(&mut self, slot: usize) -> VkResult<()>;
}

#[derive(Debug)]
pub struct FrameState {
    phase: FramePhase,
    slot: usize,
    image: u32,
    frame: u64,
}

impl Default for FrameState {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameState {
    pub fn new() -> Self {
        Self {
            phase: FramePhase::Idle,
            slot: 0,
            image: 0,
            frame: 0,
        }
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Image acquired for the frame being recorded.
    pub fn image(&self) -> Option<u32> {
        (self.phase == FramePhase::Begun).then_some(self.image)
    }

    /// Ok while a frame is being recorded.
    pub fn recording(&self) -> VkResult<()> {
        match self.phase {
            FramePhase::Begun => Ok(()),
            _ => Err(VkError::NotReady),
        }
    }

    /// Ok between frames.
    pub fn idle(&self) -> VkResult<()> {
        match self.phase {
            FramePhase::Idle => Ok(()),
            _ => Err(VkError::FrameInProgress),
        }
    }

    /// Frames presented so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn begin<O: FrameOps>(&mut self, ops: &mut O) -> VkResult<()> {
        if self.phase != FramePhase::Idle {
            return Err(VkError::FrameInProgress);
        }
        let slot = self.slot;
        // The fence stays signaled until an image is in hand, so a stale
        // swapchain never leaves a reset fence with nothing to signal it.
        ops.wait_fence(slot)?;
        let image = match ops.acquire(slot)? {
            Acquired::Image { index, suboptimal } => {
                if suboptimal {
                    debug!("vk: acquired suboptimal image {index}");
                }
                index
            }
            Acquired::OutOfDate => {
                info!("vk: swapchain out of date on acquire");
                ops.recreate_swapchain()?;
                return Err(VkError::SwapchainOutOfDate);
            }
        };
        ops.reset_fence(slot)?;
        if let Err(e) = ops.begin_recording(slot, image) {
            return Err(Self::abandon_slot(ops, slot, e));
        }
        self.image = image;
        self.phase = FramePhase::Begun;
        Ok(())
    }

    pub fn end<O: FrameOps>(&mut self, ops: &mut O, force: bool) -> VkResult<PresentStatus> {
        if self.phase != FramePhase::Begun {
            return Err(VkError::NotReady);
        }
        let (slot, image) = (self.slot, self.image);
        let submitted = ops
            .finish_recording(slot, image, force)
            .and_then(|()| ops.submit(slot));
        if let Err(e) = submitted {
            self.phase = FramePhase::Idle;
            return Err(Self::abandon_slot(ops, slot, e));
        }
        self.phase = FramePhase::Ended;

        let status = ops.present(slot, image);
        self.slot = (slot + 1) % FRAMES_IN_FLIGHT;
        self.frame += 1;
        self.phase = FramePhase::Idle;

        let status = status?;
        if status != PresentStatus::Optimal {
            info!("vk: present reported {:?}, recreating swapchain", status);
            ops.recreate_swapchain()?;
        }
        Ok(status)
    }

    /// The slot stays current, so its fence has to be signaled again before
    /// the next `begin` waits on it.
    fn abandon_slot<O: FrameOps>(ops: &mut O, slot: usize, cause: VkError) -> VkError {
        warn!("vk: abandoning frame on slot {slot}: {cause}");
        match ops.abandon(slot) {
            Ok(()) => cause,
            Err(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Ev {
        Wait(usize),
        Reset(usize),
        Acquire(usize),
        Recreate,
        Begin(usize, u32),
        Finish(usize, bool),
        Submit(usize),
        Present(usize, u32),
        Abandon(usize),
    }

    /// Fences start signaled. A submission signals its fence only when the
    /// simulated GPU retires it, which happens lazily on a wait.
    struct MockGpu {
        events: Vec<Ev>,
        signaled: [bool; FRAMES_IN_FLIGHT],
        queue: VecDeque<usize>,
        acquire_script: VecDeque<Acquired>,
        present_script: VecDeque<PresentStatus>,
        next_image: u32,
        images: u32,
        fail_begin: usize,
        fail_finish: usize,
    }

    impl MockGpu {
        fn new() -> Self {
            Self {
                events: Vec::new(),
                signaled: [true; FRAMES_IN_FLIGHT],
                queue: VecDeque::new(),
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                next_image: 0,
                images: 3,
                fail_begin: 0,
                fail_finish: 0,
            }
        }
    }

    impl FrameOps for MockGpu {
        fn wait_fence(&mut self, slot: usize) -> VkResult<()> {
            self.events.push(Ev::Wait(slot));
            while !self.signaled[slot] {
                let done = self
                    .queue
                    .pop_front()
                    .expect("waiting on a fence nothing will signal");
                self.signaled[done] = true;
            }
            Ok(())
        }

        fn reset_fence(&mut self, slot: usize) -> VkResult<()> {
            assert!(self.signaled[slot], "reset of an in-flight fence");
            self.events.push(Ev::Reset(slot));
            self.signaled[slot] = false;
            Ok(())
        }

        fn acquire(&mut self, slot: usize) -> VkResult<Acquired> {
            self.events.push(Ev::Acquire(slot));
            if let Some(a) = self.acquire_script.pop_front() {
                return Ok(a);
            }
            let index = self.next_image;
            self.next_image = (self.next_image + 1) % self.images;
            Ok(Acquired::Image {
                index,
                suboptimal: false,
            })
        }

        fn recreate_swapchain(&mut self) -> VkResult<()> {
            self.events.push(Ev::Recreate);
            self.next_image = 0;
            Ok(())
        }

        fn begin_recording(&mut self, slot: usize, image: u32) -> VkResult<()> {
            self.events.push(Ev::Begin(slot, image));
            if self.fail_begin > 0 {
                self.fail_begin -= 1;
                return Err(VkError::NotReady);
            }
            Ok(())
        }

        fn finish_recording(&mut self, slot: usize, _image: u32, force: bool) -> VkResult<()> {
            self.events.push(Ev::Finish(slot, force));
            if self.fail_finish > 0 {
                self.fail_finish -= 1;
                return Err(VkError::NotReady);
            }
            Ok(())
        }

        fn submit(&mut self, slot: usize) -> VkResult<()> {
            assert!(!self.signaled[slot], "submit with a signaled fence");
            self.events.push(Ev::Submit(slot));
            self.queue.push_back(slot);
            Ok(())
        }

        fn present(&mut self, slot: usize, image: u32) -> VkResult<PresentStatus> {
            self.events.push(Ev::Present(slot, image));
            Ok(self
                .present_script
                .pop_front()
                .unwrap_or(PresentStatus::Optimal))
        }

        fn abandon(&mut self, slot: usize) -> VkResult<()> {
            assert!(!self.signaled[slot], "abandon with a signaled fence");
            self.events.push(Ev::Abandon(slot));
            self.queue.push_back(slot);
            Ok(())
        }
    }

    #[test]
    fn slots_alternate_and_fences_guard_reuse() {
        let mut gpu = MockGpu::new();
        let mut fs = FrameState::new();
        for _ in 0..50 {
            fs.begin(&mut gpu).unwrap();
            fs.end(&mut gpu, false).unwrap();
        }
        assert_eq!(fs.frame(), 50);

        // Each Reset(k) after the first round is preceded by a Submit(k)
        // since the previous Reset(k): slot k never records while its last
        // submission may still be running.
        let mut submitted = [true; FRAMES_IN_FLIGHT];
        let mut slots = Vec::new();
        for ev in &gpu.events {
            match *ev {
                Ev::Reset(k) => {
                    assert!(submitted[k], "slot {k} reused without a submit");
                    submitted[k] = false;
                }
                Ev::Submit(k) => submitted[k] = true,
                Ev::Begin(k, _) => slots.push(k),
                _ => {}
            }
        }
        assert!(slots.chunks(2).all(|c| c == [0, 1]));
    }

    #[test]
    fn stale_swapchain_on_acquire_skips_the_frame() {
        let mut gpu = MockGpu::new();
        gpu.acquire_script.push_back(Acquired::OutOfDate);
        let mut fs = FrameState::new();

        let err = fs.begin(&mut gpu).unwrap_err();
        assert!(matches!(err, VkError::SwapchainOutOfDate));
        assert!(!err.is_fatal());
        assert_eq!(fs.phase(), FramePhase::Idle);
        assert_eq!(gpu.events, [Ev::Wait(0), Ev::Acquire(0), Ev::Recreate]);
        // fence untouched, so the retry does not deadlock
        assert!(gpu.signaled[0]);

        fs.begin(&mut gpu).unwrap();
        assert_eq!(fs.phase(), FramePhase::Begun);
        assert_eq!(fs.image(), Some(0));
        fs.end(&mut gpu, false).unwrap();
    }

    #[test]
    fn misuse_is_reported_without_touching_the_gpu() {
        let mut gpu = MockGpu::new();
        let mut fs = FrameState::new();
        assert!(matches!(fs.end(&mut gpu, true), Err(VkError::NotReady)));
        assert!(gpu.events.is_empty());

        fs.begin(&mut gpu).unwrap();
        let n = gpu.events.len();
        assert!(matches!(fs.begin(&mut gpu), Err(VkError::FrameInProgress)));
        assert_eq!(gpu.events.len(), n);
    }

    #[test]
    fn stale_or_suboptimal_present_recreates_and_advances() {
        let mut gpu = MockGpu::new();
        gpu.present_script.push_back(PresentStatus::Suboptimal);
        gpu.present_script.push_back(PresentStatus::OutOfDate);
        let mut fs = FrameState::new();

        fs.begin(&mut gpu).unwrap();
        assert_eq!(fs.end(&mut gpu, false).unwrap(), PresentStatus::Suboptimal);
        assert_eq!(fs.slot(), 1);
        fs.begin(&mut gpu).unwrap();
        assert_eq!(fs.end(&mut gpu, true).unwrap(), PresentStatus::OutOfDate);
        assert_eq!(fs.slot(), 0);
        assert_eq!(gpu.events.iter().filter(|e| **e == Ev::Recreate).count(), 2);
        assert!(gpu.events.contains(&Ev::Finish(1, true)));
    }

    #[test]
    fn image_is_only_visible_while_recording() {
        let mut gpu = MockGpu::new();
        let mut fs = FrameState::new();
        assert_eq!(fs.image(), None);
        fs.begin(&mut gpu).unwrap();
        assert_eq!(fs.image(), Some(0));
        fs.end(&mut gpu, false).unwrap();
        assert_eq!(fs.image(), None);
    }

    #[test]
    fn failed_end_resignals_the_slot() {
        let mut gpu = MockGpu::new();
        gpu.fail_finish = 1;
        let mut fs = FrameState::new();

        fs.begin(&mut gpu).unwrap();
        assert!(matches!(fs.end(&mut gpu, false), Err(VkError::NotReady)));
        assert_eq!(fs.phase(), FramePhase::Idle);
        assert_eq!(fs.slot(), 0);
        assert_eq!(fs.frame(), 0);
        assert!(!gpu.events.iter().any(|e| matches!(e, Ev::Submit(_))));
        assert_eq!(gpu.events.last(), Some(&Ev::Abandon(0)));

        // waits on slot 0 again; the abandon submission is what signals it
        fs.begin(&mut gpu).unwrap();
        fs.end(&mut gpu, false).unwrap();
        assert_eq!(fs.frame(), 1);
        assert_eq!(fs.slot(), 1);
    }

    #[test]
    fn failed_begin_recording_resignals_the_slot() {
        let mut gpu = MockGpu::new();
        gpu.fail_begin = 1;
        let mut fs = FrameState::new();

        assert!(fs.begin(&mut gpu).is_err());
        assert_eq!(fs.phase(), FramePhase::Idle);
        assert_eq!(gpu.events.last(), Some(&Ev::Abandon(0)));

        fs.begin(&mut gpu).unwrap();
        fs.end(&mut gpu, false).unwrap();
        assert_eq!(fs.frame(), 1);
    }

    #[test]
    fn gates_follow_the_phase() {
        let mut gpu = MockGpu::new();
        let mut fs = FrameState::new();
        assert!(matches!(fs.recording(), Err(VkError::NotReady)));
        assert!(fs.idle().is_ok());

        fs.begin(&mut gpu).unwrap();
        assert!(fs.recording().is_ok());
        assert!(matches!(fs.idle(), Err(VkError::FrameInProgress)));

        fs.end(&mut gpu, false).unwrap();
        assert!(matches!(fs.recording(), Err(VkError::NotReady)));
        assert!(fs.idle().is_ok());
    }
}
