// SPDX-License-Identifier: CEPL-1.0
//! The per-frame protocol, independent of the graphics API.
//!
//! One iteration of [`FrameLoop::draw_frame`]:
//! wait slot fence -> acquire image -> write uniforms -> reset fence ->
//! record -> submit -> present -> advance slot.
//!
//! Fences and acquire semaphores belong to a frame slot; render-finished
//! semaphores belong to a swapchain image. The backend keeps that split, the
//! loop only hands it the right index for each call.

use crate::{ChainStatus, RenderError, RenderSize, MAX_FRAMES_IN_FLIGHT};
use anyhow::Result;
use orbit_math::SceneUniforms;
use std::time::Instant;
use tracing::{debug, info};

/// Image index handed out by the swapchain plus the chain's health.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Acquired {
    pub image: u32,
    pub status: ChainStatus,
}

/// GPU-side operations the frame loop drives. `slot` is always a frame slot
/// index in `0..frames_in_flight()`, `image` a swapchain image index.
pub trait FrameBackend {
    fn frames_in_flight(&self) -> usize {
        MAX_FRAMES_IN_FLIGHT
    }

    /// Block until the last submission that used `slot` has completed.
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;

    /// Acquire the next presentable image, signalling the slot's acquire semaphore.
    fn acquire_image(&mut self, slot: usize) -> Result<Acquired>;

    fn write_uniforms(&mut self, slot: usize, uniforms: &SceneUniforms) -> Result<()>;

    /// Reset the slot's fence so the next submit can signal it.
    fn reset_slot(&mut self, slot: usize) -> Result<()>;

    /// Reset and re-record the slot's command buffer targeting `image`.
    fn record(&mut self, slot: usize, image: u32) -> Result<()>;

    /// Submit the slot's commands: wait the slot's acquire semaphore, signal the
    /// image's render-finished semaphore and the slot's fence.
    fn submit(&mut self, slot: usize, image: u32) -> Result<()>;

    fn present(&mut self, image: u32) -> Result<ChainStatus>;

    /// Rebuild the swapchain and everything sized by it.
    fn recreate_chain(&mut self, size: RenderSize) -> Result<()>;

    /// Extent of the current swapchain.
    fn extent(&self) -> RenderSize;

    fn wait_idle(&mut self) -> Result<()>;
}

/// Window-side view used while recreating the chain.
pub trait SurfaceProbe {
    fn framebuffer_size(&self) -> RenderSize;

    /// Block until the windowing system has something new to say.
    fn wait_events(&mut self);
}

/// Poll `probe` until it reports a drawable size.
pub fn wait_for_nonzero_extent(probe: &mut dyn SurfaceProbe) -> RenderSize {
    let mut size = probe.framebuffer_size();
    while size.is_zero() {
        probe.wait_events();
        size = probe.framebuffer_size();
    }
    size
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Fence observed signaled; CPU owns the slot's resources.
    Idle,
    /// Submitted and not yet waited on.
    Pending,
}

/// CPU-side mirror of every slot's fence.
#[derive(Debug)]
pub struct SlotLedger {
    slots: Vec<SlotState>,
}

impl SlotLedger {
    /// All slots start idle, like fences created signaled.
    pub fn new(frames: usize) -> Self {
        Self {
            slots: vec![SlotState::Idle; frames],
        }
    }

    pub fn state(&self, slot: usize) -> SlotState {
        self.slots[slot]
    }

    pub fn ensure_idle(&self, slot: usize, op: &'static str) -> Result<(), RenderError> {
        match self.slots[slot] {
            SlotState::Idle => Ok(()),
            SlotState::Pending => Err(RenderError::InFlightViolation { slot, op }),
        }
    }

    pub fn mark_pending(&mut self, slot: usize) -> Result<(), RenderError> {
        self.ensure_idle(slot, "submit")?;
        self.slots[slot] = SlotState::Pending;
        Ok(())
    }

    /// The slot's fence has been waited on.
    pub fn retire(&mut self, slot: usize) {
        self.slots[slot] = SlotState::Idle;
    }

    pub fn pending(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| **s == SlotState::Pending)
            .count()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The image was presented; `recreated` if the chain was rebuilt afterwards.
    Presented { recreated: bool },
    /// Acquire found the chain stale: it was rebuilt and nothing was drawn.
    Dropped,
}

pub struct FrameLoop<B: FrameBackend> {
    backend: B,
    ledger: SlotLedger,
    frames: usize,
    slot: usize,
    resized: bool,
    recreations: u64,
    started: Instant,
}

impl<B: FrameBackend> FrameLoop<B> {
    pub fn new(backend: B) -> Self {
        let frames = backend.frames_in_flight().max(1);
        Self {
            backend,
            ledger: SlotLedger::new(frames),
            frames,
            slot: 0,
            resized: false,
            recreations: 0,
            started: Instant::now(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn current_slot(&self) -> usize {
        self.slot
    }

    pub fn ledger(&self) -> &SlotLedger {
        &self.ledger
    }

    /// How many times the chain has been rebuilt.
    pub fn recreations(&self) -> u64 {
        self.recreations
    }

    /// Request a chain rebuild after the next present.
    pub fn notify_resized(&mut self) {
        self.resized = true;
    }

    pub fn draw_frame(&mut self, probe: &mut dyn SurfaceProbe) -> Result<FrameOutcome> {
        let slot = self.slot;

        // 1) wait until the GPU is done with this slot; from here the CPU owns
        // its fence, command buffer and uniforms
        self.backend.wait_for_slot(slot)?;
        self.ledger.retire(slot);

        // 2) acquire; a stale chain drops the frame and keeps the slot
        let acquired = self.backend.acquire_image(slot)?;
        if !acquired.status.is_usable() {
            debug!("acquire: chain stale, dropping frame");
            self.recreate(probe)?;
            return Ok(FrameOutcome::Dropped);
        }

        // 3) uniforms for this slot only
        let uniforms = SceneUniforms::spinning(
            self.started.elapsed().as_secs_f32(),
            self.backend.extent().aspect(),
        );
        self.backend.write_uniforms(slot, &uniforms)?;

        // 4) reset fence, then re-record
        self.backend.reset_slot(slot)?;
        self.backend.record(slot, acquired.image)?;

        // 5) submit
        self.backend.submit(slot, acquired.image)?;
        self.ledger.mark_pending(slot)?;

        // 6) present; suboptimal, stale or a pending resize all rebuild
        let status = self.backend.present(acquired.image)?;
        let recreated = status.needs_recreate() || self.resized;
        if recreated {
            debug!(?status, resized = self.resized, "present: rebuilding chain");
            self.recreate(probe)?;
        }

        // 7) advance
        self.slot = (slot + 1) % self.frames;
        Ok(FrameOutcome::Presented { recreated })
    }

    fn recreate(&mut self, probe: &mut dyn SurfaceProbe) -> Result<()> {
        let size = wait_for_nonzero_extent(probe);
        self.backend.recreate_chain(size)?;
        // any pending resize is satisfied by this rebuild
        self.resized = false;
        self.recreations += 1;
        info!(
            width = size.width,
            height = size.height,
            count = self.recreations,
            "swapchain recreated"
        );
        Ok(())
    }

    /// Drain the GPU. Call before dropping anything the backend owns.
    pub fn shutdown(&mut self) -> Result<()> {
        self.backend.wait_idle()?;
        for slot in 0..self.frames {
            self.ledger.retire(slot);
        }
        Ok(())
    }

    pub fn into_backend(self) -> B {
        self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Clone, Debug, PartialEq)]
    enum Call {
        Wait(usize),
        Acquire(usize),
        Write(usize),
        Reset(usize),
        Record(usize, u32),
        Submit(usize, u32),
        Present(u32),
        Recreate(RenderSize),
        Idle,
    }

    /// Fake GPU: a slot's fence signals as soon as it is waited on.
    struct MockBackend {
        calls: Vec<Call>,
        acquire: VecDeque<ChainStatus>,
        present: VecDeque<ChainStatus>,
        image_count: u32,
        next_image: u32,
        signaled: Vec<bool>,
        extent: RenderSize,
        wait_fails: bool,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                calls: Vec::new(),
                acquire: VecDeque::new(),
                present: VecDeque::new(),
                image_count: 3,
                next_image: 0,
                signaled: vec![true; MAX_FRAMES_IN_FLIGHT],
                extent: RenderSize::new(800, 600),
                wait_fails: false,
            }
        }

        fn with_acquire(mut self, s: &[ChainStatus]) -> Self {
            self.acquire.extend(s.iter().copied());
            self
        }

        fn with_present(mut self, s: &[ChainStatus]) -> Self {
            self.present.extend(s.iter().copied());
            self
        }

        fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls.iter().filter(|c| pred(*c)).count()
        }
    }

    impl FrameBackend for MockBackend {
        fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Wait(slot));
            if self.wait_fails {
                return Err(RenderError::driver("vkWaitForFences", "device lost").into());
            }
            self.signaled[slot] = true;
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> Result<Acquired> {
            self.calls.push(Call::Acquire(slot));
            let status = self.acquire.pop_front().unwrap_or(ChainStatus::Optimal);
            let image = self.next_image;
            if status.is_usable() {
                self.next_image = (self.next_image + 1) % self.image_count;
            }
            Ok(Acquired { image, status })
        }

        fn write_uniforms(&mut self, slot: usize, _u: &SceneUniforms) -> Result<()> {
            assert!(self.signaled[slot], "uniforms written while slot {slot} in flight");
            self.calls.push(Call::Write(slot));
            Ok(())
        }

        fn reset_slot(&mut self, slot: usize) -> Result<()> {
            assert!(self.signaled[slot], "fence {slot} reset while in flight");
            self.calls.push(Call::Reset(slot));
            self.signaled[slot] = false;
            Ok(())
        }

        fn record(&mut self, slot: usize, image: u32) -> Result<()> {
            self.calls.push(Call::Record(slot, image));
            Ok(())
        }

        fn submit(&mut self, slot: usize, image: u32) -> Result<()> {
            self.calls.push(Call::Submit(slot, image));
            Ok(())
        }

        fn present(&mut self, image: u32) -> Result<ChainStatus> {
            self.calls.push(Call::Present(image));
            Ok(self.present.pop_front().unwrap_or(ChainStatus::Optimal))
        }

        fn recreate_chain(&mut self, size: RenderSize) -> Result<()> {
            self.calls.push(Call::Recreate(size));
            self.extent = size;
            self.next_image = 0;
            Ok(())
        }

        fn extent(&self) -> RenderSize {
            self.extent
        }

        fn wait_idle(&mut self) -> Result<()> {
            self.calls.push(Call::Idle);
            self.signaled.iter_mut().for_each(|s| *s = true);
            Ok(())
        }
    }

    struct Probe {
        sizes: VecDeque<RenderSize>,
        last: RenderSize,
        waits: usize,
    }

    impl Probe {
        fn fixed(width: u32, height: u32) -> Self {
            Self::sequence(&[RenderSize::new(width, height)])
        }

        fn sequence(sizes: &[RenderSize]) -> Self {
            Self {
                sizes: sizes.iter().copied().collect(),
                last: RenderSize::default(),
                waits: 0,
            }
        }
    }

    impl SurfaceProbe for Probe {
        fn framebuffer_size(&self) -> RenderSize {
            self.sizes.front().copied().unwrap_or(self.last)
        }

        fn wait_events(&mut self) {
            self.waits += 1;
            if let Some(s) = self.sizes.pop_front() {
                self.last = s;
            }
        }
    }

    #[test]
    fn steady_frame_follows_protocol_order() {
        let mut fl = FrameLoop::new(MockBackend::new());
        let mut probe = Probe::fixed(800, 600);

        let out = fl.draw_frame(&mut probe).unwrap();
        assert_eq!(out, FrameOutcome::Presented { recreated: false });
        assert_eq!(
            fl.backend().calls,
            vec![
                Call::Wait(0),
                Call::Acquire(0),
                Call::Write(0),
                Call::Reset(0),
                Call::Record(0, 0),
                Call::Submit(0, 0),
                Call::Present(0),
            ]
        );
        assert_eq!(fl.current_slot(), 1);
        assert_eq!(fl.ledger().state(0), SlotState::Pending);
    }

    #[test]
    fn slot_and_image_advance_independently() {
        let mut fl = FrameLoop::new(MockBackend::new());
        let mut probe = Probe::fixed(800, 600);
        for _ in 0..5 {
            fl.draw_frame(&mut probe).unwrap();
        }
        let submits: Vec<_> = fl
            .backend()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Submit(s, i) => Some((*s, *i)),
                _ => None,
            })
            .collect();
        assert_eq!(submits, vec![(0, 0), (1, 1), (0, 2), (1, 0), (0, 1)]);
        assert_eq!(fl.current_slot(), 1);
    }

    #[test]
    fn stale_acquire_recreates_once_and_keeps_slot() {
        let backend = MockBackend::new().with_acquire(&[ChainStatus::Stale]);
        let mut fl = FrameLoop::new(backend);
        let mut probe = Probe::fixed(1024, 768);

        let out = fl.draw_frame(&mut probe).unwrap();
        assert_eq!(out, FrameOutcome::Dropped);
        assert_eq!(fl.current_slot(), 0);
        assert_eq!(fl.recreations(), 1);
        assert_eq!(
            fl.backend().calls,
            vec![
                Call::Wait(0),
                Call::Acquire(0),
                Call::Recreate(RenderSize::new(1024, 768)),
            ]
        );
        assert_eq!(fl.backend().count(|c| matches!(c, Call::Reset(_))), 0);

        // the next iteration re-enters with the same slot
        fl.draw_frame(&mut probe).unwrap();
        assert_eq!(fl.backend().calls[3], Call::Wait(0));
        assert_eq!(fl.backend().calls[5], Call::Write(0));
    }

    #[test]
    fn suboptimal_present_recreates_without_resize_flag() {
        let backend = MockBackend::new().with_present(&[ChainStatus::Suboptimal]);
        let mut fl = FrameLoop::new(backend);
        let mut probe = Probe::fixed(800, 600);

        let out = fl.draw_frame(&mut probe).unwrap();
        assert_eq!(out, FrameOutcome::Presented { recreated: true });
        assert_eq!(fl.recreations(), 1);
        assert_eq!(
            fl.backend().calls.last(),
            Some(&Call::Recreate(RenderSize::new(800, 600)))
        );
        assert_eq!(fl.current_slot(), 1);
    }

    #[test]
    fn stale_present_recreates() {
        let backend = MockBackend::new().with_present(&[ChainStatus::Stale]);
        let mut fl = FrameLoop::new(backend);
        let out = fl.draw_frame(&mut Probe::fixed(640, 480)).unwrap();
        assert_eq!(out, FrameOutcome::Presented { recreated: true });
    }

    #[test]
    fn suboptimal_acquire_still_renders() {
        let backend = MockBackend::new().with_acquire(&[ChainStatus::Suboptimal]);
        let mut fl = FrameLoop::new(backend);
        let out = fl.draw_frame(&mut Probe::fixed(800, 600)).unwrap();
        assert_eq!(out, FrameOutcome::Presented { recreated: false });
        assert_eq!(fl.recreations(), 0);
        assert_eq!(fl.backend().count(|c| matches!(c, Call::Submit(..))), 1);
    }

    #[test]
    fn resize_flag_is_consumed_once() {
        let mut fl = FrameLoop::new(MockBackend::new());
        let mut probe = Probe::fixed(1280, 720);
        fl.notify_resized();

        let first = fl.draw_frame(&mut probe).unwrap();
        let second = fl.draw_frame(&mut probe).unwrap();
        assert_eq!(first, FrameOutcome::Presented { recreated: true });
        assert_eq!(second, FrameOutcome::Presented { recreated: false });
        assert_eq!(fl.recreations(), 1);
        assert_eq!(fl.backend().extent(), RenderSize::new(1280, 720));
    }

    #[test]
    fn stale_acquire_satisfies_pending_resize() {
        let backend = MockBackend::new().with_acquire(&[ChainStatus::Stale]);
        let mut fl = FrameLoop::new(backend);
        let mut probe = Probe::fixed(1280, 720);
        fl.notify_resized();

        assert_eq!(fl.draw_frame(&mut probe).unwrap(), FrameOutcome::Dropped);
        let next = fl.draw_frame(&mut probe).unwrap();
        assert_eq!(next, FrameOutcome::Presented { recreated: false });
        assert_eq!(fl.recreations(), 1);
        assert_eq!(
            fl.backend().count(|c| matches!(c, Call::Recreate(_))),
            1
        );
    }

    #[test]
    fn failed_wait_keeps_slot_in_flight() {
        let mut fl = FrameLoop::new(MockBackend::new());
        let mut probe = Probe::fixed(800, 600);
        fl.draw_frame(&mut probe).unwrap();
        fl.draw_frame(&mut probe).unwrap();
        assert_eq!(fl.ledger().pending(), 2);

        fl.backend_mut().wait_fails = true;
        let calls_before = fl.backend().calls.len();
        assert!(fl.draw_frame(&mut probe).is_err());

        // slot 0 was never observed complete: nothing touched it
        assert_eq!(fl.ledger().state(0), SlotState::Pending);
        assert_eq!(fl.current_slot(), 0);
        assert_eq!(&fl.backend().calls[calls_before..], &[Call::Wait(0)]);

        fl.backend_mut().wait_fails = false;
        fl.draw_frame(&mut probe).unwrap();
        assert_eq!(fl.ledger().state(0), SlotState::Pending);
        assert_eq!(fl.current_slot(), 1);
    }

    #[test]
    fn minimized_window_blocks_until_nonzero() {
        let backend = MockBackend::new().with_acquire(&[ChainStatus::Stale]);
        let mut fl = FrameLoop::new(backend);
        let mut probe = Probe::sequence(&[
            RenderSize::new(0, 0),
            RenderSize::new(0, 0),
            RenderSize::new(800, 0),
            RenderSize::new(640, 480),
        ]);

        fl.draw_frame(&mut probe).unwrap();
        assert_eq!(probe.waits, 3);
        assert_eq!(
            fl.backend().calls.last(),
            Some(&Call::Recreate(RenderSize::new(640, 480)))
        );
    }

    #[test]
    fn nonzero_size_does_not_wait() {
        let mut probe = Probe::fixed(10, 10);
        assert_eq!(wait_for_nonzero_extent(&mut probe), RenderSize::new(10, 10));
        assert_eq!(probe.waits, 0);
    }

    #[test]
    fn at_most_one_submission_per_slot_under_churn() {
        use ChainStatus::*;
        let backend = MockBackend::new()
            .with_acquire(&[Optimal, Stale, Optimal, Suboptimal, Stale, Optimal])
            .with_present(&[Optimal, Suboptimal, Optimal, Stale, Optimal]);
        let mut fl = FrameLoop::new(backend);
        let mut probe = Probe::fixed(800, 600);

        for n in 0..12 {
            if n % 4 == 3 {
                fl.notify_resized();
            }
            fl.draw_frame(&mut probe).unwrap();
            assert!(fl.ledger().pending() <= MAX_FRAMES_IN_FLIGHT);
        }

        // every submit on a slot is preceded by a wait on that slot
        let calls = &fl.backend().calls;
        let mut waited = vec![true; MAX_FRAMES_IN_FLIGHT];
        for c in calls {
            match c {
                Call::Wait(s) => waited[*s] = true,
                Call::Submit(s, _) => {
                    assert!(waited[*s], "slot {s} submitted twice without a wait");
                    waited[*s] = false;
                }
                _ => {}
            }
        }
    }

    #[test]
    fn shutdown_drains_gpu() {
        let mut fl = FrameLoop::new(MockBackend::new());
        fl.draw_frame(&mut Probe::fixed(800, 600)).unwrap();
        assert_eq!(fl.ledger().pending(), 1);
        fl.shutdown().unwrap();
        assert_eq!(fl.ledger().pending(), 0);
        assert_eq!(fl.into_backend().calls.last(), Some(&Call::Idle));
    }

    #[test]
    fn ledger_rejects_reuse_of_pending_slot() {
        let mut ledger = SlotLedger::new(2);
        ledger.mark_pending(0).unwrap();
        assert!(matches!(
            ledger.ensure_idle(0, "reset fence"),
            Err(RenderError::InFlightViolation { slot: 0, op: "reset fence" })
        ));
        assert!(matches!(
            ledger.mark_pending(0),
            Err(RenderError::InFlightViolation { slot: 0, .. })
        ));
        assert!(ledger.ensure_idle(1, "record").is_ok());
        ledger.retire(0);
        assert_eq!(ledger.state(0), SlotState::Idle);
        ledger.mark_pending(0).unwrap();
    }
}
