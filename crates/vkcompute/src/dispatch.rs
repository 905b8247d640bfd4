//! Command recording, submission and fence synchronization.
//!
//! Each dispatch records a fresh one-time-submit command buffer, submits it
//! with a fresh fence and blocks the host until the fence signals or the
//! configured timeout elapses.

use std::time::{Duration, Instant};

use ash::vk;
use tracing::{debug, error, info, warn};

use crate::descriptor::DescriptorSet;
use crate::device::{DeviceContext, HangFlag};
use crate::error::{ComputeError, Result, VkResultExt};
use crate::pipeline::ComputePipeline;

/// Where a [`Dispatcher`] is in its submit cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Recording,
    Submitted,
    Completed,
    /// The fence never signaled. The dispatcher accepts no more work.
    TimedOut,
}

impl DispatchState {
    pub fn can_transition_to(self, next: Self) -> bool {
        use DispatchState::*;
        matches!(
            (self, next),
            (Idle | Completed, Recording)
                | (Recording, Submitted | Idle)
                | (Submitted, Completed | TimedOut | Idle)
        )
    }

    fn advance(&mut self, next: Self) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(ComputeError::invalid(format!(
                "invalid dispatch state transition {self:?} -> {next:?}"
            )));
        }
        *self = next;
        Ok(())
    }
}

/// Workgroups needed to cover `elements` with groups of `workgroup_size`.
pub fn workgroup_count(elements: u64, workgroup_size: u32) -> Result<u32> {
    if elements == 0 {
        return Err(ComputeError::invalid("dispatch over zero elements"));
    }
    if workgroup_size == 0 {
        return Err(ComputeError::invalid("workgroup size must be non-zero"));
    }
    u32::try_from(elements.div_ceil(u64::from(workgroup_size))).map_err(|_| {
        ComputeError::invalid(format!(
            "{elements} elements need more than u32::MAX workgroups of {workgroup_size}"
        ))
    })
}

/// `timeout` as the nanosecond count `vkWaitForFences` takes, saturating.
pub fn timeout_nanos(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

/// Something the host can block on until submitted work finishes.
pub trait CompletionSignal {
    /// `Ok(true)` once signaled, `Ok(false)` if `timeout` elapsed first.
    fn wait(&self, timeout: Duration) -> Result<bool>;
}

/// Wait on `signal`, turning an elapsed timeout into
/// [`ComputeError::SubmissionTimeout`].
pub fn await_completion<S: CompletionSignal + ?Sized>(signal: &S, timeout: Duration) -> Result<()> {
    if signal.wait(timeout)? {
        Ok(())
    } else {
        Err(ComputeError::SubmissionTimeout { timeout })
    }
}

/// A fence that is destroyed when dropped.
pub struct Fence<'a> {
    device: &'a ash::Device,
    handle: vk::Fence,
}

impl<'a> Fence<'a> {
    /// Create an unsignaled fence.
    pub fn new(device: &'a ash::Device) -> Result<Self> {
        // SAFETY: default create info, live device.
        let handle = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }
            .or_device("vkCreateFence")?;
        Ok(Self { device, handle })
    }

    pub fn handle(&self) -> vk::Fence {
        self.handle
    }
}

impl CompletionSignal for Fence<'_> {
    fn wait(&self, timeout: Duration) -> Result<bool> {
        // SAFETY: the fence is live for the lifetime of self.
        match unsafe { self.device.wait_for_fences(&[self.handle], true, timeout_nanos(timeout)) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err::<bool, _>(e).or_device("vkWaitForFences"),
        }
    }
}

impl Drop for Fence<'_> {
    fn drop(&mut self) {
        // SAFETY: the fence is not in use by a pending submission unless the
        // wait timed out, in which case it is released regardless.
        unsafe { self.device.destroy_fence(self.handle, None) };
    }
}

/// What one completed dispatch did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub elements: u64,
    pub workgroups: u32,
    pub workgroup_size: u32,
    /// Host time from recording to the fence signal.
    pub elapsed: Duration,
}

/// Host-side bookkeeping of the submit cycle.
///
/// Knows nothing about command buffers: the dispatcher reports recording and
/// submission, and hands over whatever signals completion.
#[derive(Debug)]
pub struct DispatchTracker {
    state: DispatchState,
    timeout: Duration,
    completed: u64,
}

impl DispatchTracker {
    pub fn new(timeout: Duration) -> Result<Self> {
        if timeout.is_zero() {
            return Err(ComputeError::invalid("fence timeout must be non-zero"));
        }
        Ok(Self { state: DispatchState::Idle, timeout, completed: 0 })
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Fails once a submission has timed out.
    pub fn ensure_usable(&self) -> Result<()> {
        if self.state == DispatchState::TimedOut {
            return Err(ComputeError::invalid(
                "dispatcher is unusable after a submission timeout",
            ));
        }
        Ok(())
    }

    pub fn begin(&mut self) -> Result<()> {
        self.ensure_usable()?;
        self.state.advance(DispatchState::Recording)
    }

    pub fn submitted(&mut self) -> Result<()> {
        self.state.advance(DispatchState::Submitted)
    }

    /// Block on `signal` and settle the cycle.
    ///
    /// The signal is dropped before this returns on every path. A timeout
    /// raises `hang` and leaves the tracker in [`DispatchState::TimedOut`];
    /// any other wait error returns it to `Idle`.
    pub fn finish<S: CompletionSignal>(&mut self, signal: S, hang: &HangFlag) -> Result<()> {
        let outcome = await_completion(&signal, self.timeout);
        drop(signal);
        match outcome {
            Ok(()) => {
                self.state.advance(DispatchState::Completed)?;
                self.completed += 1;
                Ok(())
            }
            Err(e @ ComputeError::SubmissionTimeout { .. }) => {
                self.state.advance(DispatchState::TimedOut)?;
                hang.raise();
                error!(timeout = ?self.timeout, "fence wait timed out");
                Err(e)
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    /// Recording or submission failed: back to `Idle`.
    pub fn abort(&mut self) {
        if self.state.can_transition_to(DispatchState::Idle) {
            self.state = DispatchState::Idle;
        }
    }
}

/// Records and submits compute work on the context's queue.
pub struct Dispatcher<'ctx> {
    ctx: &'ctx DeviceContext,
    command_pool: vk::CommandPool,
    tracker: DispatchTracker,
}

impl<'ctx> Dispatcher<'ctx> {
    pub fn new(ctx: &'ctx DeviceContext, timeout: Duration) -> Result<Self> {
        let tracker = DispatchTracker::new(timeout)?;
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(ctx.queue_family_index());
        // SAFETY: live device, valid queue family.
        let command_pool = unsafe { ctx.device().create_command_pool(&info, None) }
            .or_init("vkCreateCommandPool")?;
        debug!(queue_family = ctx.queue_family_index(), ?timeout, "created dispatcher");
        Ok(Self { ctx, command_pool, tracker })
    }

    pub fn state(&self) -> DispatchState {
        self.tracker.state()
    }

    pub fn timeout(&self) -> Duration {
        self.tracker.timeout()
    }

    /// Dispatches that completed successfully.
    pub fn completed(&self) -> u64 {
        self.tracker.completed()
    }

    /// Run `pipeline` over `elements` invocations along x with `set` bound,
    /// and block until the device is done.
    pub fn dispatch(
        &mut self,
        pipeline: &ComputePipeline,
        set: &DescriptorSet,
        elements: u64,
    ) -> Result<DispatchReport> {
        self.tracker.ensure_usable()?;
        if !set.is_complete() {
            return Err(ComputeError::invalid("descriptor set has unbound slots"));
        }
        let workgroup_size = pipeline.workgroup_size()[0];
        let workgroups = workgroup_count(elements, workgroup_size)?;

        let started = Instant::now();
        self.tracker.begin()?;
        match self.execute(pipeline, set, workgroups) {
            Ok(()) => {
                let report = DispatchReport {
                    elements,
                    workgroups,
                    workgroup_size,
                    elapsed: started.elapsed(),
                };
                info!(
                    elements,
                    workgroups,
                    elapsed_us = report.elapsed.as_micros() as u64,
                    "dispatch completed"
                );
                Ok(report)
            }
            Err(e) => {
                if self.tracker.state() != DispatchState::TimedOut {
                    warn!(error = %e, state = ?self.tracker.state(), "dispatch failed");
                    self.tracker.abort();
                }
                Err(e)
            }
        }
    }

    fn execute(
        &mut self,
        pipeline: &ComputePipeline,
        set: &DescriptorSet,
        workgroups: u32,
    ) -> Result<()> {
        let ctx = self.ctx;
        let device = ctx.device();
        let pool = self.command_pool;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        // SAFETY: pool is owned by self and used from this thread only.
        let command_buffer = unsafe { device.allocate_command_buffers(&alloc_info) }
            .or_device("vkAllocateCommandBuffers")?
            .into_iter()
            .next()
            .ok_or_else(|| ComputeError::allocation("vkAllocateCommandBuffers returned nothing"))?;
        // SAFETY: freed after the fence is consumed by `finish`.
        let command_buffer = scopeguard::guard(command_buffer, move |cb| unsafe {
            device.free_command_buffers(pool, &[cb])
        });

        record(device, *command_buffer, pipeline, set, workgroups)?;

        let fence = Fence::new(device)?;
        let submit =
            vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&*command_buffer));
        // SAFETY: the command buffer is executable and the fence unsignaled.
        unsafe { device.queue_submit(ctx.queue(), &[submit], fence.handle()) }
            .or_device("vkQueueSubmit")?;
        self.tracker.submitted()?;
        debug!(workgroups, "submitted compute work");

        self.tracker.finish(fence, ctx.hang_flag())
    }
}

/// Record bind, dispatch and a shader-write to host-read barrier.
fn record(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    pipeline: &ComputePipeline,
    set: &DescriptorSet,
    workgroups: u32,
) -> Result<()> {
    let begin = vk::CommandBufferBeginInfo::default()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::SHADER_WRITE)
        .dst_access_mask(vk::AccessFlags::HOST_READ);
    // SAFETY: command_buffer is freshly allocated and recorded from this
    // thread only; pipeline and set are live.
    unsafe {
        device.begin_command_buffer(command_buffer, &begin).or_device("vkBeginCommandBuffer")?;
        device.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::COMPUTE, pipeline.handle());
        device.cmd_bind_descriptor_sets(
            command_buffer,
            vk::PipelineBindPoint::COMPUTE,
            pipeline.layout(),
            0,
            &[set.handle()],
            &[],
        );
        device.cmd_dispatch(command_buffer, workgroups, 1, 1);
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::HOST,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
        device.end_command_buffer(command_buffer).or_device("vkEndCommandBuffer")?;
    }
    Ok(())
}

impl Drop for Dispatcher<'_> {
    fn drop(&mut self) {
        if self.tracker.state() == DispatchState::TimedOut {
            warn!("destroying command pool after a timed out submission");
        }
        // SAFETY: all command buffers from this pool were freed or are
        // abandoned after a timeout.
        unsafe { self.ctx.device().destroy_command_pool(self.command_pool, None) };
        debug!(completed = self.tracker.completed(), "destroyed dispatcher");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Never signals; blocks for the whole timeout like a hung GPU would.
    struct HungSignal;

    impl CompletionSignal for HungSignal {
        fn wait(&self, timeout: Duration) -> Result<bool> {
            std::thread::sleep(timeout);
            Ok(false)
        }
    }

    /// Signals on the n-th wait.
    struct CountdownSignal {
        remaining: Cell<u32>,
    }

    impl CompletionSignal for CountdownSignal {
        fn wait(&self, _timeout: Duration) -> Result<bool> {
            let left = self.remaining.get().saturating_sub(1);
            self.remaining.set(left);
            Ok(left == 0)
        }
    }

    struct LostSignal;

    impl CompletionSignal for LostSignal {
        fn wait(&self, _timeout: Duration) -> Result<bool> {
            Err::<bool, _>(vk::Result::ERROR_DEVICE_LOST).or_device("vkWaitForFences")
        }
    }

    #[test]
    fn hung_signal_times_out_within_tolerance() {
        let timeout = Duration::from_millis(50);
        let started = Instant::now();
        let err = await_completion(&HungSignal, timeout).unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err.kind(), ErrorKind::SubmissionTimeout);
        assert!(elapsed >= timeout, "returned early after {elapsed:?}");
        assert!(elapsed < timeout + Duration::from_millis(500), "took {elapsed:?}");
        match err {
            ComputeError::SubmissionTimeout { timeout: t } => assert_eq!(t, timeout),
            other => panic!("expected SubmissionTimeout, got {other:?}"),
        }
    }

    #[test]
    fn signaled_wait_completes() {
        let signal = CountdownSignal { remaining: Cell::new(1) };
        assert!(await_completion(&signal, Duration::from_secs(1)).is_ok());

        let late = CountdownSignal { remaining: Cell::new(2) };
        assert!(await_completion(&late, Duration::from_secs(1)).is_err());
        assert!(await_completion(&late, Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn wait_errors_pass_through() {
        let err = await_completion(&LostSignal, Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Device);
    }

    /// Counts its drops so tests can see when the tracker releases it.
    struct Tracked<S> {
        inner: S,
        drops: Rc<Cell<u32>>,
    }

    impl<S: CompletionSignal> CompletionSignal for Tracked<S> {
        fn wait(&self, timeout: Duration) -> Result<bool> {
            self.inner.wait(timeout)
        }
    }

    impl<S> Drop for Tracked<S> {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    fn submitted_tracker(timeout: Duration) -> DispatchTracker {
        let mut tracker = DispatchTracker::new(timeout).unwrap();
        tracker.begin().unwrap();
        tracker.submitted().unwrap();
        tracker
    }

    #[test]
    fn hung_submission_poisons_tracker_and_raises_hang() {
        let mut tracker = submitted_tracker(Duration::from_millis(20));
        let hang = HangFlag::default();
        let drops = Rc::new(Cell::new(0));

        let err = tracker
            .finish(Tracked { inner: HungSignal, drops: Rc::clone(&drops) }, &hang)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SubmissionTimeout);
        assert_eq!(tracker.state(), DispatchState::TimedOut);
        assert_eq!(drops.get(), 1, "signal not released on timeout");
        assert!(hang.is_raised());

        assert_eq!(tracker.begin().unwrap_err().kind(), ErrorKind::InvalidUsage);
        assert_eq!(tracker.ensure_usable().unwrap_err().kind(), ErrorKind::InvalidUsage);
        assert_eq!(tracker.state(), DispatchState::TimedOut);
        assert_eq!(tracker.completed(), 0);
    }

    #[test]
    fn signaled_submission_completes_and_allows_another() {
        let mut tracker = submitted_tracker(Duration::from_secs(1));
        let hang = HangFlag::default();
        let drops = Rc::new(Cell::new(0));
        let signal = CountdownSignal { remaining: Cell::new(1) };

        tracker.finish(Tracked { inner: signal, drops: Rc::clone(&drops) }, &hang).unwrap();
        assert_eq!(tracker.state(), DispatchState::Completed);
        assert_eq!(tracker.completed(), 1);
        assert_eq!(drops.get(), 1);
        assert!(!hang.is_raised());
        tracker.begin().unwrap();
    }

    #[test]
    fn lost_device_returns_tracker_to_idle() {
        let mut tracker = submitted_tracker(Duration::from_secs(1));
        let hang = HangFlag::default();
        let err = tracker.finish(LostSignal, &hang).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Device);
        assert_eq!(tracker.state(), DispatchState::Idle);
        assert!(!hang.is_raised());
    }

    #[test]
    fn aborted_recording_returns_to_idle() {
        let mut tracker = DispatchTracker::new(Duration::from_secs(1)).unwrap();
        tracker.begin().unwrap();
        tracker.abort();
        assert_eq!(tracker.state(), DispatchState::Idle);
        assert_eq!(
            DispatchTracker::new(Duration::ZERO).unwrap_err().kind(),
            ErrorKind::InvalidUsage
        );
    }

    #[test]
    fn workgroup_count_rounds_up() {
        assert_eq!(workgroup_count(1, 64).unwrap(), 1);
        assert_eq!(workgroup_count(64, 64).unwrap(), 1);
        assert_eq!(workgroup_count(65, 64).unwrap(), 2);
        assert_eq!(workgroup_count(1 << 20, 64).unwrap(), 1 << 14);
    }

    #[test]
    fn workgroup_count_rejects_degenerate_input() {
        assert_eq!(workgroup_count(0, 64).unwrap_err().kind(), ErrorKind::InvalidUsage);
        assert_eq!(workgroup_count(64, 0).unwrap_err().kind(), ErrorKind::InvalidUsage);
        assert!(workgroup_count(u64::MAX, 1).is_err());
        assert_eq!(workgroup_count(u64::from(u32::MAX), 1).unwrap(), u32::MAX);
    }

    #[test]
    fn timeout_nanos_saturates() {
        assert_eq!(timeout_nanos(Duration::from_secs(5)), 5_000_000_000);
        assert_eq!(timeout_nanos(Duration::MAX), u64::MAX);
    }

    #[test]
    fn happy_path_transitions() {
        let mut state = DispatchState::Idle;
        for next in [DispatchState::Recording, DispatchState::Submitted, DispatchState::Completed] {
            state.advance(next).unwrap();
        }
        state.advance(DispatchState::Recording).unwrap();
    }

    #[test]
    fn timed_out_is_terminal() {
        let mut state = DispatchState::Submitted;
        state.advance(DispatchState::TimedOut).unwrap();
        for next in [
            DispatchState::Idle,
            DispatchState::Recording,
            DispatchState::Submitted,
            DispatchState::Completed,
        ] {
            assert!(!state.can_transition_to(next), "{next:?}");
        }
        let err = state.advance(DispatchState::Recording).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUsage);
        assert_eq!(state, DispatchState::TimedOut);
    }

    #[test]
    fn recording_failure_returns_to_idle() {
        let mut state = DispatchState::Recording;
        state.advance(DispatchState::Idle).unwrap();
        assert!(!DispatchState::Idle.can_transition_to(DispatchState::Submitted));
        assert!(!DispatchState::Recording.can_transition_to(DispatchState::Completed));
    }

    proptest! {
        #[test]
        fn prop_workgroups_cover_elements(elements in 1u64..1 << 40, wg in 1u32..1025) {
            if let Ok(groups) = workgroup_count(elements, wg) {
                let covered = u64::from(groups) * u64::from(wg);
                prop_assert!(covered >= elements);
                prop_assert!(covered - elements < u64::from(wg));
            }
        }
    }
}
