// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    mem::size_of,
    sync::{Mutex, MutexGuard},
};

use log::{debug, trace, warn};
use vm_memory::{Address, Bytes, GuestAddress, GuestMemoryMmap};

use crate::{
    allocator::{CmdBufArena, CmdBufHandle, PagePool},
    context::ContextState,
    device::SvgaDevice,
    fence::FenceTracker,
    fifo::FifoRing,
    protocol::{
        svga_cb_header, svga_dc_cmd_start_stop, Category, CbStatus, DeliveryFlags,
        FENCE_CMD_SIZE, SVGA_CB_CONTEXT_0, SVGA_CB_FLAG_DX_CONTEXT, SVGA_CB_FLAG_NO_IRQ,
        SVGA_CMD_FENCE, SVGA_REG_COMMAND_HIGH, SVGA_REG_COMMAND_LOW,
    },
    queue::SubmissionQueue,
    wait::{spin_until, WaitPolicy},
    EngineConfig, Error, Result,
};

/// Where a submission stands when [`SubmissionEngine::submit`] returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitState {
    /// Nothing left to wait for.
    Completed,
    /// The command buffer is owned by the device until it retires.
    Pending(CmdBufHandle),
    /// Sent through the FIFO; done once `fence_used` passed.
    FencePending,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubmitStatus {
    pub state: SubmitState,
    /// Fence terminating the submission, 0 if none.
    pub fence_used: u32,
    /// Last fence the device had passed when the call returned.
    pub fence_last: u32,
}

/// Everything the engine talks to. Only touched with the state lock held.
pub(crate) struct Hardware<D> {
    pub device: D,
    pub mem: GuestMemoryMmap,
    pub fifo: FifoRing,
    pub wait: WaitPolicy,
}

pub(crate) struct EngineState {
    pub arena: CmdBufArena,
    pub queue: SubmissionQueue,
    pub fences: FenceTracker,
    pub context: ContextState,
    /// Buffer carrying device-context commands.
    pub ctl_buf: CmdBufHandle,
    next_id: u64,
    surface_dirty: bool,
}

impl EngineState {
    /// Fills in the header of `handle` for a fresh submission.
    pub(crate) fn write_descriptor<D: SvgaDevice>(
        &self,
        hw: &Hardware<D>,
        handle: CmdBufHandle,
        length: usize,
        flags: u32,
        dx_context: u32,
    ) -> Result<()> {
        let header = svga_cb_header {
            status: CbStatus::NONE.0.into(),
            id: self.next_id.into(),
            flags: flags.into(),
            length: (length as u32).into(),
            pa: self.arena.payload_addr(handle)?.raw_value().into(),
            dx_context: dx_context.into(),
            ..Default::default()
        };
        self.arena.write_header(&hw.mem, handle, header)
    }

    /// Hands the descriptor of `handle` to the device on `context`.
    pub(crate) fn dispatch<D: SvgaDevice>(
        &mut self,
        hw: &Hardware<D>,
        handle: CmdBufHandle,
        context: u32,
    ) -> Result<()> {
        let addr = self.arena.header_addr(handle)?.raw_value();
        trace!(
            "Dispatching descriptor {} at {addr:#x}, context {context:#x}",
            self.next_id
        );
        hw.device.write_register(SVGA_REG_COMMAND_HIGH, (addr >> 32) as u32);
        hw.device.write_register(SVGA_REG_COMMAND_LOW, addr as u32 | context);
        hw.device.sync();
        self.next_id += 1;
        Ok(())
    }

    /// Retires completed command buffers. A fault restarts the context, which
    /// retires everything else as well.
    pub(crate) fn check_queue<D: SvgaDevice>(
        &mut self,
        hw: &Hardware<D>,
        target: Option<CmdBufHandle>,
    ) -> Result<bool> {
        let arena = &self.arena;
        let outcome = self
            .queue
            .scan(target, |handle| arena.status(&hw.mem, handle))?;
        if outcome.faulted.is_empty() {
            return Ok(outcome.retired);
        }

        for &(handle, status) in &outcome.faulted {
            self.report_fault(hw, handle, status);
        }
        self.context_restart(hw)?;
        Ok(true)
    }

    fn report_fault<D: SvgaDevice>(
        &self,
        hw: &Hardware<D>,
        handle: CmdBufHandle,
        status: CbStatus,
    ) {
        let Ok(offset) = self.arena.error_offset(&hw.mem, handle) else {
            warn!("Command buffer failed: {status}");
            return;
        };
        let command = self
            .arena
            .payload_addr(handle)
            .ok()
            .and_then(|pa| hw.mem.read_obj::<u32>(pa.unchecked_add(offset.into())).ok());
        match command {
            Some(command) => {
                warn!("Command buffer failed: {status} at offset {offset}, command {command:#x}")
            }
            None => warn!("Command buffer failed: {status} at offset {offset}"),
        }
    }

    pub(crate) fn wait_for<D: SvgaDevice>(
        &mut self,
        hw: &Hardware<D>,
        handle: CmdBufHandle,
    ) -> Result<()> {
        spin_until(&hw.device, hw.wait, "command buffer", || {
            self.check_queue(hw, Some(handle))
        })
    }

    /// Waits until no queued command buffer carries any of `categories`.
    fn wait_categories<D: SvgaDevice>(
        &mut self,
        hw: &Hardware<D>,
        what: &'static str,
        categories: Category,
    ) -> Result<()> {
        spin_until(&hw.device, hw.wait, what, || {
            self.check_queue(hw, None)?;
            Ok(!self.queue.has_category(categories))
        })
    }

    pub(crate) fn submit<D: SvgaDevice>(
        &mut self,
        hw: &Hardware<D>,
        handle: CmdBufHandle,
        size: usize,
        flags: DeliveryFlags,
        dx_context: u32,
    ) -> Result<SubmitStatus> {
        if size % 4 != 0 {
            return Err(Error::UnalignedPayload(size));
        }
        let capacity = self.arena.capacity(handle)?;
        if size > capacity {
            return Err(Error::PayloadTooLarge {
                size,
                max: capacity,
            });
        }
        // The buffer may still be owned by the device from an earlier
        // submission.
        self.wait_for(hw, handle)?;

        if flags.contains(DeliveryFlags::DIRTY_SURFACE) {
            self.surface_dirty = true;
        }

        let (state, fence_used) =
            if self.context.uses_cmd_buffers() && !flags.contains(DeliveryFlags::FORCE_FIFO) {
                self.submit_cmdbuf(hw, handle, size, flags, dx_context)?
            } else {
                self.submit_fifo(hw, handle, size, flags)?
            };

        Ok(SubmitStatus {
            state,
            fence_used,
            fence_last: hw.device.fence_last_passed(),
        })
    }

    fn submit_cmdbuf<D: SvgaDevice>(
        &mut self,
        hw: &Hardware<D>,
        handle: CmdBufHandle,
        size: usize,
        flags: DeliveryFlags,
        dx_context: u32,
    ) -> Result<(SubmitState, u32)> {
        let mut length = size;
        let mut fence = 0;
        if flags.cb_needs_fence() {
            fence = self.fences.get_token(&hw.device);
            self.arena.write_words(&hw.mem, handle, length, &[SVGA_CMD_FENCE, fence])?;
            length += FENCE_CMD_SIZE;
        }

        self.wait_categories(hw, "conflicting command buffers", Category::conflicts_of(flags))?;
        if !self.context.uses_cmd_buffers() {
            // Restarting after a fault lost the context.
            return self.submit_fifo(hw, handle, size, flags);
        }

        if length == 0 {
            self.arena.set_status(&hw.mem, handle, CbStatus::COMPLETED)?;
            return Ok((SubmitState::Completed, 0));
        }

        let mut header_flags = SVGA_CB_FLAG_NO_IRQ;
        let mut dx = 0;
        if flags.contains(DeliveryFlags::DX_CONTEXT) {
            header_flags |= SVGA_CB_FLAG_DX_CONTEXT;
            dx = dx_context;
        }
        self.write_descriptor(hw, handle, length, header_flags, dx)?;
        self.queue.insert(handle, Category::of(flags), length);
        let id = self.next_id;
        self.dispatch(hw, handle, SVGA_CB_CONTEXT_0)?;
        debug!("Submitted command buffer {id}: {length} bytes, {flags:?}");

        if !flags.contains(DeliveryFlags::SYNC) {
            return Ok((SubmitState::Pending(handle), fence));
        }

        self.wait_for(hw, handle)?;
        let status = self.arena.status(&hw.mem, handle)?;
        if status != CbStatus::COMPLETED {
            warn!("Synchronous command buffer {id} ended with {status}");
            if flags.cb_needs_fence() {
                // Our fence never executed.
                fence = hw.device.fence_last_passed();
            }
        }
        Ok((SubmitState::Completed, fence))
    }

    fn submit_fifo<D: SvgaDevice>(
        &mut self,
        hw: &Hardware<D>,
        handle: CmdBufHandle,
        size: usize,
        flags: DeliveryFlags,
    ) -> Result<(SubmitState, u32)> {
        let mut words = self.arena.read_words(&hw.mem, handle, size)?;
        let mut fence = 0;
        if flags.fifo_needs_fence() {
            fence = self.fences.get_token(&hw.device);
            words.extend_from_slice(&[SVGA_CMD_FENCE, fence]);
        }

        self.fences.check_and_clear(&hw.device, hw.wait, Category::conflicts_of(flags))?;
        if words.is_empty() {
            self.arena.set_status(&hw.mem, handle, CbStatus::COMPLETED)?;
            return Ok((SubmitState::Completed, 0));
        }

        if let Err(e) = hw.fifo.write_words(&hw.mem, &hw.device, hw.wait, &words) {
            warn!("FIFO submission of {} words failed: {e}", words.len());
            self.arena.set_status(&hw.mem, handle, CbStatus::SUBMISSION_ERROR)?;
            return Err(e);
        }
        // The words are copied out, the buffer can be reused right away.
        self.arena.set_status(&hw.mem, handle, CbStatus::COMPLETED)?;
        hw.device.sync();
        debug!(
            "Submitted {} words through the FIFO, fence {fence}, {flags:?}",
            words.len()
        );

        if flags.contains(DeliveryFlags::SYNC) {
            FenceTracker::wait(&hw.device, hw.wait, fence)?;
            return Ok((SubmitState::Completed, fence));
        }

        self.fences.record(Category::of(flags), fence);
        let state = if fence == 0 {
            SubmitState::Completed
        } else {
            SubmitState::FencePending
        };
        Ok((state, fence))
    }

    pub(crate) fn query<D: SvgaDevice>(
        &mut self,
        hw: &Hardware<D>,
        status: &SubmitStatus,
    ) -> Result<bool> {
        match status.state {
            SubmitState::Completed => Ok(true),
            SubmitState::Pending(handle) => self.check_queue(hw, Some(handle)),
            SubmitState::FencePending => Ok(FenceTracker::query(&hw.device, status.fence_used)),
        }
    }

    pub(crate) fn flush_all<D: SvgaDevice>(&mut self, hw: &Hardware<D>) -> Result<()> {
        spin_until(&hw.device, hw.wait, "queue drain", || {
            self.check_queue(hw, None)?;
            Ok(self.queue.is_empty())
        })?;
        hw.device.flush();
        Ok(())
    }

    pub(crate) fn wait_update<D: SvgaDevice>(&mut self, hw: &Hardware<D>) -> Result<()> {
        self.wait_categories(hw, "screen updates", Category::UPDATE)?;
        self.fences.check_and_clear(&hw.device, hw.wait, Category::UPDATE)
    }
}

/// Submission and synchronization engine of an SVGA-II adapter.
///
/// Every operation runs under one lock, for its whole duration, including
/// the waits it performs.
pub struct SubmissionEngine<D: SvgaDevice> {
    hw: Hardware<D>,
    max_payload: usize,
    state: Mutex<EngineState>,
}

impl<D: SvgaDevice> SubmissionEngine<D> {
    /// Takes over the FIFO and the command-buffer pool described by `config`
    /// and enables command-buffer context 0 if the device supports it.
    pub fn new(device: D, mem: GuestMemoryMmap, config: &EngineConfig) -> Result<Self> {
        let fifo = FifoRing::reset(&mem, config.fifo_base(), config.fifo_size())?;
        let mut arena = CmdBufArena::new(PagePool::new(config.pool_base(), config.pool_pages()));
        let ctl_buf = arena.allocate(&mem, size_of::<svga_dc_cmd_start_stop>())?;

        let engine = Self {
            hw: Hardware {
                device,
                mem,
                fifo,
                wait: config.wait_policy(),
            },
            max_payload: config.max_payload(),
            state: Mutex::new(EngineState {
                arena,
                queue: SubmissionQueue::default(),
                fences: FenceTracker::default(),
                context: ContextState::new(config.cmd_buffers()),
                ctl_buf,
                next_id: 0,
                surface_dirty: false,
            }),
        };
        engine.context_start()?;
        Ok(engine)
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        // A panic in the middle of an operation leaves the queue and the
        // device out of step, nothing sensible can follow.
        self.state.lock().unwrap()
    }

    pub fn device(&self) -> &D {
        &self.hw.device
    }

    pub fn memory(&self) -> &GuestMemoryMmap {
        &self.hw.mem
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Allocates a command buffer able to hold `size` bytes of payload.
    pub fn alloc(&self, size: usize) -> Result<CmdBufHandle> {
        if size > self.max_payload {
            return Err(Error::PayloadTooLarge {
                size,
                max: self.max_payload,
            });
        }
        self.lock().arena.allocate(&self.hw.mem, size)
    }

    /// Allocates a command buffer of the maximum payload size.
    pub fn alloc_default(&self) -> Result<CmdBufHandle> {
        self.alloc(self.max_payload)
    }

    /// Waits until the device is done with the buffer, then releases it.
    pub fn free(&self, handle: CmdBufHandle) -> Result<()> {
        let mut state = self.lock();
        state.arena.header_addr(handle)?;
        state.wait_for(&self.hw, handle)?;
        state.arena.release(handle)
    }

    /// Copies `words` at the start of the payload, returns the bytes written.
    pub fn write_payload(&self, handle: CmdBufHandle, words: &[u32]) -> Result<usize> {
        let state = self.lock();
        let capacity = state.arena.capacity(handle)?;
        let len = words.len() * 4;
        if len > capacity {
            return Err(Error::PayloadTooLarge {
                size: len,
                max: capacity,
            });
        }
        state.arena.write_words(&self.hw.mem, handle, 0, words)?;
        Ok(len)
    }

    pub fn read_payload(&self, handle: CmdBufHandle, len: usize) -> Result<Vec<u32>> {
        if len % 4 != 0 {
            return Err(Error::UnalignedPayload(len));
        }
        self.lock().arena.read_words(&self.hw.mem, handle, len)
    }

    /// Device-physical address of the payload.
    pub fn payload_address(&self, handle: CmdBufHandle) -> Result<GuestAddress> {
        self.lock().arena.payload_addr(handle)
    }

    pub fn capacity(&self, handle: CmdBufHandle) -> Result<usize> {
        self.lock().arena.capacity(handle)
    }

    /// Delivers the first `size` bytes of the payload of `handle` to the
    /// device.
    ///
    /// Command buffers are used when the device supports them and the
    /// context is running, unless `flags` contains `FORCE_FIFO`.
    pub fn submit(
        &self,
        handle: CmdBufHandle,
        size: usize,
        flags: DeliveryFlags,
        dx_context: u32,
    ) -> Result<SubmitStatus> {
        self.lock()
            .submit(&self.hw, handle, size, flags, dx_context)
    }

    /// Polls a previous submission without blocking.
    pub fn query(&self, status: &SubmitStatus) -> Result<bool> {
        self.lock().query(&self.hw, status)
    }

    pub fn status(&self, handle: CmdBufHandle) -> Result<CbStatus> {
        self.lock().arena.status(&self.hw.mem, handle)
    }

    pub fn wait_for(&self, handle: CmdBufHandle) -> Result<()> {
        self.lock().wait_for(&self.hw, handle)
    }

    /// Waits for every queued command buffer, then drains the FIFO.
    pub fn flush_all(&self) -> Result<()> {
        self.lock().flush_all(&self.hw)
    }

    /// Waits for all screen updates in flight.
    pub fn wait_update(&self) -> Result<()> {
        self.lock().wait_update(&self.hw)
    }

    /// Reserves a fence id.
    pub fn fence_get(&self) -> u32 {
        self.lock().fences.get_token(&self.hw.device)
    }

    /// Returns the last fence passed and the last fence issued.
    pub fn fence_query(&self) -> (u32, u32) {
        let state = self.lock();
        (self.hw.device.fence_last_passed(), state.fences.last_issued())
    }

    pub fn fence_wait(&self, fence: u32) -> Result<()> {
        let _state = self.lock();
        FenceTracker::wait(&self.hw.device, self.hw.wait, fence)
    }

    pub fn context_start(&self) -> Result<()> {
        self.lock().context_start(&self.hw)
    }

    pub fn context_stop(&self) -> Result<()> {
        self.lock().context_stop(&self.hw)
    }

    pub fn context_restart(&self) -> Result<()> {
        self.lock().context_restart(&self.hw)
    }

    pub fn is_context_enabled(&self) -> bool {
        self.lock().context.enabled
    }

    pub fn cmd_buffers_supported(&self) -> bool {
        self.lock().context.supported
    }

    /// Returns whether a submission touched the framebuffer since the last
    /// call, and clears the flag.
    pub fn take_surface_dirty(&self) -> bool {
        std::mem::take(&mut self.lock().surface_dirty)
    }

    /// Command buffers handed to the device and not yet retired.
    pub fn in_flight(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn queued_bytes(&self) -> usize {
        self.lock().queue.queued_bytes()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use assert_matches::assert_matches;
    use mockall::predicate::{always, eq};

    use super::*;
    use crate::{
        device::MockSvgaDevice,
        protocol::{
            SVGA_CB_CONTEXT_MASK, SVGA_FIFO_MIN, SVGA_FIFO_NEXT_CMD, SVGA_FIFO_NUM_REGS,
        },
        soft_device::{Completion, Event},
        testutils::{
            engine_memory, payload, soft_engine, soft_engine_config, soft_engine_with,
            test_config, FIFO_BASE, POOL_BASE, POOL_PAGES,
        },
        EngineConfigBuilder, Transport,
    };

    /// A mock device that accepts exactly one descriptor, the context enable
    /// sent at creation.
    fn mock_accepting_control(mem: &GuestMemoryMmap) -> MockSvgaDevice {
        let mut device = MockSvgaDevice::new();
        let mem = mem.clone();
        device
            .expect_write_register()
            .with(eq(SVGA_REG_COMMAND_HIGH), always())
            .times(1)
            .return_const(());
        device
            .expect_write_register()
            .with(eq(SVGA_REG_COMMAND_LOW), always())
            .times(1)
            .returning(move |_, value| {
                let header = GuestAddress(u64::from(value & !SVGA_CB_CONTEXT_MASK));
                mem.store(CbStatus::COMPLETED.0, header, Ordering::Release)
                    .unwrap();
            });
        device.expect_sync().return_const(());
        device
    }

    fn position(events: &[Event], event: Event) -> usize {
        events
            .iter()
            .position(|&e| e == event)
            .unwrap_or_else(|| panic!("{event:?} not found in {events:?}"))
    }

    #[test]
    fn test_zero_length_submission() {
        let config = test_config(Transport::CmdBuf, WaitPolicy::UNBOUNDED);
        let mem = engine_memory(&config);
        let mut device = mock_accepting_control(&mem);
        device.expect_fence_next().never();
        device.expect_fence_last_passed().return_const(0u32);

        let engine = SubmissionEngine::new(device, mem, &config).unwrap();
        assert!(engine.is_context_enabled());

        let handle = engine.alloc(64).unwrap();
        let status = engine.submit(handle, 0, DeliveryFlags::RENDER, 0).unwrap();
        assert_eq!(
            status,
            SubmitStatus {
                state: SubmitState::Completed,
                fence_used: 0,
                fence_last: 0,
            }
        );
        assert_eq!(engine.status(handle).unwrap(), CbStatus::COMPLETED);
        assert_eq!(engine.in_flight(), 0);
    }

    #[test]
    fn test_submit_rejects_bad_sizes() {
        let (engine, _device) = soft_engine(Completion::Immediate);
        let handle = engine.alloc(64).unwrap();
        let capacity = engine.capacity(handle).unwrap();

        assert_matches!(
            engine.submit(handle, 6, DeliveryFlags::empty(), 0),
            Err(Error::UnalignedPayload(6))
        );
        assert_matches!(
            engine.submit(handle, capacity + 4, DeliveryFlags::empty(), 0),
            Err(Error::PayloadTooLarge { .. })
        );
        assert_matches!(
            engine.alloc(engine.max_payload() + 1),
            Err(Error::PayloadTooLarge { .. })
        );
        assert_matches!(
            engine.write_payload(handle, &vec![0; capacity / 4 + 1]),
            Err(Error::PayloadTooLarge { .. })
        );
        assert_matches!(engine.read_payload(handle, 3), Err(Error::UnalignedPayload(3)));
    }

    #[test]
    fn test_payload_round_trip() {
        let (engine, _device) = soft_engine(Completion::Immediate);
        let handle = engine.alloc_default().unwrap();
        assert!(engine.capacity(handle).unwrap() >= engine.max_payload());
        assert_eq!(engine.write_payload(handle, &[5, 6, 7]).unwrap(), 12);
        assert_eq!(engine.read_payload(handle, 12).unwrap(), vec![5, 6, 7]);
        assert_eq!(engine.payload_address(handle).unwrap().raw_value() % 64, 0);
    }

    #[test]
    fn test_header_contents() {
        let (engine, _device) = soft_engine(Completion::AfterSyncs(10));
        let handle = payload(&engine, &[1, 2, 3, 4]);
        engine
            .submit(
                handle,
                16,
                DeliveryFlags::DX_CONTEXT | DeliveryFlags::FORCE_FENCE,
                7,
            )
            .unwrap();

        let state = engine.lock();
        let header = state.arena.read_header(engine.memory(), handle).unwrap();
        assert_eq!(u32::from(header.status), CbStatus::NONE.0);
        // The context enable went first.
        assert_eq!(u64::from(header.id), 1);
        assert_eq!(
            u32::from(header.flags),
            SVGA_CB_FLAG_NO_IRQ | SVGA_CB_FLAG_DX_CONTEXT
        );
        assert_eq!(u32::from(header.dx_context), 7);
        assert_eq!(u32::from(header.length), 16 + FENCE_CMD_SIZE as u32);
        let words = state
            .arena
            .read_words(engine.memory(), handle, 16 + FENCE_CMD_SIZE)
            .unwrap();
        assert_eq!(words[4], SVGA_CMD_FENCE);
        assert_eq!(words[5], state.fences.last_issued());
    }

    #[test]
    fn test_present_waits_for_pending_render() {
        let (engine, device) = soft_engine(Completion::AfterSyncs(3));

        let render = payload(&engine, &[0x100]);
        let status = engine.submit(render, 4, DeliveryFlags::RENDER, 0).unwrap();
        assert_eq!(status.state, SubmitState::Pending(render));

        let present = payload(&engine, &[0x200]);
        engine
            .submit(present, 4, DeliveryFlags::PRESENT, 0)
            .unwrap();

        let events = device.events();
        let render_done = position(
            &events,
            Event::Completed {
                id: 1,
                status: CbStatus::COMPLETED,
            },
        );
        let present_sent = position(&events, Event::Dispatched { id: 2 });
        assert!(render_done < present_sent);
    }

    #[test]
    fn test_update_does_not_wait_for_present() {
        let (engine, device) = soft_engine(Completion::AfterSyncs(100));

        let present = payload(&engine, &[0x200]);
        engine
            .submit(present, 4, DeliveryFlags::PRESENT, 0)
            .unwrap();
        let update = payload(&engine, &[0x300]);
        engine.submit(update, 4, DeliveryFlags::UPDATE, 0).unwrap();

        assert_eq!(engine.in_flight(), 2);
        assert_eq!(engine.queued_bytes(), 8);
        let events = device.events();
        assert!(events.contains(&Event::Dispatched { id: 2 }));
        assert!(!events
            .iter()
            .any(|e| matches!(e, Event::Completed { id: 1, .. })));
    }

    #[test]
    fn test_sync_submission() {
        let (engine, device) = soft_engine(Completion::AfterSyncs(4));
        let handle = payload(&engine, &[1, 2]);
        let status = engine
            .submit(handle, 8, DeliveryFlags::SYNC | DeliveryFlags::RENDER, 0)
            .unwrap();
        assert_eq!(status.state, SubmitState::Completed);
        assert_eq!(status.fence_used, 0);
        assert_eq!(engine.status(handle).unwrap(), CbStatus::COMPLETED);
        assert_eq!(engine.in_flight(), 0);
        assert_eq!(device.in_flight(), 0);
    }

    #[test]
    fn test_query_pending_submission() {
        let (engine, device) = soft_engine(Completion::AfterSyncs(3));
        let handle = payload(&engine, &[1]);
        let status = engine
            .submit(handle, 4, DeliveryFlags::FORCE_FENCE, 0)
            .unwrap();
        assert_ne!(status.fence_used, 0);
        assert!(!engine.query(&status).unwrap());

        device.sync();
        device.sync();
        assert!(engine.query(&status).unwrap());
        assert_eq!(engine.fence_query().0, status.fence_used);
        engine.fence_wait(status.fence_used).unwrap();
    }

    #[test]
    fn test_fault_restarts_context() {
        let (engine, device) = soft_engine(Completion::AfterSyncs(2));
        device.inject_fault(1, 4);

        let failing = payload(&engine, &[0xbad0, 0xbad1]);
        let other = payload(&engine, &[0x600d]);
        engine
            .submit(failing, 8, DeliveryFlags::empty(), 0)
            .unwrap();
        engine.submit(other, 4, DeliveryFlags::empty(), 0).unwrap();

        engine.flush_all().unwrap();

        assert_eq!(engine.status(failing).unwrap(), CbStatus::COMMAND_ERROR);
        assert_eq!(engine.status(other).unwrap(), CbStatus::QUEUE_FULL);
        assert_eq!(engine.in_flight(), 0);
        assert!(engine.is_context_enabled());

        let events = device.events();
        let disabled = position(&events, Event::ContextEnabled(false));
        assert!(events[disabled..].contains(&Event::ContextEnabled(true)));

        // Work submitted after the restart goes through.
        let handle = payload(&engine, &[1]);
        engine.submit(handle, 4, DeliveryFlags::SYNC, 0).unwrap();
        assert_eq!(engine.status(handle).unwrap(), CbStatus::COMPLETED);
    }

    #[test]
    fn test_faulted_sync_submission_before_any_fence_reports_zero() {
        let (engine, device) = soft_engine(Completion::Immediate);
        // Descriptor 0 is the context enable.
        device.inject_fault(1, 0);
        let bad = payload(&engine, &[1]);
        let status = engine
            .submit(bad, 4, DeliveryFlags::SYNC | DeliveryFlags::FORCE_FENCE, 0)
            .unwrap();
        assert_eq!(status.state, SubmitState::Completed);
        assert_eq!(status.fence_used, 0);
        assert_eq!(engine.status(bad).unwrap(), CbStatus::COMMAND_ERROR);
    }

    #[test]
    fn test_faulted_sync_submission_reports_last_passed_fence() {
        let (engine, device) = soft_engine(Completion::Immediate);
        let flags = DeliveryFlags::SYNC | DeliveryFlags::FORCE_FENCE;

        let good = payload(&engine, &[1]);
        let first = engine.submit(good, 4, flags, 0).unwrap();
        assert_eq!(first.fence_last, first.fence_used);

        device.inject_fault(2, 0);
        let bad = payload(&engine, &[2]);
        let status = engine.submit(bad, 4, flags, 0).unwrap();
        assert_eq!(status.state, SubmitState::Completed);
        assert_eq!(status.fence_used, first.fence_used);
        assert_eq!(engine.status(bad).unwrap(), CbStatus::COMMAND_ERROR);
        assert!(engine.is_context_enabled());
    }

    #[test]
    fn test_free_waits_for_completion() {
        let (engine, device) = soft_engine(Completion::AfterSyncs(5));
        let handle = payload(&engine, &[1, 2, 3]);
        engine
            .submit(handle, 12, DeliveryFlags::empty(), 0)
            .unwrap();
        assert_eq!(device.in_flight(), 1);

        engine.free(handle).unwrap();
        assert_eq!(device.in_flight(), 0);
        assert_eq!(engine.in_flight(), 0);
        assert_matches!(engine.status(handle), Err(Error::InvalidHandle));
        assert_matches!(engine.free(handle), Err(Error::InvalidHandle));
    }

    #[test]
    fn test_resubmit_waits_for_previous_use() {
        let (engine, device) = soft_engine(Completion::AfterSyncs(3));
        let handle = payload(&engine, &[1]);
        engine.submit(handle, 4, DeliveryFlags::empty(), 0).unwrap();
        engine.submit(handle, 4, DeliveryFlags::empty(), 0).unwrap();

        let events = device.events();
        let first_done = position(
            &events,
            Event::Completed {
                id: 1,
                status: CbStatus::COMPLETED,
            },
        );
        assert!(first_done < position(&events, Event::Dispatched { id: 2 }));
    }

    #[test]
    fn test_flush_all() {
        let (engine, device) = soft_engine(Completion::AfterSyncs(4));
        for i in 0..4 {
            let handle = payload(&engine, &[i]);
            engine.submit(handle, 4, DeliveryFlags::RENDER, 0).unwrap();
        }
        engine.flush_all().unwrap();
        assert_eq!(engine.in_flight(), 0);
        assert_eq!(device.in_flight(), 0);
    }

    #[test]
    fn test_wait_update() {
        let (engine, _device) = soft_engine(Completion::AfterSyncs(100));
        let update = payload(&engine, &[1]);
        engine.submit(update, 4, DeliveryFlags::UPDATE, 0).unwrap();
        let present = payload(&engine, &[2]);
        engine
            .submit(present, 4, DeliveryFlags::PRESENT, 0)
            .unwrap();

        engine.wait_update().unwrap();
        assert_eq!(engine.status(update).unwrap(), CbStatus::COMPLETED);
    }

    #[test]
    fn test_force_fifo() {
        let (engine, device) = soft_engine(Completion::Immediate);
        let handle = payload(&engine, &[0xa, 0xb]);
        let status = engine
            .submit(handle, 8, DeliveryFlags::FORCE_FIFO | DeliveryFlags::RENDER, 0)
            .unwrap();
        assert_eq!(status.state, SubmitState::FencePending);
        assert_eq!(
            device.fifo_words(),
            vec![0xa, 0xb, SVGA_CMD_FENCE, status.fence_used]
        );
        assert!(engine.query(&status).unwrap());
        assert_eq!(engine.status(handle).unwrap(), CbStatus::COMPLETED);
        assert_eq!(engine.in_flight(), 0);
    }

    #[test]
    fn test_fifo_fence_ordering() {
        let config = test_config(Transport::Fifo, WaitPolicy::UNBOUNDED);
        let mem = engine_memory(&config);
        let mut device = MockSvgaDevice::new();
        let mut issued = 0;
        device.expect_fence_next().times(3).returning(move || {
            issued += 1;
            issued
        });
        // The presentation waits for the rendering fence, the update that
        // follows does not wait for the presentation.
        let mut polls = 0;
        device
            .expect_fence_passed()
            .with(eq(1))
            .times(2)
            .returning(move |_| {
                polls += 1;
                polls == 2
            });
        device.expect_fence_passed().with(eq(2)).never();
        device.expect_sync().return_const(());
        device.expect_write_register().never();
        device.expect_fence_last_passed().return_const(0u32);

        let engine = SubmissionEngine::new(device, mem, &config).unwrap();
        assert!(!engine.cmd_buffers_supported());

        for (word, flags) in [
            (0x1, DeliveryFlags::RENDER),
            (0x2, DeliveryFlags::PRESENT),
            (0x3, DeliveryFlags::UPDATE),
        ] {
            let handle = payload(&engine, &[word]);
            let status = engine.submit(handle, 4, flags, 0).unwrap();
            assert_eq!(status.state, SubmitState::FencePending);
        }

        let words = FifoRing::new(FIFO_BASE).drain(engine.memory()).unwrap();
        assert_eq!(
            words,
            vec![
                0x1,
                SVGA_CMD_FENCE,
                1,
                0x2,
                SVGA_CMD_FENCE,
                2,
                0x3,
                SVGA_CMD_FENCE,
                3
            ]
        );
        assert_eq!(engine.fence_query(), (0, 3));
        assert_eq!(
            FifoRing::new(FIFO_BASE)
                .register(engine.memory(), SVGA_FIFO_MIN)
                .unwrap(),
            SVGA_FIFO_NUM_REGS * 4
        );
    }

    #[test]
    fn test_fifo_without_fence_completes() {
        let (engine, device) = soft_engine_config(
            test_config(Transport::Fifo, WaitPolicy::UNBOUNDED),
            |device| device,
        );
        let handle = payload(&engine, &[0x42]);
        let status = engine.submit(handle, 4, DeliveryFlags::empty(), 0).unwrap();
        assert_eq!(status.state, SubmitState::Completed);
        assert_eq!(status.fence_used, 0);
        engine.flush_all().unwrap();
        assert_eq!(device.fifo_words(), vec![0x42]);
    }

    #[test]
    fn test_fifo_out_of_space_publishes_nothing() {
        // Eight word slots.
        let config = EngineConfigBuilder::default()
            .set_transport(Transport::Fifo)
            .set_wait_policy(WaitPolicy::bounded(2))
            .set_max_payload(16 * 1024)
            .set_fifo(FIFO_BASE, (SVGA_FIFO_NUM_REGS + 8) * 4)
            .set_pool(POOL_BASE, POOL_PAGES)
            .build()
            .unwrap();
        let mem = engine_memory(&config);
        // Never consumes anything.
        let mut device = MockSvgaDevice::new();
        device.expect_sync().return_const(());
        device.expect_fence_last_passed().return_const(0u32);
        let engine = SubmissionEngine::new(device, mem, &config).unwrap();
        let ring = FifoRing::new(FIFO_BASE);
        let min = SVGA_FIFO_NUM_REGS * 4;

        let first = payload(&engine, &[0xa0, 0xa1, 0xa2, 0xa3, 0xa4]);
        engine.submit(first, 20, DeliveryFlags::empty(), 0).unwrap();
        assert_eq!(engine.status(first).unwrap(), CbStatus::COMPLETED);

        let second = payload(&engine, &[0xb0, 0xb1, 0xb2]);
        assert_matches!(
            engine.submit(second, 12, DeliveryFlags::empty(), 0),
            Err(Error::DeviceUnresponsive {
                what: "fifo space",
                polls: 2
            })
        );
        assert_eq!(engine.status(second).unwrap(), CbStatus::SUBMISSION_ERROR);
        assert_eq!(
            ring.register(engine.memory(), SVGA_FIFO_NEXT_CMD).unwrap(),
            min + 20
        );
        assert_eq!(
            ring.drain(engine.memory()).unwrap(),
            vec![0xa0, 0xa1, 0xa2, 0xa3, 0xa4]
        );
    }

    #[test]
    fn test_bounded_wait_reports_unresponsive_device() {
        let (engine, _device) = soft_engine_config(
            test_config(Transport::CmdBuf, WaitPolicy::bounded(5)),
            |device| device.with_completion(Completion::AfterSyncs(1000)),
        );
        let handle = payload(&engine, &[1]);
        assert_matches!(
            engine.submit(handle, 4, DeliveryFlags::SYNC, 0),
            Err(Error::DeviceUnresponsive {
                what: "command buffer",
                polls: 5
            })
        );
        // Still queued, a later wait can pick it up.
        assert_eq!(engine.in_flight(), 1);
    }

    #[test]
    fn test_device_context_flag_is_ignored() {
        let (engine, device) = soft_engine(Completion::Immediate);
        let handle = payload(&engine, &[0x400]);
        let flags = DeliveryFlags::USE_CONTEXT_DEVICE | DeliveryFlags::SYNC;
        let status = engine.submit(handle, 4, flags, 0).unwrap();
        assert_eq!(status.state, SubmitState::Completed);
        assert_eq!(engine.status(handle).unwrap(), CbStatus::COMPLETED);
        // Still a regular context 0 submission, the context stays up.
        assert!(device.is_context_enabled());
        assert!(device.events().contains(&Event::Completed {
            id: 1,
            status: CbStatus::COMPLETED
        }));
    }

    #[test]
    fn test_surface_dirty_latch() {
        let (engine, _device) = soft_engine(Completion::Immediate);
        assert!(!engine.take_surface_dirty());
        let handle = payload(&engine, &[1]);
        engine
            .submit(handle, 4, DeliveryFlags::DIRTY_SURFACE, 0)
            .unwrap();
        assert!(engine.take_surface_dirty());
        assert!(!engine.take_surface_dirty());
    }

    #[test]
    fn test_fence_get() {
        let (engine, device) = soft_engine_with(|device| device);
        let fence = engine.fence_get();
        assert_ne!(fence, 0);
        assert_eq!(engine.fence_query(), (0, fence));
        assert!(!device.fence_passed(fence));
        // Zero never blocks.
        engine.fence_wait(0).unwrap();
    }
}
