// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! In-process model of the device side of the SVGA submission protocol.
//!
//! `SoftSvga` consumes command buffers and FIFO words from guest memory the
//! way the adapter does, passes the fences it finds and reports faults on
//! request. It gives no meaning to any other command.

use std::{
    collections::{HashMap, VecDeque},
    sync::{atomic::Ordering, Arc, Mutex},
};

use log::{debug, error, info, trace};
use vm_memory::{Address, Bytes, GuestAddress, GuestMemoryMmap};

use crate::{
    device::SvgaDevice,
    fifo::FifoRing,
    protocol::{
        svga_cb_header, svga_dc_cmd_start_stop, CbStatus, SVGA_CB_CONTEXT_0,
        SVGA_CB_CONTEXT_DEVICE, SVGA_CB_CONTEXT_MASK, SVGA_CB_ERROR_OFFSET_OFFSET,
        SVGA_CB_STATUS_OFFSET, SVGA_CMD_FENCE, SVGA_DC_CMD_START_STOP_CONTEXT, SVGA_FIFO_FENCE,
        SVGA_REG_COMMAND_HIGH, SVGA_REG_COMMAND_LOW,
    },
    Result,
};

/// When dispatched command buffers complete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Completion {
    /// As soon as `SVGA_REG_COMMAND_LOW` is written.
    #[default]
    Immediate,
    /// After this many calls to [`SvgaDevice::sync`], in dispatch order.
    AfterSyncs(u32),
}

/// Observable device activity, in the order it happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Dispatched { id: u64 },
    Completed { id: u64, status: CbStatus },
    ContextEnabled(bool),
    FencePassed(u32),
}

#[derive(Debug)]
struct InFlight {
    header: GuestAddress,
    id: u64,
    syncs_left: u32,
}

#[derive(Debug)]
struct SoftState {
    mem: GuestMemoryMmap,
    fifo: FifoRing,
    cmd_buffers: bool,
    reject_context_enable: bool,
    completion: Completion,
    faults: HashMap<u64, u32>,
    context_enabled: bool,
    // A faulted context processes nothing until it is stopped.
    halted: bool,
    command_high: u32,
    in_flight: VecDeque<InFlight>,
    next_fence: u32,
    last_passed: u32,
    events: Vec<Event>,
    fifo_words: Vec<u32>,
}

/// Software SVGA device sharing guest memory with the engine.
///
/// Clones share state, so a test can keep one to inspect what the engine
/// did to the other.
#[derive(Clone, Debug)]
pub struct SoftSvga {
    state: Arc<Mutex<SoftState>>,
}

impl SoftSvga {
    pub fn new(mem: GuestMemoryMmap, fifo_base: GuestAddress) -> Self {
        Self {
            state: Arc::new(Mutex::new(SoftState {
                mem,
                fifo: FifoRing::new(fifo_base),
                cmd_buffers: true,
                reject_context_enable: false,
                completion: Completion::Immediate,
                faults: HashMap::new(),
                context_enabled: false,
                halted: false,
                command_high: 0,
                in_flight: VecDeque::new(),
                next_fence: 0,
                last_passed: 0,
                events: Vec::new(),
                fifo_words: Vec::new(),
            })),
        }
    }

    pub fn with_cmd_buffers(self, enabled: bool) -> Self {
        self.state.lock().unwrap().cmd_buffers = enabled;
        self
    }

    pub fn with_completion(self, completion: Completion) -> Self {
        self.state.lock().unwrap().completion = completion;
        self
    }

    /// Makes the device refuse to enable command-buffer contexts.
    pub fn reject_context_enable(self, reject: bool) -> Self {
        self.state.lock().unwrap().reject_context_enable = reject;
        self
    }

    /// Fails the command buffer with the given id with `COMMAND_ERROR` at
    /// byte `error_offset` of its payload.
    pub fn inject_fault(&self, id: u64, error_offset: u32) {
        self.state.lock().unwrap().faults.insert(id, error_offset);
    }

    pub fn has_cmd_buffers(&self) -> bool {
        self.state.lock().unwrap().cmd_buffers
    }

    pub fn is_context_enabled(&self) -> bool {
        self.state.lock().unwrap().context_enabled
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight.len()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    /// Every word consumed from the FIFO so far.
    pub fn fifo_words(&self) -> Vec<u32> {
        self.state.lock().unwrap().fifo_words.clone()
    }
}

fn fence_reached(last_passed: u32, fence: u32) -> bool {
    // Fence ids wrap around.
    last_passed.wrapping_sub(fence) as i32 >= 0
}

impl SoftState {
    fn pass_fences(&mut self, words: &[u32]) -> Result<()> {
        let mut iter = words.iter();
        while let Some(&word) = iter.next() {
            if word != SVGA_CMD_FENCE {
                continue;
            }
            let Some(&fence) = iter.next() else {
                break;
            };
            if fence != 0 && !fence_reached(self.last_passed, fence) {
                self.last_passed = fence;
                self.fifo.set_register(&self.mem, SVGA_FIFO_FENCE, fence)?;
                self.events.push(Event::FencePassed(fence));
            }
        }
        Ok(())
    }

    fn payload(&self, header: &svga_cb_header) -> Result<Vec<u32>> {
        let mut bytes = vec![0u8; u32::from(header.length) as usize];
        self.mem.read_slice(&mut bytes, GuestAddress(u64::from(header.pa)))?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    fn set_status(&mut self, addr: GuestAddress, id: u64, status: CbStatus) -> Result<()> {
        self.mem.store(
            status.0,
            addr.unchecked_add(SVGA_CB_STATUS_OFFSET),
            Ordering::Release,
        )?;
        self.events.push(Event::Completed { id, status });
        Ok(())
    }

    fn consume_fifo(&mut self) -> Result<()> {
        let words = self.fifo.drain(&self.mem)?;
        if !words.is_empty() {
            trace!("Consumed {} FIFO words", words.len());
            self.pass_fences(&words)?;
            self.fifo_words.extend(words);
        }
        Ok(())
    }

    fn complete(&mut self, buf: InFlight) -> Result<()> {
        if let Some(&error_offset) = self.faults.get(&buf.id) {
            debug!("Failing command buffer {} at offset {error_offset}", buf.id);
            self.mem.store(
                error_offset,
                buf.header.unchecked_add(SVGA_CB_ERROR_OFFSET_OFFSET),
                Ordering::Release,
            )?;
            self.halted = true;
            return self.set_status(buf.header, buf.id, CbStatus::COMMAND_ERROR);
        }

        let header: svga_cb_header = self.mem.read_obj(buf.header)?;
        let words = self.payload(&header)?;
        self.pass_fences(&words)?;
        self.set_status(buf.header, buf.id, CbStatus::COMPLETED)
    }

    fn process_in_flight(&mut self, tick: bool) -> Result<()> {
        if tick {
            for buf in self.in_flight.iter_mut() {
                buf.syncs_left = buf.syncs_left.saturating_sub(1);
            }
        }
        while !self.halted && self.in_flight.front().is_some_and(|buf| buf.syncs_left == 0) {
            if let Some(buf) = self.in_flight.pop_front() {
                self.complete(buf)?;
            }
        }
        Ok(())
    }

    fn control(&mut self, addr: GuestAddress, header: &svga_cb_header) -> Result<()> {
        let id = u64::from(header.id);
        let cmd: svga_dc_cmd_start_stop = self.mem.read_obj(GuestAddress(u64::from(header.pa)))?;
        if u32::from(cmd.cmd) != SVGA_DC_CMD_START_STOP_CONTEXT
            || u32::from(cmd.context) != SVGA_CB_CONTEXT_0
        {
            return self.set_status(addr, id, CbStatus::COMMAND_ERROR);
        }

        let enable = u32::from(cmd.enable) != 0;
        if enable && self.reject_context_enable {
            info!("Refusing to enable command-buffer context");
            return self.set_status(addr, id, CbStatus::COMMAND_ERROR);
        }
        if !enable {
            // Work still queued on the context is dropped.
            self.in_flight.clear();
            self.halted = false;
        }
        self.context_enabled = enable;
        self.events.push(Event::ContextEnabled(enable));
        self.set_status(addr, id, CbStatus::COMPLETED)
    }

    fn dispatch(&mut self, value: u32) -> Result<()> {
        if !self.cmd_buffers {
            debug!("Command buffers not supported, ignoring dispatch");
            return Ok(());
        }

        let context = value & SVGA_CB_CONTEXT_MASK;
        let addr = GuestAddress(
            (u64::from(self.command_high) << 32) | u64::from(value & !SVGA_CB_CONTEXT_MASK),
        );
        let header: svga_cb_header = self.mem.read_obj(addr)?;
        let id = u64::from(header.id);
        self.events.push(Event::Dispatched { id });

        match context {
            SVGA_CB_CONTEXT_DEVICE => self.control(addr, &header),
            SVGA_CB_CONTEXT_0 if self.context_enabled => {
                let syncs_left = match self.completion {
                    Completion::Immediate => 0,
                    Completion::AfterSyncs(syncs) => syncs,
                };
                self.in_flight.push_back(InFlight {
                    header: addr,
                    id,
                    syncs_left,
                });
                self.process_in_flight(false)
            }
            _ => self.set_status(addr, id, CbStatus::SUBMISSION_ERROR),
        }
    }
}

impl SvgaDevice for SoftSvga {
    fn write_register(&self, reg: u32, value: u32) {
        let mut state = self.state.lock().unwrap();
        let result = match reg {
            SVGA_REG_COMMAND_HIGH => {
                state.command_high = value;
                Ok(())
            }
            SVGA_REG_COMMAND_LOW => state.dispatch(value),
            _ => Ok(()),
        };
        if let Err(e) = result {
            error!("Register {reg} write failed: {e}");
        }
    }

    fn sync(&self) {
        let mut state = self.state.lock().unwrap();
        if let Err(e) = state
            .consume_fifo()
            .and_then(|()| state.process_in_flight(true))
        {
            error!("Device sync failed: {e}");
        }
    }

    fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        if let Err(e) = state.consume_fifo() {
            error!("FIFO flush failed: {e}");
        }
    }

    fn fence_next(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.next_fence = state.next_fence.wrapping_add(1);
        if state.next_fence == 0 {
            state.next_fence = 1;
        }
        state.next_fence
    }

    fn fence_passed(&self, fence: u32) -> bool {
        let state = self.state.lock().unwrap();
        fence == 0 || (state.last_passed != 0 && fence_reached(state.last_passed, fence))
    }

    fn fence_last_passed(&self) -> u32 {
        self.state.lock().unwrap().last_passed
    }
}
