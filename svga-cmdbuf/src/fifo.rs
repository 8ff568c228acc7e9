// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::sync::atomic::Ordering;

use log::trace;
use vm_memory::{Address, Bytes, GuestAddress, GuestMemoryMmap};

use crate::{
    device::SvgaDevice,
    protocol::{
        SVGA_FIFO_FENCE, SVGA_FIFO_MAX, SVGA_FIFO_MIN, SVGA_FIFO_NEXT_CMD, SVGA_FIFO_NUM_REGS,
        SVGA_FIFO_STOP,
    },
    wait::{spin_until, WaitPolicy},
    Error, Result,
};

/// The legacy command FIFO: a ring of 32-bit words in guest memory, preceded
/// by its register block.
///
/// `MIN`, `MAX`, `NEXT_CMD` and `STOP` hold byte offsets from the start of
/// the FIFO. The guest produces at `NEXT_CMD`, the device consumes from
/// `STOP`; the ring is empty when both are equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FifoRing {
    base: GuestAddress,
}

impl FifoRing {
    /// Wraps an already initialized FIFO.
    pub fn new(base: GuestAddress) -> Self {
        Self { base }
    }

    /// Initializes the register block of a FIFO spanning `size` bytes and
    /// leaves the ring empty.
    pub fn reset(mem: &GuestMemoryMmap, base: GuestAddress, size: u32) -> Result<Self> {
        let ring = Self::new(base);
        let min = SVGA_FIFO_NUM_REGS * 4;
        ring.set_register(mem, SVGA_FIFO_MIN, min)?;
        ring.set_register(mem, SVGA_FIFO_MAX, size)?;
        ring.set_register(mem, SVGA_FIFO_NEXT_CMD, min)?;
        ring.set_register(mem, SVGA_FIFO_STOP, min)?;
        ring.set_register(mem, SVGA_FIFO_FENCE, 0)?;
        Ok(ring)
    }

    pub fn base(&self) -> GuestAddress {
        self.base
    }

    pub fn register(&self, mem: &GuestMemoryMmap, reg: u32) -> Result<u32> {
        mem.load::<u32>(self.register_addr(reg), Ordering::Acquire)
            .map_err(Error::GuestMemory)
    }

    pub fn set_register(&self, mem: &GuestMemoryMmap, reg: u32, value: u32) -> Result<()> {
        mem.store(value, self.register_addr(reg), Ordering::Release)
            .map_err(Error::GuestMemory)
    }

    fn register_addr(&self, reg: u32) -> GuestAddress {
        self.base.unchecked_add(u64::from(reg) * 4)
    }

    fn word_addr(&self, offset: u32) -> GuestAddress {
        self.base.unchecked_add(u64::from(offset))
    }

    fn advance(offset: u32, min: u32, max: u32) -> u32 {
        match offset + 4 {
            next if next >= max => min,
            next => next,
        }
    }

    /// Words the ring can take before `NEXT_CMD` would catch up with `STOP`.
    fn free_words(&self, mem: &GuestMemoryMmap, min: u32, max: u32) -> Result<usize> {
        let span = max - min;
        let next = self.register(mem, SVGA_FIFO_NEXT_CMD)?;
        let stop = self.register(mem, SVGA_FIFO_STOP)?;
        let used = (next + span - stop) % span;
        Ok(((span - used) / 4 - 1) as usize)
    }

    /// Copies `words` into the ring one at a time, publishing `NEXT_CMD`
    /// after each of them.
    ///
    /// When the whole stream fits in the ring, nothing is published until
    /// there is room for all of it, so running out of wait budget never
    /// leaves a partial command behind. Longer streams are fed to the device
    /// as it consumes them.
    pub(crate) fn write_words<D: SvgaDevice + ?Sized>(
        &self,
        mem: &GuestMemoryMmap,
        device: &D,
        policy: WaitPolicy,
        words: &[u32],
    ) -> Result<()> {
        let min = self.register(mem, SVGA_FIFO_MIN)?;
        let max = self.register(mem, SVGA_FIFO_MAX)?;

        if words.len() <= ((max - min) / 4 - 1) as usize {
            spin_until(device, policy, "fifo space", || {
                Ok(self.free_words(mem, min, max)? >= words.len())
            })?;
        }

        for &word in words {
            let next = self.register(mem, SVGA_FIFO_NEXT_CMD)?;
            let advanced = Self::advance(next, min, max);
            // Writing would make NEXT_CMD catch up with STOP, which reads as
            // an empty ring.
            spin_until(device, policy, "fifo space", || {
                Ok(self.register(mem, SVGA_FIFO_STOP)? != advanced)
            })?;
            mem.store(word, self.word_addr(next), Ordering::Release)
                .map_err(Error::GuestMemory)?;
            self.set_register(mem, SVGA_FIFO_NEXT_CMD, advanced)?;
        }
        trace!("Wrote {} words to the FIFO", words.len());
        Ok(())
    }

    /// Consumes everything between `STOP` and `NEXT_CMD`, as the device does.
    pub(crate) fn drain(&self, mem: &GuestMemoryMmap) -> Result<Vec<u32>> {
        let min = self.register(mem, SVGA_FIFO_MIN)?;
        let max = self.register(mem, SVGA_FIFO_MAX)?;
        let next = self.register(mem, SVGA_FIFO_NEXT_CMD)?;
        let mut stop = self.register(mem, SVGA_FIFO_STOP)?;

        let mut words = Vec::new();
        while stop != next {
            words.push(
                mem.load::<u32>(self.word_addr(stop), Ordering::Acquire)
                    .map_err(Error::GuestMemory)?,
            );
            stop = Self::advance(stop, min, max);
        }
        self.set_register(mem, SVGA_FIFO_STOP, stop)?;
        Ok(words)
    }
}
