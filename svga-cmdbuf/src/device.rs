// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

/// Trait representing the device side of an SVGA-II adapter, as seen by the
/// submission engine.
///
/// The engine never maps BARs or touches I/O ports itself. Whatever sets up
/// the adapter hands it an implementation of this trait together with the
/// guest memory holding the FIFO and the command-buffer pool.
#[cfg_attr(test, mockall::automock)]
pub trait SvgaDevice {
    /// Writes an SVGA register.
    fn write_register(&self, reg: u32, value: u32);

    /// Makes the device observe recent register and memory writes and lets
    /// the host make progress. Cheap, called from every polling loop.
    fn sync(&self);

    /// Blocks until the device consumed everything currently in the FIFO.
    fn flush(&self);

    /// Reserves a fresh fence id. Never returns 0.
    fn fence_next(&self) -> u32;

    /// Whether the device has processed the given fence.
    fn fence_passed(&self, fence: u32) -> bool;

    /// Last fence the device processed, 0 if none yet.
    fn fence_last_passed(&self) -> u32;
}
