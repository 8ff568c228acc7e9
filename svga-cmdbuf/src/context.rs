// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use log::{info, warn};
use vm_memory::Bytes;

use crate::{
    device::SvgaDevice,
    engine::{EngineState, Hardware},
    protocol::{
        svga_dc_cmd_start_stop, CbStatus, SVGA_CB_CONTEXT_0, SVGA_CB_CONTEXT_DEVICE,
        SVGA_CB_FLAG_NO_IRQ,
    },
    wait::spin_until,
    Result,
};

/// Command-buffer context 0, the only one the engine submits to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ContextState {
    /// The device accepts command buffers. Cleared for good if it refuses to
    /// enable the context.
    pub supported: bool,
    pub enabled: bool,
}

impl ContextState {
    pub(crate) fn new(supported: bool) -> Self {
        Self {
            supported,
            enabled: false,
        }
    }

    pub(crate) fn uses_cmd_buffers(&self) -> bool {
        self.supported && self.enabled
    }
}

impl EngineState {
    pub(crate) fn context_start<D: SvgaDevice>(&mut self, hw: &Hardware<D>) -> Result<()> {
        if !self.context.supported || self.context.enabled {
            return Ok(());
        }

        let status = self.submit_control(hw, true)?;
        if status == CbStatus::COMPLETED {
            self.context.enabled = true;
            info!("Command-buffer context enabled");
        } else {
            self.context.supported = false;
            warn!("Device refused command buffers ({status}), falling back to the FIFO");
        }
        Ok(())
    }

    /// Disables the context and invalidates everything still queued on it.
    pub(crate) fn context_stop<D: SvgaDevice>(&mut self, hw: &Hardware<D>) -> Result<()> {
        self.context.enabled = false;
        let result = if self.context.supported {
            self.submit_control(hw, false).map(|status| {
                if status != CbStatus::COMPLETED {
                    warn!("Disabling command-buffer context returned {status}");
                }
            })
        } else {
            Ok(())
        };

        // The device dropped the queued work, or is being abandoned: either
        // way nothing queued completes anymore.
        let dropped = self.queue.force_drain();
        if !dropped.is_empty() {
            info!("Invalidated {} in-flight command buffers", dropped.len());
        }
        for handle in dropped {
            self.arena.set_status(&hw.mem, handle, CbStatus::QUEUE_FULL)?;
        }
        result
    }

    pub(crate) fn context_restart<D: SvgaDevice>(&mut self, hw: &Hardware<D>) -> Result<()> {
        self.context_stop(hw)?;
        self.context_start(hw)
    }

    /// Runs a start/stop command on the device context and waits for its
    /// status.
    fn submit_control<D: SvgaDevice>(
        &mut self,
        hw: &Hardware<D>,
        enable: bool,
    ) -> Result<CbStatus> {
        let handle = self.ctl_buf;
        let cmd = svga_dc_cmd_start_stop::new(enable, SVGA_CB_CONTEXT_0);
        hw.mem.write_obj(cmd, self.arena.payload_addr(handle)?)?;
        self.write_descriptor(
            hw,
            handle,
            std::mem::size_of::<svga_dc_cmd_start_stop>(),
            SVGA_CB_FLAG_NO_IRQ,
            0,
        )?;
        self.dispatch(hw, handle, SVGA_CB_CONTEXT_DEVICE)?;

        let arena = &self.arena;
        spin_until(&hw.device, hw.wait, "context control", || {
            Ok(!arena.status(&hw.mem, handle)?.is_pending())
        })?;
        arena.status(&hw.mem, handle)
    }
}
