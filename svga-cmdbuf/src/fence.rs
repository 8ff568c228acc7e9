// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use log::trace;

use crate::{
    device::SvgaDevice,
    protocol::Category,
    wait::{spin_until, WaitPolicy},
    Result,
};

const SLOTS: [Category; 3] = [Category::PRESENT, Category::RENDER, Category::UPDATE];

/// Last fence issued per ordering category for work pushed through the FIFO.
///
/// A slot holding `Some(fence)` means that fence may still be outstanding.
#[derive(Debug, Default)]
pub(crate) struct FenceTracker {
    slots: [Option<u32>; 3],
    last_issued: u32,
}

impl FenceTracker {
    /// Reserves a new fence on the device.
    pub(crate) fn get_token<D: SvgaDevice + ?Sized>(&mut self, device: &D) -> u32 {
        let token = device.fence_next();
        self.last_issued = token;
        token
    }

    pub(crate) fn last_issued(&self) -> u32 {
        self.last_issued
    }

    /// Remembers `token` as the most recent fence of every category in
    /// `categories`.
    pub(crate) fn record(&mut self, categories: Category, token: u32) {
        if token == 0 {
            return;
        }
        for (slot, category) in self.slots.iter_mut().zip(SLOTS) {
            if categories.contains(category) {
                *slot = Some(token);
            }
        }
    }

    /// Waits for the outstanding fence of every category in `conflicts`, then
    /// forgets it.
    pub(crate) fn check_and_clear<D: SvgaDevice + ?Sized>(
        &mut self,
        device: &D,
        policy: WaitPolicy,
        conflicts: Category,
    ) -> Result<()> {
        for (slot, category) in self.slots.iter_mut().zip(SLOTS) {
            if !conflicts.contains(category) {
                continue;
            }
            if let Some(token) = *slot {
                trace!("Waiting for {category:?} fence {token}");
                Self::wait(device, policy, token)?;
                *slot = None;
            }
        }
        Ok(())
    }

    pub(crate) fn wait<D: SvgaDevice + ?Sized>(
        device: &D,
        policy: WaitPolicy,
        token: u32,
    ) -> Result<()> {
        if token == 0 {
            return Ok(());
        }
        spin_until(device, policy, "fence", || Ok(device.fence_passed(token)))
    }

    pub(crate) fn query<D: SvgaDevice + ?Sized>(device: &D, token: u32) -> bool {
        token == 0 || device.fence_passed(token)
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self, category: Category) -> Option<u32> {
        SLOTS
            .iter()
            .position(|&c| c == category)
            .and_then(|index| self.slots[index])
    }
}
