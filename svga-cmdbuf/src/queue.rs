// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::collections::VecDeque;

use crate::{
    allocator::CmdBufHandle,
    protocol::{CbStatus, Category},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct QueueNode {
    handle: CmdBufHandle,
    categories: Category,
    data_size: usize,
}

/// Result of a single retirement pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ScanOutcome {
    /// The queue is empty, or the requested target is no longer queued.
    pub retired: bool,
    /// Entries unlinked with a fault status, in submission order.
    pub faulted: Vec<(CmdBufHandle, CbStatus)>,
}

/// Command buffers handed to the device and not yet seen completed, in
/// submission order.
#[derive(Debug, Default)]
pub(crate) struct SubmissionQueue {
    nodes: VecDeque<QueueNode>,
}

impl SubmissionQueue {
    pub(crate) fn insert(&mut self, handle: CmdBufHandle, categories: Category, data_size: usize) {
        self.nodes.push_back(QueueNode {
            handle,
            categories,
            data_size,
        });
    }

    /// Unlinks every entry whose status reached `COMPLETED` in one pass.
    ///
    /// Faulted entries are unlinked as well and reported; deciding what to do
    /// about them is up to the caller.
    pub(crate) fn scan<F>(
        &mut self,
        target: Option<CmdBufHandle>,
        mut status_of: F,
    ) -> Result<ScanOutcome>
    where
        F: FnMut(CmdBufHandle) -> Result<CbStatus>,
    {
        let mut outcome = ScanOutcome::default();
        let mut kept = VecDeque::with_capacity(self.nodes.len());
        let mut target_queued = false;

        while let Some(node) = self.nodes.pop_front() {
            let status = match status_of(node.handle) {
                Ok(status) => status,
                Err(e) => {
                    // Leave the queue as it was: kept entries, then this one,
                    // then the rest.
                    kept.push_back(node);
                    kept.append(&mut self.nodes);
                    self.nodes = kept;
                    return Err(e);
                }
            };
            if status.is_pending() {
                target_queued |= target == Some(node.handle);
                kept.push_back(node);
            } else if status.is_fault() {
                outcome.faulted.push((node.handle, status));
            }
        }
        self.nodes = kept;

        outcome.retired = self.nodes.is_empty() || (target.is_some() && !target_queued);
        Ok(outcome)
    }

    pub(crate) fn has_category(&self, mask: Category) -> bool {
        !mask.is_empty() && self.nodes.iter().any(|node| node.categories.intersects(mask))
    }

    /// Empties the queue, returning the entries that were still in flight.
    pub(crate) fn force_drain(&mut self) -> Vec<CmdBufHandle> {
        self.nodes.drain(..).map(|node| node.handle).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Bytes of payload currently owned by the device.
    pub(crate) fn queued_bytes(&self) -> usize {
        self.nodes.iter().map(|node| node.data_size).sum()
    }
}
