// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

#![allow(non_camel_case_types)]

use std::{
    fmt::{self, Display},
    mem::{offset_of, size_of},
};

use bitflags::bitflags;
use vm_memory::{ByteValued, Le32, Le64};

/// Pages handed out by the buffer allocator.
pub const PAGE_SIZE: usize = 4096;

/// Largest payload the device accepts in a single command buffer.
pub const SVGA_CB_MAX_SIZE: usize = 512 * 1024;

pub const SVGA_REG_COMMAND_LOW: u32 = 48;
pub const SVGA_REG_COMMAND_HIGH: u32 = 49;

/// FIFO command emitting a fence, followed by one word carrying the fence id.
pub const SVGA_CMD_FENCE: u32 = 30;

/// Device-context command enabling or disabling a command-buffer context.
pub const SVGA_DC_CMD_START_STOP_CONTEXT: u32 = 1;

/// Context ids are carried in the low bits of `SVGA_REG_COMMAND_LOW`, the
/// header itself is 64-byte aligned.
pub const SVGA_CB_CONTEXT_MASK: u32 = 0x3f;
pub const SVGA_CB_CONTEXT_0: u32 = 0x0;
pub const SVGA_CB_CONTEXT_DEVICE: u32 = 0x3f;

pub const SVGA_CB_FLAG_NO_IRQ: u32 = 1 << 0;
pub const SVGA_CB_FLAG_DX_CONTEXT: u32 = 1 << 1;

/// FIFO register indices, in 32-bit words from the start of FIFO memory.
pub const SVGA_FIFO_MIN: u32 = 0;
pub const SVGA_FIFO_MAX: u32 = 1;
pub const SVGA_FIFO_NEXT_CMD: u32 = 2;
pub const SVGA_FIFO_STOP: u32 = 3;
pub const SVGA_FIFO_FENCE: u32 = 6;
/// Number of register words preceding the command area.
pub const SVGA_FIFO_NUM_REGS: u32 = 293;

/// Command-buffer descriptor status, as written by the device.
///
/// The values are ordered: everything below `COMPLETED` is still owned by
/// the device, everything above it is a fault.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CbStatus(pub u32);

impl CbStatus {
    pub const NONE: Self = Self(0);
    pub const COMPLETED: Self = Self(1);
    pub const QUEUE_FULL: Self = Self(2);
    pub const COMMAND_ERROR: Self = Self(3);
    pub const CB_HEADER_ERROR: Self = Self(4);
    pub const PREEMPTED: Self = Self(5);
    pub const SUBMISSION_ERROR: Self = Self(6);
    pub const PARTIAL_COMPLETE: Self = Self(7);

    pub const fn is_pending(self) -> bool {
        self.0 < Self::COMPLETED.0
    }

    pub const fn is_fault(self) -> bool {
        self.0 > Self::COMPLETED.0
    }
}

impl Display for CbStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => write!(f, "none"),
            Self::COMPLETED => write!(f, "completed"),
            Self::QUEUE_FULL => write!(f, "queue-full"),
            Self::COMMAND_ERROR => write!(f, "command-error"),
            Self::CB_HEADER_ERROR => write!(f, "header-error"),
            Self::PREEMPTED => write!(f, "preempted"),
            Self::SUBMISSION_ERROR => write!(f, "submission-error"),
            Self::PARTIAL_COMPLETE => write!(f, "partial-complete"),
            Self(other) => write!(f, "unknown({other})"),
        }
    }
}

/// Command-buffer header shared with the device.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct svga_cb_header {
    pub status: Le32,
    pub error_offset: Le32,
    pub id: Le64,
    pub flags: Le32,
    pub length: Le32,
    /// Physical address of the payload.
    pub pa: Le64,
    pub offset: Le32,
    pub dx_context: Le32,
    pub must_be_zero: [Le32; 6],
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for svga_cb_header {}

pub const SVGA_CB_HEADER_SIZE: usize = size_of::<svga_cb_header>();
pub const SVGA_CB_STATUS_OFFSET: u64 = offset_of!(svga_cb_header, status) as u64;
pub const SVGA_CB_ERROR_OFFSET_OFFSET: u64 = offset_of!(svga_cb_header, error_offset) as u64;

/// Payload of a `SVGA_DC_CMD_START_STOP_CONTEXT` control buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct svga_dc_cmd_start_stop {
    pub cmd: Le32,
    pub enable: Le32,
    pub context: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for svga_dc_cmd_start_stop {}

impl svga_dc_cmd_start_stop {
    pub fn new(enable: bool, context: u32) -> Self {
        Self {
            cmd: SVGA_DC_CMD_START_STOP_CONTEXT.into(),
            enable: u32::from(enable).into(),
            context: context.into(),
        }
    }
}

/// Bytes reserved after every payload for the fence command the engine may
/// append.
pub const FENCE_CMD_SIZE: usize = 2 * size_of::<u32>();

bitflags! {
    /// Delivery flags passed by the frontend along with a command stream.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DeliveryFlags: u32 {
        /// Accepted for compatibility, streams always go to context 0.
        const USE_CONTEXT_DEVICE = 0x8000_0000;
        /// Wait for completion before returning.
        const SYNC = 0x4000_0000;
        /// Bypass command buffers even when they are available.
        const FORCE_FIFO = 0x2000_0000;
        /// Always terminate the stream with a fence.
        const FORCE_FENCE = 0x1000_0000;
        const PRESENT = 0x0800_0000;
        const RENDER = 0x0400_0000;
        const UPDATE = 0x0200_0000;
        /// The stream touches the framebuffer surface.
        const DIRTY_SURFACE = 0x0100_0000;
        /// Attach the caller's DX context id to the descriptor.
        const DX_CONTEXT = SVGA_CB_FLAG_DX_CONTEXT;
    }
}

bitflags! {
    /// Ordering categories tracked for in-flight work.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Category: u8 {
        const PRESENT = 0x01;
        const RENDER = 0x02;
        const UPDATE = 0x04;
    }
}

impl Category {
    /// Categories a submission carries while it is in flight.
    pub fn of(flags: DeliveryFlags) -> Self {
        let mut categories = Self::empty();
        if flags.contains(DeliveryFlags::PRESENT) {
            categories |= Self::PRESENT;
        }
        if flags.contains(DeliveryFlags::RENDER) {
            categories |= Self::RENDER;
        }
        if flags.contains(DeliveryFlags::UPDATE) {
            categories |= Self::UPDATE;
        }
        categories
    }

    /// Categories of earlier work a submission has to wait for.
    pub fn conflicts_of(flags: DeliveryFlags) -> Self {
        let mut conflicts = Self::empty();
        if flags.contains(DeliveryFlags::PRESENT) {
            conflicts |= Self::PRESENT | Self::RENDER;
        }
        if flags.intersects(DeliveryFlags::RENDER | DeliveryFlags::UPDATE) {
            conflicts |= Self::RENDER | Self::UPDATE;
        }
        conflicts
    }
}

impl DeliveryFlags {
    /// FIFO submissions need a fence whenever completion has to be observed
    /// later.
    pub fn fifo_needs_fence(self) -> bool {
        self.intersects(
            Self::SYNC | Self::FORCE_FENCE | Self::PRESENT | Self::RENDER | Self::UPDATE,
        )
    }

    /// Command buffers carry their own status, a fence is only added on
    /// request.
    pub fn cb_needs_fence(self) -> bool {
        self.contains(Self::FORCE_FENCE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        assert_eq!(SVGA_CB_HEADER_SIZE, 64);
        assert_eq!(SVGA_CB_STATUS_OFFSET, 0);
        assert_eq!(SVGA_CB_ERROR_OFFSET_OFFSET, 4);
        assert_eq!(offset_of!(svga_cb_header, id), 8);
        assert_eq!(offset_of!(svga_cb_header, length), 20);
        assert_eq!(offset_of!(svga_cb_header, pa), 24);
        assert_eq!(offset_of!(svga_cb_header, dx_context), 36);
        assert_eq!(size_of::<svga_dc_cmd_start_stop>(), 12);
    }

    #[test]
    fn test_status_ordering() {
        assert!(CbStatus::NONE.is_pending());
        assert!(!CbStatus::COMPLETED.is_pending());
        assert!(!CbStatus::COMPLETED.is_fault());
        for status in [
            CbStatus::QUEUE_FULL,
            CbStatus::COMMAND_ERROR,
            CbStatus::SUBMISSION_ERROR,
            CbStatus(0x100),
        ] {
            assert!(status > CbStatus::COMPLETED);
            assert!(status.is_fault());
        }
        assert_eq!(CbStatus::COMMAND_ERROR.to_string(), "command-error");
        assert_eq!(CbStatus(42).to_string(), "unknown(42)");
    }

    #[test]
    fn test_category_of_flags() {
        assert_eq!(Category::of(DeliveryFlags::SYNC), Category::empty());
        assert_eq!(Category::of(DeliveryFlags::UPDATE), Category::UPDATE);
        assert_eq!(
            Category::of(DeliveryFlags::PRESENT | DeliveryFlags::RENDER),
            Category::PRESENT | Category::RENDER
        );
    }

    #[test]
    fn test_conflict_table() {
        assert_eq!(
            Category::conflicts_of(DeliveryFlags::PRESENT),
            Category::PRESENT | Category::RENDER
        );
        assert_eq!(
            Category::conflicts_of(DeliveryFlags::RENDER),
            Category::RENDER | Category::UPDATE
        );
        assert_eq!(
            Category::conflicts_of(DeliveryFlags::UPDATE),
            Category::RENDER | Category::UPDATE
        );
        assert_eq!(
            Category::conflicts_of(DeliveryFlags::FORCE_FENCE),
            Category::empty()
        );
        // Presentation never waits on screen updates.
        assert!(!Category::conflicts_of(DeliveryFlags::PRESENT).contains(Category::UPDATE));
    }

    #[test]
    fn test_fence_requirements() {
        assert!(DeliveryFlags::RENDER.fifo_needs_fence());
        assert!(DeliveryFlags::SYNC.fifo_needs_fence());
        assert!(!DeliveryFlags::FORCE_FIFO.fifo_needs_fence());
        assert!(!DeliveryFlags::RENDER.cb_needs_fence());
        assert!((DeliveryFlags::RENDER | DeliveryFlags::FORCE_FENCE).cb_needs_fence());
    }

    #[test]
    fn test_start_stop_payload() {
        let cmd = svga_dc_cmd_start_stop::new(true, SVGA_CB_CONTEXT_0);
        assert_eq!(u32::from(cmd.cmd), SVGA_DC_CMD_START_STOP_CONTEXT);
        assert_eq!(u32::from(cmd.enable), 1);
        assert_eq!(u32::from(cmd.context), 0);
    }
}
