// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::module_name_repetitions
)]

pub mod allocator;
mod context;
pub mod device;
pub mod engine;
mod fence;
pub mod fifo;
pub mod protocol;
mod queue;
// In-process device model, driven by the CLI and the tests
pub mod soft_device;
pub mod wait;
#[cfg(test)]
pub(crate) mod testutils;

use std::fmt::{Display, Formatter};

use clap::ValueEnum;
use thiserror::Error as ThisError;
use vm_memory::{GuestAddress, GuestMemoryError};

pub use crate::{
    allocator::CmdBufHandle,
    device::SvgaDevice,
    engine::{SubmissionEngine, SubmitState, SubmitStatus},
    protocol::{CbStatus, DeliveryFlags},
    wait::WaitPolicy,
};
use crate::protocol::{PAGE_SIZE, SVGA_CB_MAX_SIZE, SVGA_FIFO_NUM_REGS};

pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the submission engine.
///
/// Faults reported by the device are not errors: they show up as the status
/// of the failed command buffer and restart the context.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Out of command-buffer memory allocating {0} bytes")]
    OutOfMemory(usize),
    #[error("Payload of {size} bytes exceeds the limit of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("Payload size {0} is not a multiple of 4")]
    UnalignedPayload(usize),
    #[error("Invalid or stale command-buffer handle")]
    InvalidHandle,
    #[error("Guest memory access failed: {0}")]
    GuestMemory(#[from] GuestMemoryError),
    #[error("Device did not answer ({what}) after {polls} polls")]
    DeviceUnresponsive { what: &'static str, polls: u64 },
}

/// How command streams reach the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    /// Command buffers on context 0, falling back to the FIFO if the device
    /// refuses them.
    #[default]
    #[value(name = "cmdbuf", alias("cb"))]
    CmdBuf,
    /// The legacy FIFO only.
    Fifo,
}

impl Display for Transport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CmdBuf => write!(f, "cmdbuf"),
            Self::Fifo => write!(f, "fifo"),
        }
    }
}

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Maximum payload {0} must be a non-zero multiple of 4")]
    UnalignedMaxPayload(usize),
    #[error("Maximum payload {0} exceeds the device limit")]
    MaxPayloadTooLarge(usize),
    #[error("Command-buffer pool base {0:#x} is not page aligned")]
    UnalignedPool(u64),
    #[error("Command-buffer pool cannot be empty")]
    EmptyPool,
    #[error("FIFO size {0} cannot hold the register block and a command")]
    FifoTooSmall(u32),
    #[error("FIFO base {0:#x} is not 32-bit aligned")]
    UnalignedFifo(u64),
    #[error("FIFO and command-buffer pool overlap")]
    Overlap,
}

/// This structure holds the configuration of a [`SubmissionEngine`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    transport: Transport,
    max_payload: usize,
    wait: WaitPolicy,
    fifo_base: GuestAddress,
    fifo_size: u32,
    pool_base: GuestAddress,
    pool_pages: usize,
}

impl EngineConfig {
    pub const DEFAULT_FIFO_BASE: GuestAddress = GuestAddress(0);
    pub const DEFAULT_FIFO_SIZE: u32 = 256 * 1024;
    pub const DEFAULT_POOL_BASE: GuestAddress = GuestAddress(0x10_0000);
    pub const DEFAULT_POOL_PAGES: usize = 512;

    pub const fn transport(&self) -> Transport {
        self.transport
    }

    /// Whether the device is expected to support command buffers.
    pub fn cmd_buffers(&self) -> bool {
        self.transport == Transport::CmdBuf
    }

    pub const fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub const fn wait_policy(&self) -> WaitPolicy {
        self.wait
    }

    pub const fn fifo_base(&self) -> GuestAddress {
        self.fifo_base
    }

    pub const fn fifo_size(&self) -> u32 {
        self.fifo_size
    }

    pub const fn pool_base(&self) -> GuestAddress {
        self.pool_base
    }

    pub const fn pool_pages(&self) -> usize {
        self.pool_pages
    }

    /// Guest memory ranges the engine and the device need mapped.
    pub fn memory_ranges(&self) -> [(GuestAddress, usize); 2] {
        [
            (self.fifo_base, self.fifo_size as usize),
            (self.pool_base, self.pool_pages * PAGE_SIZE),
        ]
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transport: Transport::default(),
            max_payload: SVGA_CB_MAX_SIZE,
            wait: WaitPolicy::UNBOUNDED,
            fifo_base: Self::DEFAULT_FIFO_BASE,
            fifo_size: Self::DEFAULT_FIFO_SIZE,
            pool_base: Self::DEFAULT_POOL_BASE,
            pool_pages: Self::DEFAULT_POOL_PAGES,
        }
    }
}

#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn set_transport(mut self, transport: Transport) -> Self {
        self.config.transport = transport;
        self
    }

    pub fn set_max_payload(mut self, max_payload: usize) -> Self {
        self.config.max_payload = max_payload;
        self
    }

    pub fn set_wait_policy(mut self, wait: WaitPolicy) -> Self {
        self.config.wait = wait;
        self
    }

    pub fn set_fifo(mut self, base: GuestAddress, size: u32) -> Self {
        self.config.fifo_base = base;
        self.config.fifo_size = size;
        self
    }

    pub fn set_pool(mut self, base: GuestAddress, pages: usize) -> Self {
        self.config.pool_base = base;
        self.config.pool_pages = pages;
        self
    }

    pub fn build(self) -> std::result::Result<EngineConfig, ConfigError> {
        let config = self.config;

        if config.max_payload == 0 || config.max_payload % 4 != 0 {
            return Err(ConfigError::UnalignedMaxPayload(config.max_payload));
        }
        if config.max_payload > SVGA_CB_MAX_SIZE {
            return Err(ConfigError::MaxPayloadTooLarge(config.max_payload));
        }
        if config.pool_base.0 % PAGE_SIZE as u64 != 0 {
            return Err(ConfigError::UnalignedPool(config.pool_base.0));
        }
        if config.pool_pages == 0 {
            return Err(ConfigError::EmptyPool);
        }
        if config.fifo_base.0 % 4 != 0 {
            return Err(ConfigError::UnalignedFifo(config.fifo_base.0));
        }
        // Registers, plus two words so that a full ring still differs from an
        // empty one.
        if config.fifo_size % 4 != 0 || config.fifo_size < (SVGA_FIFO_NUM_REGS + 2) * 4 {
            return Err(ConfigError::FifoTooSmall(config.fifo_size));
        }

        let fifo_end = config.fifo_base.0 + u64::from(config.fifo_size);
        let pool_end = config.pool_base.0 + (config.pool_pages * PAGE_SIZE) as u64;
        if config.fifo_base.0 < pool_end && config.pool_base.0 < fifo_end {
            return Err(ConfigError::Overlap);
        }

        Ok(config)
    }
}
