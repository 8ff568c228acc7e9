// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use vm_memory::{GuestAddress, GuestMemoryMmap};

use crate::{
    soft_device::{Completion, SoftSvga},
    CmdBufHandle, EngineConfig, EngineConfigBuilder, SubmissionEngine, SvgaDevice, Transport,
    WaitPolicy,
};

pub(crate) const FIFO_BASE: GuestAddress = GuestAddress(0x1_0000);
pub(crate) const FIFO_SIZE: u32 = 0x4000;
pub(crate) const POOL_BASE: GuestAddress = GuestAddress(0x10_0000);
pub(crate) const POOL_PAGES: usize = 64;

pub(crate) fn guest_memory(ranges: &[(GuestAddress, usize)]) -> GuestMemoryMmap {
    GuestMemoryMmap::<()>::from_ranges(ranges).unwrap()
}

pub(crate) fn test_config(transport: Transport, wait: WaitPolicy) -> EngineConfig {
    EngineConfigBuilder::default()
        .set_transport(transport)
        .set_wait_policy(wait)
        .set_max_payload(16 * 1024)
        .set_fifo(FIFO_BASE, FIFO_SIZE)
        .set_pool(POOL_BASE, POOL_PAGES)
        .build()
        .unwrap()
}

pub(crate) fn engine_memory(config: &EngineConfig) -> GuestMemoryMmap {
    guest_memory(&config.memory_ranges())
}

/// Engine on top of a software device, sharing its state with the returned
/// device handle.
pub(crate) fn soft_engine_config(
    config: EngineConfig,
    setup: impl FnOnce(SoftSvga) -> SoftSvga,
) -> (SubmissionEngine<SoftSvga>, SoftSvga) {
    let mem = engine_memory(&config);
    let device = setup(SoftSvga::new(mem.clone(), config.fifo_base()));
    let engine = SubmissionEngine::new(device.clone(), mem, &config).unwrap();
    (engine, device)
}

pub(crate) fn soft_engine_with(
    setup: impl FnOnce(SoftSvga) -> SoftSvga,
) -> (SubmissionEngine<SoftSvga>, SoftSvga) {
    soft_engine_config(test_config(Transport::CmdBuf, WaitPolicy::UNBOUNDED), setup)
}

pub(crate) fn soft_engine(completion: Completion) -> (SubmissionEngine<SoftSvga>, SoftSvga) {
    soft_engine_with(|device| device.with_completion(completion))
}

/// Allocates a command buffer holding `words`.
pub(crate) fn payload<D: SvgaDevice>(engine: &SubmissionEngine<D>, words: &[u32]) -> CmdBufHandle {
    let handle = engine.alloc(words.len() * 4).unwrap();
    engine.write_payload(handle, words).unwrap();
    handle
}
