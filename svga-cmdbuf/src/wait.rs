// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use log::trace;

use crate::{device::SvgaDevice, Error, Result};

/// How long the engine keeps polling the device before giving up.
///
/// The device offers no completion interrupt to this engine: every wait is a
/// loop reading a status word from guest memory and calling
/// [`SvgaDevice::sync`] in between. With `max_polls == None` such a loop
/// only ends when the device answers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WaitPolicy {
    max_polls: Option<u64>,
}

impl WaitPolicy {
    pub const UNBOUNDED: Self = Self { max_polls: None };

    pub const fn bounded(max_polls: u64) -> Self {
        Self {
            max_polls: Some(max_polls),
        }
    }

    pub const fn max_polls(&self) -> Option<u64> {
        self.max_polls
    }
}

/// Polls `done` until it reports true, nudging the device between attempts.
pub(crate) fn spin_until<D, F>(
    device: &D,
    policy: WaitPolicy,
    what: &'static str,
    mut done: F,
) -> Result<()>
where
    D: SvgaDevice + ?Sized,
    F: FnMut() -> Result<bool>,
{
    let mut polls: u64 = 0;
    while !done()? {
        if policy.max_polls.is_some_and(|max| polls >= max) {
            return Err(Error::DeviceUnresponsive { what, polls });
        }
        polls += 1;
        device.sync();
        std::hint::spin_loop();
    }
    if polls > 0 {
        trace!("{what}: done after {polls} polls");
    }
    Ok(())
}
