// SVGA command-buffer submission engine, driven against a software device
//
// Copyright 2024 Red Hat Inc
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    fmt::{self, Display},
    fs,
    path::PathBuf,
    process::exit,
};

use clap::{Parser, ValueEnum};
use log::{error, info};
use svga_cmdbuf::{
    soft_device::{Completion, Event, SoftSvga},
    ConfigError, DeliveryFlags, EngineConfig, EngineConfigBuilder, SubmissionEngine,
    SubmitState, Transport, WaitPolicy,
};
use thiserror::Error as ThisError;
use vm_memory::GuestMemoryMmap;

#[derive(ValueEnum, Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamKind {
    /// Presentation to the screen
    Present,
    /// Rendering into a surface
    Render,
    /// Screen update
    Update,
}

impl From<StreamKind> for DeliveryFlags {
    fn from(kind: StreamKind) -> Self {
        match kind {
            StreamKind::Present => Self::PRESENT,
            StreamKind::Render => Self::RENDER,
            StreamKind::Update => Self::UPDATE,
        }
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct CmdbufArgs {
    /// How command streams reach the device
    #[clap(short, long, value_enum, default_value_t = Transport::CmdBuf)]
    pub transport: Transport,

    /// Number of submissions
    #[clap(short = 'n', long, default_value_t = 16)]
    pub submissions: usize,

    /// Words of generated payload per submission
    #[clap(short, long, default_value_t = 64)]
    pub words: usize,

    /// File of little-endian 32-bit words used as payload instead of the
    /// generated one
    #[clap(short, long, value_name = "FILE")]
    pub payload: Option<PathBuf>,

    /// Comma separated list of ordering categories the streams belong to
    #[clap(short, long, value_delimiter = ',')]
    pub kind: Vec<StreamKind>,

    /// Wait for every submission to complete
    #[clap(long)]
    pub sync: bool,

    /// Terminate every submission with a fence
    #[clap(long)]
    pub force_fence: bool,

    /// Give up waiting on the device after this many polls
    #[clap(long)]
    pub max_polls: Option<u64>,

    /// Device syncs before a command buffer completes, 0 completes on
    /// dispatch
    #[clap(long, default_value_t = 0)]
    pub completion_delay: u32,

    /// Ids of command buffers the device fails
    #[clap(long, value_delimiter = ',')]
    pub fail: Vec<u64>,
}

impl CmdbufArgs {
    pub fn delivery_flags(&self) -> DeliveryFlags {
        let mut flags = self
            .kind
            .iter()
            .copied()
            .map(DeliveryFlags::from)
            .fold(DeliveryFlags::empty(), DeliveryFlags::union);
        if self.sync {
            flags |= DeliveryFlags::SYNC;
        }
        if self.force_fence {
            flags |= DeliveryFlags::FORCE_FENCE;
        }
        flags
    }

    pub fn completion(&self) -> Completion {
        match self.completion_delay {
            0 => Completion::Immediate,
            syncs => Completion::AfterSyncs(syncs),
        }
    }
}

pub fn config_from_args(args: &CmdbufArgs) -> Result<EngineConfig, ConfigError> {
    let mut builder = EngineConfigBuilder::default().set_transport(args.transport);
    if let Some(max_polls) = args.max_polls {
        builder = builder.set_wait_policy(WaitPolicy::bounded(max_polls));
    }
    builder.build()
}

#[derive(Debug, ThisError)]
pub enum RunError {
    #[error("Could not read payload: {0}")]
    ReadPayload(std::io::Error),
    #[error("Payload file size {0} is not a multiple of 4")]
    UnalignedPayloadFile(usize),
    #[error("Could not map guest memory: {0}")]
    Memory(String),
    #[error("Submission failed: {0}")]
    Engine(#[from] svga_cmdbuf::Error),
}

pub fn load_payload(args: &CmdbufArgs) -> Result<Vec<u32>, RunError> {
    let Some(path) = &args.payload else {
        // Stay clear of the fence opcode, the software device would pass
        // fences that were never issued.
        return Ok((0..args.words as u32)
            .map(|i| 0xc0de_0000 | (i & 0xffff))
            .collect());
    };

    let bytes = fs::read(path).map_err(RunError::ReadPayload)?;
    if bytes.len() % 4 != 0 {
        return Err(RunError::UnalignedPayloadFile(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub submitted: usize,
    pub completed: usize,
    pub pending: usize,
    pub fence_pending: usize,
    pub faults: usize,
    pub fifo_words: usize,
    pub last_fence: u32,
    pub cmd_buffers: bool,
}

impl Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} submissions via {}: {} completed, {} pending, {} fenced, {} faults, \
             {} FIFO words, last fence {}",
            self.submitted,
            if self.cmd_buffers {
                "command buffers"
            } else {
                "FIFO"
            },
            self.completed,
            self.pending,
            self.fence_pending,
            self.faults,
            self.fifo_words,
            self.last_fence
        )
    }
}

/// Command buffers cycled through by the submissions.
const BUFFERS: usize = 4;

pub fn run(args: &CmdbufArgs, config: &EngineConfig) -> Result<Summary, RunError> {
    let words = load_payload(args)?;
    let size = words.len() * 4;

    let mem = GuestMemoryMmap::<()>::from_ranges(&config.memory_ranges())
        .map_err(|e| RunError::Memory(e.to_string()))?;
    let device = SoftSvga::new(mem.clone(), config.fifo_base())
        .with_cmd_buffers(config.cmd_buffers())
        .with_completion(args.completion());
    for &id in &args.fail {
        device.inject_fault(id, 0);
    }

    let engine = SubmissionEngine::new(device.clone(), mem, config)?;
    let mut summary = Summary {
        cmd_buffers: engine.is_context_enabled(),
        ..Default::default()
    };
    info!("Engine ready, transport {}", config.transport());

    let handles = (0..BUFFERS.min(args.submissions))
        .map(|_| engine.alloc(size))
        .collect::<Result<Vec<_>, _>>()?;
    let flags = args.delivery_flags();

    for (i, &handle) in handles.iter().cycle().take(args.submissions).enumerate() {
        // The device may still be reading the previous round.
        engine.wait_for(handle)?;
        engine.write_payload(handle, &words)?;
        let status = engine.submit(handle, size, flags, 0)?;
        match status.state {
            SubmitState::Completed => summary.completed += 1,
            SubmitState::Pending(_) => summary.pending += 1,
            SubmitState::FencePending => summary.fence_pending += 1,
        }
        if status.fence_used != 0 {
            summary.last_fence = status.fence_used;
        }
        info!("Submission {i}: {:?}", status.state);
        summary.submitted += 1;
    }

    engine.flush_all()?;
    for handle in handles {
        engine.free(handle)?;
    }

    summary.faults = device
        .events()
        .iter()
        .filter(|event| matches!(event, Event::Completed { status, .. } if status.is_fault()))
        .count();
    summary.fifo_words = device.fifo_words().len();
    Ok(summary)
}

pub fn main() {
    env_logger::init();

    let args = CmdbufArgs::parse();

    let config = match config_from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    };

    match run(&args, &config) {
        Ok(summary) => println!("{summary}"),
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    }
}
