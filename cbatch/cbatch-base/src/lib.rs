pub mod bias;
pub mod config;
mod context;
pub mod decoder;
pub mod engine;
pub mod pool;
mod processor;
pub mod refresher;
pub mod request;
pub mod sampler;
pub mod sim;
pub mod stats;
pub mod temperature;

pub use config::{RefreshPolicy, SamplingParams, SchedulerArgs, SchedulerConfig};
pub use context::{ContextOptions, ModelContext};
pub use engine::{Batch, BatchEntry, DecodeEngine, Tokenizer};
pub use processor::*;
pub use request::{InferenceRequest, OutputChunk, RequestHandle, StopReason};
pub use sampler::{Sampler, SamplerFactory, SamplerKind};

use anyhow::Result;
use flexi_logger::{DeferredNow, Logger, WriteMode};
use log::Record;

pub type Token = u32;
pub type SlotId = usize;

pub type HashMap<K, V> = fxhash::FxHashMap<K, V>;
pub type HashSet<K> = fxhash::FxHashSet<K>;

pub enum LogMode {
    Normal,
    Test,
    Daemon,
}

fn daemon_format(
    w: &mut dyn std::io::Write,
    now: &mut DeferredNow,
    record: &Record,
) -> Result<(), std::io::Error> {
    write!(
        w,
        "[{}] {} {}",
        now.format("%Y-%m-%d %H:%M:%S%.3f"),
        record.level(),
        &record.args()
    )
}

pub fn init_log(mode: LogMode) -> Result<()> {
    let logger = match mode {
        LogMode::Normal => Logger::try_with_env_or_str("warn")?.log_to_stdout(),
        LogMode::Test => {
            Logger::try_with_env_or_str("debug")?.write_mode(WriteMode::SupportCapture)
        }
        LogMode::Daemon => Logger::try_with_env_or_str("info")?
            .format(daemon_format)
            .log_to_stdout(),
    };
    logger.start()?;
    Ok(())
}

/// Error caused by the caller (bad parameters, a request that can never fit).
/// Anything else bubbling out of the scheduler is an internal failure.
#[derive(Debug)]
pub struct UserError {
    pub msg: String,
}

impl UserError {
    pub fn anyhow(msg: String) -> anyhow::Error {
        anyhow::anyhow!(Self { msg })
    }

    pub fn is_self(e: &anyhow::Error) -> bool {
        e.downcast_ref::<Self>().is_some()
    }
}

impl std::fmt::Display for UserError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for UserError {}

#[macro_export]
macro_rules! bail_user {
    ($($arg:tt)*) => {
        return Err($crate::UserError::anyhow(format!($($arg)*)))
    };
}

pub fn limit_tokens(tokens: &[Token], max_len: usize) -> String {
    if tokens.len() > max_len {
        format!("{:?}...", &tokens[..max_len])
    } else {
        format!("{:?}", tokens)
    }
}
