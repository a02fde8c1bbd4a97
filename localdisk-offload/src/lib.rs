/*!
File-backed offload for the cairn bundle cache.

Persists a bundle's block graph as one verifiable record file per
storage id, under a sharded directory tree. Records carry a fixed
header with a CRC32-Castagnoli over the body; a record that fails
verification on restore is removed and reported corrupt, never retried.
*/

pub mod config;

mod record;
mod storage;

pub use config::Config;
pub use storage::LocalDiskOffload;

use cairn_cache::offload::Error;
use cairn_pool::{Handle, Pool};
use std::path::PathBuf;
use trace_err::*;
use tracing::{error, info, trace};
