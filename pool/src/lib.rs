/*!
Fixed-capacity block arena for a DTN bundle cache.

One preallocated arena is divided into fixed-size blocks: an admin block
hosting the free queue, recycle queue and active-job list, plus N content
blocks. Blocks are typed (primary bundle, canonical block, CBOR chunk,
duct, ref, module data, ...) through a 32-bit signature registry carrying
construct/destruct callbacks, and are shared across queues by counted
references. Everything is guarded by a single coarse lock with a
condition used by the deadline-blocking duct operations; destructors run
with the lock released.
*/

pub mod block;
pub mod bundle;
pub mod duct;
pub mod error;
pub mod pool;

mod list;
mod reference;

pub use block::{
    BlockData, BlockKind, BlocktypeApi, Handle, InitArg, JobHandler, NullBlocktypeApi, Registration,
};
pub use bundle::{
    CanonicalBlock, CreationTimestamp, DeliveryMetadata, DeliveryPolicy, DtnTime, Eid, PrimaryBlock,
};
pub use duct::{Deadline, DuctDir, DuctEvent, DuctHandler};
pub use error::Error;
pub use pool::{Config, Pool, PoolStats, Sublist, BLOCK_SIZE, MAX_CONTENT_SIZE};

use bytes::Bytes;
use std::sync::Arc;
use trace_err::*;
use tracing::{error, info, trace, warn};
