/*!
Bundle retention cache engine over a [`cairn_pool`] arena.

One cache entry per stored bundle, indexed four ways (bundle id,
destination, custodian, next-action time) and driven by a five-state
retention machine: expiry, forwarding through a bounded duct,
custody-tracked retransmission, custody acknowledgment (DACS)
aggregation, and aged-out deletion. An injected offload backend persists
custody bundles so their resident blocks can be evicted between
retransmissions.
*/

pub mod config;
pub mod entry;
pub mod error;
pub mod offload;
pub mod sig;

mod cache;
mod custody;
mod fsm;
mod index;

pub use cache::Cache;
pub use config::Config;
pub use custody::DacsSignal;
pub use entry::{CacheEntryData, CacheStats, EntryFlags, FsmState};
pub use error::Error;

use bytes::Bytes;
use cache::{CacheInner, Shared};
use cairn_pool::{
    BlockKind, CreationTimestamp, Deadline, DeliveryPolicy, DtnTime, DuctDir, Eid, Handle, Pool,
    Sublist,
};
use index::{key_of, Indices};
use std::sync::{Arc, Weak};
use trace_err::*;
use tracing::{debug, error, info, trace, warn};

// The pending and idle lists live in the cache-state block's embedded
// sub-lists.
pub(crate) const PENDING: Sublist = Sublist::A;
pub(crate) const IDLE: Sublist = Sublist::B;
