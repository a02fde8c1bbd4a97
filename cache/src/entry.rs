use super::*;

/// Retention state of one cache entry.
///
/// `Undefined` is terminal: the driver discards the entry and recycles
/// its block. Entries for freshly stored bundles start in `Idle`; open
/// custody signals start in `GenerateDacs`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FsmState {
    #[default]
    Undefined,
    Idle,
    Queue,
    Delete,
    GenerateDacs,
}

pub(crate) const STATE_COUNT: usize = 5;

impl FsmState {
    /// Position of this state in the [`CacheStats`] counter arrays.
    pub fn idx(self) -> usize {
        match self {
            FsmState::Undefined => 0,
            FsmState::Idle => 1,
            FsmState::Queue => 2,
            FsmState::Delete => 3,
            FsmState::GenerateDacs => 4,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            FsmState::Undefined => "undefined",
            FsmState::Idle => "idle",
            FsmState::Queue => "queue",
            FsmState::Delete => "delete",
            FsmState::GenerateDacs => "generate_dacs",
        }
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        /// This node is responsible for the payload.
        const LOCAL_CUSTODY = 1 << 0;
        /// Selected for forwarding but not yet handed to an egress CLA.
        const PENDING_FORWARD = 1 << 1;
        /// A queue ref block for this entry is (or may still be) on a
        /// duct; cleared only by that block's destructor.
        const LOCALLY_QUEUED = 1 << 2;
        /// `action_time` is armed; the entry sleeps until it fires.
        const ACTION_TIME_WAIT = 1 << 3;
        /// Something touched this entry since the last age-out check.
        const ACTIVITY = 1 << 4;
    }
}

/// Content of a cache entry data block.
///
/// `bundle_ref` is a counted reference to the resident primary block,
/// `None` once offloaded and evicted. `storage_id` 0 means not
/// offloaded. `time_key` 0 means not currently in the time index.
#[derive(Clone, Debug, Default)]
pub struct CacheEntryData {
    pub state: FsmState,
    pub flags: EntryFlags,
    pub bundle_ref: Option<Handle>,
    pub storage_id: u64,
    pub action_time: DtnTime,
    pub expire_time: DtnTime,
    pub time_key: u64,

    // Bundle id and index-key copies, valid while `bundle_indexed`.
    pub source: Eid,
    pub creation: CreationTimestamp,
    pub destination: Eid,
    pub key_primary: u64,
    pub key_destination: u64,
    pub bundle_indexed: bool,

    // Custody signal accumulation; `Some` while this entry is the open
    // signal for its custodian.
    pub key_custodian: u64,
    pub dacs: Option<custody::DacsSignal>,
}

/// Content of the cache-state block. The interesting parts are the
/// block's embedded sub-lists (pending and idle), not its payload.
#[derive(Default)]
pub struct CacheStateData;

/// Read-only counters snapshot, indexed by [`FsmState::idx`].
#[derive(Clone, Debug, Default)]
pub struct CacheStats {
    pub enters: [u64; STATE_COUNT],
    pub exits: [u64; STATE_COUNT],
    pub discards: u64,
}
