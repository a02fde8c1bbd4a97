use super::*;

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    /// Source EID stamped onto locally generated custody signals.
    pub local_eid: Eid,

    /// Interface id carried by the cache duct's events.
    pub intf_id: u32,

    /// Depth limit applied to both duct subqueues.
    pub duct_depth: u32,

    /// Accepted custody sequence numbers accumulated per signal before
    /// it is finalized early.
    pub max_acks_per_dacs: usize,

    /// How long an open custody signal accumulates before transmission,
    /// in milliseconds.
    pub dacs_open_time: u64,

    /// Lifetime stamped onto generated custody signal bundles, in
    /// milliseconds.
    pub dacs_lifetime: u64,

    /// Quiet period a deleted entry lingers before its block is
    /// reclaimed, in milliseconds.
    pub age_out_time: u64,

    /// Revisit interval for entries with no armed timer, in milliseconds.
    pub fast_retry: u64,

    /// Revisit interval for entries parked on a timer or a queue, in
    /// milliseconds.
    pub idle_retry: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_eid: Eid::Null,
            intf_id: 0,
            duct_depth: 64,
            max_acks_per_dacs: 16,
            dacs_open_time: 10_000,
            dacs_lifetime: 3_600_000,
            age_out_time: 5_000,
            fast_retry: 3_000,
            idle_retry: 3_600_000,
        }
    }
}
