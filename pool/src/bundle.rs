use super::*;

const DTN_EPOCH: time::OffsetDateTime = time::macros::datetime!(2000-01-01 00:00:00 UTC);

/// Milliseconds since the DTN epoch (2000-01-01T00:00:00Z).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DtnTime {
    millisecs: u64,
}

impl DtnTime {
    /// Sorts after every reachable wall-clock value; used to park a timer
    /// that must not refire until it is explicitly re-armed.
    pub const INFINITE: DtnTime = DtnTime {
        millisecs: u64::MAX,
    };

    pub fn now() -> Self {
        Self {
            millisecs: ((time::OffsetDateTime::now_utc() - DTN_EPOCH).whole_milliseconds()) as u64,
        }
    }

    pub fn new(millisecs: u64) -> Self {
        Self { millisecs }
    }

    pub fn millisecs(&self) -> u64 {
        self.millisecs
    }

    pub fn saturating_add(self, millisecs: u64) -> Self {
        Self {
            millisecs: self.millisecs.saturating_add(millisecs),
        }
    }
}

impl core::fmt::Display for DtnTime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if *self == Self::INFINITE {
            write!(f, "dtn:inf")
        } else {
            write!(f, "dtn:{}ms", self.millisecs)
        }
    }
}

/// A minimal ordered Endpoint Identifier.
///
/// Pattern matching and URI parsing are the embedding agent's concern;
/// the cache only compares, hashes and stores these.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Eid {
    #[default]
    Null,
    Ipn {
        node: u64,
        service: u64,
    },
    Dtn(Arc<str>),
}

impl core::fmt::Display for Eid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Eid::Null => write!(f, "dtn:none"),
            Eid::Ipn { node, service } => write!(f, "ipn:{node}.{service}"),
            Eid::Dtn(s) => write!(f, "dtn://{s}"),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CreationTimestamp {
    pub time: DtnTime,
    pub sequence: u64,
}

/// Who is responsible for the payload once it leaves this node.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// The egress CLA becomes the implicit custodian on transmit.
    #[default]
    Normal,
    /// Retain local custody until acknowledged; drives retransmission.
    CustodyTracking,
}

/// Delivery bookkeeping carried alongside the logical primary fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryMetadata {
    pub ingress_intf_id: u32,
    pub ingress_time: DtnTime,
    /// 0 until an egress CLA has accepted the bundle.
    pub egress_intf_id: u32,
    pub egress_time: DtnTime,
    pub policy: DeliveryPolicy,
    /// Retransmit interval in milliseconds when custody tracking.
    pub local_retx_interval: u64,
    /// Offload storage id once committed to a backing store; 0 = none.
    pub committed_storage_id: u64,
}

/// Logical primary-block fields plus delivery metadata.
///
/// The encoded CBOR representation lives in the chunk chain owned by the
/// block (sub-list A); the canonical blocks hang off sub-list B.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrimaryBlock {
    pub version: u8,
    pub flags: u64,
    pub destination: Eid,
    pub source: Eid,
    pub report_to: Eid,
    pub previous_custodian: Eid,
    pub creation: CreationTimestamp,
    /// Lifetime in milliseconds from the creation timestamp.
    pub lifetime: u64,
    /// Custody sequence number assigned by the previous custodian.
    pub custody_seq: u64,
    pub delivery: DeliveryMetadata,
}

impl Default for PrimaryBlock {
    fn default() -> Self {
        Self {
            version: 7,
            flags: 0,
            destination: Eid::Null,
            source: Eid::Null,
            report_to: Eid::Null,
            previous_custodian: Eid::Null,
            creation: CreationTimestamp::default(),
            lifetime: 0,
            custody_seq: 0,
            delivery: DeliveryMetadata::default(),
        }
    }
}

impl PrimaryBlock {
    pub fn expiry(&self) -> DtnTime {
        self.creation.time.saturating_add(self.lifetime)
    }
}

/// Logical extension/payload block header. `content_offset`/
/// `content_length` locate the payload within the encoded stream held in
/// the block's chunk chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CanonicalBlock {
    pub block_type: u64,
    pub block_num: u64,
    pub flags: u64,
    pub content_offset: usize,
    pub content_length: usize,
}
