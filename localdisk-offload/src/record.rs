//! The on-disk record codec.
//!
//! Layout: a fixed 16-byte little-endian header `{magic, block_count,
//! byte_count, crc32}` followed by the body. The CRC (Castagnoli) covers
//! the body only; `block_count` is the number of logical blocks
//! (primary plus canonicals) and must match what the body parses to.
//! All integers are little-endian.

use cairn_pool::{CanonicalBlock, CreationTimestamp, DeliveryPolicy, DtnTime, Eid, PrimaryBlock};

pub(crate) const MAGIC: u32 = 0xCA17_B10C;
const HEADER_LEN: usize = 16;

const CASTAGNOLI: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum DecodeError {
    #[error("bad record magic {0:#010x}")]
    BadMagic(u32),

    #[error("record body length {actual} does not match header {expected}")]
    BadLength { expected: usize, actual: usize },

    #[error("record checksum mismatch")]
    BadCrc,

    #[error("record truncated at offset {0}")]
    Truncated(usize),

    #[error("invalid value for record field {0}")]
    BadValue(&'static str),
}

/// One canonical block: its logical header, the chunk-size hint used
/// when the resident copy was persisted, and the raw CBOR stream.
#[derive(Debug, PartialEq)]
pub(crate) struct CanonicalImage {
    pub block: CanonicalBlock,
    pub chunk_hint: u32,
    pub cbor: Vec<u8>,
}

/// The decoded form of one record: everything needed to rebuild the
/// bundle's block graph in a pool.
#[derive(Debug, PartialEq)]
pub(crate) struct RecordImage {
    pub primary: PrimaryBlock,
    pub primary_hint: u32,
    pub primary_cbor: Vec<u8>,
    pub canonicals: Vec<CanonicalImage>,
}

pub(crate) fn encode(img: &RecordImage) -> Vec<u8> {
    let mut body = Vec::new();
    put_primary(&mut body, &img.primary);
    body.extend_from_slice(&img.primary_hint.to_le_bytes());
    put_bytes(&mut body, &img.primary_cbor);
    for c in &img.canonicals {
        body.extend_from_slice(&c.block.block_type.to_le_bytes());
        body.extend_from_slice(&c.block.block_num.to_le_bytes());
        body.extend_from_slice(&c.block.flags.to_le_bytes());
        body.extend_from_slice(&c.chunk_hint.to_le_bytes());
        body.extend_from_slice(&(c.block.content_offset as u32).to_le_bytes());
        body.extend_from_slice(&(c.block.content_length as u32).to_le_bytes());
        put_bytes(&mut body, &c.cbor);
    }

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&(1 + img.canonicals.len() as u32).to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&CASTAGNOLI.checksum(&body).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

pub(crate) fn decode(data: &[u8]) -> Result<RecordImage, DecodeError> {
    let mut r = Reader::new(data);
    let magic = r.u32()?;
    if magic != MAGIC {
        return Err(DecodeError::BadMagic(magic));
    }
    let block_count = r.u32()?;
    let byte_count = r.u32()? as usize;
    let crc = r.u32()?;
    let body = &data[HEADER_LEN..];
    if body.len() != byte_count {
        return Err(DecodeError::BadLength {
            expected: byte_count,
            actual: body.len(),
        });
    }
    if CASTAGNOLI.checksum(body) != crc {
        return Err(DecodeError::BadCrc);
    }

    let primary = get_primary(&mut r)?;
    let primary_hint = r.u32()?;
    let primary_cbor = r.bytes()?;
    let mut canonicals = Vec::new();
    while !r.at_end() {
        let block_type = r.u64()?;
        let block_num = r.u64()?;
        let flags = r.u64()?;
        let chunk_hint = r.u32()?;
        let content_offset = r.u32()? as usize;
        let content_length = r.u32()? as usize;
        let cbor = r.bytes()?;
        canonicals.push(CanonicalImage {
            block: CanonicalBlock {
                block_type,
                block_num,
                flags,
                content_offset,
                content_length,
            },
            chunk_hint,
            cbor,
        });
    }
    if block_count as usize != 1 + canonicals.len() {
        return Err(DecodeError::BadValue("block_count"));
    }
    Ok(RecordImage {
        primary,
        primary_hint,
        primary_cbor,
        canonicals,
    })
}

fn put_primary(out: &mut Vec<u8>, p: &PrimaryBlock) {
    out.push(p.version);
    out.extend_from_slice(&p.flags.to_le_bytes());
    put_eid(out, &p.destination);
    put_eid(out, &p.source);
    put_eid(out, &p.report_to);
    put_eid(out, &p.previous_custodian);
    out.extend_from_slice(&p.creation.time.millisecs().to_le_bytes());
    out.extend_from_slice(&p.creation.sequence.to_le_bytes());
    out.extend_from_slice(&p.lifetime.to_le_bytes());
    out.extend_from_slice(&p.custody_seq.to_le_bytes());
    out.extend_from_slice(&p.delivery.ingress_intf_id.to_le_bytes());
    out.extend_from_slice(&p.delivery.ingress_time.millisecs().to_le_bytes());
    out.extend_from_slice(&p.delivery.egress_intf_id.to_le_bytes());
    out.extend_from_slice(&p.delivery.egress_time.millisecs().to_le_bytes());
    out.push(match p.delivery.policy {
        DeliveryPolicy::Normal => 0,
        DeliveryPolicy::CustodyTracking => 1,
    });
    out.extend_from_slice(&p.delivery.local_retx_interval.to_le_bytes());
    out.extend_from_slice(&p.delivery.committed_storage_id.to_le_bytes());
}

fn get_primary(r: &mut Reader) -> Result<PrimaryBlock, DecodeError> {
    let mut p = PrimaryBlock::default();
    p.version = r.u8()?;
    p.flags = r.u64()?;
    p.destination = get_eid(r)?;
    p.source = get_eid(r)?;
    p.report_to = get_eid(r)?;
    p.previous_custodian = get_eid(r)?;
    p.creation = CreationTimestamp {
        time: DtnTime::new(r.u64()?),
        sequence: r.u64()?,
    };
    p.lifetime = r.u64()?;
    p.custody_seq = r.u64()?;
    p.delivery.ingress_intf_id = r.u32()?;
    p.delivery.ingress_time = DtnTime::new(r.u64()?);
    p.delivery.egress_intf_id = r.u32()?;
    p.delivery.egress_time = DtnTime::new(r.u64()?);
    p.delivery.policy = match r.u8()? {
        0 => DeliveryPolicy::Normal,
        1 => DeliveryPolicy::CustodyTracking,
        _ => return Err(DecodeError::BadValue("delivery_policy")),
    };
    p.delivery.local_retx_interval = r.u64()?;
    p.delivery.committed_storage_id = r.u64()?;
    Ok(p)
}

fn put_eid(out: &mut Vec<u8>, eid: &Eid) {
    match eid {
        Eid::Null => out.push(0),
        Eid::Ipn { node, service } => {
            out.push(1);
            out.extend_from_slice(&node.to_le_bytes());
            out.extend_from_slice(&service.to_le_bytes());
        }
        Eid::Dtn(s) => {
            out.push(2);
            out.extend_from_slice(&(s.len() as u16).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
    }
}

fn get_eid(r: &mut Reader) -> Result<Eid, DecodeError> {
    match r.u8()? {
        0 => Ok(Eid::Null),
        1 => Ok(Eid::Ipn {
            node: r.u64()?,
            service: r.u64()?,
        }),
        2 => {
            let len = r.u16()? as usize;
            let raw = r.take(len)?;
            let s = core::str::from_utf8(raw).map_err(|_| DecodeError::BadValue("dtn_eid"))?;
            Ok(Eid::Dtn(s.into()))
        }
        _ => Err(DecodeError::BadValue("eid_tag")),
    }
}

fn put_bytes(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
}

/// Bounds-checked cursor over a record buffer; never panics on
/// truncated input.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(DecodeError::Truncated(self.pos))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}
