//! Custody acknowledgment aggregation.
//!
//! Accepted custody sequence numbers are batched per previous custodian
//! into an open compressed signal entry. The entry sits in
//! `GenerateDacs` with a bounded open timer; leaving that state encodes
//! the batch into a signal bundle that forwards through the ordinary
//! Queue path.

use super::*;

/// One open compressed custody signal: the previous custodian plus the
/// accepted custody sequence numbers not yet transmitted.
#[derive(Clone, Debug, Default)]
pub struct DacsSignal {
    pub custodian: Eid,
    pub acks: Vec<u64>,
}

/// Signal payload: custodian, then the accepted sequence numbers
/// compressed into sorted `(first, count)` runs, little-endian.
pub(crate) fn encode_signal(signal: &DacsSignal) -> Vec<u8> {
    let mut out = Vec::new();
    encode_eid(&mut out, &signal.custodian);
    let mut acks = signal.acks.clone();
    acks.sort_unstable();
    acks.dedup();
    let mut runs: Vec<(u64, u64)> = Vec::new();
    for a in acks {
        match runs.last_mut() {
            Some((first, count)) if first.wrapping_add(*count) == a => *count += 1,
            _ => runs.push((a, 1)),
        }
    }
    out.extend_from_slice(&(runs.len() as u32).to_le_bytes());
    for (first, count) in runs {
        out.extend_from_slice(&first.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());
    }
    out
}

pub(crate) fn encode_eid(out: &mut Vec<u8>, eid: &Eid) {
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

impl Shared {
    /// Adds one accepted custody sequence number to the open signal for
    /// `custodian`. A full signal is forced through finalization on the
    /// next pass and a fresh one opened. Caller holds the cache lock.
    pub(crate) fn append_ack_locked(
        &self,
        inner: &mut CacheInner,
        custodian: &Eid,
        custody_seq: u64,
        now: DtnTime,
    ) -> Result<(), Error> {
        let pool = &self.pool;
        let state = inner.state_block.ok_or(Error::Detached)?;

        if let Some(&open) = inner.custodians.get(custodian) {
            let appended = pool.with_data_mut::<CacheEntryData, _>(open, |e| match &mut e.dacs {
                Some(d) if d.acks.len() < self.config.max_acks_per_dacs => {
                    d.acks.push(custody_seq);
                    true
                }
                _ => false,
            })?;
            if appended {
                return Ok(());
            }
            inner.custodians.remove(custodian);
            pool.with_data_mut::<CacheEntryData, _>(open, |e| {
                e.flags.remove(EntryFlags::ACTION_TIME_WAIT);
                e.action_time = DtnTime::INFINITE;
            })?;
            self.retarget_time(inner, open, 0)?;
            pool.sublist_append(state, PENDING, open)?;
        }

        let entry = pool.alloc_data(sig::CACHE_ENTRY, None, 255)?;
        pool.ref_create(entry)?;
        let key = key_of(custodian);
        let open_until = now.saturating_add(self.config.dacs_open_time);
        pool.with_data_mut::<CacheEntryData, _>(entry, |e| {
            e.state = FsmState::GenerateDacs;
            e.flags = EntryFlags::ACTION_TIME_WAIT;
            e.action_time = open_until;
            e.expire_time = DtnTime::INFINITE;
            e.key_custodian = key;
            e.dacs = Some(DacsSignal {
                custodian: custodian.clone(),
                acks: vec![custody_seq],
            });
        })?;
        inner.stats.enters[FsmState::GenerateDacs.idx()] += 1;
        inner.index.custodian.insert((key, entry.index()), entry);
        inner.custodians.insert(custodian.clone(), entry);
        self.retarget_time(inner, entry, open_until.millisecs())?;
        pool.sublist_append(state, IDLE, entry)?;
        trace!(custodian = %custodian, "Opened custody signal");
        Ok(())
    }

    /// GenerateDacs exit: encode the accumulated batch into a signal
    /// bundle and mark the entry for the ordinary forwarding path.
    pub(crate) fn finalize_dacs(
        &self,
        inner: &mut CacheInner,
        entry: Handle,
        now: DtnTime,
    ) -> Result<(), Error> {
        let pool = &self.pool;
        let Some(signal) = pool.with_data_mut::<CacheEntryData, _>(entry, |e| e.dacs.take())?
        else {
            return Ok(());
        };
        let key = pool.with_data::<CacheEntryData, _>(entry, |e| e.key_custodian)?;
        inner.index.custodian.remove(&(key, entry.index()));
        if inner.custodians.get(&signal.custodian) == Some(&entry) {
            inner.custodians.remove(&signal.custodian);
        }

        inner.dacs_seq += 1;
        let sequence = inner.dacs_seq;
        let payload = encode_signal(&signal);
        let primary = pool.alloc_primary(sig::PRIMARY, None, 255)?;
        let built = (|| {
            pool.with_primary_mut(primary, |p| {
                p.destination = signal.custodian.clone();
                p.source = self.config.local_eid.clone();
                p.creation = CreationTimestamp {
                    time: now,
                    sequence,
                };
                p.lifetime = self.config.dacs_lifetime;
            })?;
            let cblock = pool.alloc_canonical(sig::CANONICAL, None, 255)?;
            pool.with_canonical_mut(cblock, |c| {
                c.block_type = 1;
                c.block_num = 1;
                c.content_length = payload.len();
            })?;
            let chunk = pool.alloc_chunk(sig::CHUNK, Bytes::from(payload), 255)?;
            pool.bundle_append_chunk(cblock, chunk)?;
            pool.bundle_append_cblock(primary, cblock)?;
            Ok::<_, Error>(())
        })();
        if let Err(e) = built {
            // Out of blocks: the acknowledgments are lost and the bare
            // entry drains out through Delete.
            warn!(custodian = %signal.custodian, error = %e, "Failed to build custody signal bundle");
            let _ = pool.recycle_block(primary);
            return Ok(());
        }

        let bref = pool.ref_create(primary)?;
        let source = self.config.local_eid.clone();
        let creation = CreationTimestamp {
            time: now,
            sequence,
        };
        let key_primary = key_of(&(source.clone(), creation));
        let key_destination = key_of(&signal.custodian);
        pool.with_data_mut::<CacheEntryData, _>(entry, |e| {
            e.bundle_ref = Some(bref);
            e.flags.insert(EntryFlags::LOCAL_CUSTODY);
            e.expire_time = now.saturating_add(self.config.dacs_lifetime);
            e.source = source.clone();
            e.creation = creation;
            e.destination = signal.custodian.clone();
            e.key_primary = key_primary;
            e.key_destination = key_destination;
            e.bundle_indexed = true;
        })?;
        inner
            .index
            .primary_id
            .insert((key_primary, entry.index()), entry);
        inner
            .index
            .destination
            .insert((key_destination, entry.index()), entry);
        metrics::counter!("cache_dacs_finalized").increment(1);
        trace!(custodian = %signal.custodian, acks = signal.acks.len(), "Finalized custody signal");
        Ok(())
    }
}
