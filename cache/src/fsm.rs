//! The per-entry retention state machine and its driver.

use super::*;

impl Shared {
    /// Drives one entry through one evaluation. Terminal entries are
    /// discarded; everything else is rescheduled in the time index and
    /// moved to the tail of the idle list, so nothing is ever silently
    /// forgotten.
    pub(crate) fn drive(
        &self,
        inner: &mut CacheInner,
        state_block: Handle,
        entry: Handle,
        now: DtnTime,
    ) -> Result<(), Error> {
        let pool = &self.pool;

        // A fired timer latches to "infinite" until explicitly re-armed,
        // so a retransmission is not duplicated while the outcome of the
        // previous attempt is still pending.
        pool.with_data_mut::<CacheEntryData, _>(entry, |e| {
            if e.flags.contains(EntryFlags::ACTION_TIME_WAIT) && now >= e.action_time {
                e.flags.remove(EntryFlags::ACTION_TIME_WAIT);
                e.action_time = DtnTime::INFINITE;
            }
        })?;

        let current = pool.with_data::<CacheEntryData, _>(entry, |e| e.state)?;
        let next = self.evaluate(inner, entry, current, now)?;
        if next != current {
            trace!(entry = %entry, from = current.name(), to = next.name(), "Cache entry transition");
            self.on_exit(inner, entry, current, now)?;
            self.on_enter(inner, entry, next, now)?;
            inner.stats.exits[current.idx()] += 1;
            inner.stats.enters[next.idx()] += 1;
            metrics::counter!("cache_fsm_enter", "state" => next.name()).increment(1);
            pool.with_data_mut::<CacheEntryData, _>(entry, |e| e.state = next)?;
        }

        if next == FsmState::Undefined {
            inner.stats.discards += 1;
            metrics::counter!("cache_discards").increment(1);
            pool.extract_node(entry)?;
            pool.ref_release(entry)?;
        } else {
            if next == FsmState::Idle {
                self.maybe_offload(inner, entry)?;
            }
            self.reschedule(inner, entry, now)?;
            pool.sublist_append(state_block, IDLE, entry)?;
        }
        Ok(())
    }

    fn evaluate(
        &self,
        inner: &mut CacheInner,
        entry: Handle,
        current: FsmState,
        now: DtnTime,
    ) -> Result<FsmState, Error> {
        let pool = &self.pool;
        Ok(match current {
            FsmState::Undefined => FsmState::Undefined,
            FsmState::Idle => {
                let (flags, expire_time, bundle_ref, storage_id) = pool
                    .with_data::<CacheEntryData, _>(entry, |e| {
                        (e.flags, e.expire_time, e.bundle_ref, e.storage_id)
                    })?;
                if now >= expire_time {
                    FsmState::Undefined
                } else if !flags.contains(EntryFlags::LOCAL_CUSTODY) {
                    FsmState::Delete
                } else if !flags
                    .intersects(EntryFlags::ACTION_TIME_WAIT | EntryFlags::LOCALLY_QUEUED)
                {
                    if bundle_ref.is_none() && storage_id != 0 {
                        self.try_restore(inner, entry, storage_id)?;
                    }
                    if pool.with_data::<CacheEntryData, _>(entry, |e| e.bundle_ref.is_some())? {
                        FsmState::Queue
                    } else {
                        FsmState::Idle
                    }
                } else {
                    FsmState::Idle
                }
            }
            FsmState::Queue => {
                if pool.with_data::<CacheEntryData, _>(entry, |e| {
                    e.flags.contains(EntryFlags::LOCALLY_QUEUED)
                })? {
                    FsmState::Queue
                } else {
                    FsmState::Idle
                }
            }
            FsmState::Delete => {
                let flags = pool.with_data::<CacheEntryData, _>(entry, |e| e.flags)?;
                if flags.contains(EntryFlags::ACTION_TIME_WAIT) {
                    FsmState::Delete
                } else if !flags.contains(EntryFlags::ACTIVITY) {
                    FsmState::Undefined
                } else {
                    // Touched since the last check: clear and re-arm the
                    // age-out timer.
                    pool.with_data_mut::<CacheEntryData, _>(entry, |e| {
                        e.flags.remove(EntryFlags::ACTIVITY);
                        e.flags.insert(EntryFlags::ACTION_TIME_WAIT);
                        e.action_time = now.saturating_add(self.config.age_out_time);
                    })?;
                    FsmState::Delete
                }
            }
            FsmState::GenerateDacs => {
                if pool.with_data::<CacheEntryData, _>(entry, |e| {
                    e.flags.contains(EntryFlags::ACTION_TIME_WAIT)
                })? {
                    FsmState::GenerateDacs
                } else {
                    FsmState::Idle
                }
            }
        })
    }

    fn on_exit(
        &self,
        inner: &mut CacheInner,
        entry: Handle,
        state: FsmState,
        now: DtnTime,
    ) -> Result<(), Error> {
        match state {
            FsmState::Queue => self.exit_queue(entry),
            FsmState::GenerateDacs => self.finalize_dacs(inner, entry, now),
            _ => Ok(()),
        }
    }

    fn on_enter(
        &self,
        inner: &mut CacheInner,
        entry: Handle,
        state: FsmState,
        now: DtnTime,
    ) -> Result<(), Error> {
        match state {
            FsmState::Queue => self.enter_queue(inner, entry),
            FsmState::Delete => self.enter_delete(inner, entry, now),
            _ => Ok(()),
        }
    }

    fn enter_queue(&self, inner: &mut CacheInner, entry: Handle) -> Result<(), Error> {
        let pool = &self.pool;
        let Some(duct) = inner.duct else {
            return Ok(());
        };
        let Some(primary) = pool.with_data_mut::<CacheEntryData, _>(entry, |e| {
            e.flags.insert(EntryFlags::PENDING_FORWARD);
            e.bundle_ref
        })?
        else {
            return Ok(());
        };
        let refblock = match pool.ref_make_block(primary, sig::QUEUE_REF, None, 255) {
            Ok(rb) => rb,
            Err(e) => {
                warn!(entry = %entry, error = %e, "No ref block for forwarding; retrying later");
                return Ok(());
            }
        };
        // Set before the push: if the push fails the flag stays set until
        // the recycled ref block's destructor clears it, keeping the
        // state machine synchronized with actual queue membership.
        pool.with_data_mut::<CacheEntryData, _>(entry, |e| {
            e.flags.insert(EntryFlags::LOCALLY_QUEUED)
        })?;
        if let Err(e) = pool.duct_push(duct, DuctDir::Ingress, refblock, Deadline::poll()) {
            debug!(entry = %entry, error = %e, "Duct full; forwarding deferred");
            pool.recycle_block(refblock)?;
        }
        Ok(())
    }

    fn exit_queue(&self, entry: Handle) -> Result<(), Error> {
        let pool = &self.pool;
        let (bundle_ref, storage_id) = pool
            .with_data::<CacheEntryData, _>(entry, |e| (e.bundle_ref, e.storage_id))?;
        let Some(primary) = bundle_ref else {
            return Ok(());
        };
        let (egress_intf, egress_time, policy, retx) = pool.with_primary(primary, |p| {
            (
                p.delivery.egress_intf_id,
                p.delivery.egress_time,
                p.delivery.policy,
                p.delivery.local_retx_interval,
            )
        })?;
        pool.with_data_mut::<CacheEntryData, _>(entry, |e| {
            if egress_intf != 0 {
                e.flags.remove(EntryFlags::PENDING_FORWARD);
                if policy == DeliveryPolicy::CustodyTracking {
                    e.action_time = egress_time.saturating_add(retx);
                    e.flags.insert(EntryFlags::ACTION_TIME_WAIT);
                } else {
                    // The egress CLA is the implicit custodian now.
                    e.flags.remove(EntryFlags::LOCAL_CUSTODY);
                }
            }
        })?;
        if storage_id != 0 {
            // Offloaded: drop the resident copy, Idle restores on demand.
            if let Some(r) =
                pool.with_data_mut::<CacheEntryData, _>(entry, |e| e.bundle_ref.take())?
            {
                pool.ref_release(r)?;
            }
        }
        Ok(())
    }

    fn enter_delete(
        &self,
        inner: &mut CacheInner,
        entry: Handle,
        now: DtnTime,
    ) -> Result<(), Error> {
        let pool = &self.pool;
        let (bundle_ref, storage_id) = pool.with_data_mut::<CacheEntryData, _>(entry, |e| {
            let r = e.bundle_ref.take();
            let sid = e.storage_id;
            e.storage_id = 0;
            e.flags.insert(EntryFlags::ACTION_TIME_WAIT);
            e.action_time = now.saturating_add(self.config.age_out_time);
            (r, sid)
        })?;
        if let Some(r) = bundle_ref {
            pool.ref_release(r)?;
        }
        if storage_id != 0 {
            if let Some(off) = inner.offload.clone() {
                if let Err(e) = off.release(storage_id) {
                    warn!(storage_id, error = %e, "Failed to release offloaded record");
                }
            }
        }
        Ok(())
    }

    fn try_restore(
        &self,
        inner: &mut CacheInner,
        entry: Handle,
        storage_id: u64,
    ) -> Result<(), Error> {
        let pool = &self.pool;
        let Some(off) = inner.offload.clone() else {
            return Ok(());
        };
        match off.restore(pool, storage_id) {
            Ok(primary) => {
                let bref = pool.ref_create(primary)?;
                pool.with_data_mut::<CacheEntryData, _>(entry, |e| e.bundle_ref = Some(bref))?;
            }
            Err(offload::Error::CorruptRecord { .. }) => {
                // Unrecoverable: the backend has discarded the record.
                // Surrender custody so the entry drains through Delete.
                error!(entry = %entry, storage_id, "Corrupt offloaded bundle discarded");
                pool.with_data_mut::<CacheEntryData, _>(entry, |e| {
                    e.storage_id = 0;
                    e.flags.remove(EntryFlags::LOCAL_CUSTODY);
                })?;
            }
            Err(e) => {
                warn!(entry = %entry, storage_id, error = %e, "Bundle restore failed; will retry");
            }
        }
        Ok(())
    }

    /// A stable custody-tracked entry parked on its retransmit timer is
    /// persisted opportunistically, so the resident copy can be dropped
    /// after the next forward.
    fn maybe_offload(&self, inner: &mut CacheInner, entry: Handle) -> Result<(), Error> {
        let pool = &self.pool;
        let Some(off) = inner.offload.clone() else {
            return Ok(());
        };
        let Some(primary) = pool.with_data::<CacheEntryData, _>(entry, |e| {
            if e.storage_id == 0
                && e.flags
                    .contains(EntryFlags::LOCAL_CUSTODY | EntryFlags::ACTION_TIME_WAIT)
            {
                e.bundle_ref
            } else {
                None
            }
        })?
        else {
            return Ok(());
        };
        if pool.with_primary(primary, |p| p.delivery.policy)? != DeliveryPolicy::CustodyTracking {
            return Ok(());
        }
        match off.offload(pool, primary) {
            Ok(sid) => {
                pool.with_primary_mut(primary, |p| p.delivery.committed_storage_id = sid)?;
                pool.with_data_mut::<CacheEntryData, _>(entry, |e| e.storage_id = sid)?;
                trace!(entry = %entry, storage_id = sid, "Offloaded custody bundle");
            }
            Err(e) => warn!(entry = %entry, error = %e, "Opportunistic offload failed"),
        }
        Ok(())
    }

    pub(crate) fn retarget_time(
        &self,
        inner: &mut CacheInner,
        entry: Handle,
        key: u64,
    ) -> Result<(), Error> {
        let pool = &self.pool;
        let old = pool.with_data::<CacheEntryData, _>(entry, |e| e.time_key)?;
        if old == key {
            return Ok(());
        }
        if old != 0 {
            inner.index.time.remove(&(old, entry.index()));
        }
        if key != 0 {
            inner.index.time.insert((key, entry.index()), entry);
        }
        pool.with_data_mut::<CacheEntryData, _>(entry, |e| e.time_key = key)?;
        Ok(())
    }

    /// Every surviving entry gets a wake time: the fast retry when it is
    /// actionable, the long idle retry when parked, or its own armed
    /// action time if that is earlier.
    fn reschedule(&self, inner: &mut CacheInner, entry: Handle, now: DtnTime) -> Result<(), Error> {
        let (flags, action_time) = self
            .pool
            .with_data::<CacheEntryData, _>(entry, |e| (e.flags, e.action_time))?;
        let mut wake = if flags
            .intersects(EntryFlags::ACTION_TIME_WAIT | EntryFlags::LOCALLY_QUEUED)
        {
            now.saturating_add(self.config.idle_retry)
        } else {
            now.saturating_add(self.config.fast_retry)
        };
        if flags.contains(EntryFlags::ACTION_TIME_WAIT) && action_time < wake {
            wake = action_time;
        }
        self.retarget_time(inner, entry, wake.millisecs())
    }
}
