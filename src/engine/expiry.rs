use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability as obs;

use super::{Engine, EngineError};

/// A slot observed in a stale state, with the version it had at that moment.
pub type SweepCandidate = (Ulid, DayKey, u64);

impl Engine {
    /// Held slots whose hold ended strictly before `now`.
    pub async fn collect_expired_holds(&self, now: Ms) -> Vec<SweepCandidate> {
        let mut expired = Vec::new();
        for (key, day) in self.store.days() {
            let guard = day.read().await;
            for slot in &guard.slots {
                if slot.status == SlotStatus::Held && slot.hold_expires_at.is_some_and(|exp| exp < now) {
                    expired.push((slot.id, key, slot.version));
                }
            }
        }
        expired
    }

    /// Slots whose buffer ended strictly before `now`.
    pub async fn collect_lapsed_buffers(&self, now: Ms) -> Vec<SweepCandidate> {
        let mut lapsed = Vec::new();
        for (key, day) in self.store.days() {
            let guard = day.read().await;
            for slot in &guard.slots {
                if slot.buffer_blocked_until.is_some_and(|until| until < now) {
                    lapsed.push((slot.id, key, slot.version));
                }
            }
        }
        lapsed
    }

    /// Release an expired hold if the slot is still at `expected_version`.
    /// `Ok(false)` means the slot moved on since it was collected and was left untouched.
    pub async fn expire_hold(&self, slot_id: Ulid, expected_version: u64, now: Ms) -> Result<bool, EngineError> {
        let (key, mut guard) = self.resolve_slot_write(slot_id).await?;
        let Some(slot) = guard.get(slot_id) else {
            return Ok(false);
        };
        let still_expired = slot.status == SlotStatus::Held && slot.hold_expires_at.is_some_and(|exp| exp < now);
        if slot.version != expected_version || !still_expired {
            return Ok(false);
        }
        let event = Event::HoldReleased {
            day: key,
            slot_id,
            reason: ReleaseReason::Expired,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    /// Clear a lapsed buffer if the slot is still at `expected_version`.
    pub async fn clear_lapsed_buffer(
        &self,
        slot_id: Ulid,
        expected_version: u64,
        now: Ms,
    ) -> Result<bool, EngineError> {
        let (key, mut guard) = self.resolve_slot_write(slot_id).await?;
        let Some(slot) = guard.get(slot_id) else {
            return Ok(false);
        };
        let still_lapsed = slot.buffer_blocked_until.is_some_and(|until| until < now);
        if slot.version != expected_version || !still_lapsed {
            return Ok(false);
        }
        let event = Event::BufferCleared { day: key, slot_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    /// Reclaim every expired hold and lapsed buffer as of `now`.
    /// Safe alongside live traffic: a slot that changed after collection is skipped.
    pub async fn run_expiry_sweep(&self, now: Ms) -> SweepReport {
        let started = std::time::Instant::now();
        let mut report = SweepReport::default();

        for (slot_id, _, version) in self.collect_expired_holds(now).await {
            match self.expire_hold(slot_id, version, now).await {
                Ok(true) => {
                    report.expired_holds += 1;
                    debug!("expired hold on slot {slot_id}");
                }
                Ok(false) | Err(EngineError::SlotNotFound(_)) => {
                    debug!("sweep skip hold on {slot_id}: slot changed since collection");
                }
                Err(e) => warn!("sweep failed to expire hold on {slot_id}: {e}"),
            }
        }
        for (slot_id, _, version) in self.collect_lapsed_buffers(now).await {
            match self.clear_lapsed_buffer(slot_id, version, now).await {
                Ok(true) => report.expired_buffers += 1,
                Ok(false) | Err(EngineError::SlotNotFound(_)) => {
                    debug!("sweep skip buffer on {slot_id}: slot changed since collection");
                }
                Err(e) => warn!("sweep failed to clear buffer on {slot_id}: {e}"),
            }
        }

        metrics::counter!(obs::SWEEP_EXPIRED_HOLDS_TOTAL).increment(report.expired_holds as u64);
        metrics::counter!(obs::SWEEP_EXPIRED_BUFFERS_TOTAL).increment(report.expired_buffers as u64);
        metrics::histogram!(obs::SWEEP_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        if report.expired_holds > 0 || report.expired_buffers > 0 {
            info!(
                "sweep reclaimed {} holds and {} buffers",
                report.expired_holds, report.expired_buffers
            );
        }
        report
    }
}
