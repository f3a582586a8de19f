use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::NaiveDate;
use tokio::sync::oneshot;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability as obs;

use super::availability::validate_window;
use super::guards::{buffer_targets, cancellation_events, check_confirm, check_hold, check_release};
use super::surcharge::validate_rule;
use super::{Engine, EngineError, WalCommand};

impl Engine {
    // ── Holds ────────────────────────────────────────────────

    /// Hold a slot for `user_id`. A re-hold by the current holder refreshes the expiry.
    pub async fn hold_slot(
        &self,
        slot_id: Ulid,
        user_id: Ulid,
        ttl: Option<Duration>,
    ) -> Result<Slot, EngineError> {
        let ttl_ms = Ms::try_from(ttl.unwrap_or(self.settings.hold_ttl).as_millis())
            .map_err(|_| EngineError::LimitExceeded("hold ttl too long"))?;
        if ttl_ms <= 0 {
            return Err(EngineError::InvalidInput("hold ttl must be positive"));
        }
        if ttl_ms > MAX_HOLD_TTL_MS {
            return Err(EngineError::LimitExceeded("hold ttl too long"));
        }

        let (key, mut guard) = self.resolve_slot_write(slot_id).await?;
        let now = self.clock.now_ms();
        let slot = guard.get(slot_id).ok_or(EngineError::SlotNotFound(slot_id))?;
        if let Err(e) = check_hold(slot, user_id, now) {
            metrics::counter!(obs::HOLDS_TOTAL, "outcome" => "rejected").increment(1);
            return Err(e);
        }

        let event = Event::HoldPlaced {
            day: key,
            slot_id,
            user_id,
            expires_at: now + ttl_ms,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(obs::HOLDS_TOTAL, "outcome" => "placed").increment(1);
        guard.get(slot_id).cloned().ok_or(EngineError::SlotNotFound(slot_id))
    }

    pub async fn release_slot(&self, slot_id: Ulid, user_id: Ulid) -> Result<Slot, EngineError> {
        let (key, mut guard) = self.resolve_slot_write(slot_id).await?;
        let now = self.clock.now_ms();
        let slot = guard.get(slot_id).ok_or(EngineError::SlotNotFound(slot_id))?;
        check_release(slot, user_id, now)?;

        let event = Event::HoldReleased {
            day: key,
            slot_id,
            reason: ReleaseReason::Customer,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(obs::HOLDS_TOTAL, "outcome" => "released").increment(1);
        guard.get(slot_id).cloned().ok_or(EngineError::SlotNotFound(slot_id))
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Turn the caller's live hold into a booking, then buffer the neighbours.
    ///
    /// The buffer is applied only after the booking itself is durable. A failure while
    /// buffering is logged and does not undo the booking.
    pub async fn confirm_booking(
        &self,
        slot_id: Ulid,
        user_id: Ulid,
        booking_id: Ulid,
    ) -> Result<Slot, EngineError> {
        let (key, mut guard) = self.resolve_slot_write(slot_id).await?;
        let now = self.clock.now_ms();
        let slot = guard.get(slot_id).ok_or(EngineError::SlotNotFound(slot_id))?;
        check_confirm(slot, user_id, now)?;

        // Booking ids span days, so the day lock alone cannot keep them unique.
        if !self.store.reserve_booking(booking_id, slot_id) {
            return Err(EngineError::DuplicateBooking(booking_id));
        }
        let event = Event::BookingConfirmed {
            day: key,
            slot_id,
            booking_id,
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            self.store.unreserve_booking(&booking_id, slot_id);
            return Err(e);
        }
        metrics::counter!(obs::BOOKINGS_TOTAL, "outcome" => "confirmed").increment(1);

        let booked = guard.get(slot_id).cloned().ok_or(EngineError::SlotNotFound(slot_id))?;
        let until = booked.starts_at() + self.settings.buffer_ms();
        let targets = buffer_targets(&guard, &booked, self.settings.buffer_minutes(), until, now);
        for target in targets {
            let event = Event::BufferApplied {
                day: key,
                slot_id: target,
                booking_id,
                until,
            };
            if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
                warn!("booking {booking_id} confirmed but buffering slot {target} failed: {e}");
                metrics::counter!(obs::BUFFER_FAILURES_TOTAL).increment(1);
                break;
            }
        }
        info!("booking {booking_id} confirmed on slot {slot_id}");
        Ok(booked)
    }

    /// Free a booked slot and repair the neighbour buffers around it.
    pub async fn cancel_booking(&self, booking_id: Ulid) -> Result<Slot, EngineError> {
        let slot_id = self
            .store
            .slot_of_booking(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let (_, mut guard) = self.resolve_slot_write(slot_id).await?;
        let now = self.clock.now_ms();
        let slot = guard.get(slot_id).ok_or(EngineError::SlotNotFound(slot_id))?;
        if slot.status != SlotStatus::Booked || slot.booking_id != Some(booking_id) {
            return Err(EngineError::NotBooked(slot_id));
        }

        let events = cancellation_events(
            &guard,
            slot,
            booking_id,
            self.settings.buffer_minutes(),
            self.settings.buffer_ms(),
            now,
        );
        let mut events = events.into_iter();
        if let Some(cancel) = events.next() {
            self.persist_and_apply(&mut guard, &cancel).await?;
        }
        for event in events {
            if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
                warn!("booking {booking_id} cancelled but buffer repair failed: {e}");
                metrics::counter!(obs::BUFFER_FAILURES_TOTAL).increment(1);
                break;
            }
        }
        metrics::counter!(obs::BOOKINGS_TOTAL, "outcome" => "cancelled").increment(1);
        info!("booking {booking_id} cancelled, slot {slot_id} available again");
        guard.get(slot_id).cloned().ok_or(EngineError::SlotNotFound(slot_id))
    }

    // ── Administrative ───────────────────────────────────────

    /// Delete every non-booked slot of the provider on `date`. Returns how many were removed.
    pub async fn revoke_date(&self, provider_id: Ulid, date: NaiveDate) -> Result<usize, EngineError> {
        let key = DayKey::new(provider_id, date);
        let Some(day) = self.store.day(&key) else {
            return Ok(0);
        };
        let mut guard = day.write().await;
        let slot_ids: Vec<Ulid> = guard
            .slots
            .iter()
            .filter(|s| s.status != SlotStatus::Booked)
            .map(|s| s.id)
            .collect();
        if slot_ids.is_empty() {
            return Ok(0);
        }
        let count = slot_ids.len();
        let event = Event::SlotsRevoked { day: key, slot_ids };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("revoked {count} slots for provider {provider_id} on {date}");
        Ok(count)
    }

    pub async fn declare_availability(&self, window: AvailabilityWindow) -> Result<(), EngineError> {
        self.declare_availability_all(vec![window]).await
    }

    /// Declare several windows. Every window is validated and counted against the provider
    /// limits before the first one is written, so a rejected batch leaves nothing behind.
    pub async fn declare_availability_all(&self, windows: Vec<AvailabilityWindow>) -> Result<(), EngineError> {
        for window in &windows {
            validate_window(window)?;
        }
        let _admin = self.admin_lock.lock().await;
        let mut added: HashMap<Ulid, HashSet<Ulid>> = HashMap::new();
        for window in &windows {
            if !self.availability.contains(&window.id) {
                added.entry(window.provider_id).or_default().insert(window.id);
            }
        }
        for (provider_id, ids) in &added {
            if self.availability.window_count(provider_id) + ids.len() > MAX_WINDOWS_PER_PROVIDER {
                return Err(EngineError::LimitExceeded("too many availability windows for provider"));
            }
        }
        for window in windows {
            self.persist_catalog_event(&Event::AvailabilityDeclared { window }).await?;
        }
        Ok(())
    }

    /// Remove a window. Returns the provider it belonged to.
    pub async fn withdraw_availability(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _admin = self.admin_lock.lock().await;
        let provider_id = self
            .availability
            .owner_of(&id)
            .ok_or(EngineError::WindowNotFound(id))?;
        self.persist_catalog_event(&Event::AvailabilityWithdrawn { id, provider_id })
            .await?;
        Ok(provider_id)
    }

    /// Store a rule. Activating it deactivates whichever rule was active before.
    pub async fn put_surcharge_rule(&self, rule: SurchargeRule) -> Result<(), EngineError> {
        validate_rule(&rule)?;
        let _admin = self.admin_lock.lock().await;
        if !self.surcharges.contains(&rule.id) && self.surcharges.len() >= MAX_SURCHARGE_RULES {
            return Err(EngineError::LimitExceeded("too many surcharge rules"));
        }
        self.persist_catalog_event(&Event::SurchargeRuleSet { rule }).await
    }

    pub async fn delete_surcharge_rule(&self, id: Ulid) -> Result<(), EngineError> {
        let _admin = self.admin_lock.lock().await;
        if !self.surcharges.contains(&id) {
            return Err(EngineError::RuleNotFound(id));
        }
        self.persist_catalog_event(&Event::SurchargeRuleDeleted { id }).await
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _admin = self.admin_lock.lock().await;
        let mut events: Vec<Event> = self
            .availability
            .all()
            .into_iter()
            .map(|window| Event::AvailabilityDeclared { window })
            .collect();
        // Inactive rules first so the active one is never switched off on replay.
        let mut rules = self.surcharges.all();
        rules.sort_by_key(|r| r.is_active);
        events.extend(rules.into_iter().map(|rule| Event::SurchargeRuleSet { rule }));

        // Read locks stay held until the swap so no day append can slip in between.
        let mut held = Vec::new();
        for (key, day) in self.store.days() {
            let guard = day.read_owned().await;
            if !guard.slots.is_empty() {
                events.push(Event::SlotsGenerated {
                    day: key,
                    slots: guard.slots.clone(),
                });
            }
            held.push(guard);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(held);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
