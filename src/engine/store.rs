use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedDay = Arc<RwLock<DaySchedule>>;

/// Day schedules plus the reverse indexes needed to reach them by slot or booking id.
pub struct SlotStore {
    days: DashMap<DayKey, SharedDay>,
    slot_index: DashMap<Ulid, DayKey>,
    booking_index: DashMap<Ulid, Ulid>,
}

impl Default for SlotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotStore {
    pub fn new() -> Self {
        Self {
            days: DashMap::new(),
            slot_index: DashMap::new(),
            booking_index: DashMap::new(),
        }
    }

    // ── Days ─────────────────────────────────────────────────

    pub fn day_count(&self) -> usize {
        self.days.len()
    }

    pub fn slot_count(&self) -> usize {
        self.slot_index.len()
    }

    pub fn day(&self, key: &DayKey) -> Option<SharedDay> {
        self.days.get(key).map(|e| e.value().clone())
    }

    pub fn day_or_create(&self, key: DayKey) -> SharedDay {
        self.days
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(DaySchedule::new(key))))
            .value()
            .clone()
    }

    /// Snapshot of every day handle, sorted by key. Never hold DashMap refs across an await.
    pub fn days(&self) -> Vec<(DayKey, SharedDay)> {
        let mut days: Vec<(DayKey, SharedDay)> =
            self.days.iter().map(|e| (*e.key(), e.value().clone())).collect();
        days.sort_by_key(|(key, _)| *key);
        days
    }

    // ── Indexes ──────────────────────────────────────────────

    pub fn day_of_slot(&self, slot_id: &Ulid) -> Option<DayKey> {
        self.slot_index.get(slot_id).map(|e| *e.value())
    }

    pub fn slot_of_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_index.get(booking_id).map(|e| *e.value())
    }

    /// Claim `booking_id` for `slot_id` ahead of the WAL append. False if the id is taken.
    pub fn reserve_booking(&self, booking_id: Ulid, slot_id: Ulid) -> bool {
        match self.booking_index.entry(booking_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(slot_id);
                true
            }
        }
    }

    /// Drop a reservation whose confirm never became durable.
    pub fn unreserve_booking(&self, booking_id: &Ulid, slot_id: Ulid) {
        self.booking_index.remove_if(booking_id, |_, reserved| *reserved == slot_id);
    }

    // ── Event application ────────────────────────────────────

    /// Apply a day event to its locked schedule. Every slot touched gets its version bumped,
    /// except generated snapshots which carry their own.
    pub fn apply(&self, day: &mut DaySchedule, event: &Event) {
        match event {
            Event::SlotsGenerated { slots, .. } => {
                for slot in slots {
                    self.slot_index.insert(slot.id, day.key);
                    if let Some(booking_id) = slot.booking_id {
                        self.booking_index.insert(booking_id, slot.id);
                    }
                    day.upsert(slot.clone());
                }
            }
            Event::SlotsRevoked { slot_ids, .. } => {
                for id in slot_ids {
                    if let Some(slot) = day.remove(*id) {
                        self.slot_index.remove(id);
                        if let Some(booking_id) = slot.booking_id {
                            self.booking_index.remove(&booking_id);
                        }
                    }
                }
            }
            Event::HoldPlaced {
                slot_id,
                user_id,
                expires_at,
                ..
            } => {
                if let Some(slot) = day.get_mut(*slot_id) {
                    slot.status = SlotStatus::Held;
                    slot.held_by = Some(*user_id);
                    slot.hold_expires_at = Some(*expires_at);
                    slot.version += 1;
                }
            }
            Event::HoldReleased { slot_id, .. } => {
                if let Some(slot) = day.get_mut(*slot_id) {
                    slot.status = SlotStatus::Available;
                    slot.clear_hold();
                    slot.version += 1;
                }
            }
            Event::BookingConfirmed {
                slot_id, booking_id, ..
            } => {
                if let Some(slot) = day.get_mut(*slot_id) {
                    slot.status = SlotStatus::Booked;
                    slot.clear_hold();
                    slot.clear_buffer();
                    slot.booking_id = Some(*booking_id);
                    slot.version += 1;
                    self.booking_index.insert(*booking_id, *slot_id);
                }
            }
            Event::BookingCancelled {
                slot_id, booking_id, ..
            } => {
                if let Some(slot) = day.get_mut(*slot_id) {
                    slot.status = SlotStatus::Available;
                    slot.booking_id = None;
                    slot.clear_hold();
                    slot.clear_buffer();
                    slot.version += 1;
                }
                self.booking_index.remove(booking_id);
            }
            Event::BufferApplied {
                slot_id,
                booking_id,
                until,
                ..
            } => {
                if let Some(slot) = day.get_mut(*slot_id) {
                    slot.buffer_blocked_until = Some(*until);
                    slot.buffer_booking_id = Some(*booking_id);
                    slot.version += 1;
                }
            }
            Event::BufferCleared { slot_id, .. } => {
                if let Some(slot) = day.get_mut(*slot_id) {
                    slot.clear_buffer();
                    slot.version += 1;
                }
            }
            Event::AvailabilityDeclared { .. }
            | Event::AvailabilityWithdrawn { .. }
            | Event::SurchargeRuleSet { .. }
            | Event::SurchargeRuleDeleted { .. } => {}
        }
    }
}
