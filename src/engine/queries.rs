use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, Resolution};

impl Engine {
    /// Every slot of the provider on `date`, in time order.
    pub async fn get_slots(&self, provider_id: Ulid, date: NaiveDate) -> Vec<Slot> {
        match self.store.day(&DayKey::new(provider_id, date)) {
            Some(day) => day.read().await.slots.clone(),
            None => Vec::new(),
        }
    }

    /// Slots a customer may pick right now: not booked, not under a live hold,
    /// not buffer-blocked. Expired holds count as available.
    pub async fn get_available_slots(&self, provider_id: Ulid, date: NaiveDate) -> Vec<Slot> {
        self.get_available_slots_at(provider_id, date, self.clock.now_ms()).await
    }

    pub async fn get_available_slots_at(&self, provider_id: Ulid, date: NaiveDate, now: Ms) -> Vec<Slot> {
        let Some(day) = self.store.day(&DayKey::new(provider_id, date)) else {
            return Vec::new();
        };
        let guard = day.read().await;
        guard.slots.iter().filter(|s| s.is_open(now)).cloned().collect()
    }

    pub async fn get_slot(&self, slot_id: Ulid) -> Option<Slot> {
        let key = self.store.day_of_slot(&slot_id)?;
        let day = self.store.day(&key)?;
        let guard = day.read().await;
        guard.get(slot_id).cloned()
    }

    pub async fn get_booking_slot(&self, booking_id: Ulid) -> Option<Slot> {
        let slot_id = self.store.slot_of_booking(&booking_id)?;
        self.get_slot(slot_id).await
    }

    pub fn active_surcharge_rule(&self) -> Option<SurchargeRule> {
        self.surcharges.active()
    }

    pub fn surcharge_rules(&self) -> Vec<SurchargeRule> {
        self.surcharges.all()
    }

    pub async fn resolve_availability(
        &self,
        provider_id: Ulid,
        date: NaiveDate,
    ) -> Result<Resolution, EngineError> {
        self.resolver.resolve(provider_id, date).await
    }

    /// Windows declared through this engine, in declaration order.
    pub fn availability_windows(&self, provider_id: Ulid) -> Vec<AvailabilityWindow> {
        self.availability.windows_of(&provider_id)
    }
}
