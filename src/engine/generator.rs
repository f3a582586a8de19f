use chrono::NaiveDate;
use tracing::info;
use ulid::Ulid;

use crate::limits::MAX_AMOUNT;
use crate::model::*;

use super::surcharge::price_for;
use super::{Engine, EngineError, Resolution};

/// Slots to insert or reprice so that `day` covers `ticks` at the given price.
/// Held and booked slots, and slots already at the right price, are left alone.
pub(crate) fn plan_generation<'a>(
    day: &DaySchedule,
    ticks: impl Iterator<Item = &'a SlotDefinition>,
    base_price: Amount,
    rule: Option<&SurchargeRule>,
) -> Vec<Slot> {
    let mut planned = Vec::new();
    for def in ticks {
        let pricing = price_for(base_price, def.time, rule);
        match day.at(def.time) {
            None => planned.push(Slot::new(day.key, def.time, pricing)),
            Some(existing) if existing.status == SlotStatus::Available && existing.pricing() != pricing => {
                let mut repriced = existing.clone();
                repriced.reprice(pricing);
                repriced.version += 1;
                planned.push(repriced);
            }
            Some(_) => {}
        }
    }
    planned
}

impl Engine {
    /// Materialize the provider's slots for `date` and return every slot of that day.
    ///
    /// Fails with `NotOpen` when the provider is closed and with `ResolutionFailed` when
    /// availability cannot be read; neither writes anything. All inserts and repricings of
    /// one call are a single WAL record.
    pub async fn generate_slots(
        &self,
        provider_id: Ulid,
        date: NaiveDate,
        base_price: Amount,
    ) -> Result<Vec<Slot>, EngineError> {
        if base_price < 0 {
            return Err(EngineError::InvalidInput("base_price must not be negative"));
        }
        if base_price > MAX_AMOUNT {
            return Err(EngineError::LimitExceeded("base_price too large"));
        }

        let window = match self.resolver.resolve(provider_id, date).await? {
            Resolution::Open(window) => window,
            Resolution::Closed => return Err(EngineError::NotOpen { provider_id, date }),
        };
        let rule = self.surcharges.active();

        let key = DayKey::new(provider_id, date);
        // Day creation is ordered with compaction, which snapshots the day list under admin_lock.
        let mut guard = {
            let _admin = self.admin_lock.lock().await;
            self.store.day_or_create(key).write_owned().await
        };
        let planned = plan_generation(&guard, self.settings.catalog.within(window), base_price, rule.as_ref());
        if !planned.is_empty() {
            let count = planned.len();
            let event = Event::SlotsGenerated { day: key, slots: planned };
            self.persist_and_apply(&mut guard, &event).await?;
            metrics::counter!(crate::observability::SLOTS_GENERATED_TOTAL).increment(count as u64);
            info!("generated {count} slots for provider {provider_id} on {date}");
        }
        Ok(guard.slots.clone())
    }
}
