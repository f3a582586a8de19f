use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

// ── Surcharge calculation ─────────────────────────────────────────

/// True iff the rule is active and `start_time <= time <= end_time`.
pub fn is_eligible(time: TimeOfDay, rule: &SurchargeRule) -> bool {
    rule.is_active && rule.start_time <= time && time <= rule.end_time
}

/// Price of a slot at `time`. No rule, inactive rule or out-of-window time means no surcharge.
pub fn price_for(base_price: Amount, time: TimeOfDay, rule: Option<&SurchargeRule>) -> Pricing {
    match rule {
        Some(rule) if is_eligible(time, rule) => Pricing::new(base_price, rule.surcharge_amount),
        _ => Pricing::new(base_price, 0),
    }
}

/// [`price_for`] on a textual `HH:MM` time.
pub fn price_at(
    base_price: Amount,
    time: &str,
    rule: Option<&SurchargeRule>,
) -> Result<Pricing, EngineError> {
    let time: TimeOfDay = time.parse()?;
    Ok(price_for(base_price, time, rule))
}

// ── Rule book ─────────────────────────────────────────────────────

/// Surcharge rules keyed by id. At most one rule is active.
#[derive(Default)]
pub struct SurchargeBook {
    rules: DashMap<Ulid, SurchargeRule>,
}

impl SurchargeBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.rules.contains_key(id)
    }

    pub fn active(&self) -> Option<SurchargeRule> {
        self.rules
            .iter()
            .find(|e| e.value().is_active)
            .map(|e| e.value().clone())
    }

    /// All rules ordered by id (creation order for ULIDs).
    pub fn all(&self) -> Vec<SurchargeRule> {
        let mut rules: Vec<SurchargeRule> = self.rules.iter().map(|e| e.value().clone()).collect();
        rules.sort_by_key(|r| r.id);
        rules
    }

    /// Insert or replace. Activating a rule deactivates every other rule.
    pub(crate) fn put(&self, rule: SurchargeRule) {
        if rule.is_active {
            for mut entry in self.rules.iter_mut() {
                if entry.key() != &rule.id {
                    entry.value_mut().is_active = false;
                }
            }
        }
        self.rules.insert(rule.id, rule);
    }

    pub(crate) fn remove(&self, id: &Ulid) -> Option<SurchargeRule> {
        self.rules.remove(id).map(|(_, r)| r)
    }
}

pub(crate) fn validate_rule(rule: &SurchargeRule) -> Result<(), EngineError> {
    if rule.start_time > rule.end_time {
        return Err(EngineError::InvalidInput("surcharge start_time after end_time"));
    }
    if !(0..=crate::limits::MAX_AMOUNT).contains(&rule.surcharge_amount) {
        return Err(EngineError::LimitExceeded("surcharge amount out of range"));
    }
    Ok(())
}
