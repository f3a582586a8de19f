use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only instant type.
pub type Ms = i64;

/// Price in whole currency units.
pub type Amount = i64;

pub const MINUTE_MS: Ms = 60_000;

const MINUTES_PER_DAY: u16 = 24 * 60;

// ── Time of day ──────────────────────────────────────────────────

/// Minute-granularity wall-clock time, `00:00` through `23:59`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay(u16);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid time format: {0:?} (expected HH:MM)")]
pub struct TimeFormatError(pub String);

impl TimeOfDay {
    pub fn from_hm(hour: u32, minute: u32) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self((hour * 60 + minute) as u16))
        } else {
            None
        }
    }

    pub fn from_minutes(minutes: u32) -> Option<Self> {
        if minutes < MINUTES_PER_DAY as u32 {
            Some(Self(minutes as u16))
        } else {
            None
        }
    }

    pub fn minutes(self) -> u32 {
        self.0 as u32
    }

    pub fn hour(self) -> u32 {
        self.minutes() / 60
    }

    pub fn minute(self) -> u32 {
        self.minutes() % 60
    }

    /// Later time on the same day, or `None` past midnight.
    pub fn plus_minutes(self, minutes: u32) -> Option<Self> {
        Self::from_minutes(self.minutes() + minutes)
    }

    /// Absolute distance in minutes.
    pub fn distance(self, other: TimeOfDay) -> u32 {
        self.minutes().abs_diff(other.minutes())
    }

    /// 12-hour display label, e.g. `9:00 AM`.
    pub fn label(self) -> String {
        let (h, suffix) = match self.hour() {
            0 => (12, "AM"),
            h @ 1..=11 => (h, "AM"),
            12 => (12, "PM"),
            h => (h - 12, "PM"),
        };
        format!("{h}:{:02} {suffix}", self.minute())
    }

    /// The UTC instant at which this time occurs on `date`.
    pub fn on(self, date: NaiveDate) -> Ms {
        date.and_time(NaiveTime::MIN).and_utc().timestamp_millis() + self.minutes() as Ms * MINUTE_MS
    }
}

impl FromStr for TimeOfDay {
    type Err = TimeFormatError;

    /// Accepts `H:MM`, `HH:MM` and `HH:MM:00`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || TimeFormatError(s.to_string());
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(err());
        }
        let digits = |p: &str, min_len: usize| {
            !p.is_empty() && p.len() >= min_len && p.len() <= 2 && p.bytes().all(|b| b.is_ascii_digit())
        };
        if !digits(parts[0], 1) || !digits(parts[1], 2) {
            return Err(err());
        }
        if parts.len() == 3 && parts[2] != "00" {
            return Err(err());
        }
        let hour: u32 = parts[0].parse().map_err(|_| err())?;
        let minute: u32 = parts[1].parse().map_err(|_| err())?;
        Self::from_hm(hour, minute).ok_or_else(err)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

// ── Slots ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotStatus {
    Available,
    Held,
    Booked,
}

impl SlotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SlotStatus::Available => "available",
            SlotStatus::Held => "held",
            SlotStatus::Booked => "booked",
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One provider's bookable timeline for one calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DayKey {
    pub provider_id: Ulid,
    pub date: NaiveDate,
}

impl DayKey {
    pub fn new(provider_id: Ulid, date: NaiveDate) -> Self {
        Self { provider_id, date }
    }
}

/// Base price plus surcharge. `total` is always `base + surcharge`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricing {
    pub base: Amount,
    pub surcharge: Amount,
    pub total: Amount,
}

impl Pricing {
    pub fn new(base: Amount, surcharge: Amount) -> Self {
        Self {
            base,
            surcharge,
            total: base.saturating_add(surcharge),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub date: NaiveDate,
    pub time: TimeOfDay,
    pub status: SlotStatus,
    pub held_by: Option<Ulid>,
    pub hold_expires_at: Option<Ms>,
    pub base_price: Amount,
    pub surcharge_amount: Amount,
    pub total_price: Amount,
    /// Set on neighbours of a confirmed booking; blocks listing while in the future.
    pub buffer_blocked_until: Option<Ms>,
    pub buffer_booking_id: Option<Ulid>,
    /// External booking reference while `status == Booked`.
    pub booking_id: Option<Ulid>,
    /// Bumped on every state change; used for compare-and-swap by the sweeper.
    pub version: u64,
}

impl Slot {
    pub fn new(key: DayKey, time: TimeOfDay, pricing: Pricing) -> Self {
        Self {
            id: Ulid::new(),
            provider_id: key.provider_id,
            date: key.date,
            time,
            status: SlotStatus::Available,
            held_by: None,
            hold_expires_at: None,
            base_price: pricing.base,
            surcharge_amount: pricing.surcharge,
            total_price: pricing.total,
            buffer_blocked_until: None,
            buffer_booking_id: None,
            booking_id: None,
            version: 0,
        }
    }

    pub fn day(&self) -> DayKey {
        DayKey::new(self.provider_id, self.date)
    }

    pub fn starts_at(&self) -> Ms {
        self.time.on(self.date)
    }

    pub fn pricing(&self) -> Pricing {
        Pricing {
            base: self.base_price,
            surcharge: self.surcharge_amount,
            total: self.total_price,
        }
    }

    pub fn reprice(&mut self, pricing: Pricing) {
        self.base_price = pricing.base;
        self.surcharge_amount = pricing.surcharge;
        self.total_price = pricing.total;
    }

    /// Held and not yet past `hold_expires_at`.
    pub fn has_live_hold(&self, now: Ms) -> bool {
        self.status == SlotStatus::Held && self.hold_expires_at.is_some_and(|exp| now <= exp)
    }

    pub fn is_buffer_blocked(&self, now: Ms) -> bool {
        self.buffer_blocked_until.is_some_and(|until| until > now)
    }

    /// Whether a customer may pick this slot right now.
    pub fn is_open(&self, now: Ms) -> bool {
        let free = match self.status {
            SlotStatus::Booked => false,
            SlotStatus::Held => !self.has_live_hold(now),
            SlotStatus::Available => true,
        };
        free && !self.is_buffer_blocked(now)
    }

    pub(crate) fn clear_hold(&mut self) {
        self.held_by = None;
        self.hold_expires_at = None;
    }

    pub(crate) fn clear_buffer(&mut self) {
        self.buffer_blocked_until = None;
        self.buffer_booking_id = None;
    }
}

/// All slots of one provider on one date, sorted by time.
#[derive(Debug, Clone)]
pub struct DaySchedule {
    pub key: DayKey,
    pub slots: Vec<Slot>,
}

impl DaySchedule {
    pub fn new(key: DayKey) -> Self {
        Self {
            key,
            slots: Vec::new(),
        }
    }

    /// Replace the slot with the same id, or insert keeping time order.
    pub fn upsert(&mut self, slot: Slot) {
        if let Some(existing) = self.slots.iter_mut().find(|s| s.id == slot.id) {
            *existing = slot;
            return;
        }
        let pos = self
            .slots
            .binary_search_by_key(&slot.time, |s| s.time)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Slot> {
        let pos = self.slots.iter().position(|s| s.id == id)?;
        Some(self.slots.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.id == id)
    }

    pub fn at(&self, time: TimeOfDay) -> Option<&Slot> {
        self.slots
            .binary_search_by_key(&time, |s| s.time)
            .ok()
            .map(|i| &self.slots[i])
    }

    /// Slots strictly closer than `radius_minutes` to `center`, excluding `center` itself.
    pub fn neighbours(&self, center: TimeOfDay, radius_minutes: u32) -> impl Iterator<Item = &Slot> {
        self.slots
            .iter()
            .filter(move |s| s.time != center && s.time.distance(center) < radius_minutes)
    }
}

// ── Availability ─────────────────────────────────────────────────

/// Which days a [`DayEntry`] applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaySelector {
    Date(NaiveDate),
    Weekday(Weekday),
}

impl DaySelector {
    pub fn matches(&self, date: NaiveDate) -> bool {
        match self {
            DaySelector::Date(d) => *d == date,
            DaySelector::Weekday(w) => date.weekday() == *w,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayEntry {
    pub selector: DaySelector,
    pub is_available: bool,
    pub start_time: TimeOfDay,
    pub end_time: TimeOfDay,
}

/// Half-open open interval `[start, end)` on a single date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenWindow {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl OpenWindow {
    pub fn contains(&self, time: TimeOfDay) -> bool {
        self.start <= time && time < self.end
    }

    pub fn duration_minutes(&self) -> u32 {
        self.end.minutes().saturating_sub(self.start.minutes())
    }
}

/// Provider-declared availability over a date range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub valid_from: NaiveDate,
    pub valid_until: NaiveDate,
    pub entries: Vec<DayEntry>,
}

impl AvailabilityWindow {
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.valid_from <= date && date <= self.valid_until
    }

    /// The entry governing `date`: a date-specific entry beats a weekday entry.
    pub fn entry_for(&self, date: NaiveDate) -> Option<&DayEntry> {
        if !self.covers(date) {
            return None;
        }
        self.entries
            .iter()
            .find(|e| matches!(e.selector, DaySelector::Date(d) if d == date))
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|e| matches!(e.selector, DaySelector::Weekday(_)) && e.selector.matches(date))
            })
    }

    pub fn open_window_on(&self, date: NaiveDate) -> Option<OpenWindow> {
        self.entry_for(date).filter(|e| e.is_available).map(|e| OpenWindow {
            start: e.start_time,
            end: e.end_time,
        })
    }
}

/// One tick of the standard time grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotDefinition {
    pub time: TimeOfDay,
    pub label: String,
    pub sort_order: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurchargeRule {
    pub id: Ulid,
    pub start_time: TimeOfDay,
    pub end_time: TimeOfDay,
    pub surcharge_amount: Amount,
    pub is_active: bool,
}

// ── WAL events ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseReason {
    Customer,
    Expired,
}

/// Flat event types, one per state change. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AvailabilityDeclared {
        window: AvailabilityWindow,
    },
    AvailabilityWithdrawn {
        id: Ulid,
        provider_id: Ulid,
    },
    SurchargeRuleSet {
        rule: SurchargeRule,
    },
    SurchargeRuleDeleted {
        id: Ulid,
    },
    /// Full snapshots of inserted or repriced slots for one day.
    SlotsGenerated {
        day: DayKey,
        slots: Vec<Slot>,
    },
    SlotsRevoked {
        day: DayKey,
        slot_ids: Vec<Ulid>,
    },
    HoldPlaced {
        day: DayKey,
        slot_id: Ulid,
        user_id: Ulid,
        expires_at: Ms,
    },
    HoldReleased {
        day: DayKey,
        slot_id: Ulid,
        reason: ReleaseReason,
    },
    BookingConfirmed {
        day: DayKey,
        slot_id: Ulid,
        booking_id: Ulid,
    },
    BookingCancelled {
        day: DayKey,
        slot_id: Ulid,
        booking_id: Ulid,
    },
    BufferApplied {
        day: DayKey,
        slot_id: Ulid,
        booking_id: Ulid,
        until: Ms,
    },
    BufferCleared {
        day: DayKey,
        slot_id: Ulid,
    },
}

impl Event {
    /// The day schedule this event mutates, if any.
    pub fn day(&self) -> Option<DayKey> {
        match self {
            Event::SlotsGenerated { day, .. }
            | Event::SlotsRevoked { day, .. }
            | Event::HoldPlaced { day, .. }
            | Event::HoldReleased { day, .. }
            | Event::BookingConfirmed { day, .. }
            | Event::BookingCancelled { day, .. }
            | Event::BufferApplied { day, .. }
            | Event::BufferCleared { day, .. } => Some(*day),
            Event::AvailabilityDeclared { .. }
            | Event::AvailabilityWithdrawn { .. }
            | Event::SurchargeRuleSet { .. }
            | Event::SurchargeRuleDeleted { .. } => None,
        }
    }

    /// Provider whose subscribers should hear about this event.
    pub fn provider_id(&self) -> Option<Ulid> {
        match self {
            Event::AvailabilityDeclared { window } => Some(window.provider_id),
            Event::AvailabilityWithdrawn { provider_id, .. } => Some(*provider_id),
            Event::SurchargeRuleSet { .. } | Event::SurchargeRuleDeleted { .. } => None,
            other => other.day().map(|d| d.provider_id),
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Outcome of one expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_holds: usize,
    pub expired_buffers: usize,
}
