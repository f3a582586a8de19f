use ulid::Ulid;

use crate::model::*;

use super::EngineError;

// ── Transition guards ────────────────────────────────────
//
// Pure checks run under the day write lock. An expired hold counts as available.

pub(crate) fn check_hold(slot: &Slot, user_id: Ulid, now: Ms) -> Result<(), EngineError> {
    if slot.status == SlotStatus::Booked {
        return Err(EngineError::AlreadyBooked(slot.id));
    }
    if slot.has_live_hold(now) && slot.held_by != Some(user_id) {
        return Err(EngineError::HoldConflict {
            slot_id: slot.id,
            held_until: slot.hold_expires_at.unwrap_or(now),
        });
    }
    if let Some(until) = slot.buffer_blocked_until.filter(|until| *until > now) {
        return Err(EngineError::BufferBlocked { slot_id: slot.id, until });
    }
    Ok(())
}

pub(crate) fn check_release(slot: &Slot, user_id: Ulid, now: Ms) -> Result<(), EngineError> {
    if slot.has_live_hold(now) && slot.held_by == Some(user_id) {
        Ok(())
    } else {
        Err(EngineError::HoldInvalidOrExpired(slot.id))
    }
}

pub(crate) fn check_confirm(slot: &Slot, user_id: Ulid, now: Ms) -> Result<(), EngineError> {
    if slot.status == SlotStatus::Booked {
        return Err(EngineError::AlreadyBooked(slot.id));
    }
    check_release(slot, user_id, now)
}

// ── Buffer planning ──────────────────────────────────────

/// A neighbour can carry a buffer unless it is booked or under a live hold.
fn can_buffer(slot: &Slot, now: Ms) -> bool {
    slot.status != SlotStatus::Booked && !slot.has_live_hold(now)
}

/// Neighbours of `booked` that should receive `until`. Identical or later-ending buffers stay.
pub(crate) fn buffer_targets(
    day: &DaySchedule,
    booked: &Slot,
    radius_minutes: u32,
    until: Ms,
    now: Ms,
) -> Vec<Ulid> {
    day.neighbours(booked.time, radius_minutes)
        .filter(|s| can_buffer(s, now))
        .filter(|s| s.buffer_blocked_until.is_none_or(|current| current < until))
        .map(|s| s.id)
        .collect()
}

/// Events that cancel `booking_id` on `cancelled` and repair the buffers around it:
/// the slot itself is freed, every buffer this booking placed is cleared, and each freed
/// slot picks up the latest still-running buffer from another booking on the same day.
pub(crate) fn cancellation_events(
    day: &DaySchedule,
    cancelled: &Slot,
    booking_id: Ulid,
    radius_minutes: u32,
    buffer_ms: Ms,
    now: Ms,
) -> Vec<Event> {
    let key = day.key;
    let mut events = vec![Event::BookingCancelled {
        day: key,
        slot_id: cancelled.id,
        booking_id,
    }];

    let mut released = vec![cancelled];
    for slot in &day.slots {
        if slot.buffer_booking_id == Some(booking_id) {
            events.push(Event::BufferCleared { day: key, slot_id: slot.id });
            released.push(slot);
        }
    }

    for slot in released {
        if slot.id != cancelled.id && !can_buffer(slot, now) {
            continue;
        }
        let covering = day
            .slots
            .iter()
            .filter(|b| b.id != cancelled.id && b.status == SlotStatus::Booked)
            .filter(|b| b.time != slot.time && b.time.distance(slot.time) < radius_minutes)
            .filter_map(|b| Some((b.booking_id?, b.starts_at() + buffer_ms)))
            .filter(|(_, until)| *until > now)
            .max_by_key(|(_, until)| *until);
        if let Some((other, until)) = covering {
            events.push(Event::BufferApplied {
                day: key,
                slot_id: slot.id,
                booking_id: other,
                until,
            });
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const MIN: Ms = MINUTE_MS;

    fn day_with(times: &[&str]) -> DaySchedule {
        let key = DayKey::new(Ulid::new(), NaiveDate::from_ymd_opt(2025, 3, 10).unwrap());
        let mut day = DaySchedule::new(key);
        for t in times {
            day.upsert(Slot::new(key, t.parse().unwrap(), Pricing::new(120, 0)));
        }
        day
    }

    fn slot_at<'a>(day: &'a DaySchedule, time: &str) -> &'a Slot {
        day.at(time.parse().unwrap()).unwrap()
    }

    fn slot_at_mut<'a>(day: &'a mut DaySchedule, time: &str) -> &'a mut Slot {
        let id = slot_at(day, time).id;
        day.get_mut(id).unwrap()
    }

    fn hold(slot: &mut Slot, user: Ulid, expires_at: Ms) {
        slot.status = SlotStatus::Held;
        slot.held_by = Some(user);
        slot.hold_expires_at = Some(expires_at);
    }

    fn book(slot: &mut Slot) -> Ulid {
        let booking = Ulid::new();
        slot.status = SlotStatus::Booked;
        slot.booking_id = Some(booking);
        booking
    }

    #[test]
    fn hold_guard() {
        let mut day = day_with(&["10:00"]);
        let (alice, bob) = (Ulid::new(), Ulid::new());
        let slot = slot_at_mut(&mut day, "10:00");
        assert!(check_hold(slot, alice, 0).is_ok());

        hold(slot, alice, 1_000);
        assert!(check_hold(slot, alice, 500).is_ok());
        assert!(matches!(
            check_hold(slot, bob, 500),
            Err(EngineError::HoldConflict { held_until: 1_000, .. })
        ));
        // Expired hold is treated as available.
        assert!(check_hold(slot, bob, 1_001).is_ok());

        book(slot);
        assert!(matches!(check_hold(slot, alice, 0), Err(EngineError::AlreadyBooked(_))));
    }

    #[test]
    fn hold_guard_respects_buffer() {
        let mut day = day_with(&["10:00"]);
        let slot = slot_at_mut(&mut day, "10:00");
        slot.buffer_blocked_until = Some(2_000);
        assert!(matches!(
            check_hold(slot, Ulid::new(), 1_999),
            Err(EngineError::BufferBlocked { until: 2_000, .. })
        ));
        assert!(check_hold(slot, Ulid::new(), 2_000).is_ok());
    }

    #[test]
    fn confirm_guard() {
        let mut day = day_with(&["10:00"]);
        let (alice, bob) = (Ulid::new(), Ulid::new());
        let slot = slot_at_mut(&mut day, "10:00");
        assert!(matches!(
            check_confirm(slot, alice, 0),
            Err(EngineError::HoldInvalidOrExpired(_))
        ));
        hold(slot, alice, 1_000);
        assert!(check_confirm(slot, alice, 1_000).is_ok());
        assert!(matches!(
            check_confirm(slot, bob, 1_000),
            Err(EngineError::HoldInvalidOrExpired(_))
        ));
        assert!(matches!(
            check_confirm(slot, alice, 1_001),
            Err(EngineError::HoldInvalidOrExpired(_))
        ));
        book(slot);
        assert!(matches!(check_confirm(slot, alice, 0), Err(EngineError::AlreadyBooked(_))));
    }

    #[test]
    fn buffer_targets_skip_booked_and_live_holds() {
        let mut day = day_with(&["09:00", "09:30", "10:00", "10:30", "11:00"]);
        hold(slot_at_mut(&mut day, "10:30"), Ulid::new(), 10 * MIN);
        book(slot_at_mut(&mut day, "10:00"));
        let booked = slot_at(&day, "10:00").clone();

        let targets = buffer_targets(&day, &booked, 60, 99 * MIN, 0);
        assert_eq!(targets, vec![slot_at(&day, "09:30").id]);

        // Once the hold lapses the slot is eligible again.
        let targets = buffer_targets(&day, &booked, 60, 99 * MIN, 11 * MIN);
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn buffer_targets_keep_later_buffers() {
        let mut day = day_with(&["09:30", "10:00", "10:30"]);
        book(slot_at_mut(&mut day, "10:00"));
        slot_at_mut(&mut day, "09:30").buffer_blocked_until = Some(50 * MIN);
        slot_at_mut(&mut day, "10:30").buffer_blocked_until = Some(20 * MIN);
        let booked = slot_at(&day, "10:00").clone();

        let targets = buffer_targets(&day, &booked, 60, 30 * MIN, 0);
        assert_eq!(targets, vec![slot_at(&day, "10:30").id]);
        // Same window again is a no-op.
        slot_at_mut(&mut day, "10:30").buffer_blocked_until = Some(30 * MIN);
        assert!(buffer_targets(&day, &booked, 60, 30 * MIN, 0).is_empty());
    }

    #[test]
    fn cancellation_rederives_buffers_from_other_bookings() {
        let mut day = day_with(&["10:00", "10:30", "11:00"]);
        let first = book(slot_at_mut(&mut day, "10:00"));
        let second = book(slot_at_mut(&mut day, "11:00"));
        let first_until = slot_at(&day, "10:00").starts_at() + 60 * MIN;
        let second_until = slot_at(&day, "11:00").starts_at() + 60 * MIN;
        {
            let middle = slot_at_mut(&mut day, "10:30");
            middle.buffer_blocked_until = Some(second_until);
            middle.buffer_booking_id = Some(second);
        }

        let cancelled = slot_at(&day, "11:00").clone();
        let events = cancellation_events(&day, &cancelled, second, 60, 60 * MIN, 0);
        let middle_id = slot_at(&day, "10:30").id;
        assert_eq!(
            events,
            vec![
                Event::BookingCancelled {
                    day: day.key,
                    slot_id: cancelled.id,
                    booking_id: second,
                },
                Event::BufferCleared {
                    day: day.key,
                    slot_id: middle_id,
                },
                // The freed 11:00 slot falls outside the 10:00 booking's strict radius.
                Event::BufferApplied {
                    day: day.key,
                    slot_id: middle_id,
                    booking_id: first,
                    until: first_until,
                },
            ]
        );
    }

    #[test]
    fn cancellation_without_neighbours_is_single_event() {
        let mut day = day_with(&["10:00", "12:00"]);
        let booking = book(slot_at_mut(&mut day, "10:00"));
        let cancelled = slot_at(&day, "10:00").clone();
        let events = cancellation_events(&day, &cancelled, booking, 60, 60 * MIN, 0);
        assert_eq!(events.len(), 1);
    }
}
