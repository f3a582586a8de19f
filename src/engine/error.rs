use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{Ms, TimeFormatError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("provider {provider_id} is not open on {date}")]
    NotOpen { provider_id: Ulid, date: NaiveDate },
    #[error("slot not found: {0}")]
    SlotNotFound(Ulid),
    #[error("slot {slot_id} is held by another customer until {held_until}")]
    HoldConflict { slot_id: Ulid, held_until: Ms },
    #[error("slot {0} has no valid hold for this customer")]
    HoldInvalidOrExpired(Ulid),
    #[error("slot {0} is already booked")]
    AlreadyBooked(Ulid),
    #[error("slot {slot_id} is blocked by a booking buffer until {until}")]
    BufferBlocked { slot_id: Ulid, until: Ms },
    #[error("booking not found: {0}")]
    BookingNotFound(Ulid),
    #[error("availability window not found: {0}")]
    WindowNotFound(Ulid),
    #[error("surcharge rule not found: {0}")]
    RuleNotFound(Ulid),
    #[error("slot {0} is not booked")]
    NotBooked(Ulid),
    #[error("booking {0} already exists")]
    DuplicateBooking(Ulid),
    #[error("availability resolution failed: {0}")]
    ResolutionFailed(String),
    #[error(transparent)]
    InvalidTimeFormat(#[from] TimeFormatError),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Transient infrastructure failures that are safe to retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ResolutionFailed(_) | EngineError::WalError(_))
    }
}
