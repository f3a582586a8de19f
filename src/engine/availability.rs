use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

// ── Sources ───────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SourceError(pub String);

/// Where provider-authored availability comes from.
#[async_trait]
pub trait AvailabilitySource: Send + Sync {
    /// Windows of `provider_id` whose declared range covers `date`, in declaration order.
    async fn windows_covering(
        &self,
        provider_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<AvailabilityWindow>, SourceError>;
}

/// In-memory, WAL-backed availability store.
#[derive(Default)]
pub struct AvailabilityBook {
    by_provider: DashMap<Ulid, Vec<AvailabilityWindow>>,
    owner: DashMap<Ulid, Ulid>,
}

impl AvailabilityBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window_count(&self, provider_id: &Ulid) -> usize {
        self.by_provider.get(provider_id).map_or(0, |w| w.len())
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.owner.contains_key(id)
    }

    pub fn owner_of(&self, id: &Ulid) -> Option<Ulid> {
        self.owner.get(id).map(|e| *e.value())
    }

    /// Declared windows of a provider, in declaration order.
    pub fn windows_of(&self, provider_id: &Ulid) -> Vec<AvailabilityWindow> {
        self.by_provider
            .get(provider_id)
            .map(|w| w.value().clone())
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<AvailabilityWindow> {
        let mut providers: Vec<Ulid> = self.by_provider.iter().map(|e| *e.key()).collect();
        providers.sort();
        providers.iter().flat_map(|p| self.windows_of(p)).collect()
    }

    /// Insert, or replace in place when the id is already declared.
    pub(crate) fn declare(&self, window: AvailabilityWindow) {
        if let Some(previous) = self.owner.get(&window.id).map(|e| *e.value())
            && previous != window.provider_id
        {
            self.withdraw(&window.id);
        }
        self.owner.insert(window.id, window.provider_id);
        let mut list = self.by_provider.entry(window.provider_id).or_default();
        if let Some(existing) = list.iter_mut().find(|w| w.id == window.id) {
            *existing = window;
        } else {
            list.push(window);
        }
    }

    pub(crate) fn withdraw(&self, id: &Ulid) -> Option<Ulid> {
        let (_, provider_id) = self.owner.remove(id)?;
        if let Some(mut list) = self.by_provider.get_mut(&provider_id) {
            list.retain(|w| &w.id != id);
        }
        Some(provider_id)
    }
}

#[async_trait]
impl AvailabilitySource for AvailabilityBook {
    async fn windows_covering(
        &self,
        provider_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<AvailabilityWindow>, SourceError> {
        Ok(self
            .by_provider
            .get(&provider_id)
            .map(|list| list.iter().filter(|w| w.covers(date)).cloned().collect())
            .unwrap_or_default())
    }
}

pub(crate) fn validate_window(window: &AvailabilityWindow) -> Result<(), EngineError> {
    if window.valid_from > window.valid_until {
        return Err(EngineError::InvalidInput("valid_from after valid_until"));
    }
    if window.entries.is_empty() {
        return Err(EngineError::InvalidInput("availability window without entries"));
    }
    if window.entries.len() > MAX_ENTRIES_PER_WINDOW {
        return Err(EngineError::LimitExceeded("too many entries in availability window"));
    }
    if window.entries.iter().any(|e| e.start_time >= e.end_time) {
        return Err(EngineError::InvalidInput("availability entry start_time must precede end_time"));
    }
    Ok(())
}

// ── Resolution ────────────────────────────────────────────────────

/// Which of several overlapping open windows is authoritative for a date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precedence {
    /// Earliest declared window that opens the date.
    #[default]
    FirstDeclared,
    /// Most recently declared window that opens the date.
    LastDeclared,
    /// Longest open interval; ties go to the earliest declared.
    Widest,
}

impl FromStr for Precedence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" | "first_declared" => Ok(Precedence::FirstDeclared),
            "last" | "last_declared" => Ok(Precedence::LastDeclared),
            "widest" => Ok(Precedence::Widest),
            other => Err(format!("unknown availability precedence: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Open(OpenWindow),
    Closed,
}

/// Pick the authoritative open window for `date` from windows in declaration order.
pub fn pick_window(
    windows: &[AvailabilityWindow],
    date: NaiveDate,
    precedence: Precedence,
) -> Option<OpenWindow> {
    let mut open = windows.iter().filter_map(|w| w.open_window_on(date));
    match precedence {
        Precedence::FirstDeclared => open.next(),
        Precedence::LastDeclared => open.last(),
        Precedence::Widest => open.fold(None, |best: Option<OpenWindow>, w| match best {
            Some(b) if b.duration_minutes() >= w.duration_minutes() => Some(b),
            _ => Some(w),
        }),
    }
}

pub struct AvailabilityResolver {
    source: Arc<dyn AvailabilitySource>,
    precedence: Precedence,
}

impl AvailabilityResolver {
    pub fn new(source: Arc<dyn AvailabilitySource>, precedence: Precedence) -> Self {
        Self { source, precedence }
    }

    /// Open window of the provider on `date`, or `Closed`. Source failures are
    /// `ResolutionFailed`, never `Closed`.
    pub async fn resolve(&self, provider_id: Ulid, date: NaiveDate) -> Result<Resolution, EngineError> {
        let windows = self
            .source
            .windows_covering(provider_id, date)
            .await
            .map_err(|e| EngineError::ResolutionFailed(e.to_string()))?;
        Ok(match pick_window(&windows, date, self.precedence) {
            Some(w) => Resolution::Open(w),
            None => Resolution::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
    }

    fn window(provider_id: Ulid, open: bool, start: &str, end: &str) -> AvailabilityWindow {
        AvailabilityWindow {
            id: Ulid::new(),
            provider_id,
            valid_from: day(),
            valid_until: day(),
            entries: vec![DayEntry {
                selector: DaySelector::Date(day()),
                is_available: open,
                start_time: t(start),
                end_time: t(end),
            }],
        }
    }

    struct Unreachable;

    #[async_trait]
    impl AvailabilitySource for Unreachable {
        async fn windows_covering(
            &self,
            _provider_id: Ulid,
            _date: NaiveDate,
        ) -> Result<Vec<AvailabilityWindow>, SourceError> {
            Err(SourceError("connection refused".into()))
        }
    }

    #[test]
    fn precedence_policies() {
        let p = Ulid::new();
        let windows = vec![
            window(p, false, "06:00", "23:00"),
            window(p, true, "10:00", "12:00"),
            window(p, true, "08:00", "18:00"),
            window(p, true, "13:00", "15:00"),
        ];
        assert_eq!(
            pick_window(&windows, day(), Precedence::FirstDeclared),
            Some(OpenWindow { start: t("10:00"), end: t("12:00") })
        );
        assert_eq!(
            pick_window(&windows, day(), Precedence::LastDeclared),
            Some(OpenWindow { start: t("13:00"), end: t("15:00") })
        );
        assert_eq!(
            pick_window(&windows, day(), Precedence::Widest),
            Some(OpenWindow { start: t("08:00"), end: t("18:00") })
        );
    }

    #[test]
    fn widest_ties_go_to_first_declared() {
        let p = Ulid::new();
        let windows = vec![window(p, true, "09:00", "11:00"), window(p, true, "13:00", "15:00")];
        assert_eq!(
            pick_window(&windows, day(), Precedence::Widest),
            Some(OpenWindow { start: t("09:00"), end: t("11:00") })
        );
    }

    #[test]
    fn precedence_parses() {
        assert_eq!("first".parse::<Precedence>().unwrap(), Precedence::FirstDeclared);
        assert_eq!("LAST".parse::<Precedence>().unwrap(), Precedence::LastDeclared);
        assert_eq!("widest".parse::<Precedence>().unwrap(), Precedence::Widest);
        assert!("random".parse::<Precedence>().is_err());
    }

    #[tokio::test]
    async fn resolver_reads_book_in_declaration_order() {
        let book = Arc::new(AvailabilityBook::new());
        let p = Ulid::new();
        book.declare(window(p, true, "09:00", "17:30"));
        book.declare(window(p, true, "12:00", "13:00"));

        let resolver = AvailabilityResolver::new(book.clone(), Precedence::FirstDeclared);
        assert_eq!(
            resolver.resolve(p, day()).await.unwrap(),
            Resolution::Open(OpenWindow { start: t("09:00"), end: t("17:30") })
        );
        assert_eq!(resolver.resolve(Ulid::new(), day()).await.unwrap(), Resolution::Closed);
        let next_day = day().succ_opt().unwrap();
        assert_eq!(resolver.resolve(p, next_day).await.unwrap(), Resolution::Closed);
    }

    #[tokio::test]
    async fn source_failure_is_not_closed() {
        let resolver = AvailabilityResolver::new(Arc::new(Unreachable), Precedence::FirstDeclared);
        let err = resolver.resolve(Ulid::new(), day()).await.unwrap_err();
        assert!(matches!(err, EngineError::ResolutionFailed(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn redeclare_replaces_in_place_and_withdraw_removes() {
        let book = AvailabilityBook::new();
        let p = Ulid::new();
        let first = window(p, true, "09:00", "10:00");
        let second = window(p, true, "11:00", "12:00");
        book.declare(first.clone());
        book.declare(second.clone());

        let mut changed = first.clone();
        changed.entries[0].end_time = t("10:30");
        book.declare(changed.clone());
        let windows = book.windows_of(&p);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0], changed);

        assert_eq!(book.withdraw(&first.id), Some(p));
        assert_eq!(book.windows_of(&p), vec![second]);
        assert_eq!(book.withdraw(&first.id), None);
    }

    #[test]
    fn window_validation() {
        let p = Ulid::new();
        assert!(validate_window(&window(p, true, "09:00", "17:00")).is_ok());
        assert!(validate_window(&window(p, true, "17:00", "09:00")).is_err());
        let mut w = window(p, true, "09:00", "17:00");
        w.valid_until = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        assert!(validate_window(&w).is_err());
        w = window(p, true, "09:00", "17:00");
        w.entries.clear();
        assert!(validate_window(&w).is_err());
    }
}
