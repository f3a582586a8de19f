use crate::limits::MIN_GRID_STEP_MINUTES;
use crate::model::*;

/// The process-wide grid of bookable ticks. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotCatalog {
    step_minutes: u32,
    ticks: Vec<SlotDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("grid step of {0} minutes is below the minimum")]
    StepTooSmall(u32),
    #[error("grid start {start} is after grid end {end}")]
    Inverted { start: TimeOfDay, end: TimeOfDay },
}

impl SlotCatalog {
    /// Ticks from `first` through `last` inclusive, every `step_minutes`.
    pub fn build(first: TimeOfDay, last: TimeOfDay, step_minutes: u32) -> Result<Self, CatalogError> {
        if step_minutes < MIN_GRID_STEP_MINUTES {
            return Err(CatalogError::StepTooSmall(step_minutes));
        }
        if first > last {
            return Err(CatalogError::Inverted { start: first, end: last });
        }
        let mut ticks = Vec::new();
        let mut cur = Some(first);
        while let Some(time) = cur.filter(|t| *t <= last) {
            ticks.push(SlotDefinition {
                time,
                label: time.label(),
                sort_order: ticks.len() as u32,
            });
            cur = time.plus_minutes(step_minutes);
        }
        Ok(Self { step_minutes, ticks })
    }

    pub fn step_minutes(&self) -> u32 {
        self.step_minutes
    }

    pub fn ticks(&self) -> &[SlotDefinition] {
        &self.ticks
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    /// Ticks inside the half-open window, in sort order.
    pub fn within(&self, window: OpenWindow) -> impl Iterator<Item = &SlotDefinition> {
        self.ticks.iter().filter(move |d| window.contains(d.time))
    }
}

impl Default for SlotCatalog {
    /// 09:00 through 17:30 every 30 minutes.
    fn default() -> Self {
        Self {
            step_minutes: 30,
            ticks: (0..18u32)
                .filter_map(|i| TimeOfDay::from_minutes(9 * 60 + i * 30))
                .enumerate()
                .map(|(i, time)| SlotDefinition {
                    time,
                    label: time.label(),
                    sort_order: i as u32,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    #[test]
    fn default_grid_is_nine_to_five_thirty() {
        let catalog = SlotCatalog::default();
        assert_eq!(catalog.len(), 18);
        assert_eq!(catalog.ticks()[0].time, t("09:00"));
        assert_eq!(catalog.ticks()[0].label, "9:00 AM");
        assert_eq!(catalog.ticks()[17].time, t("17:30"));
        assert_eq!(catalog.ticks()[17].sort_order, 17);
        assert_eq!(catalog, SlotCatalog::build(t("09:00"), t("17:30"), 30).unwrap());
    }

    #[test]
    fn build_stops_at_end_of_day() {
        let catalog = SlotCatalog::build(t("22:00"), t("23:59"), 60).unwrap();
        let times: Vec<String> = catalog.ticks().iter().map(|d| d.time.to_string()).collect();
        assert_eq!(times, vec!["22:00", "23:00"]);
    }

    #[test]
    fn build_rejects_bad_grids() {
        assert_eq!(
            SlotCatalog::build(t("09:00"), t("17:00"), 1),
            Err(CatalogError::StepTooSmall(1))
        );
        assert!(matches!(
            SlotCatalog::build(t("17:00"), t("09:00"), 30),
            Err(CatalogError::Inverted { .. })
        ));
    }

    #[test]
    fn within_uses_half_open_window() {
        let catalog = SlotCatalog::default();
        let window = OpenWindow { start: t("09:00"), end: t("17:30") };
        let ticks: Vec<TimeOfDay> = catalog.within(window).map(|d| d.time).collect();
        assert_eq!(ticks.len(), 17);
        assert_eq!(ticks.first(), Some(&t("09:00")));
        assert_eq!(ticks.last(), Some(&t("17:00")));

        let narrow = OpenWindow { start: t("10:15"), end: t("11:00") };
        let ticks: Vec<TimeOfDay> = catalog.within(narrow).map(|d| d.time).collect();
        assert_eq!(ticks, vec![t("10:30")]);
    }
}
