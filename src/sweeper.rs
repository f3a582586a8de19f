use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::Engine;

/// Periodically reclaim expired holds and lapsed buffers until `cancel` fires.
pub async fn run_sweeper(engine: Arc<Engine>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("expiry sweeper stopped");
                return;
            }
            _ = interval.tick() => {
                let report = engine.run_expiry_sweep(engine.now_ms()).await;
                if report.expired_holds > 0 {
                    info!("reaped {} expired holds", report.expired_holds);
                }
                engine.notify.prune();
            }
        }
    }
}

/// Compact the WAL whenever `threshold` appends have accumulated since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("compactor stopped");
                return;
            }
            _ = interval.tick() => {
                let appends = engine.wal_appends_since_compact().await;
                if appends < threshold {
                    continue;
                }
                match engine.compact_wal().await {
                    Ok(()) => info!("WAL compacted after {appends} appends"),
                    Err(e) => error!("WAL compaction failed: {e}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::{EngineOptions, EngineSettings};
    use crate::model::*;
    use crate::notify::NotifyHub;
    use chrono::NaiveDate;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_sweeper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn engine_with_open_day(name: &str, clock: Arc<ManualClock>) -> (Arc<Engine>, Vec<Slot>) {
        let options = EngineOptions {
            settings: EngineSettings::default(),
            clock,
            availability_source: None,
        };
        let engine = Arc::new(Engine::open(test_wal_path(name), Arc::new(NotifyHub::new()), options).unwrap());
        let provider = Ulid::new();
        let date = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        engine
            .declare_availability(AvailabilityWindow {
                id: Ulid::new(),
                provider_id: provider,
                valid_from: date,
                valid_until: date,
                entries: vec![DayEntry {
                    selector: DaySelector::Date(date),
                    is_available: true,
                    start_time: "09:00".parse().unwrap(),
                    end_time: "17:30".parse().unwrap(),
                }],
            })
            .await
            .unwrap();
        let slots = engine.generate_slots(provider, date, 120).await.unwrap();
        (engine, slots)
    }

    #[tokio::test]
    async fn sweeper_reaps_expired_holds_then_stops() {
        let clock = Arc::new(ManualClock::new(1_741_593_600_000));
        let (engine, slots) = engine_with_open_day("sweeper_reaps.wal", clock.clone()).await;
        let slot_id = slots[0].id;
        engine
            .hold_slot(slot_id, Ulid::new(), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        clock.advance(61_000);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_sweeper(engine.clone(), Duration::from_millis(10), cancel.clone()));
        for _ in 0..100 {
            if engine.get_slot(slot_id).await.unwrap().status == SlotStatus::Available {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let slot = engine.get_slot(slot_id).await.unwrap();
        assert_eq!(slot.status, SlotStatus::Available);
        assert_eq!(slot.held_by, None);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn sweeper_leaves_live_holds_alone() {
        let clock = Arc::new(ManualClock::new(1_741_593_600_000));
        let (engine, slots) = engine_with_open_day("sweeper_live.wal", clock.clone()).await;
        let user = Ulid::new();
        engine.hold_slot(slots[1].id, user, None).await.unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_sweeper(engine.clone(), Duration::from_millis(5), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();

        let slot = engine.get_slot(slots[1].id).await.unwrap();
        assert_eq!(slot.status, SlotStatus::Held);
        assert_eq!(slot.held_by, Some(user));
    }

    #[tokio::test]
    async fn compactor_stops_on_cancel() {
        let clock = Arc::new(ManualClock::new(1_741_593_600_000));
        let (engine, _) = engine_with_open_day("compactor_cancel.wal", clock).await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_compactor(engine, 1, cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
