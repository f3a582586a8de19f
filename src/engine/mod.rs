mod availability;
mod catalog;
mod error;
mod expiry;
mod generator;
mod guards;
mod mutations;
mod queries;
mod store;
mod surcharge;

pub use availability::{
    AvailabilityBook, AvailabilityResolver, AvailabilitySource, Precedence, Resolution, SourceError,
    pick_window,
};
pub use catalog::{CatalogError, SlotCatalog};
pub use error::EngineError;
pub use store::{SharedDay, SlotStore};
pub use surcharge::{SurchargeBook, is_eligible, price_at, price_for};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedRwLockWriteGuard, broadcast, mpsc, oneshot};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One flush_sync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut pending = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = pending {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so buffered bytes never leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

// ── Settings ─────────────────────────────────────────────

/// Booking policy knobs fixed for the lifetime of an engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// TTL used when a hold request does not carry its own.
    pub hold_ttl: Duration,
    /// Neighbour radius around a confirmed booking, applied on both sides.
    pub buffer: Duration,
    pub catalog: Arc<SlotCatalog>,
    pub precedence: Precedence,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            hold_ttl: Duration::from_secs(7 * 60),
            buffer: Duration::from_secs(60 * 60),
            catalog: Arc::new(SlotCatalog::default()),
            precedence: Precedence::FirstDeclared,
        }
    }
}

impl EngineSettings {
    pub(super) fn buffer_ms(&self) -> Ms {
        self.buffer.as_millis() as Ms
    }

    pub(super) fn buffer_minutes(&self) -> u32 {
        (self.buffer.as_secs() / 60) as u32
    }
}

pub struct EngineOptions {
    pub settings: EngineSettings,
    pub clock: Arc<dyn Clock>,
    /// External availability source. `None` resolves against the engine's own book.
    pub availability_source: Option<Arc<dyn AvailabilitySource>>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            settings: EngineSettings::default(),
            clock: Arc::new(SystemClock),
            availability_source: None,
        }
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(super) store: SlotStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) availability: Arc<AvailabilityBook>,
    pub(super) resolver: AvailabilityResolver,
    pub(super) surcharges: SurchargeBook,
    pub(super) settings: EngineSettings,
    pub(super) clock: Arc<dyn Clock>,
    /// Serializes availability and surcharge writes so WAL order matches apply order.
    pub(super) admin_lock: Mutex<()>,
}

impl Engine {
    pub fn open(wal_path: PathBuf, notify: Arc<NotifyHub>, options: EngineOptions) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let availability = Arc::new(AvailabilityBook::new());
        let source: Arc<dyn AvailabilitySource> = match options.availability_source {
            Some(source) => source,
            None => availability.clone(),
        };
        let engine = Self {
            store: SlotStore::new(),
            wal_tx,
            notify,
            availability,
            resolver: AvailabilityResolver::new(source, options.settings.precedence),
            surcharges: SurchargeBook::new(),
            settings: options.settings,
            clock: options.clock,
            admin_lock: Mutex::new(()),
        };

        // Sole owner of every day lock during replay, so try_write never contends.
        // blocking_write would panic here when a tenant is opened from async context.
        for event in &events {
            match event.day() {
                Some(key) => {
                    let day = engine.store.day_or_create(key);
                    let mut guard = day
                        .try_write()
                        .map_err(|_| io::Error::other("replay: day schedule already locked"))?;
                    engine.store.apply(&mut guard, event);
                }
                None => engine.apply_catalog_event(event),
            }
        }
        if !events.is_empty() {
            tracing::info!(
                "replayed {} events from {}: {} days, {} slots",
                events.len(),
                wal_path.display(),
                engine.store.day_count(),
                engine.store.slot_count()
            );
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    fn publish(&self, event: &Event) {
        if let Some(provider_id) = event.provider_id() {
            self.notify.send(provider_id, event);
        }
    }

    /// WAL-append, apply to the locked day, notify. State only changes once the record is durable.
    pub(super) async fn persist_and_apply(
        &self,
        day: &mut DaySchedule,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply(day, event);
        self.publish(event);
        Ok(())
    }

    /// Same as [`Self::persist_and_apply`] for availability and surcharge events.
    /// Callers hold `admin_lock`.
    pub(super) async fn persist_catalog_event(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_catalog_event(event);
        self.publish(event);
        Ok(())
    }

    fn apply_catalog_event(&self, event: &Event) {
        match event {
            Event::AvailabilityDeclared { window } => self.availability.declare(window.clone()),
            Event::AvailabilityWithdrawn { id, .. } => {
                self.availability.withdraw(id);
            }
            Event::SurchargeRuleSet { rule } => self.surcharges.put(rule.clone()),
            Event::SurchargeRuleDeleted { id } => {
                self.surcharges.remove(id);
            }
            _ => {}
        }
    }

    /// Lookup slot → day, acquire the day's write lock.
    /// The slot may have been revoked while waiting; callers re-check under the lock.
    pub(super) async fn resolve_slot_write(
        &self,
        slot_id: Ulid,
    ) -> Result<(DayKey, OwnedRwLockWriteGuard<DaySchedule>), EngineError> {
        let key = self
            .store
            .day_of_slot(&slot_id)
            .ok_or(EngineError::SlotNotFound(slot_id))?;
        let day = self.store.day(&key).ok_or(EngineError::SlotNotFound(slot_id))?;
        Ok((key, day.write_owned().await))
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Every persisted change touching `provider_id`'s slots or availability.
    pub fn subscribe(&self, provider_id: Ulid) -> broadcast::Receiver<Event> {
        self.notify.subscribe(provider_id)
    }
}
