mod error;
mod intervals;
mod lifecycle;
mod mutations;
mod pricing;
mod queries;
mod slots;
mod validate;
mod windows;
#[cfg(test)]
mod tests;

pub use error::EngineError;
pub use intervals::{compute_saturated_spans, merge_overlapping, peak_concurrency, subtract_intervals};
pub use lifecycle::{check_booking_transition, check_consultation_transition, check_payment_transition};
pub use mutations::BookingRequest;
pub use pricing::{PackageDiscount, PackagePrice, Quote, QuoteInput, percent_of, price_package, quote};
pub use slots::{SlotQuery, compute_availability, day_candidates, generate_slots, resolve_slot, total_duration_min};
pub use validate::now_ms;
pub use windows::{blocked_spans, windows_for_date};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::gateway::{ManualGateway, PaymentGateway};
use crate::model::*;
use crate::notify::{Notice, NoticeKind, NoticeTarget, NotifyHub};
use crate::refund::{RefundPolicy, TieredRefundPolicy};
use crate::wal::Wal;

pub type SharedServiceState = Arc<RwLock<ServiceState>>;
pub type SharedConsultation = Arc<Mutex<ConsultationBooking>>;

/// Source of "now". Swappable so tests can move time.
pub type Clock = Arc<dyn Fn() -> Ms + Send + Sync>;

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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Takes the first append, drains whatever else is already
/// queued, writes the batch behind a single fsync and answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch.iter().try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so no half-written batch lingers in the buffer.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(path = %wal.path().display(), "WAL flush failed: {e}");
    }

    for (_, tx) in batch {
        let _ = tx.send(match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        });
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
        WalCommand::Append { .. } => {}
    }
}

/// Cross-service lookups maintained alongside the per-service state.
#[derive(Default)]
pub(super) struct Index {
    /// location / window / add-on / booking / payment id → service id
    pub(super) entity_to_service: DashMap<Ulid, Ulid>,
    /// gateway transaction reference → payment id
    pub(super) transaction_refs: DashMap<String, Ulid>,
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedServiceState>,
    pub packages: DashMap<Ulid, ServicePackage>,
    pub consultations: DashMap<Ulid, SharedConsultation>,
    pub notify: Arc<NotifyHub>,
    pub(super) index: Index,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold it shared for their whole run; compaction takes it
    /// exclusively so its snapshot matches the log exactly.
    pub(super) write_gate: RwLock<()>,
    pub(super) gateway: Arc<dyn PaymentGateway>,
    pub(super) refunds: Arc<dyn RefundPolicy>,
    pub(super) clock: Clock,
}

/// Apply an event to one service (caller holds its lock).
fn apply_to_service(ss: &mut ServiceState, event: &Event, index: &Index) {
    match event {
        Event::ServiceUpdated { service } => ss.service = service.clone(),
        Event::ServiceArchived { at, .. } => ss.service.archived_at = Some(*at),
        Event::LocationAdded { location } => {
            index.entity_to_service.insert(location.id, ss.service.id);
            ss.locations.push(location.clone());
        }
        Event::LocationArchived { id, at, .. } => {
            if let Some(l) = ss.locations.iter_mut().find(|l| l.id == *id) {
                l.archived_at = Some(*at);
            }
        }
        Event::WindowAdded { window } => {
            index.entity_to_service.insert(window.id, ss.service.id);
            ss.windows.push(window.clone());
        }
        Event::WindowDeactivated { id, .. } => {
            if let Some(w) = ss.windows.iter_mut().find(|w| w.id == *id) {
                w.is_active = false;
            }
        }
        Event::AddOnAdded { addon } => {
            index.entity_to_service.insert(addon.id, ss.service.id);
            ss.addons.push(addon.clone());
        }
        Event::AddOnUpdated { addon } => {
            if let Some(a) = ss.addons.iter_mut().find(|a| a.id == addon.id) {
                *a = addon.clone();
            }
        }
        Event::AddOnArchived { id, at, .. } => {
            if let Some(a) = ss.addons.iter_mut().find(|a| a.id == *id) {
                a.archived_at = Some(*at);
            }
        }
        Event::BookingCreated { booking } => {
            index.entity_to_service.insert(booking.id, ss.service.id);
            ss.insert_booking(booking.clone());
        }
        Event::BookingTransitioned { id, to, at, reason, .. } => {
            if let Some(b) = ss.booking_mut(*id) {
                lifecycle::apply_booking_transition(b, *to, *at, reason.as_deref());
            }
        }
        Event::BookingRescheduled {
            original_id,
            replacement,
            ..
        } => {
            if let Some(b) = ss.booking_mut(*original_id) {
                b.status = BookingStatus::Rescheduled;
                b.rescheduled_to = Some(replacement.id);
            }
            index.entity_to_service.insert(replacement.id, ss.service.id);
            ss.insert_booking(replacement.clone());
        }
        Event::PaymentRecorded {
            payment,
            payment_status,
            ..
        } => {
            if let Some(b) = ss.booking_mut(payment.booking_id) {
                b.payment_status = *payment_status;
            }
            index.entity_to_service.insert(payment.id, ss.service.id);
            index
                .transaction_refs
                .insert(payment.transaction_reference.clone(), payment.id);
            ss.payments.push(payment.clone());
        }
        Event::ReminderSent { booking_id, .. } => {
            if let Some(b) = ss.booking_mut(*booking_id) {
                b.reminder_sent = true;
            }
        }
        // Handled outside any single service.
        Event::ServiceCreated { .. }
        | Event::PackageCreated { .. }
        | Event::PackageArchived { .. }
        | Event::ConsultationScheduled { .. }
        | Event::ConsultationTransitioned { .. } => {}
    }
}

fn apply_consultation_transition(c: &mut ConsultationBooking, to: ConsultationStatus, at: Ms) {
    c.status = to;
    match to {
        ConsultationStatus::InProgress => c.started_at = Some(at),
        ConsultationStatus::Completed => c.completed_at = Some(at),
        _ => {}
    }
}

/// Service an event belongs to, for events applied under a service lock.
fn event_service_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ServiceUpdated { service } => Some(service.id),
        Event::ServiceArchived { id, .. } => Some(*id),
        Event::LocationAdded { location } => Some(location.service_id),
        Event::WindowAdded { window } => Some(window.service_id),
        Event::AddOnAdded { addon } | Event::AddOnUpdated { addon } => Some(addon.service_id),
        Event::BookingCreated { booking } => Some(booking.service_id),
        Event::LocationArchived { service_id, .. }
        | Event::WindowDeactivated { service_id, .. }
        | Event::AddOnArchived { service_id, .. }
        | Event::BookingTransitioned { service_id, .. }
        | Event::BookingRescheduled { service_id, .. }
        | Event::PaymentRecorded { service_id, .. }
        | Event::ReminderSent { service_id, .. } => Some(*service_id),
        Event::ServiceCreated { .. }
        | Event::PackageCreated { .. }
        | Event::PackageArchived { .. }
        | Event::ConsultationScheduled { .. }
        | Event::ConsultationTransitioned { .. } => None,
    }
}

impl Engine {
    /// Engine with the manual gateway and the default refund tiers.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_collaborators(
            wal_path,
            notify,
            Arc::new(ManualGateway),
            Arc::new(TieredRefundPolicy::default()),
        )
    }

    /// Replays `wal_path` into memory and starts the WAL writer task.
    pub fn with_collaborators(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        gateway: Arc<dyn PaymentGateway>,
        refunds: Arc<dyn RefundPolicy>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            packages: DashMap::new(),
            consultations: DashMap::new(),
            notify,
            index: Index::default(),
            wal_tx,
            write_gate: RwLock::new(()),
            gateway,
            refunds,
            clock: Arc::new(now_ms),
        };

        // Rebuild unlocked, then publish.
        let mut services: HashMap<Ulid, ServiceState> = HashMap::new();
        for event in &events {
            match event {
                Event::ServiceCreated { service } => {
                    services.insert(service.id, ServiceState::new(service.clone()));
                }
                Event::PackageCreated { package } => {
                    engine.packages.insert(package.id, package.clone());
                }
                Event::PackageArchived { id, at } => {
                    if let Some(mut p) = engine.packages.get_mut(id) {
                        p.archived_at = Some(*at);
                    }
                }
                Event::ConsultationScheduled { consultation } => {
                    engine
                        .consultations
                        .insert(consultation.id, Arc::new(Mutex::new(consultation.clone())));
                }
                Event::ConsultationTransitioned { id, to, at } => {
                    if let Some(entry) = engine.consultations.get(id)
                        && let Ok(mut c) = entry.try_lock()
                    {
                        apply_consultation_transition(&mut c, *to, *at);
                    }
                }
                other => {
                    if let Some(sid) = event_service_id(other)
                        && let Some(ss) = services.get_mut(&sid)
                    {
                        apply_to_service(ss, other, &engine.index);
                    }
                }
            }
        }
        for (id, ss) in services {
            engine.state.insert(id, Arc::new(RwLock::new(ss)));
        }

        tracing::info!(
            path = %wal_path.display(),
            events = events.len(),
            services = engine.state.len(),
            "engine replayed"
        );
        Ok(engine)
    }

    /// Replace the clock (tests drive time through this).
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> Ms {
        (self.clock)()
    }

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

    pub fn get_service(&self, id: &Ulid) -> Option<SharedServiceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_service_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.index.entity_to_service.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append, then apply under the caller's lock.
    pub(super) async fn persist_and_apply(&self, ss: &mut ServiceState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_service(ss, event, &self.index);
        Ok(())
    }

    /// Lookup entity → service, acquire that service's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ServiceState>), EngineError> {
        let service_id = self
            .get_service_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let ss = self.get_service(&service_id).ok_or(EngineError::NotFound(service_id))?;
        Ok((service_id, ss.write_owned().await))
    }

    /// Post-commit, fire-and-forget.
    pub(super) fn notify_booking(&self, booking: &Booking, kind: NoticeKind) {
        let notice: Notice = self
            .notify
            .notice(NoticeTarget::Booking(booking.id), Some(booking.service_id), kind, self.now());
        self.notify.dispatch(notice);
    }
}
