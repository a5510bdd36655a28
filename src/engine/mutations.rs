use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, oneshot};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{NoticeKind, NoticeTarget};

use super::lifecycle::{check_booking_transition, check_consultation_transition, next_payment_status, validate_booking_transition};
use super::pricing::{self, PackageDiscount, QuoteInput};
use super::slots::{SlotQuery, resolve_slot, total_duration_min};
use super::validate::*;
use super::{Engine, EngineError, WalCommand, apply_consultation_transition};

/// Everything needed to book one appointment.
#[derive(Debug, Clone, PartialEq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub user_id: Ulid,
    pub service_id: Ulid,
    pub location_id: Option<Ulid>,
    pub package_id: Option<Ulid>,
    /// Pin the booking to one window when several offer the same start.
    pub window_id: Option<Ulid>,
    pub scheduled_at: Ms,
    pub addons: Vec<AddOnSelection>,
    pub client: ClientDetails,
}

fn booking_notice(status: BookingStatus) -> Option<NoticeKind> {
    match status {
        BookingStatus::Pending => None,
        BookingStatus::Confirmed => Some(NoticeKind::BookingConfirmed),
        BookingStatus::InProgress => Some(NoticeKind::BookingStarted),
        BookingStatus::Completed => Some(NoticeKind::BookingCompleted),
        BookingStatus::Cancelled => Some(NoticeKind::BookingCancelled),
        BookingStatus::NoShow => Some(NoticeKind::BookingNoShow),
        BookingStatus::Rescheduled => Some(NoticeKind::BookingRescheduled),
    }
}

/// A location the booking may use: present and not archived.
fn check_location(ss: &ServiceState, location_id: Option<Ulid>) -> Result<(), EngineError> {
    match location_id {
        Some(id) => match ss.location(id) {
            Some(l) if l.archived_at.is_none() => Ok(()),
            _ => Err(EngineError::validation("location_id", format!("location {id} is not offered"))),
        },
        None if ss.has_active_locations() => {
            Err(EngineError::validation("location_id", "this service requires a location"))
        }
        None => Ok(()),
    }
}

impl Engine {
    // ── Services & master data ───────────────────────────────────

    pub async fn create_service(&self, service: Service) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        validate_service(&service)?;
        if self.state.len() >= MAX_SERVICES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        if self.state.contains_key(&service.id) {
            return Err(EngineError::AlreadyExists(service.id));
        }

        let id = service.id;
        let event = Event::ServiceCreated {
            service: service.clone(),
        };
        self.wal_append(&event).await?;
        self.state.insert(id, Arc::new(RwLock::new(ServiceState::new(service))));
        tracing::debug!(service_id = %id, "service created");
        Ok(())
    }

    /// Edit a service's settings. Existing bookings keep their prices.
    pub async fn update_service(&self, id: Ulid, patch: &ServicePatch) -> Result<Service, EngineError> {
        let _gate = self.write_gate.read().await;
        let ss = self.get_service(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = ss.write().await;
        let service = patch.apply(&guard.service);
        validate_service(&service)?;
        let event = Event::ServiceUpdated {
            service: service.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::debug!(service_id = %id, "service updated");
        Ok(service)
    }

    pub async fn archive_service(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let ss = self.get_service(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = ss.write().await;
        if guard.service.archived_at.is_some() {
            return Ok(());
        }
        let event = Event::ServiceArchived { id, at: self.now() };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);
        self.notify.remove(&id);
        Ok(())
    }

    pub async fn add_location(&self, location: ServiceLocation) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        if location.max_capacity == 0 {
            return Err(EngineError::validation("max_capacity", "must be at least 1"));
        }
        validate_adjustment(location.additional_charge, "additional_charge")?;
        if let Some(name) = &location.name {
            validate_name(name, "name")?;
        }
        if self.get_service_for_entity(&location.id).is_some() {
            return Err(EngineError::AlreadyExists(location.id));
        }
        let ss = self
            .get_service(&location.service_id)
            .ok_or(EngineError::NotFound(location.service_id))?;
        let mut guard = ss.write().await;
        if guard.locations.len() >= MAX_LOCATIONS_PER_SERVICE {
            return Err(EngineError::LimitExceeded("too many locations on service"));
        }
        let event = Event::LocationAdded { location };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn archive_location(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let (service_id, mut guard) = self.resolve_entity_write(&id).await?;
        if guard.location(id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::LocationArchived {
            id,
            service_id,
            at: self.now(),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Blocked windows are stored closed regardless of the flags they came with.
    pub async fn add_window(&self, window: AvailabilityWindow) -> Result<AvailabilityWindow, EngineError> {
        let _gate = self.write_gate.read().await;
        let window = window.normalized();
        validate_window(&window)?;
        if self.get_service_for_entity(&window.id).is_some() {
            return Err(EngineError::AlreadyExists(window.id));
        }
        let ss = self
            .get_service(&window.service_id)
            .ok_or(EngineError::NotFound(window.service_id))?;
        let mut guard = ss.write().await;
        if guard.windows.len() >= MAX_WINDOWS_PER_SERVICE {
            return Err(EngineError::LimitExceeded("too many windows on service"));
        }
        if let Some(lid) = window.location_id
            && guard.location(lid).is_none()
        {
            return Err(EngineError::validation("location_id", format!("location {lid} is not on this service")));
        }
        let event = Event::WindowAdded { window: window.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(window)
    }

    pub async fn deactivate_window(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let (service_id, mut guard) = self.resolve_entity_write(&id).await?;
        if guard.window(id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::WindowDeactivated { id, service_id };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn add_addon(&self, addon: ServiceAddOn) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        validate_addon(&addon)?;
        if self.get_service_for_entity(&addon.id).is_some() {
            return Err(EngineError::AlreadyExists(addon.id));
        }
        let ss = self
            .get_service(&addon.service_id)
            .ok_or(EngineError::NotFound(addon.service_id))?;
        let mut guard = ss.write().await;
        if guard.addons.len() >= MAX_ADDONS_PER_SERVICE {
            return Err(EngineError::LimitExceeded("too many add-ons on service"));
        }
        let event = Event::AddOnAdded { addon };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// New price / limits apply to future bookings only.
    pub async fn update_addon(&self, id: Ulid, patch: &AddOnPatch) -> Result<ServiceAddOn, EngineError> {
        let _gate = self.write_gate.read().await;
        let (_, mut guard) = self.resolve_entity_write(&id).await?;
        let current = guard.addon(id).ok_or(EngineError::NotFound(id))?;
        let addon = patch.apply(current);
        validate_addon(&addon)?;
        let event = Event::AddOnUpdated { addon: addon.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(addon)
    }

    pub async fn archive_addon(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let (service_id, mut guard) = self.resolve_entity_write(&id).await?;
        if guard.addon(id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::AddOnArchived {
            id,
            service_id,
            at: self.now(),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Prices the bundle from the current base prices of its services.
    pub async fn create_package(
        &self,
        id: Ulid,
        name: String,
        mut items: Vec<PackageItem>,
        discount: PackageDiscount,
        deposit: DepositPolicy,
    ) -> Result<ServicePackage, EngineError> {
        let _gate = self.write_gate.read().await;
        validate_name(&name, "name")?;
        validate_deposit(&deposit)?;
        if items.is_empty() {
            return Err(EngineError::validation("items", "a package needs at least one service"));
        }
        if items.len() > MAX_PACKAGE_ITEMS {
            return Err(EngineError::LimitExceeded("too many package items"));
        }
        if self.packages.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let mut base_prices = std::collections::HashMap::new();
        for item in &items {
            if let Some(ss) = self.get_service(&item.service_id) {
                let guard = ss.read().await;
                if guard.service.archived_at.is_none() {
                    base_prices.insert(item.service_id, guard.service.base_price);
                }
            }
        }
        let price = pricing::price_package(&items, |sid| base_prices.get(&sid).copied(), discount)?;
        items.sort_by_key(|i| i.position);

        let package = ServicePackage {
            id,
            name,
            items,
            individual_price_total: price.individual_price_total,
            discount_amount: price.discount_amount,
            discount_percentage: price.discount_percentage,
            total_price: price.total_price,
            deposit,
            archived_at: None,
        };
        let event = Event::PackageCreated {
            package: package.clone(),
        };
        self.wal_append(&event).await?;
        self.packages.insert(id, package.clone());
        Ok(package)
    }

    pub async fn archive_package(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        if !self.packages.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let at = self.now();
        self.wal_append(&Event::PackageArchived { id, at }).await?;
        if let Some(mut p) = self.packages.get_mut(&id) {
            p.archived_at = Some(at);
        }
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────────────

    /// Validate, find the slot, price and commit, all under the service's
    /// write lock so the capacity check and the insert cannot interleave
    /// with another booking for the same service.
    pub async fn create_booking(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        let _gate = self.write_gate.read().await;
        validate_instant(req.scheduled_at, "scheduled_at")?;
        validate_client(&req.client)?;
        if self.get_service_for_entity(&req.id).is_some() {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let package = match req.package_id {
            Some(pid) => {
                let p = self
                    .packages
                    .get(&pid)
                    .filter(|p| p.archived_at.is_none())
                    .map(|p| p.clone())
                    .ok_or_else(|| EngineError::validation("package_id", format!("package {pid} is not offered")))?;
                if !p.includes(req.service_id) {
                    return Err(EngineError::validation(
                        "package_id",
                        format!("package {pid} does not include service {}", req.service_id),
                    ));
                }
                Some(p)
            }
            None => None,
        };

        let ss = self
            .get_service(&req.service_id)
            .ok_or(EngineError::NotFound(req.service_id))?;
        let mut guard = ss.write().await;

        if !guard.service.is_bookable() {
            return Err(EngineError::validation(
                "service_id",
                format!("service {} is not accepting bookings", req.service_id),
            ));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_SERVICE {
            return Err(EngineError::LimitExceeded("too many bookings on service"));
        }
        check_location(&guard, req.location_id)?;
        pricing::resolve_addons(&guard, &req.addons)?;

        let now = self.now();
        let date = date_of(req.scheduled_at)
            .ok_or_else(|| EngineError::validation("scheduled_at", "timestamp out of range"))?;
        let query = SlotQuery {
            location_id: req.location_id,
            from: date,
            to: date,
            duration_min: total_duration_min(&guard, &req.addons),
            exclude_booking: None,
        };
        let slot = match resolve_slot(&guard, &query, req.scheduled_at, req.window_id, now) {
            Ok(slot) => slot,
            Err(e) => {
                if matches!(e, EngineError::Capacity { .. }) {
                    metrics::counter!(crate::observability::BOOKINGS_REJECTED_TOTAL, "reason" => "capacity").increment(1);
                }
                return Err(e);
            }
        };

        let quote = pricing::quote(&QuoteInput {
            state: &guard,
            location_id: req.location_id,
            window: guard.window(slot.window_id),
            package: package.as_ref(),
            addons: &req.addons,
        })?;

        let status = if guard.service.auto_confirm {
            BookingStatus::Confirmed
        } else {
            BookingStatus::Pending
        };
        let booking = Booking {
            id: req.id,
            user_id: req.user_id,
            service_id: req.service_id,
            location_id: req.location_id,
            package_id: req.package_id,
            window_id: slot.window_id,
            span: slot.span,
            addons: quote.addons,
            pricing: quote.pricing,
            status,
            payment_status: PaymentStatus::Pending,
            client: req.client,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            rescheduled_from: None,
            rescheduled_to: None,
            reminder_sent: false,
            created_at: now,
        };

        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        tracing::debug!(booking_id = %booking.id, service_id = %booking.service_id, total = booking.pricing.total_amount, "booking created");
        self.notify_booking(&booking, NoticeKind::BookingCreated);
        if status == BookingStatus::Confirmed {
            self.notify_booking(&booking, NoticeKind::BookingConfirmed);
        }
        Ok(booking)
    }

    /// Move a booking along its status graph. Cancellation refunds per policy;
    /// rescheduling goes through `reschedule_booking`.
    pub async fn transition_booking(
        &self,
        id: Ulid,
        to: BookingStatus,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        match to {
            BookingStatus::Cancelled => return self.cancel_booking(id, reason).await,
            BookingStatus::Rescheduled => {
                return Err(EngineError::validation("status", "reschedule needs a new time"));
            }
            _ => {}
        }
        validate_text(reason.as_deref())?;

        let _gate = self.write_gate.read().await;
        let (service_id, mut guard) = self.resolve_entity_write(&id).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        let now = self.now();
        validate_booking_transition(booking, to, now)?;

        let event = Event::BookingTransitioned {
            id,
            service_id,
            to,
            at: now,
            reason,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let updated = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        drop(guard);

        if let Some(kind) = booking_notice(to) {
            self.notify_booking(&updated, kind);
        }
        Ok(updated)
    }

    /// Cancel, then refund whatever the refund policy allows. A failed refund
    /// leaves the booking cancelled; it can be retried as a manual refund.
    pub async fn cancel_booking(&self, id: Ulid, reason: Option<String>) -> Result<Booking, EngineError> {
        validate_text(reason.as_deref())?;
        let _gate = self.write_gate.read().await;
        let (service_id, mut guard) = self.resolve_entity_write(&id).await?;
        let booking = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        let now = self.now();
        validate_booking_transition(&booking, BookingStatus::Cancelled, now)?;

        let paid = guard.net_paid(id);
        let percentage = self.refunds.refund_percentage(&booking, now).min(100);
        let refund_amount = if paid > 0 {
            pricing::percent_of(paid, percentage as f64)?
        } else {
            0
        };

        let event = Event::BookingTransitioned {
            id,
            service_id,
            to: BookingStatus::Cancelled,
            at: now,
            reason,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let cancelled = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;

        if refund_amount > 0 {
            match self
                .settle(&mut guard, Ulid::new(), &cancelled, PaymentType::Refund, refund_amount, now)
                .await
            {
                Ok(_) => tracing::info!(booking_id = %id, refund_amount, percentage, "cancellation refunded"),
                Err(e) => tracing::warn!(booking_id = %id, refund_amount, "cancellation refund failed: {e}"),
            }
        }
        let updated = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        drop(guard);

        self.notify_booking(&updated, NoticeKind::BookingCancelled);
        if updated.payment_status != cancelled.payment_status {
            self.notify_booking(&updated, NoticeKind::Refunded);
        }
        Ok(updated)
    }

    /// Book the same appointment at a new time. The original stops counting
    /// against capacity, the replacement is confirmed and keeps the payment
    /// status; both changes land in one WAL record.
    pub async fn reschedule_booking(
        &self,
        new_id: Ulid,
        original_id: Ulid,
        scheduled_at: Ms,
        location_id: Option<Ulid>,
    ) -> Result<Booking, EngineError> {
        validate_instant(scheduled_at, "scheduled_at")?;
        let _gate = self.write_gate.read().await;
        if self.get_service_for_entity(&new_id).is_some() {
            return Err(EngineError::AlreadyExists(new_id));
        }
        let (service_id, mut guard) = self.resolve_entity_write(&original_id).await?;
        let original = guard
            .booking(original_id)
            .cloned()
            .ok_or(EngineError::NotFound(original_id))?;
        check_booking_transition(original.status, BookingStatus::Rescheduled)?;

        let location_id = location_id.or(original.location_id);
        check_location(&guard, location_id)?;
        let package = original.package_id.and_then(|pid| self.packages.get(&pid).map(|p| p.clone()));
        let selection = original.addon_selection();
        pricing::resolve_addons(&guard, &selection)?;

        let now = self.now();
        let date = date_of(scheduled_at).ok_or_else(|| EngineError::validation("scheduled_at", "timestamp out of range"))?;
        let query = SlotQuery {
            location_id,
            from: date,
            to: date,
            duration_min: total_duration_min(&guard, &selection),
            exclude_booking: Some(original_id),
        };
        let slot = resolve_slot(&guard, &query, scheduled_at, None, now)?;
        let quote = pricing::quote(&QuoteInput {
            state: &guard,
            location_id,
            window: guard.window(slot.window_id),
            package: package.as_ref(),
            addons: &selection,
        })?;

        let replacement = Booking {
            id: new_id,
            location_id,
            window_id: slot.window_id,
            span: slot.span,
            addons: quote.addons,
            pricing: quote.pricing,
            status: BookingStatus::Confirmed,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            rescheduled_from: Some(original_id),
            rescheduled_to: None,
            reminder_sent: false,
            created_at: now,
            ..original
        };
        let event = Event::BookingRescheduled {
            original_id,
            service_id,
            at: now,
            replacement: replacement.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        tracing::debug!(%original_id, %new_id, "booking rescheduled");
        self.notify_booking(&replacement, NoticeKind::BookingRescheduled);
        Ok(replacement)
    }

    // ── Payments ─────────────────────────────────────────────────

    /// Charge or refund through the gateway and record the outcome.
    /// Caller holds the service lock and has validated `amount`.
    async fn settle(
        &self,
        ss: &mut ServiceState,
        payment_id: Ulid,
        booking: &Booking,
        payment_type: PaymentType,
        amount: Minor,
        now: Ms,
    ) -> Result<Payment, EngineError> {
        let net_paid = ss.net_paid(booking.id);
        let net_after = match payment_type {
            PaymentType::Refund => net_paid - amount,
            _ => net_paid + amount,
        };
        let next_status = next_payment_status(booking, payment_type, net_after)?;

        let receipt = match payment_type {
            PaymentType::Refund => self.gateway.refund(booking.id, amount).await?,
            _ => self.gateway.charge(booking.id, amount).await?,
        };
        if self.index.transaction_refs.contains_key(&receipt.transaction_reference) {
            return Err(EngineError::Gateway(format!(
                "duplicate transaction reference {}",
                receipt.transaction_reference
            )));
        }

        let payment = Payment {
            id: payment_id,
            booking_id: booking.id,
            payment_type,
            amount,
            status: receipt.status,
            gateway: self.gateway.name(),
            transaction_reference: receipt.transaction_reference,
            created_at: now,
        };
        let payment_status = if payment.status == ChargeStatus::Completed {
            next_status
        } else {
            booking.payment_status
        };
        let event = Event::PaymentRecorded {
            service_id: booking.service_id,
            payment: payment.clone(),
            payment_status,
        };
        self.persist_and_apply(ss, &event).await?;
        metrics::counter!(crate::observability::PAYMENTS_TOTAL,
            "type" => payment_type.as_str(), "status" => payment.status.as_str())
        .increment(1);

        if payment.status == ChargeStatus::Failed {
            return Err(EngineError::Gateway(format!(
                "{payment_type} of {amount} for booking {} failed",
                booking.id
            )));
        }
        Ok(payment)
    }

    /// Take a deposit, a payment in full or the final balance. The amount
    /// comes from the booking's price breakdown.
    pub async fn record_payment(
        &self,
        id: Ulid,
        booking_id: Ulid,
        payment_type: PaymentType,
    ) -> Result<Payment, EngineError> {
        let _gate = self.write_gate.read().await;
        if self.get_service_for_entity(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        let (_, mut guard) = self.resolve_entity_write(&booking_id).await?;
        let booking = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        if !booking.occupies_capacity() || booking.status == BookingStatus::NoShow {
            return Err(EngineError::validation(
                "booking_id",
                format!("booking {booking_id} is {}", booking.status),
            ));
        }

        let amount = match payment_type {
            PaymentType::Deposit if booking.pricing.deposit_amount > 0 => booking.pricing.deposit_amount,
            PaymentType::Deposit => {
                return Err(EngineError::validation("payment_type", "no deposit is required"));
            }
            PaymentType::Full => booking.pricing.total_amount,
            PaymentType::Final => booking.pricing.total_amount - guard.net_paid(booking_id),
            PaymentType::Refund => {
                return Err(EngineError::validation("payment_type", "refunds are recorded separately"));
            }
        };
        if amount <= 0 {
            return Err(EngineError::validation("amount", "nothing left to pay"));
        }

        let now = self.now();
        let payment = self.settle(&mut guard, id, &booking, payment_type, amount, now).await?;
        drop(guard);

        if payment.status == ChargeStatus::Completed {
            self.notify_booking(&booking, NoticeKind::PaymentReceived);
        }
        Ok(payment)
    }

    pub async fn refund_booking(&self, id: Ulid, booking_id: Ulid, amount: Minor) -> Result<Payment, EngineError> {
        let _gate = self.write_gate.read().await;
        if self.get_service_for_entity(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        let (_, mut guard) = self.resolve_entity_write(&booking_id).await?;
        let booking = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        if let Some(replacement) = booking.rescheduled_to {
            return Err(EngineError::validation(
                "booking_id",
                format!("booking {booking_id} was rescheduled; refund {replacement} instead"),
            ));
        }
        let paid = guard.net_paid(booking_id);
        if amount <= 0 || amount > paid {
            return Err(EngineError::validation("amount", format!("{amount} is outside 1..={paid}")));
        }

        let now = self.now();
        let payment = self
            .settle(&mut guard, id, &booking, PaymentType::Refund, amount, now)
            .await?;
        drop(guard);

        self.notify_booking(&booking, NoticeKind::Refunded);
        Ok(payment)
    }

    // ── Reminders ────────────────────────────────────────────────

    /// Remind every confirmed booking starting within the lead time, once.
    /// Returns how many reminders went out.
    pub async fn send_due_reminders(&self) -> usize {
        let now = self.now();
        let lead = self.notify.config().reminder_lead_ms;

        let mut due = Vec::new();
        for entry in self.state.iter() {
            let ss = entry.value().clone();
            // Busy services are picked up on the next tick.
            if let Ok(guard) = ss.try_read() {
                for b in guard.overlapping(&Span::new(now, now + lead + 1)) {
                    if b.status == BookingStatus::Confirmed && !b.reminder_sent && b.scheduled_at() > now {
                        due.push((b.id, guard.service.id));
                    }
                }
            }
        }

        let mut sent = 0;
        for (booking_id, service_id) in due {
            match self.mark_reminded(booking_id, service_id).await {
                Ok(Some(booking)) => {
                    self.notify_booking(&booking, NoticeKind::Reminder);
                    sent += 1;
                }
                Ok(None) => {}
                Err(e) => tracing::debug!(%booking_id, "reminder skipped: {e}"),
            }
        }
        if sent > 0 {
            metrics::counter!(crate::observability::REMINDERS_SENT_TOTAL).increment(sent as u64);
        }
        sent
    }

    async fn mark_reminded(&self, booking_id: Ulid, service_id: Ulid) -> Result<Option<Booking>, EngineError> {
        let _gate = self.write_gate.read().await;
        let ss = self.get_service(&service_id).ok_or(EngineError::NotFound(service_id))?;
        let mut guard = ss.write().await;
        // Re-check: the booking may have moved on since it was collected.
        match guard.booking(booking_id) {
            Some(b) if b.status == BookingStatus::Confirmed && !b.reminder_sent => {}
            _ => return Ok(None),
        }
        let event = Event::ReminderSent { booking_id, service_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(guard.booking(booking_id).cloned())
    }

    // ── Consultations ────────────────────────────────────────────

    pub async fn schedule_consultation(&self, consultation: ConsultationBooking) -> Result<ConsultationBooking, EngineError> {
        let _gate = self.write_gate.read().await;
        validate_instant(consultation.span.start, "scheduled_at")?;
        validate_instant(consultation.span.end, "ends_at")?;
        validate_text(consultation.notes.as_deref())?;
        if self.consultations.contains_key(&consultation.id) {
            return Err(EngineError::AlreadyExists(consultation.id));
        }
        if let Some(bid) = consultation.booking_id
            && self.get_service_for_entity(&bid).is_none()
        {
            return Err(EngineError::NotFound(bid));
        }

        let consultation = ConsultationBooking {
            status: ConsultationStatus::Scheduled,
            started_at: None,
            completed_at: None,
            ..consultation
        };
        let event = Event::ConsultationScheduled {
            consultation: consultation.clone(),
        };
        self.wal_append(&event).await?;
        self.consultations
            .insert(consultation.id, Arc::new(Mutex::new(consultation.clone())));

        let notice = self.notify.notice(
            NoticeTarget::Consultation(consultation.id),
            None,
            NoticeKind::ConsultationScheduled,
            self.now(),
        );
        self.notify.dispatch(notice);
        Ok(consultation)
    }

    pub async fn transition_consultation(&self, id: Ulid, to: ConsultationStatus) -> Result<ConsultationBooking, EngineError> {
        let _gate = self.write_gate.read().await;
        let shared = self
            .consultations
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        let mut guard = shared.lock().await;
        check_consultation_transition(guard.status, to)?;

        let at = self.now();
        self.wal_append(&Event::ConsultationTransitioned { id, to, at }).await?;
        apply_consultation_transition(&mut guard, to, at);
        let updated = guard.clone();
        drop(guard);

        let notice = self
            .notify
            .notice(NoticeTarget::Consultation(id), None, NoticeKind::ConsultationUpdated, at);
        self.notify.dispatch(notice);
        Ok(updated)
    }

    // ── WAL maintenance ──────────────────────────────────────────

    /// Rewrite the WAL as the minimal event set that recreates current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;
        let mut events = Vec::new();

        for entry in self.packages.iter() {
            events.push(Event::PackageCreated {
                package: entry.value().clone(),
            });
        }

        let services: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        for ss in services {
            let guard = ss.read().await;
            events.push(Event::ServiceCreated {
                service: guard.service.clone(),
            });
            for location in &guard.locations {
                events.push(Event::LocationAdded {
                    location: location.clone(),
                });
            }
            for window in &guard.windows {
                events.push(Event::WindowAdded { window: window.clone() });
            }
            for addon in &guard.addons {
                events.push(Event::AddOnAdded { addon: addon.clone() });
            }
            for booking in &guard.bookings {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                });
            }
            for payment in &guard.payments {
                let payment_status = guard
                    .booking(payment.booking_id)
                    .map_or(PaymentStatus::Pending, |b| b.payment_status);
                events.push(Event::PaymentRecorded {
                    service_id: guard.service.id,
                    payment: payment.clone(),
                    payment_status,
                });
            }
        }

        let consultations: Vec<_> = self.consultations.iter().map(|e| e.value().clone()).collect();
        for c in consultations {
            events.push(Event::ConsultationScheduled {
                consultation: c.lock().await.clone(),
            });
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn validate_addon(addon: &ServiceAddOn) -> Result<(), EngineError> {
    validate_name(&addon.name, "name")?;
    validate_price(addon.price, "price")?;
    if addon.duration_min > MAX_DURATION_MIN {
        return Err(EngineError::validation(
            "duration_min",
            format!("{} is over {MAX_DURATION_MIN}", addon.duration_min),
        ));
    }
    if !(1..=MAX_ADDON_QUANTITY).contains(&addon.max_quantity) {
        return Err(EngineError::validation(
            "max_quantity",
            format!("{} is outside 1..={MAX_ADDON_QUANTITY}", addon.max_quantity),
        ));
    }
    Ok(())
}
