use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::pricing::{self, QuoteInput};
use super::slots::{self, SlotQuery, total_duration_min};
use super::windows::windows_for_date;
use super::{Engine, EngineError};

fn check_range(from: NaiveDate, to: NaiveDate) -> Result<(), EngineError> {
    if to < from {
        return Err(EngineError::validation("to", "must not be before from"));
    }
    if (to - from).num_days() >= MAX_SLOT_QUERY_DAYS {
        return Err(EngineError::LimitExceeded("date range too wide"));
    }
    Ok(())
}

impl Engine {
    pub async fn service(&self, id: Ulid) -> Result<ServiceState, EngineError> {
        let ss = self.get_service(&id).ok_or(EngineError::NotFound(id))?;
        let guard = ss.read().await;
        Ok(guard.clone())
    }

    /// Every service, archived ones included, ordered by id.
    pub async fn list_services(&self) -> Vec<Service> {
        let shared: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(shared.len());
        for ss in shared {
            out.push(ss.read().await.service.clone());
        }
        out.sort_by_key(|s| s.id);
        out
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let service_id = self.get_service_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let ss = self.get_service(&service_id).ok_or(EngineError::NotFound(service_id))?;
        let guard = ss.read().await;
        guard.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Bookings filtered by service and/or user, chronological.
    pub async fn list_bookings(&self, service_id: Option<Ulid>, user_id: Option<Ulid>) -> Vec<Booking> {
        let shared: Vec<_> = match service_id {
            Some(sid) => self.get_service(&sid).into_iter().collect(),
            None => self.state.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::new();
        for ss in shared {
            let guard = ss.read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| user_id.is_none_or(|u| b.user_id == u))
                    .cloned(),
            );
        }
        out.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn payments_for(&self, booking_id: Ulid) -> Result<Vec<Payment>, EngineError> {
        let service_id = self
            .get_service_for_entity(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let ss = self.get_service(&service_id).ok_or(EngineError::NotFound(service_id))?;
        let guard = ss.read().await;
        if guard.booking(booking_id).is_none() {
            return Err(EngineError::NotFound(booking_id));
        }
        Ok(guard.payments_for(booking_id).cloned().collect())
    }

    pub fn get_package(&self, id: Ulid) -> Result<ServicePackage, EngineError> {
        self.packages
            .get(&id)
            .map(|p| p.clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub fn list_packages(&self) -> Vec<ServicePackage> {
        let mut out: Vec<_> = self.packages.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|p| p.id);
        out
    }

    pub async fn get_consultation(&self, id: Ulid) -> Result<ConsultationBooking, EngineError> {
        let shared = self
            .consultations
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        let c = shared.lock().await;
        Ok(c.clone())
    }

    /// Open start times for a service, sized for the given add-ons.
    pub async fn available_slots(
        &self,
        service_id: Ulid,
        location_id: Option<Ulid>,
        from: NaiveDate,
        to: NaiveDate,
        addons: &[AddOnSelection],
    ) -> Result<Vec<Slot>, EngineError> {
        check_range(from, to)?;
        let ss = self.get_service(&service_id).ok_or(EngineError::NotFound(service_id))?;
        let guard = ss.read().await;
        if !guard.service.is_bookable() {
            return Ok(Vec::new());
        }
        let query = SlotQuery {
            location_id,
            from,
            to,
            duration_min: total_duration_min(&guard, addons),
            exclude_booking: None,
        };
        Ok(slots::generate_slots(&guard, &query, self.now()).collect())
    }

    /// Price a prospective booking without committing anything.
    pub async fn quote_booking(
        &self,
        service_id: Ulid,
        location_id: Option<Ulid>,
        window_id: Option<Ulid>,
        package_id: Option<Ulid>,
        addons: &[AddOnSelection],
    ) -> Result<PriceBreakdown, EngineError> {
        let package = match package_id {
            Some(pid) => Some(self.get_package(pid)?),
            None => None,
        };
        let ss = self.get_service(&service_id).ok_or(EngineError::NotFound(service_id))?;
        let guard = ss.read().await;
        let window = match window_id {
            Some(wid) => Some(guard.window(wid).ok_or(EngineError::NotFound(wid))?),
            None => None,
        };
        let quote = pricing::quote(&QuoteInput {
            state: &guard,
            location_id,
            window,
            package: package.as_ref(),
            addons,
        })?;
        Ok(quote.pricing)
    }

    /// Free time for a service (and location) across a date range.
    pub async fn availability(
        &self,
        service_id: Ulid,
        location_id: Option<Ulid>,
        from: NaiveDate,
        to: NaiveDate,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        check_range(from, to)?;
        let ss = self.get_service(&service_id).ok_or(EngineError::NotFound(service_id))?;
        let guard = ss.read().await;
        Ok(slots::compute_availability(
            &guard,
            location_id,
            from,
            to,
            self.now(),
            min_duration_ms,
        ))
    }

    /// Windows in effect on `date`, most specific first.
    pub async fn windows_on(
        &self,
        service_id: Ulid,
        location_id: Option<Ulid>,
        date: NaiveDate,
    ) -> Result<Vec<AvailabilityWindow>, EngineError> {
        let ss = self.get_service(&service_id).ok_or(EngineError::NotFound(service_id))?;
        let guard = ss.read().await;
        Ok(windows_for_date(&guard, location_id, date)
            .into_iter()
            .cloned()
            .collect())
    }
}
