use crate::model::*;

use super::EngineError;

// ── Booking status ───────────────────────────────────────────────

impl BookingStatus {
    pub fn can_transition_to(self, to: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, to),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, InProgress)
                | (Confirmed, Cancelled)
                | (Confirmed, NoShow)
                | (Confirmed, Rescheduled)
                | (InProgress, Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::NoShow | BookingStatus::Rescheduled
        )
    }
}

impl PaymentStatus {
    pub fn can_transition_to(self, to: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, to),
            (Pending, DepositPaid)
                | (Pending, FullyPaid)
                | (DepositPaid, FullyPaid)
                | (DepositPaid, PartiallyRefunded)
                | (DepositPaid, Refunded)
                | (FullyPaid, PartiallyRefunded)
                | (FullyPaid, Refunded)
                | (PartiallyRefunded, Refunded)
        )
    }
}

impl ConsultationStatus {
    pub fn can_transition_to(self, to: ConsultationStatus) -> bool {
        use ConsultationStatus::*;
        matches!(
            (self, to),
            (Scheduled, InProgress) | (Scheduled, Cancelled) | (Scheduled, NoShow) | (InProgress, Completed)
        )
    }
}

pub fn check_booking_transition(from: BookingStatus, to: BookingStatus) -> Result<(), EngineError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

pub fn check_payment_transition(from: PaymentStatus, to: PaymentStatus) -> Result<(), EngineError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

pub fn check_consultation_transition(from: ConsultationStatus, to: ConsultationStatus) -> Result<(), EngineError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

/// Status graph plus the time rules attached to individual edges.
pub fn validate_booking_transition(booking: &Booking, to: BookingStatus, now: Ms) -> Result<(), EngineError> {
    check_booking_transition(booking.status, to)?;
    match to {
        BookingStatus::Cancelled if now >= booking.ends_at() => Err(EngineError::validation(
            "status",
            format!("booking {} has already ended", booking.id),
        )),
        BookingStatus::NoShow if now < booking.scheduled_at() => Err(EngineError::validation(
            "status",
            format!("booking {} has not started yet", booking.id),
        )),
        BookingStatus::NoShow if booking.started_at.is_some() => Err(EngineError::validation(
            "status",
            format!("booking {} was started", booking.id),
        )),
        _ => Ok(()),
    }
}

/// Record the side fields of a transition. The caller has validated it.
pub fn apply_booking_transition(booking: &mut Booking, to: BookingStatus, at: Ms, reason: Option<&str>) {
    booking.status = to;
    match to {
        BookingStatus::InProgress => booking.started_at = Some(at),
        BookingStatus::Completed => booking.completed_at = Some(at),
        BookingStatus::Cancelled => {
            booking.cancelled_at = Some(at);
            booking.cancellation_reason = reason.map(str::to_owned);
        }
        _ => {}
    }
}

/// Payment status after recording `payment_type` worth `amount`, given what
/// has been paid so far.
pub fn next_payment_status(
    booking: &Booking,
    payment_type: PaymentType,
    net_paid_after: Minor,
) -> Result<PaymentStatus, EngineError> {
    let to = match payment_type {
        PaymentType::Deposit => PaymentStatus::DepositPaid,
        PaymentType::Full | PaymentType::Final => PaymentStatus::FullyPaid,
        PaymentType::Refund if net_paid_after <= 0 => PaymentStatus::Refunded,
        PaymentType::Refund => PaymentStatus::PartiallyRefunded,
    };
    check_payment_transition(booking.payment_status, to)?;
    // A final payment settles a deposit; paying in full skips it.
    match (payment_type, booking.payment_status) {
        (PaymentType::Final, PaymentStatus::DepositPaid) | (PaymentType::Full, PaymentStatus::Pending) => Ok(to),
        (PaymentType::Final, from) | (PaymentType::Full, from) => Err(EngineError::InvalidTransition {
            from: from.as_str(),
            to: to.as_str(),
        }),
        _ => Ok(to),
    }
}
