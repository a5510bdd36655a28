use crate::model::{Booking, HOUR_MS, Ms};

/// How much of what was paid goes back when a booking is cancelled.
pub trait RefundPolicy: Send + Sync {
    /// Percentage (0..=100) of the net amount paid.
    fn refund_percentage(&self, booking: &Booking, cancelled_at: Ms) -> u8;
}

/// Full refund with plenty of notice, a partial one with some, none otherwise.
#[derive(Debug, Clone)]
pub struct TieredRefundPolicy {
    pub full_refund_hours: u32,
    pub partial_refund_hours: u32,
    pub partial_percentage: u8,
}

impl Default for TieredRefundPolicy {
    fn default() -> Self {
        Self {
            full_refund_hours: 48,
            partial_refund_hours: 24,
            partial_percentage: 50,
        }
    }
}

impl RefundPolicy for TieredRefundPolicy {
    fn refund_percentage(&self, booking: &Booking, cancelled_at: Ms) -> u8 {
        let notice = booking.scheduled_at() - cancelled_at;
        if notice >= self.full_refund_hours as Ms * HOUR_MS {
            100
        } else if notice >= self.partial_refund_hours as Ms * HOUR_MS {
            self.partial_percentage.min(100)
        } else {
            0
        }
    }
}
