use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{HOUR_MS, Ms};

const CHANNEL_CAPACITY: usize = 256;

/// What a notice is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum NoticeTarget {
    Booking(Ulid),
    Consultation(Ulid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    BookingCreated,
    BookingConfirmed,
    BookingStarted,
    BookingCompleted,
    BookingCancelled,
    BookingNoShow,
    BookingRescheduled,
    PaymentReceived,
    Refunded,
    Reminder,
    ConsultationScheduled,
    ConsultationUpdated,
}

impl NoticeKind {
    fn default_subject(self) -> &'static str {
        match self {
            NoticeKind::BookingCreated => "Booking received",
            NoticeKind::BookingConfirmed => "Booking confirmed",
            NoticeKind::BookingStarted => "Appointment started",
            NoticeKind::BookingCompleted => "Thanks for visiting",
            NoticeKind::BookingCancelled => "Booking cancelled",
            NoticeKind::BookingNoShow => "Missed appointment",
            NoticeKind::BookingRescheduled => "Booking rescheduled",
            NoticeKind::PaymentReceived => "Payment received",
            NoticeKind::Refunded => "Refund issued",
            NoticeKind::Reminder => "Appointment reminder",
            NoticeKind::ConsultationScheduled => "Consultation booked",
            NoticeKind::ConsultationUpdated => "Consultation updated",
        }
    }
}

/// Delivery settings for one tenant.
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    /// How long before the start a reminder goes out.
    pub reminder_lead_ms: Ms,
    /// Prepended to every subject line, e.g. the business name.
    pub subject_prefix: Option<String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            reminder_lead_ms: 24 * HOUR_MS,
            subject_prefix: None,
        }
    }
}

/// One outbound message. Transport is somebody else's job; subscribers get
/// the notice and can render `to_json()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub target: NoticeTarget,
    pub service_id: Option<Ulid>,
    pub kind: NoticeKind,
    pub subject: String,
    pub at: Ms,
}

impl Notice {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Fire-and-forget fan-out of notices: one channel per service plus one for
/// the whole tenant. Sending never blocks and never fails the caller.
pub struct NotifyHub {
    config: NotificationConfig,
    channels: DashMap<Ulid, broadcast::Sender<Notice>>,
    all: broadcast::Sender<Notice>,
}

impl NotifyHub {
    pub fn new(config: NotificationConfig) -> Self {
        Self {
            config,
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn config(&self) -> &NotificationConfig {
        &self.config
    }

    pub fn notice(&self, target: NoticeTarget, service_id: Option<Ulid>, kind: NoticeKind, at: Ms) -> Notice {
        let subject = match &self.config.subject_prefix {
            Some(prefix) => format!("{prefix}: {}", kind.default_subject()),
            None => kind.default_subject().to_string(),
        };
        Notice {
            target,
            service_id,
            kind,
            subject,
            at,
        }
    }

    pub fn subscribe(&self, service_id: Ulid) -> broadcast::Receiver<Notice> {
        self.channels
            .entry(service_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notice> {
        self.all.subscribe()
    }

    pub fn dispatch(&self, notice: Notice) {
        tracing::info!(target_kind = ?notice.target, kind = ?notice.kind, "notice: {}", notice.subject);
        metrics::counter!(crate::observability::NOTICES_TOTAL, "kind" => format!("{:?}", notice.kind)).increment(1);
        if let Some(service_id) = notice.service_id
            && let Some(sender) = self.channels.get(&service_id)
        {
            let _ = sender.send(notice.clone());
        }
        let _ = self.all.send(notice);
    }

    /// Drop a service's channel once it is archived.
    pub fn remove(&self, service_id: &Ulid) {
        self.channels.remove(service_id);
    }
}
