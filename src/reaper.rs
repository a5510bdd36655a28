use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// How often a tenant looks for bookings that need a reminder.
pub const REMINDER_INTERVAL: Duration = Duration::from_secs(60);

/// How often a tenant checks whether its WAL has grown enough to compact.
pub const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that sends reminders for bookings entering the lead window.
pub async fn run_reminders(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let sent = engine.send_due_reminders().await;
        if sent > 0 {
            info!("sent {sent} reminders");
        }
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!(appends, "compacted WAL");
            true
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BookingRequest;
    use crate::model::*;
    use crate::notify::{NoticeKind, NotificationConfig, NotifyHub};
    use chrono::{NaiveDate, NaiveTime};
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn at(h: u32) -> Ms {
        instant_at(
            NaiveDate::from_ymd_opt(2030, 3, 5).unwrap(),
            NaiveTime::from_hms_opt(h, 0, 0).unwrap(),
        )
    }

    /// Engine frozen at 08:00 with one auto-confirmed service open 09:00-17:00.
    async fn engine_with_service(name: &str) -> (Arc<Engine>, Ulid) {
        let notify = Arc::new(NotifyHub::new(NotificationConfig::default()));
        let engine = Engine::new(test_wal_path(name), notify)
            .unwrap()
            .with_clock(Arc::new(|| at(8)));
        let sid = Ulid::new();
        engine
            .create_service(Service {
                auto_confirm: true,
                ..Service::new(sid, "Haircut", 4000, 60)
            })
            .await
            .unwrap();
        engine
            .add_window(AvailabilityWindow::new(
                Ulid::new(),
                sid,
                WindowKind::Regular,
                WindowPattern::Daily,
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            ))
            .await
            .unwrap();
        (Arc::new(engine), sid)
    }

    fn booking_at(sid: Ulid, start: Ms) -> BookingRequest {
        BookingRequest {
            id: Ulid::new(),
            user_id: Ulid::new(),
            service_id: sid,
            location_id: None,
            package_id: None,
            window_id: None,
            scheduled_at: start,
            addons: Vec::new(),
            client: ClientDetails::default(),
        }
    }

    #[tokio::test]
    async fn reminder_loop_notifies_upcoming_booking() {
        let (engine, sid) = engine_with_service("reminder_loop.wal").await;
        let booking = engine.create_booking(booking_at(sid, at(10))).await.unwrap();
        let mut rx = engine.notify.subscribe_all();

        let task = tokio::spawn(run_reminders(engine.clone(), Duration::from_millis(10)));
        let notice = loop {
            let n = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("no reminder within 2s")
                .unwrap();
            if n.kind == NoticeKind::Reminder {
                break n;
            }
        };
        task.abort();

        assert_eq!(notice.target, crate::notify::NoticeTarget::Booking(booking.id));
        assert!(engine.get_booking(booking.id).await.unwrap().reminder_sent);
    }

    #[tokio::test]
    async fn compaction_waits_for_threshold() {
        let (engine, sid) = engine_with_service("compact_threshold.wal").await;
        engine.create_booking(booking_at(sid, at(10))).await.unwrap();
        engine.create_booking(booking_at(sid, at(11))).await.unwrap();

        // Service, window and two bookings so far.
        assert!(!compact_if_due(&engine, 100).await);
        assert!(compact_if_due(&engine, 4).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(engine.list_bookings(Some(sid), None).await.len(), 2);
    }
}
