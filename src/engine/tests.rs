use super::*;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{NaiveDate, NaiveTime};
use tokio_test::{assert_err, assert_ok};

use crate::gateway::{GatewayError, GatewayReceipt, mock::MockGateway};
use crate::notify::NotificationConfig;

fn day() -> NaiveDate {
    // A Tuesday.
    NaiveDate::from_ymd_opt(2030, 3, 5).unwrap()
}

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn at(h: u32, m: u32) -> Ms {
    instant_at(day(), t(h, m))
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

/// Clock parked a week before `day()`; tests move it by storing into the atomic.
fn test_clock() -> (Arc<AtomicI64>, Clock) {
    let now = Arc::new(AtomicI64::new(at(0, 0) - 7 * DAY_MS));
    let handle = now.clone();
    (now, Arc::new(move || handle.load(Ordering::SeqCst)))
}

fn hub() -> Arc<NotifyHub> {
    Arc::new(NotifyHub::new(NotificationConfig::default()))
}

fn open(path: PathBuf) -> (Engine, Arc<AtomicI64>) {
    let (now, clock) = test_clock();
    let engine = Engine::new(path, hub()).unwrap().with_clock(clock);
    (engine, now)
}

struct Massage {
    service: Ulid,
    location: Ulid,
    window: Ulid,
    stones: Ulid,
}

/// 120.00 for an hour, 30% deposit, hot stones at 15.00 (max 2), a client
/// location 20.00 cheaper, and a daily 09:00-17:00 window carrying +50.00.
async fn massage(engine: &Engine) -> Massage {
    let service = Ulid::new();
    engine
        .create_service(Service {
            deposit: DepositPolicy::Percentage(30.0),
            auto_confirm: true,
            ..Service::new(service, "Massage", 12000, 60)
        })
        .await
        .unwrap();

    let location = Ulid::new();
    engine
        .add_location(ServiceLocation {
            additional_charge: -2000,
            ..ServiceLocation::new(location, service, LocationKind::ClientLocation)
        })
        .await
        .unwrap();

    let window = Ulid::new();
    engine
        .add_window(AvailabilityWindow {
            price_modifier: Some(PriceModifier::Fixed(5000)),
            ..AvailabilityWindow::new(window, service, WindowKind::Regular, WindowPattern::Daily, t(9, 0), t(17, 0))
        })
        .await
        .unwrap();

    let stones = Ulid::new();
    engine
        .add_addon(ServiceAddOn {
            max_quantity: 2,
            ..ServiceAddOn::new(stones, service, "Hot stones", 1500)
        })
        .await
        .unwrap();

    Massage {
        service,
        location,
        window,
        stones,
    }
}

fn request(m: &Massage, start: Ms, stones: u32) -> BookingRequest {
    BookingRequest {
        id: Ulid::new(),
        user_id: Ulid::new(),
        service_id: m.service,
        location_id: Some(m.location),
        package_id: None,
        window_id: None,
        scheduled_at: start,
        addons: if stones > 0 {
            vec![AddOnSelection {
                addon_id: m.stones,
                quantity: stones,
            }]
        } else {
            Vec::new()
        },
        client: ClientDetails::default(),
    }
}

fn stones(m: &Massage, quantity: u32) -> Vec<AddOnSelection> {
    vec![AddOnSelection {
        addon_id: m.stones,
        quantity,
    }]
}

// ── Pricing ──────────────────────────────────────────────

#[tokio::test]
async fn quote_adds_every_component() {
    let (engine, _) = open(test_wal_path("quote.wal"));
    let m = massage(&engine).await;

    let p = engine
        .quote_booking(m.service, Some(m.location), Some(m.window), None, &stones(&m, 2))
        .await
        .unwrap();
    assert_eq!(p.base_price, 12000);
    assert_eq!(p.addons_total, 3000);
    assert_eq!(p.location_surcharge, -2000);
    assert_eq!(p.window_modifier, 5000);
    assert_eq!(p.total_amount, 18000);
    assert_eq!(p.deposit_amount, 5400);
    assert_eq!(p.remaining_amount, 12600);
}

#[tokio::test]
async fn booking_stores_price_and_addon_snapshot() {
    let (engine, _) = open(test_wal_path("snapshot.wal"));
    let m = massage(&engine).await;

    let b = engine.create_booking(request(&m, at(10, 0), 2)).await.unwrap();
    assert_eq!(b.status, BookingStatus::Confirmed);
    assert_eq!(b.payment_status, PaymentStatus::Pending);
    assert_eq!(b.span, Span::new(at(10, 0), at(11, 0)));
    assert_eq!(b.window_id, m.window);
    assert_eq!(b.pricing.total_amount, 18000);
    assert_eq!(b.pricing.deposit_amount, 5400);
    assert_eq!(b.addons.len(), 1);
    assert_eq!(b.addons[0].unit_price, 1500);
    assert_eq!(b.addons[0].quantity, 2);
    assert_eq!(engine.get_booking(b.id).await.unwrap(), b);
}

#[tokio::test]
async fn addon_price_change_does_not_touch_existing_bookings() {
    let (engine, _) = open(test_wal_path("addon_reprice.wal"));
    let m = massage(&engine).await;
    let b = engine.create_booking(request(&m, at(10, 0), 2)).await.unwrap();

    let updated = engine
        .update_addon(
            m.stones,
            &AddOnPatch {
                price: Some(2500),
                ..AddOnPatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.max_quantity, 2);

    let stored = engine.get_booking(b.id).await.unwrap();
    assert_eq!(stored.addons[0].unit_price, 1500);
    assert_eq!(stored.pricing.total_amount, 18000);

    let fresh = engine
        .quote_booking(m.service, Some(m.location), Some(m.window), None, &stones(&m, 2))
        .await
        .unwrap();
    assert_eq!(fresh.total_amount, 20000);
}

#[tokio::test]
async fn package_price_replaces_base_price() {
    let (engine, _) = open(test_wal_path("package.wal"));
    let m = massage(&engine).await;
    let facial = Ulid::new();
    engine
        .create_service(Service::new(facial, "Facial", 8000, 45))
        .await
        .unwrap();

    let items = vec![
        PackageItem {
            service_id: m.service,
            quantity: 1,
            position: 0,
            optional: false,
        },
        PackageItem {
            service_id: facial,
            quantity: 1,
            position: 1,
            optional: false,
        },
    ];
    let package = engine
        .create_package(
            Ulid::new(),
            "Spa day".into(),
            items,
            PackageDiscount::Percentage(10.0),
            DepositPolicy::None,
        )
        .await
        .unwrap();
    assert_eq!(package.individual_price_total, 20000);
    assert_eq!(package.discount_amount, 2000);
    assert_eq!(package.total_price, 18000);

    let b = engine
        .create_booking(BookingRequest {
            package_id: Some(package.id),
            ..request(&m, at(10, 0), 0)
        })
        .await
        .unwrap();
    assert_eq!(b.pricing.base_price, 18000);
    assert_eq!(b.pricing.total_amount, 21000);
    // No package deposit, so the service's 30% applies.
    assert_eq!(b.pricing.deposit_amount, 6300);
}

#[tokio::test]
async fn package_must_include_the_service() {
    let (engine, _) = open(test_wal_path("package_scope.wal"));
    let m = massage(&engine).await;
    let facial = Ulid::new();
    engine
        .create_service(Service::new(facial, "Facial", 8000, 45))
        .await
        .unwrap();
    let package = engine
        .create_package(
            Ulid::new(),
            "Facial twice".into(),
            vec![PackageItem {
                service_id: facial,
                quantity: 2,
                position: 0,
                optional: false,
            }],
            PackageDiscount::Amount(1000),
            DepositPolicy::None,
        )
        .await
        .unwrap();
    assert_eq!(package.total_price, 15000);

    let err = engine
        .create_booking(BookingRequest {
            package_id: Some(package.id),
            ..request(&m, at(10, 0), 0)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "package_id", .. }));
}

// ── Validation ───────────────────────────────────────────

#[tokio::test]
async fn addon_quantity_over_max_is_rejected() {
    let (engine, _) = open(test_wal_path("addon_max.wal"));
    let m = massage(&engine).await;

    let err = engine.create_booking(request(&m, at(10, 0), 3)).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "quantity", .. }));
    assert!(engine.list_bookings(Some(m.service), None).await.is_empty());
}

#[tokio::test]
async fn oversized_addon_and_service_are_rejected() {
    let (engine, _) = open(test_wal_path("addon_bounds.wal"));
    let m = massage(&engine).await;

    let err = engine
        .add_addon(ServiceAddOn {
            duration_min: 3_000_000_000,
            max_quantity: 2,
            ..ServiceAddOn::new(Ulid::new(), m.service, "Marathon", 1500)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "duration_min", .. }));

    let err = engine
        .add_addon(ServiceAddOn {
            max_quantity: 2,
            ..ServiceAddOn::new(Ulid::new(), m.service, "Gold leaf", i64::MAX / 2)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "price", .. }));

    let err = engine
        .add_addon(ServiceAddOn {
            max_quantity: u32::MAX,
            ..ServiceAddOn::new(Ulid::new(), m.service, "Towels", 100)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "max_quantity", .. }));

    let err = engine
        .create_service(Service::new(Ulid::new(), "Retreat", 12000, 10 * 24 * 60))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "duration_min", .. }));

    // Still bookable as before.
    assert_ok!(engine.create_booking(request(&m, at(10, 0), 2)).await);
}

#[tokio::test]
async fn required_addon_must_be_selected() {
    let (engine, _) = open(test_wal_path("addon_required.wal"));
    let m = massage(&engine).await;
    engine
        .add_addon(ServiceAddOn {
            is_required: true,
            ..ServiceAddOn::new(Ulid::new(), m.service, "Consultation form", 0)
        })
        .await
        .unwrap();

    let err = engine.create_booking(request(&m, at(10, 0), 1)).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "addons", .. }));
}

#[tokio::test]
async fn start_off_the_slot_grid_is_rejected() {
    let (engine, _) = open(test_wal_path("off_grid.wal"));
    let m = massage(&engine).await;

    let err = engine.create_booking(request(&m, at(10, 30), 0)).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "scheduled_at", .. }));
    let err = engine.create_booking(request(&m, at(18, 0), 0)).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "scheduled_at", .. }));
}

#[tokio::test]
async fn location_is_required_when_the_service_has_some() {
    let (engine, _) = open(test_wal_path("location_required.wal"));
    let m = massage(&engine).await;

    let err = engine
        .create_booking(BookingRequest {
            location_id: None,
            ..request(&m, at(10, 0), 0)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "location_id", .. }));
}

#[tokio::test]
async fn archived_service_takes_no_bookings() {
    let (engine, _) = open(test_wal_path("archived_service.wal"));
    let m = massage(&engine).await;
    engine.archive_service(m.service).await.unwrap();

    let err = engine.create_booking(request(&m, at(10, 0), 0)).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "service_id", .. }));
    let slots = engine
        .available_slots(m.service, Some(m.location), day(), day(), &[])
        .await
        .unwrap();
    assert!(slots.is_empty());
}

#[tokio::test]
async fn duplicate_booking_id_rejected() {
    let (engine, _) = open(test_wal_path("dup_booking.wal"));
    let m = massage(&engine).await;
    let req = request(&m, at(10, 0), 0);
    engine.create_booking(req.clone()).await.unwrap();

    let err = engine
        .create_booking(BookingRequest {
            scheduled_at: at(12, 0),
            ..req
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
}

#[tokio::test]
async fn slot_range_is_bounded() {
    let (engine, _) = open(test_wal_path("range.wal"));
    let m = massage(&engine).await;
    let far = day() + chrono::Days::new(200);

    let err = engine
        .available_slots(m.service, Some(m.location), day(), far, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

// ── Capacity ─────────────────────────────────────────────

#[tokio::test]
async fn concurrent_requests_for_last_seat() {
    let (engine, _) = open(test_wal_path("race.wal"));
    let m = massage(&engine).await;

    let (a, b) = tokio::join!(
        engine.create_booking(request(&m, at(10, 0), 0)),
        engine.create_booking(request(&m, at(10, 0), 0)),
    );
    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(EngineError::Capacity { .. })))
            .count(),
        1
    );
    assert_eq!(engine.list_bookings(Some(m.service), None).await.len(), 1);
}

#[tokio::test]
async fn many_tasks_one_seat() {
    let path = test_wal_path("race_tasks.wal");
    let (_, clock) = test_clock();
    let engine = Arc::new(Engine::new(path, hub()).unwrap().with_clock(clock));
    let m = massage(&engine).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        let req = request(&m, at(14, 0), 0);
        handles.push(tokio::spawn(async move { engine.create_booking(req).await }));
    }

    let mut ok = 0;
    let mut full = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::Capacity { .. }) => full += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(full, 15);
}

#[tokio::test]
async fn window_pool_caps_concurrent_bookings() {
    let (engine, _) = open(test_wal_path("window_pool.wal"));
    let sid = Ulid::new();
    engine
        .create_service(Service::new(sid, "Group class", 2000, 60))
        .await
        .unwrap();
    engine
        .add_window(AvailabilityWindow {
            max_bookings: Some(2),
            ..AvailabilityWindow::new(Ulid::new(), sid, WindowKind::Regular, WindowPattern::Daily, t(9, 0), t(12, 0))
        })
        .await
        .unwrap();

    let req = || BookingRequest {
        id: Ulid::new(),
        user_id: Ulid::new(),
        service_id: sid,
        location_id: None,
        package_id: None,
        window_id: None,
        scheduled_at: at(9, 0),
        addons: Vec::new(),
        client: ClientDetails::default(),
    };
    assert_ok!(engine.create_booking(req()).await);
    assert_ok!(engine.create_booking(req()).await);
    let err = engine.create_booking(req()).await.unwrap_err();
    assert!(matches!(err, EngineError::Capacity { .. }));
    assert!(err.is_recoverable());

    let slots = engine.available_slots(sid, None, day(), day(), &[]).await.unwrap();
    let starts: Vec<Ms> = slots.iter().map(|s| s.span.start).collect();
    assert_eq!(starts, vec![at(10, 0), at(11, 0)]);
    assert!(slots.iter().all(|s| s.remaining == 2));
}

#[tokio::test]
async fn blocked_window_closes_its_hours() {
    let (engine, _) = open(test_wal_path("blocked.wal"));
    let m = massage(&engine).await;
    let blocked = engine
        .add_window(AvailabilityWindow {
            is_bookable: true,
            ..AvailabilityWindow::new(
                Ulid::new(),
                m.service,
                WindowKind::Blocked,
                WindowPattern::SpecificDate(day()),
                t(12, 0),
                t(14, 0),
            )
        })
        .await
        .unwrap();
    assert!(!blocked.is_bookable);

    let slots = engine
        .available_slots(m.service, Some(m.location), day(), day(), &[])
        .await
        .unwrap();
    let starts: Vec<Ms> = slots.iter().map(|s| s.span.start).collect();
    assert_eq!(starts, vec![at(9, 0), at(10, 0), at(11, 0), at(14, 0), at(15, 0), at(16, 0)]);

    let err = engine.create_booking(request(&m, at(12, 0), 0)).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "scheduled_at", .. }));

    // Other days are untouched.
    let next = day().succ_opt().unwrap();
    let slots = engine
        .available_slots(m.service, Some(m.location), next, next, &[])
        .await
        .unwrap();
    assert_eq!(slots.len(), 8);
}

#[tokio::test]
async fn deactivated_window_offers_nothing() {
    let (engine, _) = open(test_wal_path("deactivate.wal"));
    let m = massage(&engine).await;
    engine.deactivate_window(m.window).await.unwrap();

    let slots = engine
        .available_slots(m.service, Some(m.location), day(), day(), &[])
        .await
        .unwrap();
    assert!(slots.is_empty());
    let windows = engine.windows_on(m.service, Some(m.location), day()).await.unwrap();
    assert!(windows.is_empty());
}

#[tokio::test]
async fn availability_excludes_booked_time() {
    let (engine, _) = open(test_wal_path("availability.wal"));
    let m = massage(&engine).await;
    engine.create_booking(request(&m, at(10, 0), 0)).await.unwrap();

    let free = engine
        .availability(m.service, Some(m.location), day(), day(), None)
        .await
        .unwrap();
    assert_eq!(free, vec![Span::new(at(9, 0), at(10, 0)), Span::new(at(11, 0), at(17, 0))]);

    let long_only = engine
        .availability(m.service, Some(m.location), day(), day(), Some(2 * HOUR_MS))
        .await
        .unwrap();
    assert_eq!(long_only, vec![Span::new(at(11, 0), at(17, 0))]);
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn manual_confirmation_flow() {
    let (engine, now) = open(test_wal_path("lifecycle.wal"));
    let m = massage(&engine).await;
    engine
        .update_service(
            m.service,
            &ServicePatch {
                auto_confirm: Some(false),
                ..ServicePatch::default()
            },
        )
        .await
        .unwrap();

    let b = engine.create_booking(request(&m, at(10, 0), 0)).await.unwrap();
    assert_eq!(b.status, BookingStatus::Pending);

    let err = engine
        .transition_booking(b.id, BookingStatus::InProgress, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: "pending",
            to: "in_progress"
        }
    ));

    engine
        .transition_booking(b.id, BookingStatus::Confirmed, None)
        .await
        .unwrap();
    now.store(at(10, 2), Ordering::SeqCst);
    let started = engine
        .transition_booking(b.id, BookingStatus::InProgress, None)
        .await
        .unwrap();
    assert_eq!(started.started_at, Some(at(10, 2)));

    now.store(at(11, 0), Ordering::SeqCst);
    let done = engine
        .transition_booking(b.id, BookingStatus::Completed, None)
        .await
        .unwrap();
    assert_eq!(done.completed_at, Some(at(11, 0)));

    assert_err!(engine.transition_booking(b.id, BookingStatus::Completed, None).await);
    assert_err!(engine.cancel_booking(b.id, None).await);
}

#[tokio::test]
async fn no_show_only_after_start() {
    let (engine, now) = open(test_wal_path("no_show.wal"));
    let m = massage(&engine).await;
    let b = engine.create_booking(request(&m, at(10, 0), 0)).await.unwrap();

    let err = engine
        .transition_booking(b.id, BookingStatus::NoShow, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "status", .. }));

    now.store(at(10, 20), Ordering::SeqCst);
    let b = engine
        .transition_booking(b.id, BookingStatus::NoShow, None)
        .await
        .unwrap();
    assert_eq!(b.status, BookingStatus::NoShow);
    assert_err!(engine.record_payment(Ulid::new(), b.id, PaymentType::Deposit).await);
}

#[tokio::test]
async fn cannot_cancel_after_the_end() {
    let (engine, now) = open(test_wal_path("late_cancel.wal"));
    let m = massage(&engine).await;
    let b = engine.create_booking(request(&m, at(10, 0), 0)).await.unwrap();

    now.store(at(11, 0), Ordering::SeqCst);
    let err = engine.cancel_booking(b.id, None).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "status", .. }));
}

#[tokio::test]
async fn rescheduled_status_needs_a_new_time() {
    let (engine, _) = open(test_wal_path("reschedule_status.wal"));
    let m = massage(&engine).await;
    let b = engine.create_booking(request(&m, at(10, 0), 0)).await.unwrap();

    let err = engine
        .transition_booking(b.id, BookingStatus::Rescheduled, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { .. }));
}

// ── Cancellation & refunds ───────────────────────────────

#[tokio::test]
async fn early_cancellation_refunds_everything() {
    let (engine, _) = open(test_wal_path("cancel_full.wal"));
    let m = massage(&engine).await;
    let b = engine.create_booking(request(&m, at(10, 0), 2)).await.unwrap();
    let deposit = engine.record_payment(Ulid::new(), b.id, PaymentType::Deposit).await.unwrap();
    assert_eq!(deposit.amount, 5400);

    let cancelled = engine
        .cancel_booking(b.id, Some("changed plans".into()))
        .await
        .unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(cancelled.cancellation_reason.as_deref(), Some("changed plans"));
    assert_eq!(cancelled.payment_status, PaymentStatus::Refunded);

    let payments = engine.payments_for(b.id).await.unwrap();
    assert_eq!(payments.len(), 2);
    assert_eq!(payments[1].payment_type, PaymentType::Refund);
    assert_eq!(payments[1].amount, 5400);

    // The time is free again.
    assert_ok!(engine.create_booking(request(&m, at(10, 0), 0)).await);
}

#[tokio::test]
async fn late_cancellation_refunds_half() {
    let (engine, now) = open(test_wal_path("cancel_half.wal"));
    let m = massage(&engine).await;
    let b = engine.create_booking(request(&m, at(10, 0), 2)).await.unwrap();
    engine.record_payment(Ulid::new(), b.id, PaymentType::Deposit).await.unwrap();

    now.store(at(10, 0) - 30 * HOUR_MS, Ordering::SeqCst);
    let cancelled = engine.cancel_booking(b.id, None).await.unwrap();
    assert_eq!(cancelled.payment_status, PaymentStatus::PartiallyRefunded);
    let refund = engine.payments_for(b.id).await.unwrap().pop().unwrap();
    assert_eq!(refund.amount, 2700);
}

#[tokio::test]
async fn last_minute_cancellation_refunds_nothing() {
    let (engine, now) = open(test_wal_path("cancel_none.wal"));
    let m = massage(&engine).await;
    let b = engine.create_booking(request(&m, at(10, 0), 0)).await.unwrap();
    engine.record_payment(Ulid::new(), b.id, PaymentType::Deposit).await.unwrap();

    now.store(at(9, 0), Ordering::SeqCst);
    let cancelled = engine.cancel_booking(b.id, None).await.unwrap();
    assert_eq!(cancelled.payment_status, PaymentStatus::DepositPaid);
    assert_eq!(engine.payments_for(b.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn refund_cannot_exceed_what_was_paid() {
    let (engine, _) = open(test_wal_path("refund_bounds.wal"));
    let m = massage(&engine).await;
    let b = engine.create_booking(request(&m, at(10, 0), 2)).await.unwrap();
    engine.record_payment(Ulid::new(), b.id, PaymentType::Full).await.unwrap();

    let err = engine.refund_booking(Ulid::new(), b.id, 18001).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "amount", .. }));

    engine.refund_booking(Ulid::new(), b.id, 3000).await.unwrap();
    assert_eq!(
        engine.get_booking(b.id).await.unwrap().payment_status,
        PaymentStatus::PartiallyRefunded
    );
    engine.refund_booking(Ulid::new(), b.id, 15000).await.unwrap();
    assert_eq!(engine.get_booking(b.id).await.unwrap().payment_status, PaymentStatus::Refunded);
}

// ── Payments ─────────────────────────────────────────────

#[tokio::test]
async fn deposit_then_balance() {
    let (engine, _) = open(test_wal_path("deposit_final.wal"));
    let m = massage(&engine).await;
    let b = engine.create_booking(request(&m, at(10, 0), 2)).await.unwrap();

    engine.record_payment(Ulid::new(), b.id, PaymentType::Deposit).await.unwrap();
    assert_eq!(engine.get_booking(b.id).await.unwrap().payment_status, PaymentStatus::DepositPaid);

    let err = engine
        .record_payment(Ulid::new(), b.id, PaymentType::Full)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    let last = engine.record_payment(Ulid::new(), b.id, PaymentType::Final).await.unwrap();
    assert_eq!(last.amount, 12600);
    assert_eq!(engine.get_booking(b.id).await.unwrap().payment_status, PaymentStatus::FullyPaid);

    assert_err!(engine.record_payment(Ulid::new(), b.id, PaymentType::Final).await);
}

#[tokio::test]
async fn refunds_are_not_recorded_as_payments() {
    let (engine, _) = open(test_wal_path("payment_type.wal"));
    let m = massage(&engine).await;
    let b = engine.create_booking(request(&m, at(10, 0), 0)).await.unwrap();

    let err = engine
        .record_payment(Ulid::new(), b.id, PaymentType::Refund)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "payment_type", .. }));
}

fn engine_with_gateway(name: &str, gateway: MockGateway) -> Engine {
    let (_, clock) = test_clock();
    Engine::with_collaborators(
        test_wal_path(name),
        hub(),
        Arc::new(gateway),
        Arc::new(crate::refund::TieredRefundPolicy::default()),
    )
    .unwrap()
    .with_clock(clock)
}

#[tokio::test]
async fn failed_charge_is_recorded_and_reported() {
    let mut gateway = MockGateway::new();
    gateway.expect_name().return_const("card".to_string());
    gateway.expect_charge().times(1).returning(|_, _| {
        Ok(GatewayReceipt {
            transaction_reference: "tx-declined-1".into(),
            status: ChargeStatus::Failed,
        })
    });
    let engine = engine_with_gateway("gateway_failed.wal", gateway);
    let m = massage(&engine).await;
    let b = engine.create_booking(request(&m, at(10, 0), 0)).await.unwrap();

    let err = engine
        .record_payment(Ulid::new(), b.id, PaymentType::Deposit)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Gateway(_)));

    let payments = engine.payments_for(b.id).await.unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, ChargeStatus::Failed);
    assert_eq!(payments[0].gateway, "card");
    assert_eq!(engine.get_booking(b.id).await.unwrap().payment_status, PaymentStatus::Pending);
}

#[tokio::test]
async fn gateway_outage_records_nothing() {
    let mut gateway = MockGateway::new();
    gateway
        .expect_charge()
        .returning(|_, _| Err(GatewayError::Unavailable("timeout".into())));
    let engine = engine_with_gateway("gateway_down.wal", gateway);
    let m = massage(&engine).await;
    let b = engine.create_booking(request(&m, at(10, 0), 0)).await.unwrap();

    let err = engine
        .record_payment(Ulid::new(), b.id, PaymentType::Full)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Gateway(ref msg) if msg.contains("timeout")));
    assert!(engine.payments_for(b.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn refund_failure_keeps_the_cancellation() {
    let mut gateway = MockGateway::new();
    gateway.expect_name().return_const("card".to_string());
    gateway.expect_charge().returning(|_, _| {
        Ok(GatewayReceipt {
            transaction_reference: "tx-1".into(),
            status: ChargeStatus::Completed,
        })
    });
    gateway
        .expect_refund()
        .returning(|_, _| Err(GatewayError::Unavailable("offline".into())));
    let engine = engine_with_gateway("refund_down.wal", gateway);
    let m = massage(&engine).await;
    let b = engine.create_booking(request(&m, at(10, 0), 0)).await.unwrap();
    engine.record_payment(Ulid::new(), b.id, PaymentType::Deposit).await.unwrap();

    let cancelled = engine.cancel_booking(b.id, None).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(cancelled.payment_status, PaymentStatus::DepositPaid);
}

// ── Rescheduling ─────────────────────────────────────────

#[tokio::test]
async fn reschedule_moves_the_booking() {
    let (engine, _) = open(test_wal_path("reschedule.wal"));
    let m = massage(&engine).await;
    let original = engine.create_booking(request(&m, at(10, 0), 2)).await.unwrap();
    engine
        .record_payment(Ulid::new(), original.id, PaymentType::Deposit)
        .await
        .unwrap();

    let new_id = Ulid::new();
    let moved = engine
        .reschedule_booking(new_id, original.id, at(14, 0), None)
        .await
        .unwrap();
    assert_eq!(moved.id, new_id);
    assert_eq!(moved.status, BookingStatus::Confirmed);
    assert_eq!(moved.span.start, at(14, 0));
    assert_eq!(moved.rescheduled_from, Some(original.id));
    assert_eq!(moved.payment_status, PaymentStatus::DepositPaid);
    assert_eq!(moved.location_id, Some(m.location));
    assert_eq!(moved.addons, original.addons);

    let old = engine.get_booking(original.id).await.unwrap();
    assert_eq!(old.status, BookingStatus::Rescheduled);
    assert_eq!(old.rescheduled_to, Some(new_id));

    // The old time is free, the old booking is finished.
    assert_ok!(engine.create_booking(request(&m, at(10, 0), 0)).await);
    let err = engine
        .reschedule_booking(Ulid::new(), original.id, at(15, 0), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
}

#[tokio::test]
async fn reschedule_may_keep_its_own_time() {
    let (engine, _) = open(test_wal_path("reschedule_same.wal"));
    let m = massage(&engine).await;
    let original = engine.create_booking(request(&m, at(10, 0), 0)).await.unwrap();

    let moved = engine
        .reschedule_booking(Ulid::new(), original.id, at(10, 0), None)
        .await
        .unwrap();
    assert_eq!(moved.span, original.span);
}

#[tokio::test]
async fn balance_after_reschedule_counts_the_deposit() {
    let (engine, _) = open(test_wal_path("reschedule_final.wal"));
    let m = massage(&engine).await;
    let original = engine.create_booking(request(&m, at(10, 0), 2)).await.unwrap();
    engine
        .record_payment(Ulid::new(), original.id, PaymentType::Deposit)
        .await
        .unwrap();

    let moved = engine
        .reschedule_booking(Ulid::new(), original.id, at(14, 0), None)
        .await
        .unwrap();
    assert_eq!(moved.pricing.total_amount, 18000);

    let last = engine
        .record_payment(Ulid::new(), moved.id, PaymentType::Final)
        .await
        .unwrap();
    assert_eq!(last.amount, 12600);
    assert_eq!(engine.get_booking(moved.id).await.unwrap().payment_status, PaymentStatus::FullyPaid);

    let paid: Minor = engine.payments_for(moved.id).await.unwrap().iter().map(|p| p.amount).sum();
    assert_eq!(paid, 18000);
}

#[tokio::test]
async fn cancelling_a_rescheduled_booking_refunds_the_deposit() {
    let (engine, _) = open(test_wal_path("reschedule_cancel.wal"));
    let m = massage(&engine).await;
    let original = engine.create_booking(request(&m, at(10, 0), 2)).await.unwrap();
    engine
        .record_payment(Ulid::new(), original.id, PaymentType::Deposit)
        .await
        .unwrap();
    let moved = engine
        .reschedule_booking(Ulid::new(), original.id, at(14, 0), None)
        .await
        .unwrap();

    let cancelled = engine.cancel_booking(moved.id, None).await.unwrap();
    assert_eq!(cancelled.payment_status, PaymentStatus::Refunded);
    let refund = engine.payments_for(moved.id).await.unwrap().pop().unwrap();
    assert_eq!(refund.payment_type, PaymentType::Refund);
    assert_eq!(refund.booking_id, moved.id);
    assert_eq!(refund.amount, 5400);
}

#[tokio::test]
async fn manual_refund_after_two_reschedules() {
    let (engine, _) = open(test_wal_path("reschedule_twice.wal"));
    let m = massage(&engine).await;
    let first = engine.create_booking(request(&m, at(10, 0), 2)).await.unwrap();
    engine
        .record_payment(Ulid::new(), first.id, PaymentType::Deposit)
        .await
        .unwrap();
    let second = engine
        .reschedule_booking(Ulid::new(), first.id, at(12, 0), None)
        .await
        .unwrap();
    let third = engine
        .reschedule_booking(Ulid::new(), second.id, at(14, 0), None)
        .await
        .unwrap();

    let err = engine.refund_booking(Ulid::new(), first.id, 5400).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "booking_id", .. }));

    assert_ok!(engine.refund_booking(Ulid::new(), third.id, 5400).await);
    assert_eq!(engine.get_booking(third.id).await.unwrap().payment_status, PaymentStatus::Refunded);
}

#[tokio::test]
async fn reschedule_into_a_full_slot_fails() {
    let (engine, _) = open(test_wal_path("reschedule_full.wal"));
    let m = massage(&engine).await;
    let first = engine.create_booking(request(&m, at(10, 0), 0)).await.unwrap();
    engine.create_booking(request(&m, at(11, 0), 0)).await.unwrap();

    let err = engine
        .reschedule_booking(Ulid::new(), first.id, at(11, 0), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Capacity { .. }));
    assert_eq!(engine.get_booking(first.id).await.unwrap().status, BookingStatus::Confirmed);
}

// ── Notices & reminders ──────────────────────────────────

#[tokio::test]
async fn booking_notices_reach_subscribers() {
    let (engine, _) = open(test_wal_path("notices.wal"));
    let m = massage(&engine).await;
    let mut rx = engine.notify.subscribe(m.service);

    let b = engine.create_booking(request(&m, at(10, 0), 0)).await.unwrap();
    let created = rx.recv().await.unwrap();
    assert_eq!(created.kind, NoticeKind::BookingCreated);
    assert_eq!(created.target, NoticeTarget::Booking(b.id));
    assert_eq!(rx.recv().await.unwrap().kind, NoticeKind::BookingConfirmed);

    engine.cancel_booking(b.id, None).await.unwrap();
    assert_eq!(rx.recv().await.unwrap().kind, NoticeKind::BookingCancelled);
}

#[tokio::test]
async fn reminders_go_out_once() {
    let (engine, now) = open(test_wal_path("reminders.wal"));
    let m = massage(&engine).await;
    let b = engine.create_booking(request(&m, at(10, 0), 0)).await.unwrap();
    let mut rx = engine.notify.subscribe_all();

    assert_eq!(engine.send_due_reminders().await, 0);

    now.store(at(10, 0) - 2 * HOUR_MS, Ordering::SeqCst);
    assert_eq!(engine.send_due_reminders().await, 1);
    assert_eq!(engine.send_due_reminders().await, 0);
    assert!(engine.get_booking(b.id).await.unwrap().reminder_sent);

    let notice = rx.recv().await.unwrap();
    assert_eq!(notice.kind, NoticeKind::Reminder);
    assert_eq!(notice.target, NoticeTarget::Booking(b.id));
}

// ── Consultations ────────────────────────────────────────

#[tokio::test]
async fn consultation_lifecycle() {
    let (engine, _) = open(test_wal_path("consultation.wal"));
    let m = massage(&engine).await;
    let b = engine.create_booking(request(&m, at(10, 0), 0)).await.unwrap();

    let c = engine
        .schedule_consultation(ConsultationBooking {
            id: Ulid::new(),
            user_id: b.user_id,
            booking_id: Some(b.id),
            span: Span::new(at(9, 0), at(9, 30)),
            status: ConsultationStatus::Completed,
            notes: Some("allergies".into()),
            started_at: None,
            completed_at: None,
        })
        .await
        .unwrap();
    assert_eq!(c.status, ConsultationStatus::Scheduled);

    let c = engine
        .transition_consultation(c.id, ConsultationStatus::InProgress)
        .await
        .unwrap();
    assert!(c.started_at.is_some());
    engine
        .transition_consultation(c.id, ConsultationStatus::Completed)
        .await
        .unwrap();
    assert_err!(engine.transition_consultation(c.id, ConsultationStatus::Cancelled).await);
    assert_eq!(
        engine.get_consultation(c.id).await.unwrap().status,
        ConsultationStatus::Completed
    );
}

#[tokio::test]
async fn consultation_for_unknown_booking_rejected() {
    let (engine, _) = open(test_wal_path("consultation_orphan.wal"));
    let err = engine
        .schedule_consultation(ConsultationBooking {
            id: Ulid::new(),
            user_id: Ulid::new(),
            booking_id: Some(Ulid::new()),
            span: Span::new(at(9, 0), at(9, 30)),
            status: ConsultationStatus::Scheduled,
            notes: None,
            started_at: None,
            completed_at: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let (booking_id, service_id) = {
        let (engine, _) = open(path.clone());
        let m = massage(&engine).await;
        let b = engine.create_booking(request(&m, at(10, 0), 2)).await.unwrap();
        engine.record_payment(Ulid::new(), b.id, PaymentType::Deposit).await.unwrap();
        engine.archive_addon(m.stones).await.unwrap();
        (b.id, m.service)
    };

    let (engine, _) = open(path);
    let b = engine.get_booking(booking_id).await.unwrap();
    assert_eq!(b.pricing.total_amount, 18000);
    assert_eq!(b.payment_status, PaymentStatus::DepositPaid);
    assert_eq!(engine.payments_for(booking_id).await.unwrap().len(), 1);
    let ss = engine.service(service_id).await.unwrap();
    assert!(ss.addons[0].archived_at.is_some());

    // Indexes are rebuilt too.
    let last = engine
        .record_payment(Ulid::new(), booking_id, PaymentType::Final)
        .await
        .unwrap();
    assert_eq!(last.amount, 12600);
}

#[tokio::test]
async fn compaction_keeps_current_state() {
    let path = test_wal_path("compact.wal");
    let before = {
        let (engine, _) = open(path.clone());
        let m = massage(&engine).await;
        let a = engine.create_booking(request(&m, at(10, 0), 1)).await.unwrap();
        engine.record_payment(Ulid::new(), a.id, PaymentType::Deposit).await.unwrap();
        engine.cancel_booking(a.id, None).await.unwrap();
        let b = engine.create_booking(request(&m, at(12, 0), 0)).await.unwrap();
        engine.reschedule_booking(Ulid::new(), b.id, at(15, 0), None).await.unwrap();
        assert!(engine.wal_appends_since_compact().await > 0);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // Writes after compaction land in the new file.
        engine.create_booking(request(&m, at(16, 0), 0)).await.unwrap();
        engine.list_bookings(None, None).await
    };

    let (engine, _) = open(path);
    let after = engine.list_bookings(None, None).await;
    assert_eq!(before, after);
    assert_eq!(after.len(), 4);
}

#[tokio::test]
async fn user_filter_on_bookings() {
    let (engine, _) = open(test_wal_path("by_user.wal"));
    let m = massage(&engine).await;
    let mine = request(&m, at(9, 0), 0);
    let user = mine.user_id;
    engine.create_booking(mine).await.unwrap();
    engine.create_booking(request(&m, at(11, 0), 0)).await.unwrap();

    assert_eq!(engine.list_bookings(None, Some(user)).await.len(), 1);
    assert_eq!(engine.list_bookings(Some(m.service), None).await.len(), 2);
    assert!(engine.list_bookings(Some(Ulid::new()), None).await.is_empty());
}
