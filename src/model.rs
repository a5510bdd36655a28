use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only instant type.
pub type Ms = i64;

/// Money in minor currency units (pence).
pub type Minor = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

pub fn minutes(m: u32) -> Ms {
    m as Ms * MINUTE_MS
}

/// Wall-clock `date` + `time` read as UTC.
pub fn instant_at(date: NaiveDate, time: NaiveTime) -> Ms {
    NaiveDateTime::new(date, time).and_utc().timestamp_millis()
}

/// UTC calendar date containing `t`.
pub fn date_of(t: Ms) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(t).map(|dt| dt.date_naive())
}

/// 0 = Sunday .. 6 = Saturday.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Same start, end pushed out by `buffer` (turnaround time after a booking).
    pub fn with_buffer(&self, buffer: Ms) -> Span {
        Span::new(self.start, self.end + buffer)
    }
}

/// Enum with a stable snake_case label for SQL input and result rows.
macro_rules! labelled_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $label:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $label),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($label => Ok(Self::$variant),)+
                    other => Err(format!("unknown {}: {other}", stringify!($name))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

labelled_enum! {
    pub enum ServiceStatus {
        Active => "active",
        Inactive => "inactive",
        Draft => "draft",
    }
}

labelled_enum! {
    pub enum LocationKind {
        BusinessPremises => "business_premises",
        ClientLocation => "client_location",
        Virtual => "virtual",
        Outdoor => "outdoor",
    }
}

labelled_enum! {
    pub enum WindowKind {
        Regular => "regular",
        Exception => "exception",
        SpecialHours => "special_hours",
        /// Always closes the time it covers.
        Blocked => "blocked",
    }
}

labelled_enum! {
    pub enum BookingStatus {
        Pending => "pending",
        Confirmed => "confirmed",
        InProgress => "in_progress",
        Completed => "completed",
        Cancelled => "cancelled",
        NoShow => "no_show",
        Rescheduled => "rescheduled",
    }
}

labelled_enum! {
    pub enum PaymentStatus {
        Pending => "pending",
        DepositPaid => "deposit_paid",
        FullyPaid => "fully_paid",
        PartiallyRefunded => "partially_refunded",
        Refunded => "refunded",
    }
}

labelled_enum! {
    pub enum PaymentType {
        Deposit => "deposit",
        Full => "full",
        Final => "final",
        Refund => "refund",
    }
}

labelled_enum! {
    /// Outcome of a single gateway call.
    pub enum ChargeStatus {
        Pending => "pending",
        Completed => "completed",
        Failed => "failed",
    }
}

labelled_enum! {
    pub enum ConsultationStatus {
        Scheduled => "scheduled",
        InProgress => "in_progress",
        Completed => "completed",
        Cancelled => "cancelled",
        NoShow => "no_show",
    }
}

// ── Master data ──────────────────────────────────────────────────

/// Upfront payment rule. The two amounts are mutually exclusive by construction.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum DepositPolicy {
    #[default]
    None,
    /// Percentage of the booking total, `0 < pct <= 100`.
    Percentage(f64),
    /// Fixed amount in minor units.
    Fixed(Minor),
}

impl DepositPolicy {
    pub fn is_required(&self) -> bool {
        !matches!(self, DepositPolicy::None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub status: ServiceStatus,
    pub base_price: Minor,
    pub duration_min: u32,
    /// Turnaround after each booking; counts against capacity.
    pub buffer_min: u32,
    pub deposit: DepositPolicy,
    pub min_advance_hours: Option<u32>,
    pub max_advance_days: Option<u32>,
    pub auto_confirm: bool,
    pub archived_at: Option<Ms>,
}

impl Service {
    pub fn new(id: Ulid, name: impl Into<String>, base_price: Minor, duration_min: u32) -> Self {
        Self {
            id,
            name: name.into(),
            status: ServiceStatus::Active,
            base_price,
            duration_min,
            buffer_min: 0,
            deposit: DepositPolicy::None,
            min_advance_hours: None,
            max_advance_days: None,
            auto_confirm: false,
            archived_at: None,
        }
    }

    pub fn is_bookable(&self) -> bool {
        self.status == ServiceStatus::Active && self.archived_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceLocation {
    pub id: Ulid,
    pub service_id: Ulid,
    pub kind: LocationKind,
    pub name: Option<String>,
    /// May be negative (e.g. a pickup discount).
    pub additional_charge: Minor,
    /// Concurrent bookings ceiling at this location.
    pub max_capacity: u32,
    pub archived_at: Option<Ms>,
}

impl ServiceLocation {
    pub fn new(id: Ulid, service_id: Ulid, kind: LocationKind) -> Self {
        Self {
            id,
            service_id,
            kind,
            name: None,
            additional_charge: 0,
            max_capacity: 1,
            archived_at: None,
        }
    }
}

/// When a window recurs. Weekly carries a weekday and no dates; the date-based
/// variants carry dates and no weekday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowPattern {
    /// 0 = Sunday .. 6 = Saturday.
    Weekly { day_of_week: u8 },
    Daily,
    /// Inclusive on both ends.
    DateRange { start: NaiveDate, end: NaiveDate },
    SpecificDate(NaiveDate),
}

impl WindowPattern {
    pub fn matches(&self, date: NaiveDate) -> bool {
        match self {
            WindowPattern::Weekly { day_of_week: dow } => day_of_week(date) == *dow,
            WindowPattern::Daily => true,
            WindowPattern::DateRange { start, end } => *start <= date && date <= *end,
            WindowPattern::SpecificDate(d) => *d == date,
        }
    }

    /// Higher wins when windows compete for the same time.
    pub fn specificity(&self) -> u8 {
        match self {
            WindowPattern::SpecificDate(_) => 3,
            WindowPattern::DateRange { .. } => 2,
            WindowPattern::Weekly { .. } => 1,
            WindowPattern::Daily => 0,
        }
    }

    pub fn is_date_based(&self) -> bool {
        matches!(self, WindowPattern::DateRange { .. } | WindowPattern::SpecificDate(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            WindowPattern::Weekly { .. } => "weekly",
            WindowPattern::Daily => "daily",
            WindowPattern::DateRange { .. } => "date_range",
            WindowPattern::SpecificDate(_) => "specific_date",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PriceModifier {
    /// Signed amount in minor units.
    Fixed(Minor),
    /// Signed percentage of the subtotal.
    Percentage(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    pub service_id: Ulid,
    /// `None` applies to every location of the service.
    pub location_id: Option<Ulid>,
    pub kind: WindowKind,
    pub pattern: WindowPattern,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    /// Step between slot starts; falls back to the service duration.
    pub slot_duration_min: Option<u32>,
    pub break_min: u32,
    /// `Some(0)` closes the window.
    pub max_bookings: Option<u32>,
    pub price_modifier: Option<PriceModifier>,
    pub is_bookable: bool,
    pub is_active: bool,
    pub min_advance_hours: Option<u32>,
    pub max_advance_days: Option<u32>,
}

impl AvailabilityWindow {
    pub fn new(
        id: Ulid,
        service_id: Ulid,
        kind: WindowKind,
        pattern: WindowPattern,
        start_time: NaiveTime,
        end_time: NaiveTime,
    ) -> Self {
        Self {
            id,
            service_id,
            location_id: None,
            kind,
            pattern,
            start_time,
            end_time,
            slot_duration_min: None,
            break_min: 0,
            max_bookings: None,
            price_modifier: None,
            is_bookable: true,
            is_active: true,
            min_advance_hours: None,
            max_advance_days: None,
        }
        .normalized()
    }

    /// A blocked window is never bookable and holds no bookings.
    pub fn normalized(mut self) -> Self {
        if self.kind == WindowKind::Blocked {
            self.is_bookable = false;
            self.max_bookings = Some(0);
        }
        self
    }

    pub fn is_blocker(&self) -> bool {
        !self.is_bookable || self.max_bookings == Some(0)
    }

    pub fn applies_to(&self, location_id: Option<Ulid>) -> bool {
        match (self.location_id, location_id) {
            (None, _) => true,
            (Some(own), Some(wanted)) => own == wanted,
            (Some(_), None) => false,
        }
    }

    pub fn span_on(&self, date: NaiveDate) -> Span {
        Span::new(instant_at(date, self.start_time), instant_at(date, self.end_time))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceAddOn {
    pub id: Ulid,
    pub service_id: Ulid,
    pub name: String,
    pub price: Minor,
    pub duration_min: u32,
    pub max_quantity: u32,
    pub is_required: bool,
    pub archived_at: Option<Ms>,
}

impl ServiceAddOn {
    pub fn new(id: Ulid, service_id: Ulid, name: impl Into<String>, price: Minor) -> Self {
        Self {
            id,
            service_id,
            name: name.into(),
            price,
            duration_min: 0,
            max_quantity: 1,
            is_required: false,
            archived_at: None,
        }
    }
}

/// Staff edits to a service. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServicePatch {
    pub name: Option<String>,
    pub status: Option<ServiceStatus>,
    pub base_price: Option<Minor>,
    pub duration_min: Option<u32>,
    pub buffer_min: Option<u32>,
    pub deposit: Option<DepositPolicy>,
    pub min_advance_hours: Option<Option<u32>>,
    pub max_advance_days: Option<Option<u32>>,
    pub auto_confirm: Option<bool>,
}

impl ServicePatch {
    pub fn apply(&self, current: &Service) -> Service {
        let mut s = current.clone();
        if let Some(name) = &self.name {
            s.name = name.clone();
        }
        s.status = self.status.unwrap_or(s.status);
        s.base_price = self.base_price.unwrap_or(s.base_price);
        s.duration_min = self.duration_min.unwrap_or(s.duration_min);
        s.buffer_min = self.buffer_min.unwrap_or(s.buffer_min);
        s.deposit = self.deposit.unwrap_or(s.deposit);
        s.min_advance_hours = self.min_advance_hours.unwrap_or(s.min_advance_hours);
        s.max_advance_days = self.max_advance_days.unwrap_or(s.max_advance_days);
        s.auto_confirm = self.auto_confirm.unwrap_or(s.auto_confirm);
        s
    }
}

/// Staff edits to an add-on; applies to future quotes and bookings only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddOnPatch {
    pub name: Option<String>,
    pub price: Option<Minor>,
    pub duration_min: Option<u32>,
    pub max_quantity: Option<u32>,
    pub is_required: Option<bool>,
}

impl AddOnPatch {
    pub fn apply(&self, current: &ServiceAddOn) -> ServiceAddOn {
        let mut a = current.clone();
        if let Some(name) = &self.name {
            a.name = name.clone();
        }
        a.price = self.price.unwrap_or(a.price);
        a.duration_min = self.duration_min.unwrap_or(a.duration_min);
        a.max_quantity = self.max_quantity.unwrap_or(a.max_quantity);
        a.is_required = self.is_required.unwrap_or(a.is_required);
        a
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOnSelection {
    pub addon_id: Ulid,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageItem {
    pub service_id: Ulid,
    pub quantity: u32,
    pub position: u32,
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePackage {
    pub id: Ulid,
    pub name: String,
    pub items: Vec<PackageItem>,
    /// Pre-discount sum of the bundled services.
    pub individual_price_total: Minor,
    pub discount_amount: Minor,
    pub discount_percentage: Option<f64>,
    /// `individual_price_total - discount_amount`.
    pub total_price: Minor,
    pub deposit: DepositPolicy,
    pub archived_at: Option<Ms>,
}

impl ServicePackage {
    pub fn includes(&self, service_id: Ulid) -> bool {
        self.items.iter().any(|i| i.service_id == service_id)
    }
}

// ── Bookings ─────────────────────────────────────────────────────

/// Add-on as it was priced when the booking was made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingAddOn {
    pub addon_id: Ulid,
    pub name: String,
    pub quantity: u32,
    pub unit_price: Minor,
    pub duration_min: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub base_price: Minor,
    pub addons_total: Minor,
    pub location_surcharge: Minor,
    pub window_modifier: Minor,
    pub total_amount: Minor,
    pub deposit_amount: Minor,
    pub remaining_amount: Minor,
}

impl PriceBreakdown {
    pub fn is_consistent(&self) -> bool {
        self.total_amount
            == self.base_price + self.addons_total + self.location_surcharge + self.window_modifier
            && self.deposit_amount + self.remaining_amount == self.total_amount
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClientDetails {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub service_id: Ulid,
    pub location_id: Option<Ulid>,
    pub package_id: Option<Ulid>,
    /// Window whose capacity pool this booking draws from.
    pub window_id: Ulid,
    /// `[scheduled_at, ends_at)`.
    pub span: Span,
    pub addons: Vec<BookingAddOn>,
    pub pricing: PriceBreakdown,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub client: ClientDetails,
    pub started_at: Option<Ms>,
    pub completed_at: Option<Ms>,
    pub cancelled_at: Option<Ms>,
    pub cancellation_reason: Option<String>,
    pub rescheduled_from: Option<Ulid>,
    pub rescheduled_to: Option<Ulid>,
    pub reminder_sent: bool,
    pub created_at: Ms,
}

impl Booking {
    pub fn scheduled_at(&self) -> Ms {
        self.span.start
    }

    pub fn ends_at(&self) -> Ms {
        self.span.end
    }

    /// Cancelled and rescheduled rows free their time.
    pub fn occupies_capacity(&self) -> bool {
        !matches!(self.status, BookingStatus::Cancelled | BookingStatus::Rescheduled)
    }

    pub fn addon_selection(&self) -> Vec<AddOnSelection> {
        self.addons
            .iter()
            .map(|a| AddOnSelection {
                addon_id: a.addon_id,
                quantity: a.quantity,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub payment_type: PaymentType,
    pub amount: Minor,
    pub status: ChargeStatus,
    pub gateway: String,
    pub transaction_reference: String,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsultationBooking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub booking_id: Option<Ulid>,
    pub span: Span,
    pub status: ConsultationStatus,
    pub notes: Option<String>,
    pub started_at: Option<Ms>,
    pub completed_at: Option<Ms>,
}

/// A concrete bookable start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub service_id: Ulid,
    pub location_id: Option<Ulid>,
    pub window_id: Ulid,
    /// `[start, start + total duration)`.
    pub span: Span,
    /// Bookings that still fit, under the stricter of the window and location limits.
    pub remaining: u32,
}

// ── Per-service state ────────────────────────────────────────────

/// Everything the engine holds for one service, guarded by one lock.
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub service: Service,
    pub locations: Vec<ServiceLocation>,
    pub windows: Vec<AvailabilityWindow>,
    pub addons: Vec<ServiceAddOn>,
    /// Sorted by `span.start`.
    pub bookings: Vec<Booking>,
    pub payments: Vec<Payment>,
}

impl ServiceState {
    pub fn new(service: Service) -> Self {
        Self {
            service,
            locations: Vec::new(),
            windows: Vec::new(),
            addons: Vec::new(),
            bookings: Vec::new(),
            payments: Vec::new(),
        }
    }

    pub fn location(&self, id: Ulid) -> Option<&ServiceLocation> {
        self.locations.iter().find(|l| l.id == id)
    }

    pub fn window(&self, id: Ulid) -> Option<&AvailabilityWindow> {
        self.windows.iter().find(|w| w.id == id)
    }

    pub fn addon(&self, id: Ulid) -> Option<&ServiceAddOn> {
        self.addons.iter().find(|a| a.id == id)
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    pub fn has_active_locations(&self) -> bool {
        self.locations.iter().any(|l| l.archived_at.is_none())
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    /// Bookings whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// The booking followed by every booking it replaced, newest first.
    pub fn reschedule_chain(&self, booking_id: Ulid) -> Vec<Ulid> {
        let mut chain = vec![booking_id];
        let mut current = booking_id;
        while let Some(prev) = self.booking(current).and_then(|b| b.rescheduled_from) {
            if chain.contains(&prev) {
                break;
            }
            chain.push(prev);
            current = prev;
        }
        chain
    }

    /// Payments made against the booking or any booking it replaced.
    pub fn payments_for(&self, booking_id: Ulid) -> impl Iterator<Item = &Payment> {
        let chain = self.reschedule_chain(booking_id);
        self.payments.iter().filter(move |p| chain.contains(&p.booking_id))
    }

    /// Completed charges minus completed refunds.
    pub fn net_paid(&self, booking_id: Ulid) -> Minor {
        self.payments_for(booking_id)
            .filter(|p| p.status == ChargeStatus::Completed)
            .map(|p| match p.payment_type {
                PaymentType::Refund => -p.amount,
                _ => p.amount,
            })
            .sum()
    }
}

/// The WAL record format. One record per state change; a booking and its
/// add-on snapshots always travel together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ServiceCreated {
        service: Service,
    },
    ServiceUpdated {
        service: Service,
    },
    ServiceArchived {
        id: Ulid,
        at: Ms,
    },
    LocationAdded {
        location: ServiceLocation,
    },
    LocationArchived {
        id: Ulid,
        service_id: Ulid,
        at: Ms,
    },
    WindowAdded {
        window: AvailabilityWindow,
    },
    WindowDeactivated {
        id: Ulid,
        service_id: Ulid,
    },
    AddOnAdded {
        addon: ServiceAddOn,
    },
    AddOnUpdated {
        addon: ServiceAddOn,
    },
    AddOnArchived {
        id: Ulid,
        service_id: Ulid,
        at: Ms,
    },
    PackageCreated {
        package: ServicePackage,
    },
    PackageArchived {
        id: Ulid,
        at: Ms,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingTransitioned {
        id: Ulid,
        service_id: Ulid,
        to: BookingStatus,
        at: Ms,
        reason: Option<String>,
    },
    BookingRescheduled {
        original_id: Ulid,
        service_id: Ulid,
        at: Ms,
        replacement: Booking,
    },
    PaymentRecorded {
        service_id: Ulid,
        payment: Payment,
        payment_status: PaymentStatus,
    },
    ReminderSent {
        booking_id: Ulid,
        service_id: Ulid,
    },
    ConsultationScheduled {
        consultation: ConsultationBooking,
    },
    ConsultationTransitioned {
        id: Ulid,
        to: ConsultationStatus,
        at: Ms,
    },
}
