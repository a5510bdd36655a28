use std::collections::HashSet;

use rust_decimal::prelude::*;
use ulid::Ulid;

use crate::limits::{MAX_ADDONS_PER_BOOKING, MAX_PACKAGE_ITEM_QUANTITY};
use crate::model::*;

use super::EngineError;

/// Everything a price depends on. Borrowed from the locked service state so
/// a quote always reflects one consistent snapshot.
pub struct QuoteInput<'a> {
    pub state: &'a ServiceState,
    pub location_id: Option<Ulid>,
    pub window: Option<&'a AvailabilityWindow>,
    pub package: Option<&'a ServicePackage>,
    pub addons: &'a [AddOnSelection],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub pricing: PriceBreakdown,
    /// Snapshots to store on the booking.
    pub addons: Vec<BookingAddOn>,
    pub duration_min: u32,
}

/// `amount × pct / 100`, rounded half away from zero to the minor unit.
pub fn percent_of(amount: Minor, pct: f64) -> Result<Minor, EngineError> {
    let pct = Decimal::from_f64(pct)
        .ok_or_else(|| EngineError::Pricing(format!("percentage {pct} is not a finite number")))?;
    (Decimal::from(amount) * pct / Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| EngineError::Pricing(format!("{pct}% of {amount} overflows")))
}

/// Check the selection against the service's add-ons and snapshot each one.
pub(super) fn resolve_addons(state: &ServiceState, selection: &[AddOnSelection]) -> Result<Vec<BookingAddOn>, EngineError> {
    if selection.len() > MAX_ADDONS_PER_BOOKING {
        return Err(EngineError::LimitExceeded("too many add-ons on booking"));
    }

    let mut seen = HashSet::new();
    let mut snapshots = Vec::with_capacity(selection.len());
    for sel in selection {
        if !seen.insert(sel.addon_id) {
            return Err(EngineError::validation("addons", format!("add-on {} selected twice", sel.addon_id)));
        }
        let addon = state
            .addon(sel.addon_id)
            .filter(|a| a.archived_at.is_none())
            .ok_or_else(|| EngineError::validation("addons", format!("add-on {} is not offered", sel.addon_id)))?;
        if sel.quantity == 0 {
            return Err(EngineError::validation("quantity", format!("add-on {} quantity must be at least 1", addon.id)));
        }
        if sel.quantity > addon.max_quantity {
            return Err(EngineError::validation(
                "quantity",
                format!("{} exceeds max {} for add-on {}", sel.quantity, addon.max_quantity, addon.name),
            ));
        }
        snapshots.push(BookingAddOn {
            addon_id: addon.id,
            name: addon.name.clone(),
            quantity: sel.quantity,
            unit_price: addon.price,
            duration_min: addon.duration_min,
        });
    }

    if let Some(missing) = state
        .addons
        .iter()
        .find(|a| a.is_required && a.archived_at.is_none() && !seen.contains(&a.id))
    {
        return Err(EngineError::validation("addons", format!("required add-on {} is missing", missing.name)));
    }

    Ok(snapshots)
}

/// Price a booking. Pure: reads only `input`.
pub fn quote(input: &QuoteInput<'_>) -> Result<Quote, EngineError> {
    let state = input.state;
    let addons = resolve_addons(state, input.addons)?;

    let base_price = match input.package {
        Some(p) => p.total_price,
        None => state.service.base_price,
    };
    let overflow = |what: &str| EngineError::Pricing(format!("{what} for service {} overflows", state.service.id));
    let addons_total = addons
        .iter()
        .try_fold(0 as Minor, |acc, a| {
            a.unit_price
                .checked_mul(a.quantity as Minor)
                .and_then(|line| acc.checked_add(line))
        })
        .ok_or_else(|| overflow("add-on total"))?;

    let location_surcharge = match input.location_id {
        Some(id) => {
            state
                .location(id)
                .filter(|l| l.archived_at.is_none())
                .ok_or_else(|| EngineError::validation("location_id", format!("location {id} is not offered")))?
                .additional_charge
        }
        None => 0,
    };

    let subtotal = base_price
        .checked_add(addons_total)
        .and_then(|s| s.checked_add(location_surcharge))
        .ok_or_else(|| overflow("subtotal"))?;
    let window_modifier = match input.window.and_then(|w| w.price_modifier) {
        Some(PriceModifier::Fixed(amount)) => amount,
        Some(PriceModifier::Percentage(pct)) => percent_of(subtotal, pct)?,
        None => 0,
    };

    let total_amount = subtotal
        .checked_add(window_modifier)
        .ok_or_else(|| overflow("total"))?;
    if total_amount < 0 {
        tracing::error!(
            service_id = %state.service.id,
            base_price, addons_total, location_surcharge, window_modifier,
            "negative booking total"
        );
        return Err(EngineError::Pricing(format!(
            "total {total_amount} for service {} is negative",
            state.service.id
        )));
    }

    let policy = input
        .package
        .map(|p| p.deposit)
        .filter(DepositPolicy::is_required)
        .unwrap_or(state.service.deposit);
    let deposit_amount = match policy {
        DepositPolicy::None => 0,
        DepositPolicy::Percentage(pct) => percent_of(total_amount, pct)?.min(total_amount),
        DepositPolicy::Fixed(amount) => amount.min(total_amount),
    };

    let pricing = PriceBreakdown {
        base_price,
        addons_total,
        location_surcharge,
        window_modifier,
        total_amount,
        deposit_amount,
        remaining_amount: total_amount - deposit_amount,
    };
    if !pricing.is_consistent() {
        tracing::error!(service_id = %state.service.id, ?pricing, "inconsistent price breakdown");
        return Err(EngineError::Pricing(format!("inconsistent breakdown {pricing:?}")));
    }

    let duration_min = addons
        .iter()
        .try_fold(state.service.duration_min, |acc, a| {
            a.duration_min
                .checked_mul(a.quantity)
                .and_then(|extra| acc.checked_add(extra))
        })
        .ok_or_else(|| EngineError::validation("addons", "total duration overflows"))?;

    Ok(Quote {
        pricing,
        addons,
        duration_min,
    })
}

// ── Packages ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PackageDiscount {
    None,
    Amount(Minor),
    Percentage(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackagePrice {
    pub individual_price_total: Minor,
    pub discount_amount: Minor,
    pub discount_percentage: Option<f64>,
    pub total_price: Minor,
}

/// Sum the bundled services at their base prices (optional items included)
/// and apply the package discount.
pub fn price_package(
    items: &[PackageItem],
    base_price_of: impl Fn(Ulid) -> Option<Minor>,
    discount: PackageDiscount,
) -> Result<PackagePrice, EngineError> {
    let mut individual_price_total: Minor = 0;
    for item in items {
        if !(1..=MAX_PACKAGE_ITEM_QUANTITY).contains(&item.quantity) {
            return Err(EngineError::validation(
                "quantity",
                format!("package item {} quantity {} is outside 1..={MAX_PACKAGE_ITEM_QUANTITY}", item.service_id, item.quantity),
            ));
        }
        let price = base_price_of(item.service_id)
            .ok_or_else(|| EngineError::validation("items", format!("service {} is not offered", item.service_id)))?;
        individual_price_total = price
            .checked_mul(item.quantity as Minor)
            .and_then(|line| individual_price_total.checked_add(line))
            .ok_or_else(|| EngineError::Pricing("package price overflows".into()))?;
    }

    let (discount_amount, discount_percentage) = match discount {
        PackageDiscount::None => (0, None),
        PackageDiscount::Amount(a) => (a, None),
        PackageDiscount::Percentage(pct) => {
            if !(0.0..=100.0).contains(&pct) {
                return Err(EngineError::validation("discount_percentage", format!("{pct} is outside 0..=100")));
            }
            (percent_of(individual_price_total, pct)?, Some(pct))
        }
    };
    if discount_amount < 0 || discount_amount > individual_price_total {
        return Err(EngineError::validation(
            "discount_amount",
            format!("{discount_amount} is outside 0..={individual_price_total}"),
        ));
    }

    Ok(PackagePrice {
        individual_price_total,
        discount_amount,
        discount_percentage,
        total_price: individual_price_total - discount_amount,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    struct Fixture {
        state: ServiceState,
        addon: Ulid,
        location: Ulid,
        window: AvailabilityWindow,
    }

    /// Base 120.00, add-on 15.00 (max 2), location −20.00, window +50.00.
    fn fixture() -> Fixture {
        let service = Service {
            deposit: DepositPolicy::Percentage(30.0),
            ..Service::new(Ulid::new(), "Massage", 12000, 60)
        };
        let mut state = ServiceState::new(service);
        let sid = state.service.id;

        let mut addon = ServiceAddOn::new(Ulid::new(), sid, "Hot stones", 1500);
        addon.max_quantity = 2;
        addon.duration_min = 15;
        let addon_id = addon.id;
        state.addons.push(addon);

        let mut location = ServiceLocation::new(Ulid::new(), sid, LocationKind::ClientLocation);
        location.additional_charge = -2000;
        let location_id = location.id;
        state.locations.push(location);

        let mut window = AvailabilityWindow::new(
            Ulid::new(),
            sid,
            WindowKind::SpecialHours,
            WindowPattern::Daily,
            NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(21, 0, 0).unwrap(),
        );
        window.price_modifier = Some(PriceModifier::Fixed(5000));

        Fixture {
            state,
            addon: addon_id,
            location: location_id,
            window,
        }
    }

    #[test]
    fn full_layered_quote() {
        let f = fixture();
        let sel = [AddOnSelection { addon_id: f.addon, quantity: 2 }];
        let q = quote(&QuoteInput {
            state: &f.state,
            location_id: Some(f.location),
            window: Some(&f.window),
            package: None,
            addons: &sel,
        })
        .unwrap();

        assert_eq!(q.pricing.base_price, 12000);
        assert_eq!(q.pricing.addons_total, 3000);
        assert_eq!(q.pricing.location_surcharge, -2000);
        assert_eq!(q.pricing.window_modifier, 5000);
        assert_eq!(q.pricing.total_amount, 18000);
        assert_eq!(q.pricing.deposit_amount, 5400);
        assert_eq!(q.pricing.remaining_amount, 12600);
        assert_eq!(q.duration_min, 90);
        assert_eq!(q.addons[0].unit_price, 1500);
    }

    #[test]
    fn overflowing_addon_total_is_a_pricing_error() {
        let mut f = fixture();
        f.state.addons[0].price = i64::MAX / 2;
        let sel = [AddOnSelection { addon_id: f.addon, quantity: 2 }];
        let err = quote(&QuoteInput {
            state: &f.state,
            location_id: None,
            window: None,
            package: None,
            addons: &sel,
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::Pricing(_)));
    }

    #[test]
    fn overflowing_duration_is_rejected() {
        let mut f = fixture();
        f.state.addons[0].duration_min = 3_000_000_000;
        let sel = [AddOnSelection { addon_id: f.addon, quantity: 2 }];
        let err = quote(&QuoteInput {
            state: &f.state,
            location_id: None,
            window: None,
            package: None,
            addons: &sel,
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation { field: "addons", .. }));
    }

    #[test]
    fn quantity_over_max_is_rejected_not_clamped() {
        let f = fixture();
        let sel = [AddOnSelection { addon_id: f.addon, quantity: 3 }];
        let err = quote(&QuoteInput {
            state: &f.state,
            location_id: None,
            window: None,
            package: None,
            addons: &sel,
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation { field: "quantity", .. }));
    }

    #[test]
    fn bad_selections() {
        let f = fixture();
        let input = |sel: &[AddOnSelection]| {
            quote(&QuoteInput {
                state: &f.state,
                location_id: None,
                window: None,
                package: None,
                addons: sel,
            })
        };
        assert!(input(&[AddOnSelection { addon_id: f.addon, quantity: 0 }]).is_err());
        assert!(input(&[AddOnSelection { addon_id: Ulid::new(), quantity: 1 }]).is_err());
        assert!(input(&[
            AddOnSelection { addon_id: f.addon, quantity: 1 },
            AddOnSelection { addon_id: f.addon, quantity: 1 },
        ])
        .is_err());
    }

    #[test]
    fn missing_required_addon() {
        let mut f = fixture();
        f.state.addons[0].is_required = true;
        let err = quote(&QuoteInput {
            state: &f.state,
            location_id: None,
            window: None,
            package: None,
            addons: &[],
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation { field: "addons", .. }));
    }

    #[test]
    fn percentage_modifier_rounds_half_up() {
        let mut f = fixture();
        f.state.service.base_price = 1005;
        f.state.service.deposit = DepositPolicy::None;
        f.window.price_modifier = Some(PriceModifier::Percentage(10.0));
        let q = quote(&QuoteInput {
            state: &f.state,
            location_id: None,
            window: Some(&f.window),
            package: None,
            addons: &[],
        })
        .unwrap();
        // 100.5 rounds to 101.
        assert_eq!(q.pricing.window_modifier, 101);
        assert_eq!(q.pricing.total_amount, 1106);
        assert_eq!(q.pricing.deposit_amount, 0);
    }

    #[test]
    fn negative_total_is_a_pricing_error() {
        let mut f = fixture();
        f.state.service.base_price = 1000;
        let err = quote(&QuoteInput {
            state: &f.state,
            location_id: Some(f.location),
            window: None,
            package: None,
            addons: &[],
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::Pricing(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn fixed_deposit_is_capped_at_total() {
        let mut f = fixture();
        f.state.service.base_price = 2000;
        f.state.service.deposit = DepositPolicy::Fixed(5000);
        let q = quote(&QuoteInput {
            state: &f.state,
            location_id: None,
            window: None,
            package: None,
            addons: &[],
        })
        .unwrap();
        assert_eq!(q.pricing.deposit_amount, 2000);
        assert_eq!(q.pricing.remaining_amount, 0);
    }

    #[test]
    fn package_price_replaces_base_and_its_deposit_wins() {
        let f = fixture();
        let package = ServicePackage {
            id: Ulid::new(),
            name: "Spa day".into(),
            items: vec![PackageItem {
                service_id: f.state.service.id,
                quantity: 1,
                position: 0,
                optional: false,
            }],
            individual_price_total: 12000,
            discount_amount: 2000,
            discount_percentage: None,
            total_price: 10000,
            deposit: DepositPolicy::Fixed(2500),
            archived_at: None,
        };
        let q = quote(&QuoteInput {
            state: &f.state,
            location_id: None,
            window: None,
            package: Some(&package),
            addons: &[],
        })
        .unwrap();
        assert_eq!(q.pricing.base_price, 10000);
        assert_eq!(q.pricing.deposit_amount, 2500);
    }

    #[test]
    fn package_discount_by_percentage() {
        let a = Ulid::new();
        let b = Ulid::new();
        let items = vec![
            PackageItem { service_id: a, quantity: 2, position: 0, optional: false },
            PackageItem { service_id: b, quantity: 1, position: 1, optional: true },
        ];
        let prices = |id: Ulid| if id == a { Some(5000) } else if id == b { Some(3333) } else { None };

        let p = price_package(&items, prices, PackageDiscount::Percentage(15.0)).unwrap();
        assert_eq!(p.individual_price_total, 13333);
        // 1999.95 rounds to 2000.
        assert_eq!(p.discount_amount, 2000);
        assert_eq!(p.total_price, 11333);

        assert!(price_package(&items, prices, PackageDiscount::Amount(20000)).is_err());
        assert!(price_package(&items, |_| None, PackageDiscount::None).is_err());
    }
}
