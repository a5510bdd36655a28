use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn validate_instant(t: Ms, field: &'static str) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::validation(field, format!("{t} is out of range")));
    }
    Ok(())
}

pub(crate) fn validate_name(name: &str, field: &'static str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::validation(field, "must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

pub(crate) fn validate_text(text: Option<&str>) -> Result<(), EngineError> {
    if text.is_some_and(|t| t.len() > MAX_TEXT_LEN) {
        return Err(EngineError::LimitExceeded("text too long"));
    }
    Ok(())
}

pub(crate) fn validate_deposit(policy: &DepositPolicy) -> Result<(), EngineError> {
    match *policy {
        DepositPolicy::None => Ok(()),
        DepositPolicy::Percentage(pct) if pct > 0.0 && pct <= 100.0 => Ok(()),
        DepositPolicy::Percentage(pct) => Err(EngineError::validation(
            "deposit_percentage",
            format!("{pct} is outside (0, 100]"),
        )),
        DepositPolicy::Fixed(amount) if amount > 0 => Ok(()),
        DepositPolicy::Fixed(amount) => Err(EngineError::validation(
            "deposit_amount",
            format!("{amount} must be positive"),
        )),
    }
}

/// Non-negative and no larger than `MAX_PRICE_MINOR`.
pub(crate) fn validate_price(amount: Minor, field: &'static str) -> Result<(), EngineError> {
    if !(0..=MAX_PRICE_MINOR).contains(&amount) {
        return Err(EngineError::validation(field, format!("{amount} is outside 0..={MAX_PRICE_MINOR}")));
    }
    Ok(())
}

/// Signed adjustments (surcharges, discounts) share the price bound.
pub(crate) fn validate_adjustment(amount: Minor, field: &'static str) -> Result<(), EngineError> {
    if amount.unsigned_abs() > MAX_PRICE_MINOR as u64 {
        return Err(EngineError::validation(field, format!("{amount} is beyond ±{MAX_PRICE_MINOR}")));
    }
    Ok(())
}

pub(crate) fn validate_service(service: &Service) -> Result<(), EngineError> {
    validate_name(&service.name, "name")?;
    if service.duration_min == 0 {
        return Err(EngineError::validation("duration_min", "must be positive"));
    }
    if service.duration_min > MAX_DURATION_MIN {
        return Err(EngineError::validation(
            "duration_min",
            format!("{} is over {MAX_DURATION_MIN}", service.duration_min),
        ));
    }
    validate_price(service.base_price, "base_price")?;
    validate_deposit(&service.deposit)
}

pub(crate) fn validate_window(window: &AvailabilityWindow) -> Result<(), EngineError> {
    if window.start_time >= window.end_time {
        return Err(EngineError::validation("end_time", "must be after start_time"));
    }
    match window.pattern {
        WindowPattern::Weekly { day_of_week } if day_of_week > 6 => {
            return Err(EngineError::validation("day_of_week", format!("{day_of_week} is outside 0..=6")));
        }
        WindowPattern::DateRange { start, end } if start > end => {
            return Err(EngineError::validation("end_date", "must not be before start_date"));
        }
        _ => {}
    }
    if window.slot_duration_min.is_some_and(|m| !(MIN_SLOT_STEP_MIN..=MAX_DURATION_MIN).contains(&m)) {
        return Err(EngineError::validation(
            "slot_duration_min",
            format!("must be within {MIN_SLOT_STEP_MIN}..={MAX_DURATION_MIN}"),
        ));
    }
    if window.break_min > MAX_DURATION_MIN {
        return Err(EngineError::validation("break_min", format!("{} is over {MAX_DURATION_MIN}", window.break_min)));
    }
    if let Some(PriceModifier::Percentage(pct)) = window.price_modifier
        && !pct.is_finite()
    {
        return Err(EngineError::validation("price_modifier", "percentage must be finite"));
    }
    if let Some(PriceModifier::Fixed(amount)) = window.price_modifier {
        validate_adjustment(amount, "price_modifier_amount")?;
    }
    Ok(())
}

pub(crate) fn validate_client(client: &ClientDetails) -> Result<(), EngineError> {
    for field in [&client.name, &client.email, &client.phone] {
        if field.as_ref().is_some_and(|v| v.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("client detail too long"));
        }
    }
    validate_text(client.notes.as_deref())
}
