use std::collections::HashMap;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::{BookingRequest, PackageDiscount};
use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveTarget {
    Service,
    Location,
    Window,
    AddOn,
    Package,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertService(Service),
    InsertLocation(ServiceLocation),
    InsertWindow(AvailabilityWindow),
    InsertAddOn(ServiceAddOn),
    InsertPackage {
        id: Ulid,
        name: String,
        items: Vec<PackageItem>,
        discount: PackageDiscount,
        deposit: DepositPolicy,
    },
    UpdateService {
        id: Ulid,
        patch: ServicePatch,
    },
    UpdateAddOn {
        id: Ulid,
        patch: AddOnPatch,
    },
    Archive {
        target: ArchiveTarget,
        id: Ulid,
    },
    InsertBooking(BookingRequest),
    CancelBooking {
        id: Ulid,
    },
    TransitionBooking {
        booking_id: Ulid,
        status: BookingStatus,
        reason: Option<String>,
    },
    Reschedule {
        id: Ulid,
        booking_id: Ulid,
        scheduled_at: Ms,
        location_id: Option<Ulid>,
    },
    RecordPayment {
        id: Ulid,
        booking_id: Ulid,
        payment_type: PaymentType,
    },
    Refund {
        id: Ulid,
        booking_id: Ulid,
        amount: Minor,
    },
    InsertConsultation(ConsultationBooking),
    TransitionConsultation {
        consultation_id: Ulid,
        status: ConsultationStatus,
    },
    SelectServices,
    SelectBookings {
        id: Option<Ulid>,
        service_id: Option<Ulid>,
        user_id: Option<Ulid>,
    },
    SelectPayments {
        booking_id: Ulid,
    },
    SelectSlots {
        service_id: Ulid,
        location_id: Option<Ulid>,
        from: NaiveDate,
        to: NaiveDate,
        addons: Vec<AddOnSelection>,
    },
    SelectQuote {
        service_id: Ulid,
        location_id: Option<Ulid>,
        window_id: Option<Ulid>,
        package_id: Option<Ulid>,
        addons: Vec<AddOnSelection>,
    },
    SelectAvailability {
        service_id: Ulid,
        location_id: Option<Ulid>,
        from: NaiveDate,
        to: NaiveDate,
        min_duration: Option<Ms>,
    },
    SelectWindows {
        service_id: Ulid,
        location_id: Option<Ulid>,
        date: NaiveDate,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table a SELECT reads from, without validating its filters. Used to
/// describe result columns before parameters are bound.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    match stmts.first()? {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(s) => s.from.first().and_then(|t| table_factor_name(&t.relation).ok()),
            _ => None,
        },
        _ => None,
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = Row::from_insert(insert)?;

    match table.as_str() {
        "services" => {
            let defaults = Service::new(row.ulid("id")?, row.string("name")?, row.i64("base_price")?, row.u32("duration_min")?);
            Ok(Command::InsertService(Service {
                status: row.label_or("status", ServiceStatus::Active)?,
                buffer_min: row.opt_u32("buffer_min")?.unwrap_or(0),
                deposit: row.deposit()?,
                min_advance_hours: row.opt_u32("min_advance_hours")?,
                max_advance_days: row.opt_u32("max_advance_days")?,
                auto_confirm: row.bool_or("auto_confirm", false)?,
                ..defaults
            }))
        }
        "locations" => {
            let defaults = ServiceLocation::new(row.ulid("id")?, row.ulid("service_id")?, row.label("kind")?);
            Ok(Command::InsertLocation(ServiceLocation {
                name: row.opt_string("name")?,
                additional_charge: row.opt_i64("additional_charge")?.unwrap_or(0),
                max_capacity: row.opt_u32("max_capacity")?.unwrap_or(1),
                ..defaults
            }))
        }
        "windows" => {
            let defaults = AvailabilityWindow::new(
                row.ulid("id")?,
                row.ulid("service_id")?,
                row.label_or("kind", WindowKind::Regular)?,
                row.pattern()?,
                row.time("start_time")?,
                row.time("end_time")?,
            );
            Ok(Command::InsertWindow(AvailabilityWindow {
                location_id: row.opt_ulid("location_id")?,
                slot_duration_min: row.opt_u32("slot_duration_min")?,
                break_min: row.opt_u32("break_min")?.unwrap_or(0),
                max_bookings: row.opt_u32("max_bookings")?.or(defaults.max_bookings),
                price_modifier: row.price_modifier()?,
                is_bookable: row.bool_or("is_bookable", defaults.is_bookable)?,
                min_advance_hours: row.opt_u32("min_advance_hours")?,
                max_advance_days: row.opt_u32("max_advance_days")?,
                ..defaults
            }))
        }
        "addons" => {
            let defaults = ServiceAddOn::new(row.ulid("id")?, row.ulid("service_id")?, row.string("name")?, row.i64("price")?);
            Ok(Command::InsertAddOn(ServiceAddOn {
                duration_min: row.opt_u32("duration_min")?.unwrap_or(0),
                max_quantity: row.opt_u32("max_quantity")?.unwrap_or(1),
                is_required: row.bool_or("is_required", false)?,
                ..defaults
            }))
        }
        "packages" => {
            let discount = match (row.opt_i64("discount_amount")?, row.opt_f64("discount_percentage")?) {
                (Some(_), Some(_)) => {
                    return Err(SqlError::BadValue("discount_amount", "give an amount or a percentage, not both".into()));
                }
                (Some(a), None) => PackageDiscount::Amount(a),
                (None, Some(p)) => PackageDiscount::Percentage(p),
                (None, None) => PackageDiscount::None,
            };
            Ok(Command::InsertPackage {
                id: row.ulid("id")?,
                name: row.string("name")?,
                items: parse_package_items(&row.string("services")?)?,
                discount,
                deposit: row.deposit()?,
            })
        }
        "bookings" => Ok(Command::InsertBooking(BookingRequest {
            id: row.ulid("id")?,
            user_id: row.ulid("user_id")?,
            service_id: row.ulid("service_id")?,
            location_id: row.opt_ulid("location_id")?,
            package_id: row.opt_ulid("package_id")?,
            window_id: row.opt_ulid("window_id")?,
            scheduled_at: row.i64("scheduled_at")?,
            addons: match row.opt_string("addons")? {
                Some(list) => parse_addon_list(&list)?,
                None => Vec::new(),
            },
            client: ClientDetails {
                name: row.opt_string("client_name")?,
                email: row.opt_string("client_email")?,
                phone: row.opt_string("client_phone")?,
                notes: row.opt_string("notes")?,
            },
        })),
        "booking_transitions" => Ok(Command::TransitionBooking {
            booking_id: row.ulid("booking_id")?,
            status: row.label("status")?,
            reason: row.opt_string("reason")?,
        }),
        "reschedules" => Ok(Command::Reschedule {
            id: row.ulid("id")?,
            booking_id: row.ulid("booking_id")?,
            scheduled_at: row.i64("scheduled_at")?,
            location_id: row.opt_ulid("location_id")?,
        }),
        "payments" => Ok(Command::RecordPayment {
            id: row.ulid("id")?,
            booking_id: row.ulid("booking_id")?,
            payment_type: row.label("payment_type")?,
        }),
        "refunds" => Ok(Command::Refund {
            id: row.ulid("id")?,
            booking_id: row.ulid("booking_id")?,
            amount: row.i64("amount")?,
        }),
        "consultations" => {
            let start = row.i64("scheduled_at")?;
            let end = row.i64("ends_at")?;
            if end <= start {
                return Err(SqlError::BadValue("ends_at", "must be after scheduled_at".into()));
            }
            Ok(Command::InsertConsultation(ConsultationBooking {
                id: row.ulid("id")?,
                user_id: row.ulid("user_id")?,
                booking_id: row.opt_ulid("booking_id")?,
                span: Span::new(start, end),
                status: ConsultationStatus::Scheduled,
                notes: row.opt_string("notes")?,
                started_at: None,
                completed_at: None,
            }))
        }
        "consultation_transitions" => Ok(Command::TransitionConsultation {
            consultation_id: row.ulid("consultation_id")?,
            status: row.label("status")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

const SERVICE_UPDATABLE: &[&str] = &[
    "name",
    "status",
    "base_price",
    "duration_min",
    "buffer_min",
    "deposit_percentage",
    "deposit_amount",
    "min_advance_hours",
    "max_advance_days",
    "auto_confirm",
];
const ADDON_UPDATABLE: &[&str] = &["name", "price", "duration_min", "max_quantity", "is_required"];

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table_name = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;
    let row = Row::from_assignments(assignments)?;

    match table_name.as_str() {
        "services" => {
            row.only(&table_name, SERVICE_UPDATABLE)?;
            let deposit = if row.has("deposit_percentage") || row.has("deposit_amount") {
                Some(row.deposit()?)
            } else {
                None
            };
            Ok(Command::UpdateService {
                id,
                patch: ServicePatch {
                    name: row.opt_string("name")?,
                    status: row.opt_label("status")?,
                    base_price: row.opt_i64("base_price")?,
                    duration_min: row.opt_u32("duration_min")?,
                    buffer_min: row.opt_u32("buffer_min")?,
                    deposit,
                    min_advance_hours: row.nullable_u32("min_advance_hours")?,
                    max_advance_days: row.nullable_u32("max_advance_days")?,
                    auto_confirm: row.get("auto_confirm").map(parse_bool).transpose()?,
                },
            })
        }
        "addons" => {
            row.only(&table_name, ADDON_UPDATABLE)?;
            Ok(Command::UpdateAddOn {
                id,
                patch: AddOnPatch {
                    name: row.opt_string("name")?,
                    price: row.opt_i64("price")?,
                    duration_min: row.opt_u32("duration_min")?,
                    max_quantity: row.opt_u32("max_quantity")?,
                    is_required: row.get("is_required").map(parse_bool).transpose()?,
                },
            })
        }
        "locations" | "windows" | "packages" | "bookings" | "payments" | "consultations" => Err(
            SqlError::Unsupported(format!("UPDATE {table_name}; archive and insert a replacement instead")),
        ),
        _ => Err(SqlError::UnknownTable(table_name)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    let target = match table.as_str() {
        "bookings" => return Ok(Command::CancelBooking { id }),
        "services" => ArchiveTarget::Service,
        "locations" => ArchiveTarget::Location,
        "windows" => ArchiveTarget::Window,
        "addons" => ArchiveTarget::AddOn,
        "packages" => ArchiveTarget::Package,
        _ => return Err(SqlError::UnknownTable(table)),
    };
    Ok(Command::Archive { target, id })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        filters.collect(selection);
    }

    match table.as_str() {
        "services" => Ok(Command::SelectServices),
        "bookings" => Ok(Command::SelectBookings {
            id: filters.opt_ulid("id")?,
            service_id: filters.opt_ulid("service_id")?,
            user_id: filters.opt_ulid("user_id")?,
        }),
        "payments" => Ok(Command::SelectPayments {
            booking_id: filters.ulid("booking_id")?,
        }),
        "slots" => {
            let (from, to) = filters.date_range()?;
            Ok(Command::SelectSlots {
                service_id: filters.ulid("service_id")?,
                location_id: filters.opt_ulid("location_id")?,
                from,
                to,
                addons: filters.addons()?,
            })
        }
        "quotes" => Ok(Command::SelectQuote {
            service_id: filters.ulid("service_id")?,
            location_id: filters.opt_ulid("location_id")?,
            window_id: filters.opt_ulid("window_id")?,
            package_id: filters.opt_ulid("package_id")?,
            addons: filters.addons()?,
        }),
        "availability" => {
            let (from, to) = filters.date_range()?;
            Ok(Command::SelectAvailability {
                service_id: filters.ulid("service_id")?,
                location_id: filters.opt_ulid("location_id")?,
                from,
                to,
                min_duration: match filters.eq.get("min_duration") {
                    Some(e) => Some(parse_i64_expr(e)?),
                    None => None,
                },
            })
        }
        "windows" => Ok(Command::SelectWindows {
            service_id: filters.ulid("service_id")?,
            location_id: filters.opt_ulid("location_id")?,
            date: match filters.eq.get("date") {
                Some(e) => parse_date_expr(e, "date")?,
                None => return Err(SqlError::MissingFilter("date")),
            },
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `addon_id[:quantity]`, comma separated.
fn parse_addon_list(list: &str) -> Result<Vec<AddOnSelection>, SqlError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (id, quantity) = split_quantity(entry, "addons")?;
            Ok(AddOnSelection { addon_id: id, quantity })
        })
        .collect()
}

/// `service_id[:quantity]`, comma separated, in display order.
fn parse_package_items(list: &str) -> Result<Vec<PackageItem>, SqlError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(position, entry)| {
            let (service_id, quantity) = split_quantity(entry, "services")?;
            Ok(PackageItem {
                service_id,
                quantity,
                position: position as u32,
                optional: false,
            })
        })
        .collect()
}

fn split_quantity(entry: &str, column: &'static str) -> Result<(Ulid, u32), SqlError> {
    let (id, quantity): (&str, u32) = match entry.split_once(':') {
        Some((id, q)) => (
            id,
            q.trim()
                .parse()
                .map_err(|e| SqlError::BadValue(column, format!("bad quantity in {entry}: {e}")))?,
        ),
        None => (entry, 1),
    };
    let id = Ulid::from_string(id.trim()).map_err(|e| SqlError::BadValue(column, format!("bad ULID in {entry}: {e}")))?;
    Ok((id, quantity))
}

// ── INSERT / UPDATE rows ──────────────────────────────────────

/// One VALUES row (or SET list) keyed by column name. NULL reads as absent.
struct Row {
    values: HashMap<String, Expr>,
}

impl Row {
    fn from_insert(insert: &ast::Insert) -> Result<Self, SqlError> {
        let values = extract_insert_values(insert)?;
        if insert.columns.is_empty() {
            return Err(SqlError::Parse("INSERT needs an explicit column list".into()));
        }
        if insert.columns.len() != values.len() {
            return Err(SqlError::Parse(format!(
                "{} columns but {} values",
                insert.columns.len(),
                values.len()
            )));
        }
        let values = insert
            .columns
            .iter()
            .map(|c| c.value.to_lowercase())
            .zip(values)
            .collect();
        Ok(Self { values })
    }

    fn from_assignments(assignments: &[ast::Assignment]) -> Result<Self, SqlError> {
        if assignments.is_empty() {
            return Err(SqlError::Parse("UPDATE needs at least one SET column".into()));
        }
        let mut values = HashMap::new();
        for a in assignments {
            let col = match &a.target {
                ast::AssignmentTarget::ColumnName(name) => object_name_last(name),
                ast::AssignmentTarget::Tuple(_) => None,
            }
            .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
            values.insert(col, a.value.clone());
        }
        Ok(Self { values })
    }

    fn has(&self, col: &str) -> bool {
        self.values.contains_key(col)
    }

    /// Every column must be one of `allowed`.
    fn only(&self, table: &str, allowed: &[&str]) -> Result<(), SqlError> {
        match self.values.keys().find(|c| !allowed.contains(&c.as_str())) {
            Some(col) => Err(SqlError::Unsupported(format!("UPDATE of {table}.{col}"))),
            None => Ok(()),
        }
    }

    /// Absent ⇒ `None`, NULL ⇒ `Some(None)`, value ⇒ `Some(Some(v))`.
    fn nullable_u32(&self, col: &'static str) -> Result<Option<Option<u32>>, SqlError> {
        if !self.has(col) {
            return Ok(None);
        }
        self.opt_u32(col).map(Some)
    }

    fn get(&self, col: &str) -> Option<&Expr> {
        self.values
            .get(col)
            .filter(|e| !matches!(extract_value(e), Some(Value::Null)))
    }

    fn require(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(col))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.require(col)?)
    }

    fn opt_ulid(&self, col: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.get(col).map(parse_ulid_expr).transpose()
    }

    fn i64(&self, col: &'static str) -> Result<i64, SqlError> {
        parse_i64_expr(self.require(col)?)
    }

    fn opt_i64(&self, col: &'static str) -> Result<Option<i64>, SqlError> {
        self.get(col).map(parse_i64_expr).transpose()
    }

    fn u32(&self, col: &'static str) -> Result<u32, SqlError> {
        to_u32(self.i64(col)?, col)
    }

    fn opt_u32(&self, col: &'static str) -> Result<Option<u32>, SqlError> {
        self.opt_i64(col)?.map(|v| to_u32(v, col)).transpose()
    }

    fn opt_f64(&self, col: &'static str) -> Result<Option<f64>, SqlError> {
        self.get(col).map(parse_f64_expr).transpose()
    }

    fn string(&self, col: &'static str) -> Result<String, SqlError> {
        parse_string_expr(self.require(col)?, col)
    }

    fn opt_string(&self, col: &'static str) -> Result<Option<String>, SqlError> {
        self.get(col).map(|e| parse_string_expr(e, col)).transpose()
    }

    fn bool_or(&self, col: &'static str, default: bool) -> Result<bool, SqlError> {
        self.get(col).map_or(Ok(default), parse_bool)
    }

    fn label<T: FromStr<Err = String>>(&self, col: &'static str) -> Result<T, SqlError> {
        self.string(col)?.parse().map_err(|e| SqlError::BadValue(col, e))
    }

    fn label_or<T: FromStr<Err = String>>(&self, col: &'static str, default: T) -> Result<T, SqlError> {
        Ok(self.opt_label(col)?.unwrap_or(default))
    }

    fn opt_label<T: FromStr<Err = String>>(&self, col: &'static str) -> Result<Option<T>, SqlError> {
        self.opt_string(col)?
            .map(|s| s.parse().map_err(|e| SqlError::BadValue(col, e)))
            .transpose()
    }

    fn date(&self, col: &'static str) -> Result<NaiveDate, SqlError> {
        parse_date_expr(self.require(col)?, col)
    }

    fn time(&self, col: &'static str) -> Result<NaiveTime, SqlError> {
        let s = self.string(col)?;
        NaiveTime::parse_from_str(&s, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M:%S"))
            .map_err(|e| SqlError::BadValue(col, format!("{s}: {e}")))
    }

    fn deposit(&self) -> Result<DepositPolicy, SqlError> {
        match (self.opt_f64("deposit_percentage")?, self.opt_i64("deposit_amount")?) {
            (Some(_), Some(_)) => Err(SqlError::BadValue(
                "deposit_amount",
                "give an amount or a percentage, not both".into(),
            )),
            (Some(p), None) => Ok(DepositPolicy::Percentage(p)),
            (None, Some(a)) => Ok(DepositPolicy::Fixed(a)),
            (None, None) => Ok(DepositPolicy::None),
        }
    }

    fn price_modifier(&self) -> Result<Option<PriceModifier>, SqlError> {
        match (self.opt_i64("price_modifier_amount")?, self.opt_f64("price_modifier_percentage")?) {
            (Some(_), Some(_)) => Err(SqlError::BadValue(
                "price_modifier_amount",
                "give an amount or a percentage, not both".into(),
            )),
            (Some(a), None) => Ok(Some(PriceModifier::Fixed(a))),
            (None, Some(p)) => Ok(Some(PriceModifier::Percentage(p))),
            (None, None) => Ok(None),
        }
    }

    /// `pattern` names the recurrence; without it a `day_of_week` means weekly
    /// and anything else means daily.
    fn pattern(&self) -> Result<WindowPattern, SqlError> {
        let pattern = match self.opt_string("pattern")? {
            Some(p) => p.to_lowercase(),
            None if self.get("day_of_week").is_some() => "weekly".into(),
            None => "daily".into(),
        };
        match pattern.as_str() {
            "weekly" => {
                let dow = self.u32("day_of_week")?;
                let day_of_week = u8::try_from(dow).map_err(|_| SqlError::BadValue("day_of_week", format!("{dow}")))?;
                Ok(WindowPattern::Weekly { day_of_week })
            }
            "daily" => Ok(WindowPattern::Daily),
            "date_range" => Ok(WindowPattern::DateRange {
                start: self.date("start_date")?,
                end: self.date("end_date")?,
            }),
            "specific_date" => Ok(WindowPattern::SpecificDate(self.date("specific_date")?)),
            other => Err(SqlError::BadValue("pattern", format!("unknown pattern {other}"))),
        }
    }
}

// ── WHERE filters ─────────────────────────────────────────────

/// Column comparisons joined by AND.
#[derive(Default)]
struct Filters {
    eq: HashMap<String, Expr>,
    ge: HashMap<String, Expr>,
    le: HashMap<String, Expr>,
}

impl Filters {
    fn collect(&mut self, expr: &Expr) {
        if let Expr::BinaryOp { left, op, right } = expr {
            let target = match op {
                ast::BinaryOperator::And => {
                    self.collect(left);
                    self.collect(right);
                    return;
                }
                ast::BinaryOperator::Eq => &mut self.eq,
                ast::BinaryOperator::GtEq => &mut self.ge,
                ast::BinaryOperator::LtEq => &mut self.le,
                _ => return,
            };
            if let Some(col) = expr_column_name(left) {
                target.insert(col, right.as_ref().clone());
            }
        }
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        self.opt_ulid(col)?.ok_or(SqlError::MissingFilter(col))
    }

    fn opt_ulid(&self, col: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.eq.get(col).map(parse_ulid_expr).transpose()
    }

    /// `date = d`, or `date >= from AND date <= to`.
    fn date_range(&self) -> Result<(NaiveDate, NaiveDate), SqlError> {
        if let Some(e) = self.eq.get("date") {
            let d = parse_date_expr(e, "date")?;
            return Ok((d, d));
        }
        let from = self.ge.get("date").ok_or(SqlError::MissingFilter("date"))?;
        let to = self.le.get("date").ok_or(SqlError::MissingFilter("date"))?;
        Ok((parse_date_expr(from, "date")?, parse_date_expr(to, "date")?))
    }

    fn addons(&self) -> Result<Vec<AddOnSelection>, SqlError> {
        match self.eq.get("addons") {
            Some(e) => parse_addon_list(&parse_string_expr(e, "addons")?),
            None => Ok(Vec::new()),
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_expr(expr: &Expr, col: &'static str) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        _ => Err(SqlError::BadValue(col, format!("expected string, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => {
                s.parse().map_err(|e| SqlError::Parse(format!("bad i64 {s}: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_f64_expr(expr: &Expr) -> Result<f64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => {
                s.parse().map_err(|e| SqlError::Parse(format!("bad number {s}: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_f64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_date_expr(expr: &Expr, col: &'static str) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr, col)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::BadValue(col, format!("{s}: {e}")))
}

fn to_u32(v: i64, col: &'static str) -> Result<u32, SqlError> {
    u32::try_from(v).map_err(|_| SqlError::BadValue(col, format!("{v} out of range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("bad value for {0}: {1}")]
    BadValue(&'static str, String),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
