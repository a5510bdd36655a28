use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SlotbookAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, ArchiveTarget, Command, SqlError};
use crate::tenant::TenantManager;

pub struct SlotbookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Parse, run and time one statement.
    async fn run(&self, engine: &Engine, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertService(service) => {
                engine.create_service(service).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertLocation(location) => {
                engine.add_location(location).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertWindow(window) => {
                engine.add_window(window).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertAddOn(addon) => {
                engine.add_addon(addon).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertPackage {
                id,
                name,
                items,
                discount,
                deposit,
            } => {
                engine
                    .create_package(id, name, items, discount, deposit)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::UpdateService { id, patch } => {
                engine.update_service(id, &patch).await.map_err(engine_err)?;
                Ok(updated())
            }
            Command::UpdateAddOn { id, patch } => {
                engine.update_addon(id, &patch).await.map_err(engine_err)?;
                Ok(updated())
            }
            Command::Archive { target, id } => {
                match target {
                    ArchiveTarget::Service => engine.archive_service(id).await,
                    ArchiveTarget::Location => engine.archive_location(id).await,
                    ArchiveTarget::Window => engine.deactivate_window(id).await,
                    ArchiveTarget::AddOn => engine.archive_addon(id).await,
                    ArchiveTarget::Package => engine.archive_package(id).await,
                }
                .map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertBooking(req) => {
                let booking = engine.create_booking(req).await.map_err(engine_err)?;
                booking_rows(vec![booking])
            }
            Command::CancelBooking { id } => {
                engine.cancel_booking(id, None).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::TransitionBooking {
                booking_id,
                status,
                reason,
            } => {
                engine
                    .transition_booking(booking_id, status, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::Reschedule {
                id,
                booking_id,
                scheduled_at,
                location_id,
            } => {
                let booking = engine
                    .reschedule_booking(id, booking_id, scheduled_at, location_id)
                    .await
                    .map_err(engine_err)?;
                booking_rows(vec![booking])
            }
            Command::RecordPayment {
                id,
                booking_id,
                payment_type,
            } => {
                let payment = engine
                    .record_payment(id, booking_id, payment_type)
                    .await
                    .map_err(engine_err)?;
                payment_rows(vec![payment])
            }
            Command::Refund { id, booking_id, amount } => {
                let payment = engine
                    .refund_booking(id, booking_id, amount)
                    .await
                    .map_err(engine_err)?;
                payment_rows(vec![payment])
            }
            Command::InsertConsultation(consultation) => {
                engine
                    .schedule_consultation(consultation)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::TransitionConsultation {
                consultation_id,
                status,
            } => {
                engine
                    .transition_consultation(consultation_id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::SelectServices => {
                let schema = Arc::new(services_schema());
                let rows: Vec<PgWireResult<DataRow>> = engine
                    .list_services()
                    .await
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.name)?;
                        encoder.encode_field(&s.status.as_str())?;
                        encoder.encode_field(&s.base_price)?;
                        encoder.encode_field(&(s.duration_min as i64))?;
                        encoder.encode_field(&(s.buffer_min as i64))?;
                        encoder.encode_field(&s.auto_confirm)?;
                        encoder.encode_field(&s.archived_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectBookings {
                id,
                service_id,
                user_id,
            } => {
                let bookings = match id {
                    Some(id) => vec![engine.get_booking(id).await.map_err(engine_err)?],
                    None => engine.list_bookings(service_id, user_id).await,
                };
                booking_rows(bookings)
            }
            Command::SelectPayments { booking_id } => {
                let payments = engine.payments_for(booking_id).await.map_err(engine_err)?;
                payment_rows(payments)
            }
            Command::SelectSlots {
                service_id,
                location_id,
                from,
                to,
                addons,
            } => {
                let slots = engine
                    .available_slots(service_id, location_id, from, to, &addons)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<DataRow>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.service_id.to_string())?;
                        encoder.encode_field(&slot.location_id.map(|l| l.to_string()))?;
                        encoder.encode_field(&slot.window_id.to_string())?;
                        encoder.encode_field(&slot.span.start)?;
                        encoder.encode_field(&slot.span.end)?;
                        encoder.encode_field(&(slot.remaining as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectQuote {
                service_id,
                location_id,
                window_id,
                package_id,
                addons,
            } => {
                let p = engine
                    .quote_booking(service_id, location_id, window_id, package_id, &addons)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(quotes_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&p.base_price)?;
                encoder.encode_field(&p.addons_total)?;
                encoder.encode_field(&p.location_surcharge)?;
                encoder.encode_field(&p.window_modifier)?;
                encoder.encode_field(&p.total_amount)?;
                encoder.encode_field(&p.deposit_amount)?;
                encoder.encode_field(&p.remaining_amount)?;
                Ok(query_response(schema, vec![Ok(encoder.take_row())]))
            }
            Command::SelectAvailability {
                service_id,
                location_id,
                from,
                to,
                min_duration,
            } => {
                let spans = engine
                    .availability(service_id, location_id, from, to, min_duration)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let sid = service_id.to_string();
                let rows: Vec<PgWireResult<DataRow>> = spans
                    .into_iter()
                    .map(|span| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&sid)?;
                        encoder.encode_field(&span.start)?;
                        encoder.encode_field(&span.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectWindows {
                service_id,
                location_id,
                date,
            } => {
                let windows = engine
                    .windows_on(service_id, location_id, date)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(windows_schema());
                let rows: Vec<PgWireResult<DataRow>> = windows
                    .into_iter()
                    .map(|w| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&w.id.to_string())?;
                        encoder.encode_field(&w.location_id.map(|l| l.to_string()))?;
                        encoder.encode_field(&w.kind.as_str())?;
                        encoder.encode_field(&w.pattern.label())?;
                        encoder.encode_field(&w.span_on(date).start)?;
                        encoder.encode_field(&w.span_on(date).end)?;
                        encoder.encode_field(&w.max_bookings.map(i64::from))?;
                        encoder.encode_field(&w.is_bookable)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
        }
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn updated() -> Response {
    Response::Execution(Tag::new("UPDATE").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn booking_rows(bookings: Vec<Booking>) -> PgWireResult<Response> {
    let schema = Arc::new(bookings_schema());
    let rows: Vec<PgWireResult<DataRow>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.user_id.to_string())?;
            encoder.encode_field(&b.service_id.to_string())?;
            encoder.encode_field(&b.location_id.map(|l| l.to_string()))?;
            encoder.encode_field(&b.span.start)?;
            encoder.encode_field(&b.span.end)?;
            encoder.encode_field(&b.status.as_str())?;
            encoder.encode_field(&b.payment_status.as_str())?;
            encoder.encode_field(&b.pricing.total_amount)?;
            encoder.encode_field(&b.pricing.deposit_amount)?;
            encoder.encode_field(&b.pricing.remaining_amount)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(query_response(schema, rows))
}

fn payment_rows(payments: Vec<Payment>) -> PgWireResult<Response> {
    let schema = Arc::new(payments_schema());
    let rows: Vec<PgWireResult<DataRow>> = payments
        .into_iter()
        .map(|p| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&p.id.to_string())?;
            encoder.encode_field(&p.booking_id.to_string())?;
            encoder.encode_field(&p.payment_type.as_str())?;
            encoder.encode_field(&p.amount)?;
            encoder.encode_field(&p.status.as_str())?;
            encoder.encode_field(&p.transaction_reference)?;
            encoder.encode_field(&p.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(query_response(schema, rows))
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn services_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("base_price", Type::INT8),
        field("duration_min", Type::INT8),
        field("buffer_min", Type::INT8),
        field("auto_confirm", Type::BOOL),
        field("archived_at", Type::INT8),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("service_id", Type::VARCHAR),
        field("location_id", Type::VARCHAR),
        field("scheduled_at", Type::INT8),
        field("ends_at", Type::INT8),
        field("status", Type::VARCHAR),
        field("payment_status", Type::VARCHAR),
        field("total_amount", Type::INT8),
        field("deposit_amount", Type::INT8),
        field("remaining_amount", Type::INT8),
    ]
}

fn payments_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("booking_id", Type::VARCHAR),
        field("payment_type", Type::VARCHAR),
        field("amount", Type::INT8),
        field("status", Type::VARCHAR),
        field("transaction_reference", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        field("service_id", Type::VARCHAR),
        field("location_id", Type::VARCHAR),
        field("window_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("remaining", Type::INT8),
    ]
}

fn quotes_schema() -> Vec<FieldInfo> {
    vec![
        field("base_price", Type::INT8),
        field("addons_total", Type::INT8),
        field("location_surcharge", Type::INT8),
        field("window_modifier", Type::INT8),
        field("total_amount", Type::INT8),
        field("deposit_amount", Type::INT8),
        field("remaining_amount", Type::INT8),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("service_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

fn windows_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("location_id", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("pattern", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("max_bookings", Type::INT8),
        field("is_bookable", Type::BOOL),
    ]
}

/// Columns a statement returns. Mutations that echo a row (bookings,
/// reschedules, payments, refunds) share the shape of the table they land in.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if upper.starts_with("INSERT") {
        return match insert_target(&upper) {
            Some("BOOKINGS") | Some("RESCHEDULES") => bookings_schema(),
            Some("PAYMENTS") | Some("REFUNDS") => payments_schema(),
            _ => vec![],
        };
    }
    match sql::select_table(sql).as_deref() {
        Some("services") => services_schema(),
        Some("bookings") => bookings_schema(),
        Some("payments") => payments_schema(),
        Some("slots") => slots_schema(),
        Some("quotes") => quotes_schema(),
        Some("availability") => availability_schema(),
        Some("windows") => windows_schema(),
        _ => vec![],
    }
}

fn insert_target(upper: &str) -> Option<&str> {
    upper
        .split_whitespace()
        .skip_while(|w| *w != "INTO")
        .nth(1)
        .map(|t| t.split('(').next().unwrap_or(t))
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        self.run(&engine, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Numbers travel quoted; the SQL layer accepts quoted integers.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();

    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<SlotbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, user: String, password: String) -> Self {
        Self {
            handler: Arc::new(SlotbookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SlotbookAuthSource::new(user, password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    user: String,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = SlotbookFactory::new(tenant_manager, user, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for an engine failure. Capacity maps to serialization_failure so
/// clients treat it as retryable.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation { .. } => "22023",
        EngineError::Capacity { .. } => "40001",
        EngineError::Pricing(_) => "XX000",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::NotFound(_) => "02000",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Gateway(_) | EngineError::WalError(_) => "58000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if !e.is_recoverable() {
        tracing::error!("engine failure: {e}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), "42601".into(), e.to_string())))
}
