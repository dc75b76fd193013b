use std::fmt::Debug;
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

use crate::auth::SerialbookAuthSource;
use crate::engine::{Engine, EngineError, ErrorKind};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, BookingFilter, Command};
use crate::tenant::TenantManager;

pub struct SerialbookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SerialbookQueryParser>,
}

impl SerialbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SerialbookQueryParser),
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

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = run_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }
}

async fn run_command(engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
    match cmd {
        Command::UpsertConfig(config) => {
            engine.save_config(config).await.map_err(engine_err)?;
            Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
        }
        Command::DeactivateConfig { id } => {
            engine.deactivate_config(id).await.map_err(engine_err)?;
            Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
        }
        Command::UpsertOverride(date_override) => {
            engine.save_override(date_override).await.map_err(engine_err)?;
            Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
        }
        Command::InsertBooking { request, source } => {
            let booked = match source {
                BookingSource::SelfService => engine.create_booking(request).await,
                BookingSource::Staff => engine.assign_walk_in(request).await,
            };
            booked.map_err(engine_err)?;
            Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
        }
        Command::ChangeStatus { booking_id, change } => {
            engine
                .change_status(booking_id, change)
                .await
                .map_err(engine_err)?;
            Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
        }
        Command::SelectSettings { provider, date } => {
            let settings = engine
                .resolve_settings(&provider, date)
                .await
                .map_err(engine_err)?;
            Ok(vec![rows(settings_schema(), &[settings], encode_settings)])
        }
        Command::SelectSerials { provider, date } => {
            let availability = engine
                .available_serials(&provider, date)
                .await
                .map_err(engine_err)?;
            let window = availability.settings.window;
            let total = availability.settings.total_slots;
            let slots: Vec<(u32, TimeWindow)> = availability
                .serials
                .iter()
                .map(|s| (*s, window.slice(*s, total)))
                .collect();
            Ok(vec![rows(serials_schema(), &slots, |enc, (serial, slot)| {
                enc.encode_field(&(*serial as i64))?;
                enc.encode_field(&format_minute_of_day(slot.start))?;
                enc.encode_field(&format_minute_of_day(slot.end))
            })])
        }
        Command::SelectBookings(filter) => {
            let bookings = match filter {
                BookingFilter::ById(id) => match engine.get_booking(id).await {
                    Ok(b) => vec![b],
                    Err(EngineError::NotFound(_)) => Vec::new(),
                    Err(e) => return Err(engine_err(e)),
                },
                BookingFilter::ByDay { provider, date } => engine
                    .list_day_bookings(&provider, date)
                    .await
                    .map_err(engine_err)?,
            };
            Ok(vec![rows(bookings_schema(), &bookings, encode_booking)])
        }
        Command::SelectConfigs { provider } => {
            let configs = engine
                .list_configs(provider.as_ref())
                .await
                .map_err(engine_err)?;
            Ok(vec![rows(configs_schema(), &configs, encode_config)])
        }
        Command::SelectOverrides { config_id } => {
            let overrides = engine
                .list_overrides(config_id)
                .await
                .map_err(engine_err)?;
            Ok(vec![rows(overrides_schema(), &overrides, encode_override)])
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let encoded: Vec<PgWireResult<DataRow>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(encoded)))
}

fn column(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn provider_columns() -> [FieldInfo; 3] {
    [
        column("provider_kind", Type::VARCHAR),
        column("provider_id", Type::VARCHAR),
        column("parent_org_id", Type::VARCHAR),
    ]
}

fn settings_schema() -> Vec<FieldInfo> {
    let mut schema = vec![column("config_id", Type::VARCHAR)];
    schema.extend(provider_columns());
    schema.extend([
        column("date", Type::VARCHAR),
        column("total_slots", Type::INT8),
        column("window_start", Type::VARCHAR),
        column("window_end", Type::VARCHAR),
        column("price", Type::INT8),
        column("admin_note", Type::VARCHAR),
        column("bookable", Type::BOOL),
        column("closure", Type::VARCHAR),
    ]);
    schema
}

fn serials_schema() -> Vec<FieldInfo> {
    vec![
        column("serial", Type::INT8),
        column("time_slot_start", Type::VARCHAR),
        column("time_slot_end", Type::VARCHAR),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    let mut schema = vec![column("id", Type::VARCHAR)];
    schema.extend(provider_columns());
    schema.extend([
        column("booking_date", Type::VARCHAR),
        column("serial", Type::INT8),
        column("patient_id", Type::VARCHAR),
        column("status", Type::VARCHAR),
        column("source", Type::VARCHAR),
        column("time_slot_start", Type::VARCHAR),
        column("time_slot_end", Type::VARCHAR),
        column("fee", Type::INT8),
        column("cancelled_by", Type::VARCHAR),
        column("reason", Type::VARCHAR),
        column("created_at", Type::INT8),
        column("updated_at", Type::INT8),
    ]);
    schema
}

fn configs_schema() -> Vec<FieldInfo> {
    let mut schema = vec![column("id", Type::VARCHAR)];
    schema.extend(provider_columns());
    schema.extend([
        column("total_slots", Type::INT8),
        column("window_start", Type::VARCHAR),
        column("window_end", Type::VARCHAR),
        column("price", Type::INT8),
        column("available_days", Type::VARCHAR),
        column("is_active", Type::BOOL),
    ]);
    schema
}

fn overrides_schema() -> Vec<FieldInfo> {
    vec![
        column("config_id", Type::VARCHAR),
        column("date", Type::VARCHAR),
        column("total_slots", Type::INT8),
        column("window_start", Type::VARCHAR),
        column("window_end", Type::VARCHAR),
        column("price", Type::INT8),
        column("admin_note", Type::VARCHAR),
        column("enabled", Type::BOOL),
    ]
}

fn encode_provider(enc: &mut DataRowEncoder, provider: &ProviderKey) -> PgWireResult<()> {
    enc.encode_field(&provider.kind.to_string())?;
    enc.encode_field(&provider.id)?;
    enc.encode_field(&provider.parent_org_id)
}

fn encode_settings(enc: &mut DataRowEncoder, s: &EffectiveSettings) -> PgWireResult<()> {
    enc.encode_field(&s.config_id.to_string())?;
    encode_provider(enc, &s.provider)?;
    enc.encode_field(&s.date.to_string())?;
    enc.encode_field(&(s.total_slots as i64))?;
    enc.encode_field(&format_minute_of_day(s.window.start))?;
    enc.encode_field(&format_minute_of_day(s.window.end))?;
    enc.encode_field(&(s.price as i64))?;
    enc.encode_field(&s.admin_note)?;
    enc.encode_field(&s.is_bookable())?;
    enc.encode_field(&s.closure.map(|c| c.to_string()))
}

fn encode_booking(enc: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    enc.encode_field(&b.id.to_string())?;
    encode_provider(enc, &b.provider)?;
    enc.encode_field(&b.date.to_string())?;
    enc.encode_field(&(b.serial as i64))?;
    enc.encode_field(&b.patient_id)?;
    enc.encode_field(&b.status.to_string())?;
    enc.encode_field(&b.source.as_str().to_string())?;
    enc.encode_field(&format_minute_of_day(b.time_slot.start))?;
    enc.encode_field(&format_minute_of_day(b.time_slot.end))?;
    enc.encode_field(&(b.fee as i64))?;
    enc.encode_field(&b.cancelled_by.map(|a| a.to_string()))?;
    enc.encode_field(&b.reason)?;
    enc.encode_field(&b.created_at)?;
    enc.encode_field(&b.updated_at)
}

fn encode_config(enc: &mut DataRowEncoder, c: &ProviderSerialConfig) -> PgWireResult<()> {
    enc.encode_field(&c.id.to_string())?;
    encode_provider(enc, &c.provider)?;
    enc.encode_field(&(c.total_slots as i64))?;
    enc.encode_field(&format_minute_of_day(c.window.start))?;
    enc.encode_field(&format_minute_of_day(c.window.end))?;
    enc.encode_field(&(c.price as i64))?;
    enc.encode_field(&c.available_days.to_string())?;
    enc.encode_field(&c.is_active)
}

fn encode_override(enc: &mut DataRowEncoder, o: &DateOverride) -> PgWireResult<()> {
    enc.encode_field(&o.config_id.to_string())?;
    enc.encode_field(&o.date.to_string())?;
    enc.encode_field(&o.total_slots.map(i64::from))?;
    enc.encode_field(&o.window.map(|w| format_minute_of_day(w.start)))?;
    enc.encode_field(&o.window.map(|w| format_minute_of_day(w.end)))?;
    enc.encode_field(&o.price.map(|p| p as i64))?;
    enc.encode_field(&o.admin_note)?;
    enc.encode_field(&o.enabled)
}

/// Result columns for a statement, picked from the table after `FROM`.
/// Anything that is not a SELECT has none.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let mut words = lower
        .split(|c: char| c.is_whitespace() || c == ';' || c == ',')
        .filter(|w| !w.is_empty());
    if words.next() != Some("select") {
        return Vec::new();
    }
    match words.skip_while(|w| *w != "from").nth(1) {
        Some("settings") => settings_schema(),
        Some("serials") => serials_schema(),
        Some("bookings") => bookings_schema(),
        Some("configs") => configs_schema(),
        Some("overrides") => overrides_schema(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl SimpleQueryHandler for SerialbookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.execute_command(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SerialbookQueryParser;

#[async_trait]
impl QueryParser for SerialbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SerialbookHandler {
    type Statement = String;
    type QueryParser = SerialbookQueryParser;

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
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute_command(&engine, cmd).await?;
        Ok(responses.remove(0))
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
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals. Replaces from the highest
/// index down so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.clone();
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

// ── Connection ───────────────────────────────────────────────────

pub struct SerialbookFactory {
    handler: Arc<SerialbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SerialbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SerialbookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SerialbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SerialbookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SerialbookFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = SerialbookFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::SerialAlreadyBooked(_)
        | EngineError::AlreadyExists(_)
        | EngineError::AlreadyActive { .. } => "23505",
        EngineError::NotConfigured(_) => "42704",
        EngineError::NotFound(_) => "P0002",
        EngineError::BookingClosed(_) => "55000",
        _ => match e.kind() {
            ErrorKind::Configuration | ErrorKind::Availability => "22023",
            ErrorKind::State => "55000",
            ErrorKind::Transient => "40001",
            ErrorKind::NotFound => "P0002",
            ErrorKind::Limit => "54000",
        },
    }
}

/// The stable error code leads the message so clients can branch on it.
fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        format!("{}: {e}", e.code()),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM serials"), 0);
        assert_eq!(count_params("SELECT * FROM bookings WHERE id = $1"), 1);
        assert_eq!(count_params("INSERT INTO bookings VALUES ($1, $2, $10, $3)"), 10);
    }

    #[test]
    fn schema_follows_from_table() {
        let names = |sql: &str| -> Vec<String> {
            result_schema(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(
            names("SELECT * FROM serials WHERE provider_id = $1"),
            vec!["serial", "time_slot_start", "time_slot_end"]
        );
        assert_eq!(names("select * from settings where date = '2026-10-19'")[0], "config_id");
        assert_eq!(names("SELECT * FROM bookings WHERE id = $1").len(), 16);
        assert!(names("INSERT INTO bookings VALUES (NULL)").is_empty());
        assert!(names("SELECT * FROM nowhere").is_empty());
    }

    #[test]
    fn sqlstate_by_error() {
        assert_eq!(sqlstate(&EngineError::SerialAlreadyBooked(4)), "23505");
        assert_eq!(sqlstate(&EngineError::NotConfigured("x".into())), "42704");
        assert_eq!(sqlstate(&EngineError::SerialMustBeEven(3)), "22023");
        assert_eq!(sqlstate(&EngineError::Timeout("day lock")), "40001");
        assert_eq!(sqlstate(&EngineError::LimitExceeded("bookings per day")), "54000");
        assert_eq!(sqlstate(&EngineError::NotFound(Ulid::new())), "P0002");
        assert_eq!(
            sqlstate(&EngineError::ReasonRequired(BookingStatus::Rejected)),
            "55000"
        );
    }
}
