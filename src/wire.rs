use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream;
use futures::{Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};

use crate::engine::{Engine, EngineError, Resolution};
use crate::model::*;
use crate::notify;
use crate::observability as obs;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

// ── Auth ─────────────────────────────────────────────────────────

/// Single shared cleartext password for every user.
#[derive(Debug)]
pub struct SlotbookAuthSource {
    password: String,
}

impl SlotbookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SlotbookAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Handler ──────────────────────────────────────────────────────

struct Subscription {
    channel: String,
    rx: broadcast::Receiver<Event>,
}

/// One handler per connection; LISTEN subscriptions live here.
pub struct SlotbookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotbookQueryParser>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl SlotbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotbookQueryParser),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Parse, execute, record metrics, then flush any pending notifications to the client.
    async fn run<C>(&self, client: &mut C, query: &str) -> PgWireResult<Response>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(|e| {
            metrics::counter!(obs::QUERIES_TOTAL, "command" => "unparsed", "status" => "error").increment(1);
            sql_err(e)
        })?;
        let label = obs::command_label(&cmd);

        let started = Instant::now();
        let result = self.execute_command(&engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(obs::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(obs::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());

        self.deliver_notifications(client).await?;
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::DeclareAvailability { windows } => {
                let entries = windows.iter().map(|w| w.entries.len()).sum::<usize>();
                engine.declare_availability_all(windows).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(entries)))
            }
            Command::WithdrawAvailability { id } => {
                engine.withdraw_availability(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectAvailability { provider_id, date } => {
                let resolution = engine
                    .resolve_availability(provider_id, date)
                    .await
                    .map_err(engine_err)?;
                availability_rows(provider_id, date, resolution)
            }
            Command::PutSurchargeRule { rule } => {
                engine.put_surcharge_rule(rule).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteSurchargeRule { id } => {
                engine.delete_surcharge_rule(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectSurchargeRules { active_only } => {
                let rules = if active_only {
                    engine.active_surcharge_rule().into_iter().collect()
                } else {
                    engine.surcharge_rules()
                };
                surcharge_rows(rules)
            }
            Command::GenerateSlots {
                provider_id,
                date,
                base_price,
            } => {
                let slots = engine
                    .generate_slots(provider_id, date, base_price)
                    .await
                    .map_err(engine_err)?;
                slot_rows(slots)
            }
            Command::SelectSlots { provider_id, date } => slot_rows(engine.get_slots(provider_id, date).await),
            Command::SelectSlot { id } => slot_rows(engine.get_slot(id).await.into_iter().collect()),
            Command::SelectAvailableSlots { provider_id, date } => {
                slot_rows(engine.get_available_slots(provider_id, date).await)
            }
            Command::RevokeSlots { provider_id, date } => {
                let removed = engine.revoke_date(provider_id, date).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(removed)))
            }
            Command::InsertHold {
                slot_id,
                user_id,
                ttl_seconds,
            } => {
                engine
                    .hold_slot(slot_id, user_id, ttl_seconds.map(Duration::from_secs))
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteHold { slot_id, user_id } => {
                engine.release_slot(slot_id, user_id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertBooking { id, slot_id, user_id } => {
                engine
                    .confirm_booking(slot_id, user_id, id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBooking { id } => slot_rows(engine.get_booking_slot(id).await.into_iter().collect()),
            Command::Listen { channel } => {
                let provider_id = notify::parse_channel(&channel).ok_or_else(|| {
                    user_error(
                        "42000",
                        format!("invalid channel: {channel} (expected provider_{{id}})"),
                    )
                })?;
                let mut subs = self.subscriptions.lock().await;
                if !subs.iter().any(|s| s.channel == channel) {
                    subs.push(Subscription {
                        rx: engine.subscribe(provider_id),
                        channel,
                    });
                }
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                self.subscriptions.lock().await.retain(|s| s.channel != channel);
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                self.subscriptions.lock().await.clear();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }

    /// Events queued for this connection's LISTEN channels since the last query.
    async fn drain_notifications(&self) -> Vec<(String, String)> {
        let mut subs = self.subscriptions.lock().await;
        let mut pending = Vec::new();
        subs.retain_mut(|sub| loop {
            match sub.rx.try_recv() {
                Ok(event) => match notify::payload(&event) {
                    Ok(payload) => pending.push((sub.channel.clone(), payload)),
                    Err(e) => warn!("dropping notification on {}: {e}", sub.channel),
                },
                Err(broadcast::error::TryRecvError::Empty) => return true,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("listener on {} lagged, {skipped} notifications dropped", sub.channel);
                }
                Err(broadcast::error::TryRecvError::Closed) => return false,
            }
        });
        pending
    }

    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let pending = self.drain_notifications().await;
        if pending.is_empty() {
            return Ok(());
        }
        let pid = client.pid_and_secret_key().0;
        debug!("delivering {} notifications", pending.len());
        for (channel, payload) in pending {
            client
                .feed(PgWireBackendMessage::NotificationResponse(NotificationResponse::new(
                    pid, channel, payload,
                )))
                .await?;
        }
        client.flush().await?;
        Ok(())
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

/// The 14 persisted slot columns.
fn slot_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("provider_id", Type::VARCHAR),
        text_field("date", Type::VARCHAR),
        text_field("time", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("held_by", Type::VARCHAR),
        text_field("hold_expires_at", Type::INT8),
        text_field("base_price", Type::INT8),
        text_field("surcharge_amount", Type::INT8),
        text_field("total_price", Type::INT8),
        text_field("buffer_blocked_until", Type::INT8),
        text_field("buffer_booking_id", Type::VARCHAR),
        text_field("booking_id", Type::VARCHAR),
        text_field("version", Type::INT8),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("provider_id", Type::VARCHAR),
        text_field("date", Type::VARCHAR),
        text_field("is_open", Type::BOOL),
        text_field("start_time", Type::VARCHAR),
        text_field("end_time", Type::VARCHAR),
    ]
}

fn surcharge_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("start_time", Type::VARCHAR),
        text_field("end_time", Type::VARCHAR),
        text_field("amount", Type::INT8),
        text_field("is_active", Type::BOOL),
    ]
}

fn slot_rows(slots: Vec<Slot>) -> PgWireResult<Response> {
    let schema = Arc::new(slot_schema());
    let rows: Vec<PgWireResult<_>> = slots
        .into_iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&slot.id.to_string())?;
            encoder.encode_field(&slot.provider_id.to_string())?;
            encoder.encode_field(&slot.date.to_string())?;
            encoder.encode_field(&slot.time.to_string())?;
            encoder.encode_field(&slot.status.as_str())?;
            encoder.encode_field(&slot.held_by.map(|u| u.to_string()))?;
            encoder.encode_field(&slot.hold_expires_at)?;
            encoder.encode_field(&slot.base_price)?;
            encoder.encode_field(&slot.surcharge_amount)?;
            encoder.encode_field(&slot.total_price)?;
            encoder.encode_field(&slot.buffer_blocked_until)?;
            encoder.encode_field(&slot.buffer_booking_id.map(|b| b.to_string()))?;
            encoder.encode_field(&slot.booking_id.map(|b| b.to_string()))?;
            encoder.encode_field(&(slot.version as i64))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn availability_rows(
    provider_id: ulid::Ulid,
    date: chrono::NaiveDate,
    resolution: Resolution,
) -> PgWireResult<Response> {
    let schema = Arc::new(availability_schema());
    let (is_open, start, end) = match resolution {
        Resolution::Open(window) => (true, Some(window.start.to_string()), Some(window.end.to_string())),
        Resolution::Closed => (false, None, None),
    };
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&provider_id.to_string())?;
    encoder.encode_field(&date.to_string())?;
    encoder.encode_field(&is_open)?;
    encoder.encode_field(&start)?;
    encoder.encode_field(&end)?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn surcharge_rows(rules: Vec<SurchargeRule>) -> PgWireResult<Response> {
    let schema = Arc::new(surcharge_schema());
    let rows: Vec<PgWireResult<_>> = rules
        .into_iter()
        .map(|rule| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&rule.id.to_string())?;
            encoder.encode_field(&rule.start_time.to_string())?;
            encoder.encode_field(&rule.end_time.to_string())?;
            encoder.encode_field(&rule.surcharge_amount)?;
            encoder.encode_field(&rule.is_active)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Row description a statement will produce, decided from its text alone so it works
/// for statements that still carry `$n` placeholders.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let is_select = upper.trim_start().starts_with("SELECT");
    if is_select && upper.contains("SURCHARGE_RULES") {
        surcharge_schema()
    } else if is_select && (upper.contains("SLOTS") || upper.contains("BOOKINGS")) {
        slot_schema()
    } else if is_select && upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.trim_start().starts_with("INSERT") && upper.contains("INTO SLOTS") {
        slot_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
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
        let sql = substitute_params(portal);
        self.run(client, &sql).await
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
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
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
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(SlotbookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SlotbookAuthSource::new(password),
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

/// Serve one client socket until it disconnects. Each connection gets its own handler.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(SlotbookFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each engine failure.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::HoldConflict { .. } | EngineError::BufferBlocked { .. } => "55P03",
        EngineError::AlreadyBooked(_) | EngineError::DuplicateBooking(_) => "23505",
        EngineError::HoldInvalidOrExpired(_) | EngineError::NotBooked(_) => "55000",
        EngineError::SlotNotFound(_)
        | EngineError::BookingNotFound(_)
        | EngineError::WindowNotFound(_)
        | EngineError::RuleNotFound(_) => "P0002",
        EngineError::InvalidTimeFormat(_) => "22007",
        EngineError::NotOpen { .. } | EngineError::InvalidInput(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::ResolutionFailed(_) | EngineError::WalError(_) => "58000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::InvalidTime(_) | SqlError::InvalidDate(_) => "22007",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn placeholder_count() {
        assert_eq!(count_params("SELECT 1"), 0);
        assert_eq!(count_params("DELETE FROM holds WHERE slot_id = $1 AND user_id = $2"), 2);
        assert_eq!(count_params("VALUES ($3, $1, $12)"), 12);
        assert_eq!(count_params("cost $ 5"), 0);
    }

    #[test]
    fn sqlstates_follow_error_kind() {
        let id = Ulid::new();
        assert_eq!(engine_sqlstate(&EngineError::HoldConflict { slot_id: id, held_until: 0 }), "55P03");
        assert_eq!(engine_sqlstate(&EngineError::AlreadyBooked(id)), "23505");
        assert_eq!(engine_sqlstate(&EngineError::DuplicateBooking(id)), "23505");
        assert_eq!(engine_sqlstate(&EngineError::HoldInvalidOrExpired(id)), "55000");
        assert_eq!(engine_sqlstate(&EngineError::SlotNotFound(id)), "P0002");
        assert_eq!(engine_sqlstate(&EngineError::LimitExceeded("x")), "54000");
        assert_eq!(engine_sqlstate(&EngineError::WalError("disk".into())), "58000");
        assert_eq!(
            engine_sqlstate(&EngineError::NotOpen {
                provider_id: id,
                date: chrono::NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            }),
            "22023"
        );
    }

    #[test]
    fn result_schemas_by_statement() {
        assert_eq!(result_schema("SELECT * FROM slots WHERE id = $1").len(), 14);
        assert_eq!(result_schema("select * from available_slots where provider_id = $1 and date = $2").len(), 14);
        assert_eq!(result_schema("SELECT * FROM bookings WHERE id = $1").len(), 14);
        assert_eq!(result_schema("INSERT INTO slots (provider_id, date, base_price) VALUES ($1, $2, $3)").len(), 14);
        assert_eq!(result_schema("SELECT * FROM availability WHERE provider_id = $1 AND date = $2").len(), 5);
        assert_eq!(result_schema("SELECT * FROM surcharge_rules").len(), 5);
        assert!(result_schema("INSERT INTO holds (slot_id, user_id) VALUES ($1, $2)").is_empty());
    }
}
