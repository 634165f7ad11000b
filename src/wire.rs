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
use tracing::debug;

use crate::auth::CareschedAuthSource;
use crate::engine::Engine;
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};

pub struct CareschedHandler {
    engine: Arc<Engine>,
    query_parser: Arc<CareschedQueryParser>,
}

impl CareschedHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(CareschedQueryParser),
        }
    }

    /// Parse, execute and record RED metrics for one statement.
    async fn run(&self, query: &str) -> PgWireResult<Vec<Response>> {
        debug!("query: {query}");
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertDoctor { id, specialty } => {
                engine
                    .register_doctor(id, specialty)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::DeleteDoctor { id } => {
                engine.remove_doctor(id).await.map_err(engine_err)?;
                Ok(vec![delete_tag()])
            }
            Command::InsertSchedule { block, upsert } => {
                let result = if upsert {
                    engine.upsert_schedule(block).await
                } else {
                    engine.add_schedule(block).await
                };
                result.map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::DeleteSchedule { id } => {
                engine.remove_schedule(id).await.map_err(engine_err)?;
                Ok(vec![delete_tag()])
            }
            Command::InsertAppointment {
                id,
                doctor_id,
                patient_id,
                date,
                range,
                reason,
                upsert,
            } => {
                if upsert && engine.get_doctor_for_entity(&id).is_some() {
                    engine
                        .reschedule_appointment(id, date, range)
                        .await
                        .map_err(engine_err)?;
                } else {
                    engine
                        .book_appointment(id, doctor_id, patient_id, date, range, reason)
                        .await
                        .map_err(engine_err)?;
                }
                Ok(vec![insert_tag()])
            }
            Command::DeleteAppointment { id } => {
                engine.cancel_appointment(id).await.map_err(engine_err)?;
                Ok(vec![delete_tag()])
            }
            Command::SetAppointmentStatus { id, status } => {
                engine
                    .set_appointment_status(id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::ConfirmToken { token } => {
                engine
                    .confirm_by_token(&token, now_ms())
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::SelectAvailability { doctor_id, date } => {
                let slots = engine
                    .compute_availability(doctor_id, date)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let doctor = doctor_id.to_string();
                let day = date.to_string();
                let rows: Vec<PgWireResult<DataRow>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&doctor)?;
                        encoder.encode_field(&day)?;
                        encoder.encode_field(&format_hhmm(slot.start_time))?;
                        encoder.encode_field(&format_hhmm(slot.end_time))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectDoctors => {
                let doctors = engine.list_doctors().await;
                let schema = Arc::new(doctors_schema());
                let rows: Vec<PgWireResult<DataRow>> = doctors
                    .into_iter()
                    .map(|d| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&d.id.to_string())?;
                        encoder.encode_field(&d.specialty)?;
                        encoder.encode_field(&(d.schedule_count as i32))?;
                        encoder.encode_field(&(d.appointment_count as i32))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectSchedules { doctor_id } => {
                if engine.get_doctor(&doctor_id).is_none() {
                    return Err(engine_err(crate::engine::EngineError::NotFound(doctor_id)));
                }
                let blocks = engine.get_schedules(doctor_id).await;
                let schema = Arc::new(schedules_schema());
                let rows: Vec<PgWireResult<DataRow>> = blocks
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.doctor_id.to_string())?;
                        encoder.encode_field(&i32::from(b.day_of_week))?;
                        encoder.encode_field(&format_hhmm(b.range.start))?;
                        encoder.encode_field(&format_hhmm(b.range.end))?;
                        encoder.encode_field(&(b.interval_minutes as i32))?;
                        encoder.encode_field(&b.active)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectAppointments { doctor_id, date } => {
                if engine.get_doctor(&doctor_id).is_none() {
                    return Err(engine_err(crate::engine::EngineError::NotFound(doctor_id)));
                }
                let appointments = engine.get_appointments(doctor_id, date).await;
                let schema = Arc::new(appointments_schema());
                let rows: Vec<PgWireResult<DataRow>> = appointments
                    .into_iter()
                    .map(|a| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&a.id.to_string())?;
                        encoder.encode_field(&a.doctor_id.to_string())?;
                        encoder.encode_field(&a.patient_id.to_string())?;
                        encoder.encode_field(&a.date.to_string())?;
                        encoder.encode_field(&format_hhmm(a.range.start))?;
                        encoder.encode_field(&format_hhmm(a.range.end))?;
                        encoder.encode_field(&a.status.as_str().to_string())?;
                        encoder.encode_field(&a.reason)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectConfirmation { appointment_id } => {
                let schema = Arc::new(confirmations_schema());
                let rows: Vec<PgWireResult<DataRow>> = engine
                    .get_confirmation(&appointment_id)
                    .into_iter()
                    .map(|c| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&c.token)?;
                        encoder.encode_field(&c.appointment_id.to_string())?;
                        encoder.encode_field(&c.doctor_id.to_string())?;
                        encoder.encode_field(&c.expires_at)?;
                        encoder.encode_field(&c.confirmed)?;
                        encoder.encode_field(&c.sent_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
        }
    }
}

fn insert_tag() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn delete_tag() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn typed(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text("doctor_id"),
        text("date"),
        text("start_time"),
        text("end_time"),
    ]
}

fn doctors_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("specialty"),
        typed("schedule_count", Type::INT4),
        typed("appointment_count", Type::INT4),
    ]
}

fn schedules_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("doctor_id"),
        typed("day_of_week", Type::INT4),
        text("start_time"),
        text("end_time"),
        typed("interval_minutes", Type::INT4),
        typed("active", Type::BOOL),
    ]
}

fn appointments_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("doctor_id"),
        text("patient_id"),
        text("date"),
        text("start_time"),
        text("end_time"),
        text("status"),
        text("reason"),
    ]
}

fn confirmations_schema() -> Vec<FieldInfo> {
    vec![
        text("token"),
        text("appointment_id"),
        text("doctor_id"),
        typed("expires_at", Type::INT8),
        typed("confirmed", Type::BOOL),
        typed("sent_at", Type::INT8),
    ]
}

/// Result columns for a statement that may still carry `$n` placeholders.
/// Non-SELECT statements return no rows.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let mut words = sql.split_whitespace();
    let is_select = words
        .next()
        .is_some_and(|w| w.eq_ignore_ascii_case("SELECT"));
    if !is_select {
        return vec![];
    }
    let table = words
        .skip_while(|w| !w.eq_ignore_ascii_case("FROM"))
        .nth(1)
        .map(|t| t.trim_matches(|c| c == '"' || c == ';').to_ascii_lowercase());
    match table.as_deref() {
        Some("availability") => availability_schema(),
        Some("doctors") => doctors_schema(),
        Some("schedules") => schedules_schema(),
        Some("appointments") => appointments_schema(),
        Some("confirmations") => confirmations_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for CareschedHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CareschedQueryParser;

#[async_trait]
impl QueryParser for CareschedQueryParser {
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
impl ExtendedQueryHandler for CareschedHandler {
    type Statement = String;
    type QueryParser = CareschedQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
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
        let mut responses = self.run(&sql).await?;
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

/// Inline bound text parameters as quoted literals.
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// One pass over the statement text: each `$n` outside a string literal
/// becomes parameter `n`. Bound values are never rescanned.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                let param = sql[start..end]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|idx| params.get(idx));
                match param {
                    Some(value) => {
                        out.push_str(&sql[copied..i]);
                        match value {
                            Some(v) => {
                                out.push('\'');
                                out.push_str(&String::from_utf8_lossy(v.as_ref()).replace('\'', "''"));
                                out.push('\'');
                            }
                            None => out.push_str("NULL"),
                        }
                        copied = end;
                        i = end;
                    }
                    None => i = start,
                }
            }
            _ => i += 1,
        }
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CareschedFactory {
    handler: Arc<CareschedHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<CareschedAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl CareschedFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(CareschedHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                CareschedAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CareschedFactory {
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
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(CareschedFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
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

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM doctors"), 0);
        assert_eq!(
            count_params("INSERT INTO doctors (id, specialty) VALUES ($1, $2)"),
            2
        );
        assert_eq!(count_params("SELECT $10, $2"), 10);
        assert_eq!(count_params("SELECT '$'"), 0);
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let params = [Some("copay $2 owed"), Some("ok")];
        assert_eq!(
            bind_params("VALUES ($1, $2)", &params),
            "VALUES ('copay $2 owed', 'ok')"
        );
    }

    #[test]
    fn binds_quote_null_and_double_digits() {
        let mut params: Vec<Option<&str>> = vec![Some("x"); 10];
        params[0] = Some("O'Brien");
        params[1] = None;
        params[9] = Some("ten");
        assert_eq!(
            bind_params("SELECT $1, $2, $10, '$1', $11, $", &params),
            "SELECT 'O''Brien', NULL, 'ten', '$1', $11, $"
        );
    }

    #[test]
    fn schema_follows_select_table() {
        let names = |sql: &str| -> Vec<String> {
            result_schema(sql)
                .iter()
                .map(|f| f.name().to_string())
                .collect()
        };
        assert_eq!(
            names("SELECT * FROM availability WHERE doctor_id = $1 AND \"date\" = $2"),
            ["doctor_id", "date", "start_time", "end_time"]
        );
        assert_eq!(names("select * from doctors;").len(), 4);
        assert_eq!(names("SELECT * FROM schedules WHERE doctor_id = $1").len(), 7);
        assert!(names("INSERT INTO doctors (id) VALUES ($1)").is_empty());
        assert!(names("SELECT * FROM patients").is_empty());
    }
}
