use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{AdminPrincipal, LineupAuthSource, TokenAuthority};
use crate::engine::{ConflictResult, Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError, Table};

pub struct LineupHandler {
    engine: Arc<Engine>,
    admin: AdminPrincipal,
    query_parser: Arc<LineupQueryParser>,
}

impl LineupHandler {
    pub fn new(engine: Arc<Engine>, admin: AdminPrincipal) -> Self {
        Self {
            engine,
            admin,
            query_parser: Arc::new(LineupQueryParser),
        }
    }

    async fn run(&self, sql: &str, format: impl Fn(usize) -> FieldFormat) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        cmd: Command,
        format: impl Fn(usize) -> FieldFormat,
    ) -> PgWireResult<Response> {
        let engine = &self.engine;
        let admin = &self.admin;
        match cmd {
            Command::InsertArtist { id, profile } => {
                engine.create_artist(admin, id, profile).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::UpdateArtist { id, patch } => {
                engine
                    .edit_artist(admin, id, |current| patch.apply(current))
                    .await
                    .map_err(engine_err)?;
                Ok(updated())
            }
            Command::DeleteArtist { id } => {
                engine.delete_artist(admin, id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertStage { id, profile } => {
                engine.create_stage(admin, id, profile).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::UpdateStage { id, patch } => {
                engine
                    .edit_stage(admin, id, |current| patch.apply(current))
                    .await
                    .map_err(engine_err)?;
                Ok(updated())
            }
            Command::DeleteStage { id } => {
                engine.delete_stage(admin, id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertBooking { id, candidate } => {
                engine
                    .create_booking(admin, id, candidate)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::UpdateBooking { id, patch } => {
                engine
                    .edit_booking(admin, id, |current| patch.apply(current))
                    .await
                    .map_err(engine_err)?;
                Ok(updated())
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(admin, id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::SelectArtists => {
                let schema = Arc::new(schema(Table::Artists, format));
                let rows: Vec<PgWireResult<DataRow>> = engine
                    .list_artists()
                    .await
                    .into_iter()
                    .map(|a| {
                        let mut enc = DataRowEncoder::new(schema.clone());
                        enc.encode_field(&a.id.to_string())?;
                        enc.encode_field(&a.profile.name)?;
                        enc.encode_field(&a.profile.description)?;
                        enc.encode_field(&a.profile.image_url)?;
                        enc.encode_field(&(a.booking_count as i64))?;
                        Ok(enc.take_row())
                    })
                    .collect();
                Ok(rows_response(schema, rows))
            }
            Command::SelectStages => {
                let schema = Arc::new(schema(Table::Stages, format));
                let rows: Vec<PgWireResult<DataRow>> = engine
                    .list_stages()
                    .await
                    .into_iter()
                    .map(|s| {
                        let mut enc = DataRowEncoder::new(schema.clone());
                        enc.encode_field(&s.id.to_string())?;
                        enc.encode_field(&s.profile.name)?;
                        enc.encode_field(&s.profile.description)?;
                        enc.encode_field(&s.profile.latitude)?;
                        enc.encode_field(&s.profile.longitude)?;
                        enc.encode_field(&(s.booking_count as i64))?;
                        Ok(enc.take_row())
                    })
                    .collect();
                Ok(rows_response(schema, rows))
            }
            Command::SelectRunningOrder { filter } => {
                let schema = Arc::new(schema(Table::RunningOrder, format));
                let rows: Vec<PgWireResult<DataRow>> = engine
                    .list_bookings(filter)
                    .await
                    .into_iter()
                    .map(|b| {
                        let mut enc = DataRowEncoder::new(schema.clone());
                        enc.encode_field(&b.id.to_string())?;
                        enc.encode_field(&b.artist_id.to_string())?;
                        enc.encode_field(&b.artist_name)?;
                        enc.encode_field(&b.stage_id.to_string())?;
                        enc.encode_field(&b.stage_name)?;
                        enc.encode_field(&b.start)?;
                        enc.encode_field(&b.end)?;
                        Ok(enc.take_row())
                    })
                    .collect();
                Ok(rows_response(schema, rows))
            }
            Command::SelectConflicts { candidate, exclude } => {
                let schema = Arc::new(schema(Table::Conflicts, format));
                let result = engine
                    .check_conflict(&candidate, exclude)
                    .await
                    .map_err(engine_err)?;
                let mut rows = Vec::new();
                if let ConflictResult::Conflict(c) = result {
                    let mut enc = DataRowEncoder::new(schema.clone());
                    enc.encode_field(&c.axis.as_str().to_string())?;
                    enc.encode_field(&c.existing.to_string())?;
                    enc.encode_field(&c.message().to_string())?;
                    rows.push(Ok(enc.take_row()));
                }
                Ok(rows_response(schema, rows))
            }
        }
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_oid(0).with_rows(1))
}

fn updated() -> Response {
    Response::Execution(Tag::new("UPDATE").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

fn rows_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Result columns of a table. Write statements return none.
fn schema(table: Table, format: impl Fn(usize) -> FieldFormat) -> Vec<FieldInfo> {
    let columns: &[(&str, Type)] = match table {
        Table::Artists => &[
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("description", Type::VARCHAR),
            ("image_url", Type::VARCHAR),
            ("booking_count", Type::INT8),
        ],
        Table::Stages => &[
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("description", Type::VARCHAR),
            ("latitude", Type::FLOAT8),
            ("longitude", Type::FLOAT8),
            ("booking_count", Type::INT8),
        ],
        Table::RunningOrder => &[
            ("id", Type::VARCHAR),
            ("artist_id", Type::VARCHAR),
            ("artist_name", Type::VARCHAR),
            ("stage_id", Type::VARCHAR),
            ("stage_name", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
        ],
        Table::Conflicts => &[
            ("axis", Type::VARCHAR),
            ("existing_id", Type::VARCHAR),
            ("message", Type::VARCHAR),
        ],
    };
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| FieldInfo::new(name.to_string(), None, None, ty.clone(), format(i)))
        .collect()
}

fn statement_schema(sql: &str, format: impl Fn(usize) -> FieldFormat) -> Vec<FieldInfo> {
    sql::select_table(sql)
        .map(|table| schema(table, format))
        .unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for LineupHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query, |_| FieldFormat::Text).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct LineupQueryParser;

#[async_trait]
impl QueryParser for LineupQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt, |i| {
            column_format.map_or(FieldFormat::Text, |f| f.format_for(i))
        }))
    }
}

#[async_trait]
impl ExtendedQueryHandler for LineupHandler {
    type Statement = String;
    type QueryParser = LineupQueryParser;

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
        self.run(&sql, |i| portal.result_column_format.format_for(i))
            .await
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
            statement_schema(&target.statement, |_| FieldFormat::Text),
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
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
            |i| target.result_column_format.format_for(i),
        )))
    }
}

/// Every `$N` placeholder outside quoted literals and identifiers, as
/// (byte range, N), left to right.
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let mut end = i + 1;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if let Ok(n) = sql[i + 1..end].parse::<usize>() {
                    found.push((i..end, n));
                    i = end;
                    continue;
                }
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Inline bound text parameters as quoted literals in one left-to-right pass,
/// so bound values are never rescanned for placeholders.
fn inline_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = range.end;
    }
    result.push_str(&sql[copied..]);
    result
}

fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct LineupFactory {
    handler: Arc<LineupHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<LineupAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl LineupFactory {
    pub fn new(engine: Arc<Engine>, authority: &TokenAuthority) -> Self {
        Self {
            handler: Arc::new(LineupHandler::new(engine, authority.sql_session())),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                LineupAuthSource::new(authority),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LineupFactory {
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
    factory: Arc<LineupFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, LineupFactory::clone(&factory)).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for an engine error.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict(_) => "23P01",
        EngineError::NotFound(_) => "02000",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::HasBookings(_) => "23503",
        EngineError::Contended(_) => "40001",
        EngineError::WalError(_) => "58030",
        EngineError::UnknownReference { .. }
        | EngineError::InvalidSpan { .. }
        | EngineError::InvalidInput(_)
        | EngineError::LimitExceeded(_) => "22023",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::WalError(_) = e {
        tracing::error!("storage failure: {e}");
    }
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM artists"), 0);
        assert_eq!(count_params("DELETE FROM artists WHERE id = $1"), 1);
        assert_eq!(count_params("UPDATE stages SET name = $2 WHERE id = $12"), 12);
        assert_eq!(count_params("SELECT '$' FROM stages"), 0);
        assert_eq!(count_params("UPDATE artists SET name = 'costs $5' WHERE id = $1"), 1);
    }

    #[test]
    fn inlines_params_in_one_pass() {
        let params = [Some("$2".to_string()), Some("O'Hara".to_string()), None];
        assert_eq!(
            inline_params("UPDATE artists SET name = $1, description = $2 WHERE id = $3", &params),
            "UPDATE artists SET name = '$2', description = 'O''Hara' WHERE id = NULL"
        );
        assert_eq!(
            inline_params("SELECT '$1' FROM stages WHERE \"$1\" = $1", &params[..1]),
            "SELECT '$1' FROM stages WHERE \"$1\" = '$2'"
        );
        let ten: Vec<Option<String>> = (1..=10).map(|i| Some(i.to_string())).collect();
        assert_eq!(inline_params("$10 $1", &ten), "'10' '1'");
    }

    #[test]
    fn sqlstates_follow_error_kind() {
        let conflict = EngineError::Conflict(crate::engine::Conflict {
            axis: ResourceAxis::Stage,
            existing: Ulid::new(),
        });
        assert_eq!(sqlstate(&conflict), "23P01");
        assert_eq!(sqlstate(&EngineError::InvalidSpan { start: 2, end: 1 }), "22023");
        assert_eq!(sqlstate(&EngineError::NotFound(Ulid::new())), "02000");
        assert_eq!(sqlstate(&EngineError::WalError("disk".into())), "58030");
        assert_eq!(sqlstate(&EngineError::Contended(Ulid::new())), "40001");
    }

    #[test]
    fn schemas_match_tables() {
        let names = |t| -> Vec<String> {
            schema(t, |_| FieldFormat::Text)
                .iter()
                .map(|f| f.name().to_string())
                .collect()
        };
        assert_eq!(names(Table::Conflicts), vec!["axis", "existing_id", "message"]);
        assert_eq!(names(Table::RunningOrder).len(), 7);
        assert!(statement_schema("DELETE FROM artists WHERE id = $1", |_| FieldFormat::Text).is_empty());
    }
}
