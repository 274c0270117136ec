use std::fmt::Debug;
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
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::RoomswapAuthSource;
use crate::engine::Engine;
use crate::model::*;
use crate::observability;
use crate::site::SiteManager;
use crate::sql::{self, Command};

pub struct RoomswapHandler {
    sites: Arc<SiteManager>,
    query_parser: Arc<RoomswapQueryParser>,
}

impl RoomswapHandler {
    pub fn new(sites: Arc<SiteManager>) -> Self {
        Self {
            sites,
            query_parser: Arc::new(RoomswapQueryParser),
        }
    }

    async fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.sites
            .get_or_create(&db)
            .await
            .map_err(|e| user_err("08006", format!("site error: {e}")))
    }

    async fn run_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertRoom { id, number, capacity, occupancy } => {
                engine
                    .register_room(id, number, capacity, occupancy)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateRoom { id, number, capacity } => {
                engine.update_room(id, number, capacity).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::InsertTenant { id, name, email, room_id } => {
                engine
                    .register_tenant(id, name, email, room_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeactivateTenant { id } => {
                engine.deactivate_tenant(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::ReassignTenant { id, room_id } => {
                engine.reassign_tenant(id, room_id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SubmitRequest { id, tenant_id, current_room, kind, reason, moving_date } => {
                engine
                    .submit_request(id, tenant_id, current_room, kind, reason, moving_date)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::ApproveRequest { id, decided_by } => {
                engine.approve(id, &decided_by).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::RejectRequest { id, decided_by, reason } => {
                engine.reject(id, &decided_by, &reason).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectRequests { filter, page } => {
                let rows = engine.list_requests(&filter, page).await.map_err(engine_err)?;
                request_rows_response(rows)
            }
            Command::SelectRequest { id } => {
                let rows = match engine.get_request_row(id).await {
                    Some(row) => vec![row],
                    None => Vec::new(),
                };
                request_rows_response(rows)
            }
            Command::SelectOutstanding { tenant_id } => {
                let rows = engine.list_outstanding_rows(tenant_id).await;
                request_rows_response(rows)
            }
            Command::SelectRooms => {
                let rooms = engine.list_rooms().await;
                let schema = Arc::new(rooms_schema());
                let rows: Vec<PgWireResult<_>> = rooms
                    .into_iter()
                    .map(|room| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&room.id.to_string())?;
                        encoder.encode_field(&room.number)?;
                        encoder.encode_field(&(room.capacity as i64))?;
                        encoder.encode_field(&(room.occupancy as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectTenants => {
                let tenants = engine.list_tenants().await;
                let schema = Arc::new(tenants_schema());
                let rows: Vec<PgWireResult<_>> = tenants
                    .into_iter()
                    .map(|tenant| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&tenant.id.to_string())?;
                        encoder.encode_field(&tenant.name)?;
                        encoder.encode_field(&tenant.email)?;
                        encoder.encode_field(&tenant.active)?;
                        encoder.encode_field(&tenant.assigned_room.map(|r| r.to_string()))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
        }
    }
}

fn request_rows_response(rows: Vec<RequestRow>) -> PgWireResult<Vec<Response>> {
    let schema = Arc::new(requests_schema());
    let encoded: Vec<PgWireResult<_>> = rows
        .into_iter()
        .map(|row| {
            let request = &row.request;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&request.id.to_string())?;
            encoder.encode_field(&request.tenant_id.to_string())?;
            encoder.encode_field(&row.tenant_name)?;
            encoder.encode_field(&row.tenant_email)?;
            encoder.encode_field(&request.kind.label())?;
            encoder.encode_field(&request.status.label())?;
            encoder.encode_field(&request.current_room.to_string())?;
            encoder.encode_field(&row.current_room_number)?;
            encoder.encode_field(&request.kind.desired_room().map(|r| r.to_string()))?;
            encoder.encode_field(&row.desired_room_number)?;
            encoder.encode_field(&request.reason)?;
            encoder.encode_field(&request.moving_date)?;
            encoder.encode_field(&request.created_at)?;
            encoder.encode_field(&request.decided_by)?;
            encoder.encode_field(&request.decided_at)?;
            encoder.encode_field(&request.rejection_reason)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(encoded)))])
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn requests_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("tenant_id"),
        text_field("tenant_name"),
        text_field("tenant_email"),
        text_field("kind"),
        text_field("status"),
        text_field("current_room"),
        text_field("current_room_number"),
        text_field("desired_room"),
        text_field("desired_room_number"),
        text_field("reason"),
        int8_field("moving_date"),
        int8_field("created_at"),
        text_field("decided_by"),
        int8_field("decided_at"),
        text_field("rejection_reason"),
    ]
}

fn rooms_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("number"),
        int8_field("capacity"),
        int8_field("occupancy"),
    ]
}

fn tenants_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        text_field("email"),
        FieldInfo::new("active".into(), None, None, Type::BOOL, FieldFormat::Text),
        text_field("room_id"),
    ]
}

/// Pick the result schema for a statement by the table it reads.
fn schema_for_statement(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.contains("SELECT") {
        return vec![];
    }
    if upper.contains("FROM REQUESTS") || upper.contains("FROM OUTSTANDING") {
        requests_schema()
    } else if upper.contains("FROM ROOMS") {
        rooms_schema()
    } else if upper.contains("FROM TENANTS") {
        tenants_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for RoomswapHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client).await?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.run_command(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomswapQueryParser;

#[async_trait]
impl QueryParser for RoomswapQueryParser {
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
        Ok(schema_for_statement(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RoomswapHandler {
    type Statement = String;
    type QueryParser = RoomswapQueryParser;

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
        let engine = self.resolve_engine(client).await?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.run_command(&engine, cmd).await?;
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
            schema_for_statement(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for_statement(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder used in the statement.
fn count_params(sql: &str) -> usize {
    sql.split('$')
        .skip(1)
        .filter_map(|chunk| {
            let digits = chunk.bytes().take_while(u8::is_ascii_digit).count();
            chunk[..digits].parse::<usize>().ok()
        })
        .max()
        .unwrap_or(0)
}

/// Inline the bound parameter values (text format) into the SQL text,
/// quoting strings and rendering missing values as NULL. A `$` that is not
/// followed by a valid parameter number passes through untouched.
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.as_str();
    let params = &portal.parameters;
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + 1..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        match rest[..digits].parse::<usize>() {
            Ok(n) if n >= 1 && n <= params.len() => {
                match &params[n - 1] {
                    Some(bytes) => {
                        let text = String::from_utf8_lossy(bytes);
                        out.push('\'');
                        out.push_str(&text.replace('\'', "''"));
                        out.push('\'');
                    }
                    None => out.push_str("NULL"),
                }
                rest = &rest[digits..];
            }
            _ => out.push('$'),
        }
    }
    out.push_str(rest);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoomswapFactory {
    handler: Arc<RoomswapHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<RoomswapAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RoomswapFactory {
    pub fn new(sites: Arc<SiteManager>, password: String) -> Self {
        let auth_source = RoomswapAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RoomswapHandler::new(sites)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomswapFactory {
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

/// Serve one client connection to completion.
pub async fn process_connection(
    socket: TcpStream,
    sites: Arc<SiteManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(RoomswapFactory::new(sites, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn user_err(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    user_err("P0001", e.to_string())
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    user_err("42601", e.to_string())
}
