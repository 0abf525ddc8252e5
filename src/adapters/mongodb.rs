//! MongoDB adapter.
//!
//! Command strings are parsed into a [`DocumentCommand`] and dispatched to
//! the driver. Transactions run on a client session held in the connection
//! envelope; MongoDB has no savepoints, so nested levels are rejected by the
//! transaction manager through the capability flags.

use super::command::{DocumentCommand, inline_params, parse_document_command};
use super::{Adapter, Capabilities, RowStream, common};
use crate::config::{EndpointConfig, EngineType};
use crate::error::{DbError, DbResult, ErrorKind};
use crate::models::{
    ColumnMetadata, Connection, IsolationLevel, QueryOptions, QueryParam, RawResult,
    ServerMetadata,
};
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt, stream};
use mongodb::bson::{self, Bson, Document, doc};
use mongodb::options::{ClientOptions, IndexOptions, ReadConcern};
use mongodb::{Client, ClientSession, Database, IndexModel};
use serde_json::{Map, Value as JsonValue, json};
use std::time::Instant;
use tokio::time::timeout;
use tracing::debug;

const ENGINE: EngineType = EngineType::MongoDb;

/// Run a driver action, attaching the open transaction session if any.
macro_rules! with_session {
    ($session:expr, $action:expr) => {
        match $session.as_mut() {
            Some(session) => $action.session(session).await,
            None => $action.await,
        }
    };
}

/// Driver handle stored in the connection envelope.
pub struct MongoSession {
    pub client: Client,
    pub db: Database,
    /// Present while a transaction is open
    pub session: Option<ClientSession>,
}

pub struct MongoAdapter;

impl MongoAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Connection string from the endpoint, unless an explicit `uri` option is given.
    fn connection_uri(config: &EndpointConfig) -> String {
        if let Some(uri) = config.option("uri") {
            return uri.to_string();
        }
        let encode = |s: &str| url::form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>();
        let auth = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => format!("{}:{}@", encode(user), encode(pass)),
            (Some(user), None) => format!("{}@", encode(user)),
            _ => String::new(),
        };
        let mut params = Vec::new();
        if let Some(source) = config.option("auth_source") {
            params.push(format!("authSource={}", encode(source)));
        }
        if let Some(replica_set) = config.option("replica_set") {
            params.push(format!("replicaSet={}", encode(replica_set)));
        }
        if config.ssl.enabled {
            params.push("tls=true".to_string());
            if config.ssl.trust_server_certificate {
                params.push("tlsAllowInvalidCertificates=true".to_string());
            }
            if let Some(ca) = &config.ssl.ca_path {
                params.push(format!("tlsCAFile={}", encode(ca)));
            }
        }
        let query = if params.is_empty() {
            String::new()
        } else {
            format!("?{}", params.join("&"))
        };
        format!(
            "mongodb://{}{}:{}/{}",
            auth,
            config.host,
            config.port_or_default(),
            query
        )
    }
}

impl Default for MongoAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Classify a MongoDB driver error by server code.
fn from_mongo(err: mongodb::error::Error) -> DbError {
    use mongodb::error::{ErrorKind as MongoErrorKind, WriteFailure};

    let (code, message) = match err.kind.as_ref() {
        MongoErrorKind::Command(cmd) => (Some(cmd.code), cmd.message.clone()),
        MongoErrorKind::Write(WriteFailure::WriteError(write)) => {
            (Some(write.code), write.message.clone())
        }
        MongoErrorKind::Authentication { message, .. } => {
            return common::native_error(ENGINE, ErrorKind::Authentication, None, message.clone());
        }
        MongoErrorKind::Io(io) => {
            return common::native_error(
                ENGINE,
                ErrorKind::Connection,
                Some(format!("{:?}", io.kind())),
                io.to_string(),
            );
        }
        MongoErrorKind::ServerSelection { message, .. } => {
            return common::native_error(ENGINE, ErrorKind::Connection, None, message.clone());
        }
        _ => (None, err.to_string()),
    };

    let kind = match code {
        Some(code) => common::classify_mongo(code),
        None if message.contains("E11000") => ErrorKind::DuplicateKey,
        None => common::classify_message(&message),
    };
    common::native_error(ENGINE, kind, code.map(|c| c.to_string()), message)
}

fn to_document(value: &JsonValue) -> DbResult<Document> {
    match Bson::try_from(value.clone()) {
        Ok(Bson::Document(doc)) => Ok(doc),
        Ok(other) => Err(DbError::query(
            format!("expected a document, got {}", other),
            "Pass a JSON object",
        )),
        Err(e) => Err(DbError::query(
            format!("invalid extended JSON: {}", e),
            "Check $oid / $date literals",
        )),
    }
}

fn to_json_map(doc: Document) -> Map<String, JsonValue> {
    match Bson::Document(doc).into_relaxed_extjson() {
        JsonValue::Object(map) => map,
        _ => Map::new(),
    }
}

fn documents_result(docs: Vec<Document>, command: &str) -> RawResult {
    let rows: Vec<Map<String, JsonValue>> = docs.into_iter().map(to_json_map).collect();
    let count = rows.len() as u64;
    let mut raw = RawResult::rows(rows, Vec::new()).with_command(command);
    // column metadata is inferred from the documents
    raw.fields = None;
    raw.row_count = Some(count);
    raw
}

/// Infer column metadata from one sample document.
fn sample_columns(doc: &Document) -> Vec<ColumnMetadata> {
    doc.iter()
        .map(|(name, value)| {
            ColumnMetadata::new(
                name,
                format!("{:?}", value.element_type()),
                matches!(value, Bson::Null),
            )
        })
        .collect()
}

async fn dispatch(
    session_state: &mut MongoSession,
    cmd: DocumentCommand,
    max_rows: Option<usize>,
) -> DbResult<RawResult> {
    let MongoSession { db, session, .. } = session_state;
    let tag = cmd.tag();
    let limit = max_rows.unwrap_or(usize::MAX);

    let raw = match cmd {
        DocumentCommand::Find {
            collection,
            filter,
            projection,
            limit: find_limit,
        } => {
            let coll = db.collection::<Document>(&collection);
            let mut action = coll.find(to_document(&filter)?);
            if let Some(projection) = projection {
                action = action.projection(to_document(&projection)?);
            }
            if let Some(n) = find_limit {
                action = action.limit(n);
            }
            let docs: Vec<Document> = match session.as_mut() {
                Some(s) => {
                    let mut cursor = action.session(&mut *s).await.map_err(from_mongo)?;
                    cursor
                        .stream(s)
                        .take(limit)
                        .try_collect()
                        .await
                        .map_err(from_mongo)?
                }
                None => action
                    .await
                    .map_err(from_mongo)?
                    .take(limit)
                    .try_collect()
                    .await
                    .map_err(from_mongo)?,
            };
            documents_result(docs, tag)
        }
        DocumentCommand::Aggregate {
            collection,
            pipeline,
        } => {
            let stages = pipeline
                .iter()
                .map(to_document)
                .collect::<DbResult<Vec<_>>>()?;
            let coll = db.collection::<Document>(&collection);
            let docs: Vec<Document> = match session.as_mut() {
                Some(s) => {
                    let mut cursor = coll
                        .aggregate(stages)
                        .session(&mut *s)
                        .await
                        .map_err(from_mongo)?;
                    cursor
                        .stream(s)
                        .take(limit)
                        .try_collect()
                        .await
                        .map_err(from_mongo)?
                }
                None => coll
                    .aggregate(stages)
                    .await
                    .map_err(from_mongo)?
                    .take(limit)
                    .try_collect()
                    .await
                    .map_err(from_mongo)?,
            };
            documents_result(docs, tag)
        }
        DocumentCommand::Insert {
            collection,
            documents,
        } => {
            if documents.is_empty() {
                return Ok(RawResult::affected(0).with_command(tag));
            }
            let docs = documents
                .iter()
                .map(to_document)
                .collect::<DbResult<Vec<_>>>()?;
            let coll = db.collection::<Document>(&collection);
            let result = with_session!(session, coll.insert_many(docs)).map_err(from_mongo)?;
            let mut ids: Vec<(usize, Bson)> = result.inserted_ids.into_iter().collect();
            ids.sort_by_key(|(idx, _)| *idx);
            let ids: Vec<JsonValue> = ids
                .into_iter()
                .map(|(_, id)| id.into_relaxed_extjson())
                .collect();
            RawResult::affected(ids.len() as u64)
                .with_command(tag)
                .with_metadata("inserted_ids", JsonValue::Array(ids))
        }
        DocumentCommand::Update {
            collection,
            filter,
            update,
            many,
        } => {
            let coll = db.collection::<Document>(&collection);
            let filter = to_document(&filter)?;
            let update = to_document(&update)?;
            let is_replacement = !update.keys().any(|k| k.starts_with('$'));
            let result = if is_replacement {
                with_session!(session, coll.replace_one(filter, update))
            } else if many {
                with_session!(session, coll.update_many(filter, update))
            } else {
                with_session!(session, coll.update_one(filter, update))
            }
            .map_err(from_mongo)?;
            RawResult::affected(result.modified_count)
                .with_command(tag)
                .with_metadata("matched_count", result.matched_count.into())
        }
        DocumentCommand::Delete {
            collection,
            filter,
            many,
        } => {
            let coll = db.collection::<Document>(&collection);
            let filter = to_document(&filter)?;
            let result = if many {
                with_session!(session, coll.delete_many(filter))
            } else {
                with_session!(session, coll.delete_one(filter))
            }
            .map_err(from_mongo)?;
            RawResult::affected(result.deleted_count).with_command(tag)
        }
        DocumentCommand::CreateIndex {
            collection,
            keys,
            options,
        } => {
            let options = options
                .map(|o| {
                    to_document(&o).and_then(|d| {
                        bson::from_document::<IndexOptions>(d).map_err(|e| {
                            DbError::query(format!("invalid index options: {}", e), "Check index option names")
                        })
                    })
                })
                .transpose()?;
            let model = IndexModel::builder()
                .keys(to_document(&keys)?)
                .options(options)
                .build();
            let coll = db.collection::<Document>(&collection);
            let result = with_session!(session, coll.create_index(model)).map_err(from_mongo)?;
            RawResult::new(json!({ "index_name": result.index_name })).with_command(tag)
        }
        DocumentCommand::DropCollection { collection } => {
            let coll = db.collection::<Document>(&collection);
            with_session!(session, coll.drop()).map_err(from_mongo)?;
            RawResult::affected(0).with_command(tag)
        }
        DocumentCommand::RunCommand { command } => {
            let command = to_document(&JsonValue::Object(command))?;
            let reply = with_session!(session, db.run_command(command)).map_err(from_mongo)?;
            let mut raw = RawResult::new(JsonValue::Object(to_json_map(reply.clone())))
                .with_command(tag);
            // count replies carry the number in `n`
            if let Ok(n) = reply.get_i32("n") {
                raw.row_count = Some(n.max(0) as u64);
            }
            raw
        }
    };
    Ok(raw)
}

#[async_trait]
impl Adapter for MongoAdapter {
    fn engine(&self) -> EngineType {
        ENGINE
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            savepoints: false,
            release_savepoint: false,
            streaming: true,
            cancel: false,
            prepared_statements: false,
            procedures: false,
            bulk_insert: true,
        }
    }

    async fn connect(&self, config: &EndpointConfig) -> DbResult<Connection> {
        let uri = Self::connection_uri(config);
        let connect_timeout = config.connect_timeout();
        let mut options = ClientOptions::parse(&uri).await.map_err(from_mongo)?;
        options.connect_timeout = Some(connect_timeout);
        options.server_selection_timeout = Some(connect_timeout);
        if options.app_name.is_none() {
            options.app_name = config.option("application_name").map(str::to_string);
        }
        let client = Client::with_options(options).map_err(from_mongo)?;
        let db = client.database(config.database.as_deref().unwrap_or("test"));

        // the driver connects lazily; ping to surface failures now
        timeout(connect_timeout, db.run_command(doc! { "ping": 1 }))
            .await
            .map_err(|_| DbError::timeout("connect", connect_timeout.as_millis() as u64))?
            .map_err(from_mongo)?;

        debug!(alias = %config.alias, database = %db.name(), "MongoDB connection established");
        Ok(Connection::new(
            ENGINE,
            MongoSession {
                client,
                db,
                session: None,
            },
        ))
    }

    async fn disconnect(&self, conn: &mut Connection) -> DbResult<()> {
        let session = conn.take_native::<MongoSession>()?;
        session.client.shutdown().await;
        Ok(())
    }

    async fn query(
        &self,
        conn: &mut Connection,
        text: &str,
        params: &[QueryParam],
        opts: &QueryOptions,
    ) -> DbResult<RawResult> {
        let text = inline_params(text, params)?;
        let cmd = parse_document_command(&text)?;
        let start = Instant::now();
        let session = conn.native_mut::<MongoSession>()?;
        let raw = dispatch(session, cmd, opts.max_rows).await?;
        conn.touch();
        Ok(raw.with_metadata("elapsed_ms", common::elapsed_ms(start).into()))
    }

    async fn begin_transaction(
        &self,
        conn: &mut Connection,
        isolation: Option<IsolationLevel>,
    ) -> DbResult<()> {
        let state = conn.native_mut::<MongoSession>()?;
        let mut session = state.client.start_session().await.map_err(from_mongo)?;
        match isolation {
            Some(IsolationLevel::Snapshot) => session
                .start_transaction()
                .read_concern(ReadConcern::snapshot())
                .await
                .map_err(from_mongo)?,
            _ => session.start_transaction().await.map_err(from_mongo)?,
        }
        state.session = Some(session);
        conn.in_transaction = true;
        conn.touch();
        Ok(())
    }

    async fn commit(&self, conn: &mut Connection) -> DbResult<()> {
        let connection_id = conn.id().to_string();
        let state = conn.native_mut::<MongoSession>()?;
        let mut session = state
            .session
            .take()
            .ok_or_else(|| DbError::no_active_transaction(connection_id))?;
        session.commit_transaction().await.map_err(from_mongo)?;
        conn.clear_transaction();
        Ok(())
    }

    async fn rollback(&self, conn: &mut Connection) -> DbResult<()> {
        let state = conn.native_mut::<MongoSession>()?;
        if let Some(mut session) = state.session.take() {
            session.abort_transaction().await.map_err(from_mongo)?;
        }
        conn.clear_transaction();
        Ok(())
    }

    async fn ping(&self, conn: &mut Connection) -> DbResult<()> {
        let state = conn.native::<MongoSession>()?;
        state
            .db
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(from_mongo)?;
        conn.touch();
        Ok(())
    }

    async fn metadata(&self, conn: &mut Connection) -> DbResult<ServerMetadata> {
        let state = conn.native::<MongoSession>()?;
        let info = state
            .db
            .run_command(doc! { "buildInfo": 1 })
            .await
            .map_err(from_mongo)?;
        let mut extra = Map::new();
        if let Ok(modules) = info.get_array("modules") {
            extra.insert(
                "modules".to_string(),
                Bson::Array(modules.clone()).into_relaxed_extjson(),
            );
        }
        if let Ok(git) = info.get_str("gitVersion") {
            extra.insert("git_version".to_string(), JsonValue::String(git.to_string()));
        }
        Ok(ServerMetadata {
            engine: ENGINE,
            server_version: info.get_str("version").ok().map(str::to_string),
            database: Some(state.db.name().to_string()),
            extra,
        })
    }

    async fn table_info(
        &self,
        conn: &mut Connection,
        table: &str,
    ) -> DbResult<Vec<ColumnMetadata>> {
        let state = conn.native::<MongoSession>()?;
        let names = state
            .db
            .list_collection_names()
            .await
            .map_err(from_mongo)?;
        if !names.iter().any(|n| n == table) {
            return Err(DbError::query(
                format!("collection '{}' not found", table),
                "Check the collection name",
            ));
        }
        let sample = state
            .db
            .collection::<Document>(table)
            .find_one(doc! {})
            .await
            .map_err(from_mongo)?;
        Ok(sample.as_ref().map(sample_columns).unwrap_or_default())
    }

    async fn bulk_insert(
        &self,
        conn: &mut Connection,
        table: &str,
        rows: &[Map<String, JsonValue>],
    ) -> DbResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let cmd = DocumentCommand::Insert {
            collection: table.to_string(),
            documents: rows.iter().cloned().map(JsonValue::Object).collect(),
        };
        let state = conn.native_mut::<MongoSession>()?;
        let raw = dispatch(state, cmd, None).await?;
        conn.touch();
        Ok(raw.affected_rows.unwrap_or_default())
    }

    fn stream<'c>(
        &'c self,
        conn: &'c mut Connection,
        text: &'c str,
        params: &'c [QueryParam],
    ) -> DbResult<RowStream<'c>> {
        let text = inline_params(text, params)?;
        let cmd = parse_document_command(&text)?;
        let state = conn.native_mut::<MongoSession>()?;

        match cmd {
            // cursors without a session stream lazily
            DocumentCommand::Find {
                collection,
                filter,
                projection,
                limit,
            } if state.session.is_none() => {
                let coll = state.db.collection::<Document>(&collection);
                let filter = to_document(&filter)?;
                let projection = projection.as_ref().map(to_document).transpose()?;
                let cursor = async move {
                    let mut action = coll.find(filter);
                    if let Some(projection) = projection {
                        action = action.projection(projection);
                    }
                    if let Some(n) = limit {
                        action = action.limit(n);
                    }
                    action.await
                };
                Ok(stream::once(cursor)
                    .try_flatten()
                    .map_ok(to_json_map)
                    .map_err(from_mongo)
                    .boxed())
            }
            cmd => {
                let buffered = async move {
                    let raw = dispatch(state, cmd, None).await?;
                    let rows = match raw.payload {
                        JsonValue::Array(items) => items,
                        other => vec![other],
                    };
                    Ok::<_, DbError>(stream::iter(rows.into_iter().filter_map(|row| match row {
                        JsonValue::Object(map) => Some(Ok::<_, DbError>(map)),
                        _ => None,
                    })))
                };
                Ok(stream::once(buffered).try_flatten().boxed())
            }
        }
    }
}
