//! Shared pieces of the relational backends: dialect-specific statements,
//! the predicate compiler and the row type all three decode into.

use std::borrow::Cow;

use serde_json::Value;
use sqlx::types::Json;

use meshql_core::envelope::{from_millis, Envelope, Params, Payload};
use meshql_core::error::{ErrorCode, MeshqlError, MeshqlResult};
use meshql_core::template::{escape_sql_literal, QueryTemplate};
use meshql_core::traits::QueryCompiler;

/// Columns every statement reads back.
const COLUMNS: &str = "id, payload, created_at, deleted, authorized_tokens";

/// SQL flavour a statement is rendered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    Mysql,
    Sqlite,
}

/// Whether versions stamped exactly at the as-of time are visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cutoff {
    /// `created_at <= at`, used by repository reads.
    Inclusive,
    /// `created_at < at`, used by searches.
    Exclusive,
}

impl Cutoff {
    fn operator(self) -> &'static str {
        match self {
            Self::Inclusive => "<=",
            Self::Exclusive => "<",
        }
    }
}

/// Restriction on which ids a current-view query covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdFilter {
    All,
    One,
    Many(usize),
}

/// Shape of a current-view query. The as-of millis bind first, then ids.
#[derive(Debug, Clone, Copy)]
pub struct ViewQuery<'a> {
    pub cutoff: Cutoff,
    pub ids: IdFilter,
    pub predicate: Option<&'a str>,
    pub limit_one: bool,
}

impl<'a> ViewQuery<'a> {
    pub fn read(ids: IdFilter) -> Self {
        Self {
            cutoff: Cutoff::Inclusive,
            ids,
            predicate: None,
            limit_one: false,
        }
    }

    pub fn search(predicate: &'a str, limit_one: bool) -> Self {
        Self {
            cutoff: Cutoff::Exclusive,
            ids: IdFilter::All,
            predicate: Some(predicate),
            limit_one,
        }
    }
}

impl SqlDialect {
    pub fn name(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Sqlite => "sqlite",
        }
    }

    /// Quote a validated table name.
    pub fn quote(self, ident: &str) -> String {
        match self {
            Self::Mysql => format!("`{}`", ident),
            _ => format!("\"{}\"", ident),
        }
    }

    /// Bind placeholder for the 1-based parameter `n`.
    pub fn placeholder(self, n: usize) -> String {
        match self {
            Self::Postgres => format!("${}", n),
            _ => "?".to_string(),
        }
    }

    /// Table and index DDL, each statement executed separately.
    pub fn create_statements(self, table: &str) -> Vec<String> {
        let t = self.quote(table);
        let index = self.quote(&format!("{}_id_created_idx", table));
        match self {
            Self::Postgres => vec![
                format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {t} (
                        pk BIGSERIAL PRIMARY KEY,
                        id TEXT NOT NULL,
                        payload JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                        created_at BIGINT NOT NULL,
                        deleted BOOLEAN NOT NULL DEFAULT FALSE,
                        authorized_tokens JSONB NOT NULL DEFAULT '[]'::jsonb
                    )
                    "#
                ),
                format!("CREATE INDEX IF NOT EXISTS {index} ON {t} (id, created_at DESC)"),
            ],
            Self::Mysql => vec![format!(
                r#"
                CREATE TABLE IF NOT EXISTS {t} (
                    pk BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                    id VARCHAR(255) NOT NULL,
                    payload JSON NOT NULL,
                    created_at BIGINT NOT NULL,
                    deleted BOOLEAN NOT NULL DEFAULT FALSE,
                    authorized_tokens JSON NOT NULL,
                    INDEX {index} (id, created_at)
                )
                "#
            )],
            Self::Sqlite => vec![
                format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {t} (
                        pk INTEGER PRIMARY KEY AUTOINCREMENT,
                        id TEXT NOT NULL,
                        payload TEXT NOT NULL DEFAULT '{{}}',
                        created_at INTEGER NOT NULL,
                        deleted INTEGER NOT NULL DEFAULT 0,
                        authorized_tokens TEXT NOT NULL DEFAULT '[]'
                    )
                    "#
                ),
                format!("CREATE INDEX IF NOT EXISTS {index} ON {t} (id, created_at)"),
            ],
        }
    }

    /// Single-row insert binding id, payload, created_at, deleted, tokens.
    pub fn insert_statement(self, table: &str) -> String {
        let values: Vec<String> = (1..=5).map(|n| self.placeholder(n)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.quote(table),
            COLUMNS,
            values.join(", ")
        )
    }

    /// Latest version per id at the cutoff, minus delete markers, newest first.
    ///
    /// Ties on `created_at` go to the highest `pk`, the row inserted last.
    pub fn current_view(self, table: &str, view: &ViewQuery<'_>) -> String {
        let t = self.quote(table);
        let mut inner = format!("created_at {} {}", view.cutoff.operator(), self.placeholder(1));
        match view.ids {
            IdFilter::All => {}
            IdFilter::One => inner.push_str(&format!(" AND id = {}", self.placeholder(2))),
            IdFilter::Many(n) => {
                let list: Vec<String> = (2..n + 2).map(|i| self.placeholder(i)).collect();
                inner.push_str(&format!(" AND id IN ({})", list.join(", ")));
            }
        }

        let (latest, mut outer) = match self {
            Self::Postgres => (
                format!(
                    "SELECT DISTINCT ON (id) pk, {COLUMNS} FROM {t} WHERE {inner} \
                     ORDER BY id, created_at DESC, pk DESC"
                ),
                "NOT latest.deleted".to_string(),
            ),
            Self::Mysql | Self::Sqlite => (
                format!(
                    "SELECT pk, {COLUMNS}, ROW_NUMBER() OVER \
                     (PARTITION BY id ORDER BY created_at DESC, pk DESC) AS rn \
                     FROM {t} WHERE {inner}"
                ),
                "latest.rn = 1 AND NOT latest.deleted".to_string(),
            ),
        };
        if let Some(predicate) = view.predicate {
            outer.push_str(&format!(" AND ({})", predicate));
        }

        let limit = if view.limit_one { " LIMIT 1" } else { "" };
        format!(
            "SELECT {COLUMNS} FROM ({latest}) latest WHERE {outer} \
             ORDER BY created_at DESC, pk DESC{limit}"
        )
    }

    /// Escape a value substituted inside a single-quoted literal.
    pub fn escape_literal(self, s: &str) -> Cow<'_, str> {
        match self {
            Self::Mysql if s.contains('\\') || s.contains('\'') => {
                Cow::Owned(s.replace('\\', "\\\\").replace('\'', "''"))
            }
            _ => escape_sql_literal(s),
        }
    }
}

/// Compiles `{{name}}` templates into a WHERE-clause predicate fragment.
#[derive(Debug, Clone, Copy)]
pub struct SqlPredicateCompiler {
    dialect: SqlDialect,
}

impl SqlPredicateCompiler {
    pub fn new(dialect: SqlDialect) -> Self {
        Self { dialect }
    }
}

impl QueryCompiler for SqlPredicateCompiler {
    type Query = String;

    fn compile_query(&self, template: &QueryTemplate, params: &Params) -> MeshqlResult<String> {
        let dialect = self.dialect;
        let rendered = template.render_with(params, |s| dialect.escape_literal(s))?;
        check_predicate(&rendered, dialect).map_err(|reason| {
            MeshqlError::template(
                ErrorCode::TplInvalidQuery,
                format!("Invalid {} predicate: {}", dialect.name(), reason),
                template.source(),
            )
        })?;
        Ok(rendered.trim().to_string())
    }
}

/// Reject fragments that would not embed as a single parenthesised predicate.
fn check_predicate(sql: &str, dialect: SqlDialect) -> Result<(), &'static str> {
    if sql.trim().is_empty() {
        return Err("predicate is empty");
    }

    let mut quote: Option<char> = None;
    let mut depth = 0i32;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == '\\' && dialect == SqlDialect::Mysql {
                    chars.next();
                } else if c == q {
                    if chars.peek() == Some(&q) {
                        chars.next();
                    } else {
                        quote = None;
                    }
                }
            }
            None => match c {
                '\'' | '"' | '`' => quote = Some(c),
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth < 0 {
                        return Err("unbalanced parentheses");
                    }
                }
                ';' => return Err("statement terminators are not allowed"),
                _ => {}
            },
        }
    }

    if quote.is_some() {
        Err("unterminated quoted string")
    } else if depth != 0 {
        Err("unbalanced parentheses")
    } else {
        Ok(())
    }
}

/// One stored version as every relational backend returns it.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EnvelopeRow {
    pub id: String,
    pub payload: Json<Value>,
    pub created_at: i64,
    pub deleted: bool,
    pub authorized_tokens: Json<Vec<String>>,
}

impl EnvelopeRow {
    pub fn into_envelope(self) -> MeshqlResult<Envelope> {
        let payload = match self.payload.0 {
            Value::Object(map) => map,
            Value::Null => Payload::new(),
            other => {
                return Err(MeshqlError::storage(
                    ErrorCode::DbCorruptRow,
                    format!("Row '{}' holds a non-object payload: {}", self.id, other),
                ))
            }
        };
        Ok(Envelope {
            id: Some(self.id),
            payload,
            created_at: Some(from_millis(self.created_at)),
            deleted: self.deleted,
            authorized_tokens: self.authorized_tokens.0,
        })
    }
}

/// Insert parameters for one envelope, in `COLUMNS` order.
pub(crate) struct InsertParams {
    pub id: String,
    pub payload: Json<Payload>,
    pub created_at: i64,
    pub deleted: bool,
    pub authorized_tokens: Json<Vec<String>>,
}

impl From<&Envelope> for InsertParams {
    fn from(envelope: &Envelope) -> Self {
        Self {
            id: envelope.id_str().to_string(),
            payload: Json(envelope.payload.clone()),
            created_at: envelope.created_millis(),
            deleted: envelope.deleted,
            authorized_tokens: Json(envelope.authorized_tokens.clone()),
        }
    }
}

/// Map a driver error onto a storage error with context.
pub(crate) fn db_error(
    code: ErrorCode,
    context: &'static str,
) -> impl FnOnce(sqlx::Error) -> MeshqlError {
    move |e| MeshqlError::storage_from(code, format!("{}: {}", context, e), e)
}

/// Convert rows, keeping only envelopes visible to `tokens`.
pub(crate) fn visible(rows: Vec<EnvelopeRow>, tokens: &[String]) -> MeshqlResult<Vec<Envelope>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let envelope = row.into_envelope()?;
        if envelope.is_visible_to(tokens) {
            out.push(envelope);
        }
    }
    Ok(out)
}

/// Defines the repository and searcher of one sqlx backend.
///
/// The backend module supplies only its pool type, dialect and `connect`.
macro_rules! sql_backend {
    (
        database: $db:ty,
        pool: $pool:ty,
        dialect: $dialect:expr,
        label: $label:literal,
        repository: $repo:ident,
        searcher: $searcher:ident $(,)?
    ) => {
        const DIALECT: $crate::sql::SqlDialect = $dialect;

        async fn fetch_view<'e, E>(
            executor: E,
            sql: &'e str,
            at: ::meshql_core::envelope::Timestamp,
            ids: &[String],
        ) -> ::meshql_core::error::MeshqlResult<Vec<$crate::sql::EnvelopeRow>>
        where
            E: ::sqlx::Executor<'e, Database = $db>,
        {
            let mut query =
                ::sqlx::query_as::<_, $crate::sql::EnvelopeRow>(sql).bind(at.timestamp_millis());
            for id in ids {
                query = query.bind(id.clone());
            }
            query.fetch_all(executor).await.map_err($crate::sql::db_error(
                ::meshql_core::error::ErrorCode::DbOperationFailed,
                "Failed to query envelopes",
            ))
        }

        async fn insert<'e, E>(
            executor: E,
            sql: &'e str,
            envelope: &::meshql_core::envelope::Envelope,
        ) -> ::meshql_core::error::MeshqlResult<()>
        where
            E: ::sqlx::Executor<'e, Database = $db>,
        {
            let params = $crate::sql::InsertParams::from(envelope);
            ::sqlx::query(sql)
                .bind(params.id)
                .bind(params.payload)
                .bind(params.created_at)
                .bind(params.deleted)
                .bind(params.authorized_tokens)
                .execute(executor)
                .await
                .map_err($crate::sql::db_error(
                    ::meshql_core::error::ErrorCode::DbOperationFailed,
                    "Failed to insert envelope",
                ))?;
            Ok(())
        }

        #[doc = concat!("Append-only envelope storage in one ", $label, " table.")]
        pub struct $repo {
            pool: $pool,
            table: String,
            span: ::tracing::Span,
        }

        impl $repo {
            pub fn new(
                pool: $pool,
                table: impl Into<String>,
            ) -> ::meshql_core::error::MeshqlResult<Self> {
                let table = table.into();
                ::meshql_core::config::validate_identifier(&table)?;
                let span = ::meshql_core::logging::storage_span(DIALECT.name(), &table);
                Ok(Self { pool, table, span })
            }

            pub fn with_span(mut self, span: ::tracing::Span) -> Self {
                self.span = span;
                self
            }

            async fn begin(&self) -> ::meshql_core::error::MeshqlResult<::sqlx::Transaction<'static, $db>> {
                self.pool.begin().await.map_err($crate::sql::db_error(
                    ::meshql_core::error::ErrorCode::DbTransactionFailed,
                    "Failed to begin transaction",
                ))
            }
        }

        #[::async_trait::async_trait]
        impl ::meshql_core::traits::Repository for $repo {
            async fn initialize(&self) -> ::meshql_core::error::MeshqlResult<()> {
                for statement in DIALECT.create_statements(&self.table) {
                    ::sqlx::query(&statement)
                        .execute(&self.pool)
                        .await
                        .map_err($crate::sql::db_error(
                            ::meshql_core::error::ErrorCode::DbSchemaFailed,
                            "Failed to create table",
                        ))?;
                }
                ::tracing::debug!(parent: &self.span, "schema ready");
                Ok(())
            }

            async fn ready(&self) -> ::meshql_core::error::MeshqlResult<bool> {
                Ok(::sqlx::query("SELECT 1").execute(&self.pool).await.is_ok())
            }

            async fn create(
                &self,
                envelope: ::meshql_core::envelope::Envelope,
            ) -> ::meshql_core::error::MeshqlResult<::meshql_core::envelope::Envelope> {
                let envelope = envelope.stamped();
                insert(&self.pool, &DIALECT.insert_statement(&self.table), &envelope).await?;
                ::tracing::debug!(parent: &self.span, id = envelope.id_str(), "created envelope");
                Ok(envelope)
            }

            async fn read(
                &self,
                id: &str,
                tokens: &[String],
                at: ::meshql_core::envelope::Timestamp,
            ) -> ::meshql_core::error::MeshqlResult<Option<::meshql_core::envelope::Envelope>> {
                let sql = DIALECT.current_view(
                    &self.table,
                    &$crate::sql::ViewQuery::read($crate::sql::IdFilter::One),
                );
                let rows = fetch_view(&self.pool, &sql, at, &[id.to_string()]).await?;
                Ok($crate::sql::visible(rows, tokens)?.into_iter().next())
            }

            async fn list(
                &self,
                tokens: &[String],
                at: ::meshql_core::envelope::Timestamp,
            ) -> ::meshql_core::error::MeshqlResult<Vec<::meshql_core::envelope::Envelope>> {
                let sql = DIALECT.current_view(
                    &self.table,
                    &$crate::sql::ViewQuery::read($crate::sql::IdFilter::All),
                );
                let rows = fetch_view(&self.pool, &sql, at, &[]).await?;
                $crate::sql::visible(rows, tokens)
            }

            async fn remove(
                &self,
                id: &str,
                tokens: &[String],
            ) -> ::meshql_core::error::MeshqlResult<bool> {
                let at = ::meshql_core::envelope::now();
                let Some(live) = ::meshql_core::traits::Repository::read(self, id, tokens, at).await? else {
                    return Ok(false);
                };
                let marker = ::meshql_core::envelope::Envelope::delete_marker(&live, at);
                insert(&self.pool, &DIALECT.insert_statement(&self.table), &marker).await?;
                ::tracing::debug!(parent: &self.span, id, "removed envelope");
                Ok(true)
            }

            async fn create_many(
                &self,
                envelopes: Vec<::meshql_core::envelope::Envelope>,
            ) -> ::meshql_core::error::MeshqlResult<Vec<::meshql_core::envelope::Envelope>> {
                let envelopes: Vec<::meshql_core::envelope::Envelope> = envelopes
                    .into_iter()
                    .map(::meshql_core::envelope::Envelope::stamped)
                    .collect();
                let sql = DIALECT.insert_statement(&self.table);

                let mut tx = self.begin().await?;
                for envelope in &envelopes {
                    insert(&mut *tx, &sql, envelope).await?;
                }
                tx.commit().await.map_err($crate::sql::db_error(
                    ::meshql_core::error::ErrorCode::DbTransactionFailed,
                    "Failed to commit transaction",
                ))?;

                ::tracing::debug!(parent: &self.span, count = envelopes.len(), "created envelopes");
                Ok(envelopes)
            }

            async fn read_many(
                &self,
                ids: &[String],
                tokens: &[String],
                at: ::meshql_core::envelope::Timestamp,
            ) -> ::meshql_core::error::MeshqlResult<Vec<::meshql_core::envelope::Envelope>> {
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                let sql = DIALECT.current_view(
                    &self.table,
                    &$crate::sql::ViewQuery::read($crate::sql::IdFilter::Many(ids.len())),
                );
                let rows = fetch_view(&self.pool, &sql, at, ids).await?;
                Ok(::meshql_core::envelope::order_by_ids(
                    ids,
                    $crate::sql::visible(rows, tokens)?,
                ))
            }

            /// A repeated id keeps the outcome of its first occurrence.
            async fn remove_many(
                &self,
                ids: &[String],
                tokens: &[String],
            ) -> ::meshql_core::error::MeshqlResult<::std::collections::HashMap<String, bool>> {
                let read_sql = DIALECT.current_view(
                    &self.table,
                    &$crate::sql::ViewQuery::read($crate::sql::IdFilter::One),
                );
                let insert_sql = DIALECT.insert_statement(&self.table);
                let at = ::meshql_core::envelope::now();
                let mut results = ::std::collections::HashMap::with_capacity(ids.len());

                let mut tx = self.begin().await?;
                for id in ids {
                    if results.contains_key(id) {
                        continue;
                    }
                    let rows = fetch_view(&mut *tx, &read_sql, at, ::std::slice::from_ref(id)).await?;
                    let live = $crate::sql::visible(rows, tokens)?.into_iter().next();
                    if let Some(live) = &live {
                        let marker = ::meshql_core::envelope::Envelope::delete_marker(live, at);
                        insert(&mut *tx, &insert_sql, &marker).await?;
                    }
                    results.insert(id.clone(), live.is_some());
                }
                tx.commit().await.map_err($crate::sql::db_error(
                    ::meshql_core::error::ErrorCode::DbTransactionFailed,
                    "Failed to commit transaction",
                ))?;

                Ok(results)
            }
        }

        #[doc = concat!("Template-driven point-in-time search over a ", $label, " table.")]
        pub struct $searcher {
            pool: $pool,
            table: String,
            compiler: $crate::sql::SqlPredicateCompiler,
            auth: ::std::sync::Arc<dyn ::meshql_core::auth::Auth>,
            span: ::tracing::Span,
        }

        impl $searcher {
            pub fn new(
                pool: $pool,
                table: impl Into<String>,
                auth: ::std::sync::Arc<dyn ::meshql_core::auth::Auth>,
            ) -> ::meshql_core::error::MeshqlResult<Self> {
                let table = table.into();
                ::meshql_core::config::validate_identifier(&table)?;
                let span = ::meshql_core::logging::storage_span(DIALECT.name(), &table);
                Ok(Self {
                    pool,
                    table,
                    compiler: $crate::sql::SqlPredicateCompiler::new(DIALECT),
                    auth,
                    span,
                })
            }

            pub fn with_span(mut self, span: ::tracing::Span) -> Self {
                self.span = span;
                self
            }

            async fn search(
                &self,
                template: &::meshql_core::template::QueryTemplate,
                params: &::meshql_core::envelope::Params,
                at: ::meshql_core::envelope::Timestamp,
                limit_one: bool,
            ) -> ::meshql_core::error::MeshqlResult<Vec<::meshql_core::envelope::Envelope>> {
                use ::meshql_core::traits::QueryCompiler;

                let predicate = self.compiler.compile_query(template, params)?;
                let sql = DIALECT.current_view(
                    &self.table,
                    &$crate::sql::ViewQuery::search(&predicate, limit_one),
                );
                ::tracing::trace!(parent: &self.span, %sql, "search");
                let rows = fetch_view(&self.pool, &sql, at, &[]).await?;
                rows.into_iter()
                    .map($crate::sql::EnvelopeRow::into_envelope)
                    .collect()
            }
        }

        #[::async_trait::async_trait]
        impl ::meshql_core::traits::Searcher for $searcher {
            async fn find(
                &self,
                template: &::meshql_core::template::QueryTemplate,
                params: &::meshql_core::envelope::Params,
                credentials: &[String],
                at: ::meshql_core::envelope::Timestamp,
            ) -> ::meshql_core::error::MeshqlResult<Option<::meshql_core::envelope::Envelope>> {
                let found = self.search(template, params, at, true).await?.into_iter().next();
                Ok(found.filter(|e| self.auth.is_authorized(credentials, e)))
            }

            async fn find_all(
                &self,
                template: &::meshql_core::template::QueryTemplate,
                params: &::meshql_core::envelope::Params,
                credentials: &[String],
                at: ::meshql_core::envelope::Timestamp,
            ) -> ::meshql_core::error::MeshqlResult<Vec<::meshql_core::envelope::Envelope>> {
                let mut found = self.search(template, params, at, false).await?;
                found.retain(|e| self.auth.is_authorized(credentials, e));
                Ok(found)
            }
        }
    };
}

pub(crate) use sql_backend;
