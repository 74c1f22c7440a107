//! Schema enrichment.
//!
//! The binary log carries neither column names nor signedness. This layer
//! keeps a per-table column list fetched from `INFORMATION_SCHEMA` over a
//! separate metadata connection (the replication connection cannot serve
//! result sets while dumping), watches Query events for ALTER TABLE, and
//! turns positional row images into name-keyed maps with integers
//! re-signed according to the DDL.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use mysql_async::prelude::Queryable;
use regex::Regex;
use tracing::{debug, info};

use crate::conn::Dsn;
use crate::driver::Config;
use crate::error::{Error, Result};
use crate::event::table_map::TableDescription;
use crate::event::{EventHeader, EventType, Position};
use crate::reader::{BinlogReader, Event};
use crate::value::{ColumnType, Value};

/// Column details unavailable in the binary log itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// Declared `unsigned` in the DDL.
    pub unsigned: bool,
}

/// Columns of one managed table, in ordinal order.
#[derive(Debug, Clone, Default)]
pub struct TableSchema {
    columns: Vec<Column>,
}

impl TableSchema {
    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Managed table schemas, keyed by database then table name.
#[derive(Debug, Default)]
pub struct Schema {
    tables: HashMap<String, HashMap<String, TableSchema>>,
}

impl Schema {
    pub fn table(&self, database: &str, table: &str) -> Option<&TableSchema> {
        self.tables.get(database)?.get(table)
    }

    fn update(&mut self, database: &str, table: &str, columns: Vec<Column>) {
        self.tables
            .entry(database.to_string())
            .or_default()
            .insert(table.to_string(), TableSchema { columns });
    }
}

/// Fetches and caches table schemas over its own connection pool.
pub struct SchemaManager {
    pool: mysql_async::Pool,
    schema: Schema,
}

impl std::fmt::Debug for SchemaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaManager")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl SchemaManager {
    /// Build a manager over a metadata connection to the same server the
    /// reader follows.
    pub fn new(dsn: &Dsn) -> Result<Self> {
        let url = format!(
            "mysql://{}:{}@{}:{}",
            dsn.user, dsn.password, dsn.host, dsn.port
        );
        let opts = mysql_async::Opts::from_url(&url)
            .map_err(|e| Error::schema(format!("invalid metadata url: {e}")))?;
        Ok(SchemaManager {
            pool: mysql_async::Pool::new(opts),
            schema: Schema::default(),
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Add a table to the managed set and fetch its columns.
    pub async fn manage(&mut self, database: &str, table: &str) -> Result<()> {
        let columns = self.fetch_columns(database, table).await?;
        if columns.is_empty() {
            return Err(Error::schema(format!(
                "table {database}.{table} has no columns in INFORMATION_SCHEMA"
            )));
        }
        debug!(database, table, columns = columns.len(), "schema cached");
        self.schema.update(database, table, columns);
        Ok(())
    }

    /// Inspect a replicated statement and refresh the schema of a managed
    /// table it alters.
    pub async fn process_query(&mut self, database: &str, query: &str) -> Result<()> {
        if let Some(table) = altered_table(query) {
            if self.schema.table(database, &table).is_some() {
                info!(database, table, "ALTER TABLE observed; refreshing schema");
                return self.manage(database, &table).await;
            }
        }
        Ok(())
    }

    async fn fetch_columns(&self, database: &str, table: &str) -> Result<Vec<Column>> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| Error::schema(format!("metadata connection failed: {e}")))?;
        let rows: Vec<(String, String)> = conn
            .exec(
                "SELECT COLUMN_NAME, COLUMN_TYPE \
                 FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION ASC",
                (database, table),
            )
            .await
            .map_err(|e| Error::schema(format!("column query failed: {e}")))?;
        Ok(rows
            .into_iter()
            .map(|(name, column_type)| Column {
                unsigned: column_type.to_lowercase().contains("unsigned"),
                name,
            })
            .collect())
    }

    /// Release the metadata pool.
    pub async fn close(self) -> Result<()> {
        self.pool
            .disconnect()
            .await
            .map_err(|e| Error::schema(format!("metadata pool shutdown failed: {e}")))
    }
}

/// Table named by an ALTER TABLE statement, if the query is one.
fn altered_table(query: &str) -> Option<String> {
    static ALTER_RE: OnceLock<Regex> = OnceLock::new();
    let re = ALTER_RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*alter\s+table\s+`?([a-z0-9_]+)").expect("alter table pattern")
    });
    re.captures(query).map(|c| c[1].to_string())
}

/// A row event with named, re-signed values.
#[derive(Debug, Clone)]
pub struct EnrichedRowsEvent {
    pub header: EventHeader,
    pub table: Arc<TableDescription>,
    /// One map per row image; update events interleave before/after.
    pub rows: Vec<HashMap<String, Value>>,
}

/// Map positional row values to column names and re-sign integers whose
/// columns the DDL declares signed.
fn enrich_rows(
    rows: Vec<Vec<Value>>,
    td: &TableDescription,
    schema: &TableSchema,
) -> Result<Vec<HashMap<String, Value>>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let mut named = HashMap::with_capacity(row.len());
        for (i, value) in row.into_iter().enumerate() {
            let column = schema.column(i).ok_or_else(|| {
                Error::schema(format!(
                    "column index {i} undefined for {}.{}",
                    td.schema_name, td.table_name
                ))
            })?;
            let column_type = ColumnType::from(td.column_types[i]);
            let value = if column.unsigned {
                value
            } else {
                value.into_signed(column_type)
            };
            named.insert(column.name.clone(), value);
        }
        out.push(named);
    }
    Ok(out)
}

/// A binlog reader paired with a schema manager.
///
/// Surfaces row events for managed tables as name-keyed maps, skipping
/// everything else, and keeps schemas fresh across ALTER TABLE.
#[derive(Debug)]
pub struct EnrichedReader {
    reader: BinlogReader,
    manager: SchemaManager,
}

impl EnrichedReader {
    /// Connect the replication session and the metadata pool.
    pub async fn connect(dsn: &str, config: Config) -> Result<Self> {
        let parsed = Dsn::parse(dsn)?;
        let reader = BinlogReader::connect(dsn, config).await?;
        Ok(EnrichedReader {
            reader,
            manager: SchemaManager::new(&parsed)?,
        })
    }

    /// Add tables of a database to the managed set.
    pub async fn manage_tables(&mut self, database: &str, tables: &[&str]) -> Result<()> {
        for table in tables {
            self.manager.manage(database, table).await?;
        }
        Ok(())
    }

    /// Read the next event, feeding Query events through the schema
    /// manager on the way.
    pub async fn read_event(&mut self) -> Result<Event> {
        let event = self.reader.read_event().await?;
        if event.header.event_type == EventType::Query {
            let query = event.decode_query()?;
            self.manager
                .process_query(&query.schema, &query.query)
                .await?;
        }
        Ok(event)
    }

    /// Block until the next row event on a managed table and return it
    /// enriched. Events for unmanaged tables are skipped.
    pub async fn next_row_event(&mut self) -> Result<EnrichedRowsEvent> {
        loop {
            let event = self.read_event().await?;
            if !event.header.event_type.is_row_event() {
                continue;
            }
            let Some(table) = event.table.clone() else {
                continue;
            };
            let Some(schema) = self
                .manager
                .schema()
                .table(&table.schema_name, &table.table_name)
            else {
                continue;
            };

            let rows = event.decode_rows()?;
            return Ok(EnrichedRowsEvent {
                header: event.header,
                rows: enrich_rows(rows.rows, &table, schema)?,
                table,
            });
        }
    }

    /// Convenience wrapper bounding each underlying read.
    pub async fn next_row_event_timeout(&mut self, timeout: Duration) -> Result<EnrichedRowsEvent> {
        tokio::time::timeout(timeout, self.next_row_event())
            .await
            .map_err(|_| Error::Timeout)?
    }

    pub fn state(&self) -> &Position {
        self.reader.state()
    }

    pub fn safepoint(&self) -> &Position {
        self.reader.safepoint()
    }

    /// Close both connections.
    pub async fn close(self) -> Result<()> {
        self.reader.close().await?;
        self.manager.close().await
    }
}
