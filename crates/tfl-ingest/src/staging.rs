//! Staging-table lifecycle
//!
//! The staging table is recreated (or verified) exactly once per run, before
//! any chunk is copied. DDL is derived from [`StagingColumn`] so the table,
//! the COPY column list and the normalizer cannot drift apart.

use std::fmt;
use std::str::FromStr;

use sqlx::PgPool;
use tracing::{info, instrument};

use crate::error::{IngestError, Result};
use crate::loader::LoadPolicy;
use crate::models::StagingColumn;

pub const DEFAULT_SCHEMA: &str = "public";
pub const DEFAULT_TABLE: &str = "stg_tfl_accidents";

/// Schema-qualified table name whose parts are plain SQL identifiers.
///
/// Identifiers are validated on construction, so they can be interpolated
/// into DDL and COPY statements directly. They are folded to lowercase the
/// way PostgreSQL folds unquoted names, which keeps catalog lookups in step
/// with the DDL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    schema: String,
    table: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Result<Self> {
        let schema = schema.into().to_ascii_lowercase();
        let table = table.into().to_ascii_lowercase();
        for part in [&schema, &table] {
            if !is_identifier(part) {
                return Err(IngestError::Config(format!(
                    "invalid SQL identifier {part:?} in table name"
                )));
            }
        }
        Ok(Self { schema, table })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl Default for TableName {
    fn default() -> Self {
        Self {
            schema: DEFAULT_SCHEMA.to_string(),
            table: DEFAULT_TABLE.to_string(),
        }
    }
}

impl FromStr for TableName {
    type Err = IngestError;

    /// Accepts `table` (schema defaults to `public`) or `schema.table`.
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((schema, table)) => Self::new(schema, table),
            None => Self::new(DEFAULT_SCHEMA, s),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {},
        _ => return false,
    }
    s.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, Default)]
pub struct StagingTable {
    name: TableName,
}

impl StagingTable {
    pub fn new(name: TableName) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &TableName {
        &self.name
    }

    /// `CREATE TABLE` statement for the staging table.
    pub fn create_sql(&self, if_not_exists: bool) -> String {
        let columns = StagingColumn::ALL
            .iter()
            .map(|c| format!("    {} {}", c.name(), c.sql_type()))
            .collect::<Vec<_>>()
            .join(",\n");
        format!(
            "CREATE TABLE {}{} (\n{}\n)",
            if if_not_exists { "IF NOT EXISTS " } else { "" },
            self.name,
            columns
        )
    }

    /// Brings the table into the state the load policy expects.
    ///
    /// `ReplaceAll` drops and recreates it; `UpsertByKey` creates it when
    /// missing and otherwise checks the existing column set. Runs in a single
    /// transaction, so a failure leaves the previous table untouched.
    #[instrument(skip(self, pool), fields(table = %self.name))]
    pub async fn ensure(&self, pool: &PgPool, policy: LoadPolicy) -> Result<()> {
        let schema_err = |source: sqlx::Error| IngestError::Schema {
            table: self.name.to_string(),
            source,
        };

        let mut tx = pool.begin().await.map_err(schema_err)?;

        match policy {
            LoadPolicy::ReplaceAll => {
                sqlx::query(&format!("DROP TABLE IF EXISTS {}", self.name))
                    .execute(&mut *tx)
                    .await
                    .map_err(schema_err)?;
                sqlx::query(&self.create_sql(false))
                    .execute(&mut *tx)
                    .await
                    .map_err(schema_err)?;
                info!("Staging table recreated");
            },
            LoadPolicy::UpsertByKey => {
                sqlx::query(&self.create_sql(true))
                    .execute(&mut *tx)
                    .await
                    .map_err(schema_err)?;

                let found: Vec<(String, String)> = sqlx::query_as(
                    "SELECT column_name::text, data_type::text \
                     FROM information_schema.columns \
                     WHERE table_schema = $1 AND table_name = $2 \
                     ORDER BY ordinal_position",
                )
                .bind(self.name.schema())
                .bind(self.name.table())
                .fetch_all(&mut *tx)
                .await
                .map_err(schema_err)?;

                if let Some(problem) = column_mismatch(&found) {
                    return Err(schema_err(sqlx::Error::Protocol(problem)));
                }
                info!(columns = found.len(), "Staging table verified");
            },
        }

        tx.commit().await.map_err(schema_err)?;
        Ok(())
    }

    pub async fn row_count(&self, pool: &PgPool) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", self.name))
            .fetch_one(pool)
            .await
            .map_err(|source| IngestError::Schema {
                table: self.name.to_string(),
                source,
            })?;
        Ok(count)
    }
}

/// Describes the first difference between the catalog columns and the
/// expected staging layout.
fn column_mismatch(found: &[(String, String)]) -> Option<String> {
    for column in StagingColumn::ALL {
        match found.iter().find(|(name, _)| name == column.name()) {
            None => return Some(format!("missing column {}", column.name())),
            Some((_, data_type)) if data_type != column.catalog_type() => {
                return Some(format!(
                    "column {} has type {}, expected {}",
                    column.name(),
                    data_type,
                    column.catalog_type()
                ))
            },
            Some(_) => {},
        }
    }
    found
        .iter()
        .find(|(name, _)| !StagingColumn::ALL.iter().any(|c| c.name() == name))
        .map(|(name, _)| format!("unexpected column {name}"))
}
