//! Staging area and conflict-aware merge into the target table.
//!
//! Each file is loaded into its own table inside the staging schema (an
//! attached in-memory database), merged into the target with a single
//! `INSERT .. SELECT .. ON CONFLICT` statement, and dropped afterwards.

use chrono::Utc;
use log::{debug, info};
use rusqlite::{params, params_from_iter, Connection};
use serde::Serialize;

use super::{quote_ident, Database, DatabaseError};
use crate::config::DatabaseConfig;
use crate::table::{Table, PROCESSED_AT_COLUMN};

const MAIN_SCHEMA: &str = "main";

/// Row counts for the target table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetStats {
    pub total_records: u64,
    pub today_records: u64,
    pub latest_processing: Option<String>,
}

/// The database side of the staged load. Implementations must tolerate
/// `drop_staging_table` on a table that was never created.
pub trait StagingStore: Send + Sync {
    /// Creates the staging schema if it is absent. Idempotent.
    fn ensure_staging_schema(&self) -> Result<(), DatabaseError>;

    /// Creates `name` fresh inside the staging schema and fills it with
    /// every row of `table`. Returns the number of rows staged.
    fn create_staging_table(&self, name: &str, table: &Table) -> Result<usize, DatabaseError>;

    /// Merges a staging table into the target, creating the target on
    /// first use. Returns the number of rows inserted or updated.
    fn upsert_into_target(&self, staging_table: &str) -> Result<usize, DatabaseError>;

    fn drop_staging_table(&self, name: &str) -> Result<(), DatabaseError>;

    fn target_stats(&self) -> Result<TargetStats, DatabaseError>;
}

/// Builds the merge statement:
///
/// `INSERT INTO <target>(<cols>) SELECT <cols> FROM <staging> WHERE true
///  ON CONFLICT (<key>) DO UPDATE SET <col> = excluded.<col>` for every
/// column except the key. `WHERE true` keeps SQLite from reading the
/// `ON` as a join constraint. A key-only table degrades to `DO NOTHING`.
pub fn build_upsert_sql(
    target_table: &str,
    staging_schema: &str,
    staging_table: &str,
    columns: &[String],
    business_key: &str,
) -> String {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let updates = columns
        .iter()
        .filter(|c| c.as_str() != business_key)
        .map(|c| format!("{col} = excluded.{col}", col = quote_ident(c)))
        .collect::<Vec<_>>();

    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    format!(
        "INSERT INTO {target} ({cols}) SELECT {cols} FROM {schema}.{staging} WHERE true \
         ON CONFLICT ({key}) {action}",
        target = quote_ident(target_table),
        cols = column_list,
        schema = quote_ident(staging_schema),
        staging = quote_ident(staging_table),
        key = quote_ident(business_key),
        action = action,
    )
}

fn schema_attached(conn: &Connection, schema: &str) -> Result<bool, DatabaseError> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_database_list")?;
    let names = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names.iter().any(|n| n.eq_ignore_ascii_case(schema)))
}

fn table_exists(conn: &Connection, schema: &str, table: &str) -> Result<bool, DatabaseError> {
    let sql = format!(
        "SELECT COUNT(*) FROM {}.sqlite_master WHERE type = 'table' AND name = ?1",
        quote_ident(schema)
    );
    let count: i64 = conn.query_row(&sql, params![table], |r| r.get(0))?;
    Ok(count > 0)
}

fn table_columns(
    conn: &Connection,
    schema: &str,
    table: &str,
) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1, ?2) ORDER BY cid")?;
    let columns = stmt
        .query_map(params![table, schema], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

fn column_defs(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("{} TEXT", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// SQLite implementation of [`StagingStore`].
#[derive(Clone)]
pub struct SqliteStagingStore {
    db: Database,
    staging_schema: String,
    target_table: String,
    business_key: String,
}

impl SqliteStagingStore {
    pub fn new(db: Database, config: &DatabaseConfig) -> Self {
        Self {
            db,
            staging_schema: config.staging_schema.clone(),
            target_table: config.target_table.clone(),
            business_key: crate::table::normalize_column_name(&config.business_key),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn target_table(&self) -> &str {
        &self.target_table
    }

    fn qualified_staging(&self, name: &str) -> String {
        format!(
            "{}.{}",
            quote_ident(&self.staging_schema),
            quote_ident(name)
        )
    }

    /// Lists the tables currently present in the staging schema.
    pub fn staging_tables(&self) -> Result<Vec<String>, DatabaseError> {
        self.db.with_conn(|conn| {
            if !schema_attached(conn, &self.staging_schema)? {
                return Ok(Vec::new());
            }
            let sql = format!(
                "SELECT name FROM {}.sqlite_master WHERE type = 'table' ORDER BY name",
                quote_ident(&self.staging_schema)
            );
            let mut stmt = conn.prepare(&sql)?;
            let names = stmt
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
    }
}

impl StagingStore for SqliteStagingStore {
    fn ensure_staging_schema(&self) -> Result<(), DatabaseError> {
        self.db.with_conn(|conn| {
            if schema_attached(conn, &self.staging_schema)? {
                debug!("Staging schema already exists: {}", self.staging_schema);
                return Ok(());
            }

            conn.execute_batch(&format!(
                "ATTACH DATABASE ':memory:' AS {}",
                quote_ident(&self.staging_schema)
            ))?;
            info!("Created staging schema: {}", self.staging_schema);
            Ok(())
        })
    }

    fn create_staging_table(&self, name: &str, table: &Table) -> Result<usize, DatabaseError> {
        let qualified = self.qualified_staging(name);

        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(&format!(
                "DROP TABLE IF EXISTS {q}; CREATE TABLE {q} ({defs});",
                q = qualified,
                defs = column_defs(table.columns())
            ))?;

            {
                let placeholders = (1..=table.columns().len())
                    .map(|i| format!("?{}", i))
                    .collect::<Vec<_>>()
                    .join(", ");
                let mut stmt =
                    tx.prepare(&format!("INSERT INTO {} VALUES ({})", qualified, placeholders))?;
                for row in table.rows() {
                    stmt.execute(params_from_iter(row.iter()))?;
                }
            }

            tx.commit()?;
            debug!("Staged {} rows into {}", table.len(), qualified);
            Ok(table.len())
        })
    }

    fn upsert_into_target(&self, staging_table: &str) -> Result<usize, DatabaseError> {
        self.db.with_conn(|conn| {
            if !table_exists(conn, &self.staging_schema, staging_table)? {
                return Err(DatabaseError::MissingTable(format!(
                    "{}.{}",
                    self.staging_schema, staging_table
                )));
            }

            let columns = table_columns(conn, &self.staging_schema, staging_table)?;
            if !columns.iter().any(|c| *c == self.business_key) {
                return Err(DatabaseError::MissingKeyColumn {
                    table: staging_table.to_string(),
                    column: self.business_key.clone(),
                });
            }

            let tx = conn.unchecked_transaction()?;

            if !table_exists(&tx, MAIN_SCHEMA, &self.target_table)? {
                tx.execute_batch(&format!(
                    "CREATE TABLE {} ({}, UNIQUE ({}))",
                    quote_ident(&self.target_table),
                    column_defs(&columns),
                    quote_ident(&self.business_key)
                ))?;
                info!("Created target table: {}", self.target_table);
            } else {
                let existing = table_columns(&tx, MAIN_SCHEMA, &self.target_table)?;
                for column in columns.iter().filter(|c| !existing.contains(c)) {
                    tx.execute_batch(&format!(
                        "ALTER TABLE {} ADD COLUMN {} TEXT",
                        quote_ident(&self.target_table),
                        quote_ident(column)
                    ))?;
                    info!(
                        "Added column '{}' to target table {}",
                        column, self.target_table
                    );
                }
            }

            let sql = build_upsert_sql(
                &self.target_table,
                &self.staging_schema,
                staging_table,
                &columns,
                &self.business_key,
            );
            let affected = tx.execute(&sql, [])?;
            tx.commit()?;

            info!("Upserted {} records to {}", affected, self.target_table);
            Ok(affected)
        })
    }

    fn drop_staging_table(&self, name: &str) -> Result<(), DatabaseError> {
        let qualified = self.qualified_staging(name);
        self.db.with_conn(|conn| {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", qualified))?;
            debug!("Cleaned up staging table: {}", qualified);
            Ok(())
        })
    }

    fn target_stats(&self) -> Result<TargetStats, DatabaseError> {
        self.db.with_conn(|conn| {
            if !table_exists(conn, MAIN_SCHEMA, &self.target_table)? {
                return Ok(TargetStats::default());
            }

            let target = quote_ident(&self.target_table);
            let total: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", target), [], |r| {
                    r.get(0)
                })?;

            let columns = table_columns(conn, MAIN_SCHEMA, &self.target_table)?;
            if !columns.iter().any(|c| c == PROCESSED_AT_COLUMN) {
                return Ok(TargetStats {
                    total_records: total as u64,
                    ..TargetStats::default()
                });
            }

            let today = Utc::now().format("%Y-%m-%d").to_string();
            let processed_at = quote_ident(PROCESSED_AT_COLUMN);
            let (today_count, latest): (Option<i64>, Option<String>) = conn.query_row(
                &format!(
                    "SELECT SUM(CASE WHEN substr({col}, 1, 10) = ?1 THEN 1 ELSE 0 END), MAX({col}) \
                     FROM {target}",
                    col = processed_at,
                    target = target
                ),
                params![today],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;

            Ok(TargetStats {
                total_records: total as u64,
                today_records: today_count.unwrap_or(0) as u64,
                latest_processing: latest,
            })
        })
    }
}
