//! Embedded schema migrations.
//!
//! Migration scripts ship inside the binary and are applied on
//! [`Bus::start`](crate::Bus::start) under an advisory lock, so any
//! number of services can boot against the same schema concurrently. Applied
//! scripts are recorded with a content hash; a hash mismatch on a later boot
//! means the embedded scripts diverged from what the database ran, which is
//! refused outright.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use sqlx::PgPool;

use crate::error::{BusError, BusResult};
use crate::sql::{is_valid_schema, render_schema, Plans};

/// Scripts in filename order; ids must be unique and ascending.
const MIGRATIONS: &[(&str, &str)] = &[
    ("0_create_tbus.sql", include_str!("../migrations/0_create_tbus.sql")),
    ("1_indexes.sql", include_str!("../migrations/1_indexes.sql")),
];

/// Serializes concurrent migrators on one (database, schema) pair. Held for
/// the duration of the migration transaction.
const ADVISORY_LOCK: &str =
    "SELECT pg_advisory_xact_lock(('x' || md5(current_database() || '.tbus.' || $1))::bit(64)::bigint)";

#[derive(Debug, Clone)]
struct Migration {
    id: i32,
    name: String,
    /// Script body with the schema already interpolated.
    sql: String,
    hash: String,
}

#[derive(Debug, sqlx::FromRow)]
struct AppliedMigration {
    id: i32,
    name: String,
    hash: String,
}

fn file_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(-?\d+)[-_]?(.*)\.sql$").expect("valid pattern"))
}

/// Split a migration file name into its numeric id and descriptive name.
fn parse_file_name(file_name: &str) -> BusResult<(i32, String)> {
    let captures =
        file_name_pattern()
            .captures(file_name)
            .ok_or_else(|| BusError::InvalidMigrationFile {
                file_name: file_name.to_string(),
            })?;
    let id = captures[1]
        .parse::<i32>()
        .map_err(|_| BusError::InvalidMigrationFile {
            file_name: file_name.to_string(),
        })?;
    Ok((id, captures[2].to_string()))
}

fn hash_migration(file_name: &str, sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_name.as_bytes());
    hasher.update(sql.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Load a script set for one schema, interpolated and hashed, ordered by id.
fn load_migrations(files: &[(&str, &str)], schema: &str) -> BusResult<Vec<Migration>> {
    let mut migrations = Vec::with_capacity(files.len());
    for (file_name, body) in files {
        let (id, name) = parse_file_name(file_name)?;
        let sql = render_schema(body, schema);
        let hash = hash_migration(file_name, &sql);
        migrations.push(Migration {
            id,
            name,
            sql,
            hash,
        });
    }
    migrations.sort_by_key(|m| m.id);
    Ok(migrations)
}

/// Bring a schema up to date with the embedded scripts, without constructing
/// a bus. [`Bus::start`](crate::Bus::start) runs this automatically; call it
/// directly to migrate ahead of a deploy.
pub async fn migrate(pool: &PgPool, schema: &str) -> BusResult<()> {
    if !is_valid_schema(schema) {
        return Err(BusError::InvalidConfiguration {
            reason: format!("invalid schema name '{schema}'"),
        });
    }
    let plans = Plans::new(schema);
    apply_migrations(pool, &plans, schema, MIGRATIONS).await
}

/// Apply one script set. Idempotent and safe to call from many processes at
/// once.
pub(crate) async fn apply_migrations(
    pool: &PgPool,
    plans: &Plans,
    schema: &str,
    files: &[(&str, &str)],
) -> BusResult<()> {
    let migrations = load_migrations(files, schema)?;

    let mut tx = pool.begin().await?;
    sqlx::query(ADVISORY_LOCK)
        .bind(schema)
        .execute(&mut *tx)
        .await?;

    let ledger_exists: bool = sqlx::query_scalar(&plans.table_exists())
        .bind("tbus_migrations")
        .fetch_one(&mut *tx)
        .await?;

    let applied: Vec<AppliedMigration> = if ledger_exists {
        sqlx::query_as(&plans.get_migrations())
            .fetch_all(&mut *tx)
            .await?
    } else {
        Vec::new()
    };

    let mismatched: Vec<String> = applied
        .iter()
        .filter_map(|row| {
            migrations
                .iter()
                .find(|m| m.id == row.id && m.hash != row.hash)
                .map(|_| row.name.clone())
        })
        .collect();
    if !mismatched.is_empty() {
        return Err(BusError::MigrationHashMismatch { files: mismatched });
    }

    let mut pending = 0usize;
    for migration in &migrations {
        if applied.iter().any(|row| row.id == migration.id) {
            continue;
        }
        sqlx::raw_sql(&migration.sql).execute(&mut *tx).await?;
        sqlx::query(&plans.insert_migration())
            .bind(migration.id)
            .bind(&migration.name)
            .bind(&migration.hash)
            .execute(&mut *tx)
            .await?;
        pending += 1;
    }

    tx.commit().await?;

    if pending > 0 {
        tracing::info!(schema, applied = pending, "applied migrations");
    }
    Ok(())
}
