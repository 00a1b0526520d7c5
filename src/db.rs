use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Options for a `sqlite:` connection string. The parent directory of a
/// file database is created if missing.
fn options(connection_string: &str) -> Result<(SqliteConnectOptions, bool), sqlx::Error> {
    let in_memory = connection_string.contains(":memory:") || connection_string.contains("mode=memory");

    if !in_memory {
        let path = connection_string
            .trim_start_matches("sqlite:")
            .trim_start_matches("//")
            .split('?')
            .next()
            .unwrap_or_default();
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }

    let options = SqliteConnectOptions::from_str(connection_string)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    Ok((options, in_memory))
}

fn pool_options(in_memory: bool) -> SqlitePoolOptions {
    // Every connection to `:memory:` is its own database.
    let max = if in_memory { 1 } else { 5 };
    SqlitePoolOptions::new().max_connections(max)
}

/// Open a pool and establish the first connection now.
pub async fn connect(connection_string: &str) -> Result<SqlitePool, sqlx::Error> {
    let (options, in_memory) = options(connection_string)?;
    pool_options(in_memory).connect_with(options).await
}

/// Open a pool without connecting; the first query connects.
pub fn connect_lazy(connection_string: &str) -> Result<SqlitePool, sqlx::Error> {
    let (options, in_memory) = options(connection_string)?;
    Ok(pool_options(in_memory).connect_lazy_with(options))
}
