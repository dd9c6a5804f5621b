//! Schema migrations for the task queue database.
//!
//! Applied versions are recorded in `_migrations`. Each pending step runs
//! in its own transaction together with its version record, so a failed
//! step leaves the schema at the previous version.

use libsql::Connection;

use crate::error::DatabaseError;

/// One schema step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Schema steps, oldest first. Versions must increase.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "task_queue",
        sql: r#"
            CREATE TABLE IF NOT EXISTS todolist (
                id TEXT PRIMARY KEY,
                proc_inst_id TEXT,
                root_proc_inst_id TEXT,
                activity_name TEXT,
                description TEXT,
                user_id TEXT,
                tool TEXT,
                tenant_id TEXT,
                draft_status TEXT NOT NULL DEFAULT 'PENDING',
                consumer TEXT,
                output TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_todolist_draft_status ON todolist(draft_status);
            CREATE INDEX IF NOT EXISTS idx_todolist_proc_inst ON todolist(proc_inst_id);

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT,
                username TEXT,
                role TEXT,
                goal TEXT,
                persona TEXT,
                tools TEXT,
                profile TEXT,
                is_agent INTEGER NOT NULL DEFAULT 0,
                model TEXT,
                tenant_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_users_email ON users(email);

            CREATE TABLE IF NOT EXISTS form_def (
                id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                fields_json TEXT,
                html TEXT,
                PRIMARY KEY (id, tenant_id)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "event_log",
        sql: r#"
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                todo_id TEXT,
                proc_inst_id TEXT,
                event_type TEXT NOT NULL,
                crew_type TEXT NOT NULL,
                data TEXT NOT NULL DEFAULT '{}',
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_todo ON events(todo_id);
            CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
        "#,
    },
];

/// Bring the schema up to the latest version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("_migrations table: {e}")))?;

    let applied = applied_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        tracing::debug!(version = applied, "Schema up to date");
        return Ok(());
    }

    for step in pending {
        tracing::info!(version = step.version, name = step.name, "Applying schema step");
        let batch = format!(
            "BEGIN;\n{}\nINSERT INTO _migrations (version, name) VALUES ({}, '{}');\nCOMMIT;",
            step.sql, step.version, step.name
        );
        if let Err(e) = conn.execute_batch(&batch).await {
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(DatabaseError::Migration(format!(
                "step {} '{}': {e}",
                step.version, step.name
            )));
        }
    }

    tracing::info!(version = applied_version(conn).await?, "Schema migrated");
    Ok(())
}

/// Highest recorded version; 0 for a fresh database.
async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT MAX(version) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("read applied version: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0)),
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Migration(format!("read applied version row: {e}"))),
    }
}
