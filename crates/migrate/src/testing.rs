//! In-memory database double for engine tests
//!
//! Understands the ledger statements, the advisory lock, and scripts made of
//! `CREATE TABLE <name>` / `DROP TABLE <name>` statements separated by `;`.
//! A statement reading `HANG` never completes and `SLEEP` pauses briefly;
//! anything else unrecognised fails like a syntax error. Transactions work on
//! a staged copy of the state that is written back only on commit.
//!
//! Advisory locks belong to the connection that took them and block other
//! connections until released or until the holder closes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use crate::backends::{
    DatabaseConnection, DatabaseExecutor, DatabasePool, DatabaseRow, DatabaseTransaction,
    DatabaseValue,
};
use crate::error::{MigrateError, MigrateResult, UNIQUE_VIOLATION};

const UNDEFINED_TABLE: &str = "42P01";
const DUPLICATE_TABLE: &str = "42P07";
const SYNTAX_ERROR: &str = "42601";

const SLEEP: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Default)]
struct State {
    ledger_exists: bool,
    ledger: BTreeMap<String, DateTime<Utc>>,
    tables: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct Shared {
    committed: State,
    log: Vec<String>,
    /// Lock key to (holding session, hold count)
    locks: HashMap<String, (u64, u32)>,
    sessions: u64,
    fail_ledger_insert: Option<String>,
    fail_acquire: bool,
    hang_on: Option<String>,
}

/// Shared handle to one in-memory database; clones see the same data
#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryDatabase {
    shared: Arc<Mutex<Shared>>,
    released: Arc<Notify>,
}

impl MemoryDatabase {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap()
    }

    /// Make the ledger insert for `id` fail after its script has run
    pub(crate) fn fail_ledger_insert(&self, id: &str) {
        self.lock().fail_ledger_insert = Some(id.to_string());
    }

    /// Make every `acquire` fail as if the server were unreachable
    pub(crate) fn fail_acquire(&self) {
        self.lock().fail_acquire = true;
    }

    /// Make the first step starting with `prefix` log itself and never
    /// complete. Steps are statements plus `COMMIT`, `ROLLBACK` and
    /// `CLOSE POOL`.
    pub(crate) fn hang_on(&self, prefix: &str) {
        self.lock().hang_on = Some(prefix.to_string());
    }

    /// Create the ledger with the given rows, bypassing the engine
    pub(crate) fn seed_ledger(&self, rows: &[(&str, DateTime<Utc>)]) {
        let mut shared = self.lock();
        shared.committed.ledger_exists = true;
        for (id, applied_at) in rows {
            shared.committed.ledger.insert(id.to_string(), *applied_at);
        }
    }

    pub(crate) fn ledger_exists(&self) -> bool {
        self.lock().committed.ledger_exists
    }

    pub(crate) fn ledger_ids(&self) -> Vec<String> {
        self.lock().committed.ledger.keys().cloned().collect()
    }

    pub(crate) fn tables(&self) -> Vec<String> {
        self.lock().committed.tables.iter().cloned().collect()
    }

    /// Whether any session holds an advisory lock
    pub(crate) fn lock_held(&self) -> bool {
        !self.lock().locks.is_empty()
    }

    /// Every statement seen, plus `BEGIN`, `COMMIT`, `ROLLBACK` and `CLOSE`
    pub(crate) fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    fn record(&self, entry: &str) {
        self.lock().log.push(entry.to_string());
    }

    async fn hang_if_requested(&self, step: &str) {
        let hang = {
            let mut shared = self.lock();
            let hang = shared
                .hang_on
                .as_deref()
                .map_or(false, |prefix| step.starts_with(prefix));
            if hang {
                shared.hang_on = None;
                shared.log.push(step.to_string());
            }
            hang
        };
        if hang {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl DatabasePool for MemoryDatabase {
    async fn acquire(&self) -> MigrateResult<Box<dyn DatabaseConnection>> {
        let session = {
            let mut shared = self.lock();
            if shared.fail_acquire {
                return Err(MigrateError::Connection("connection refused".to_string()));
            }
            shared.sessions += 1;
            shared.sessions
        };
        Ok(Box::new(MemoryConnection {
            db: self.clone(),
            session,
        }))
    }

    async fn health_check(&self) -> MigrateResult<Duration> {
        Ok(Duration::ZERO)
    }

    async fn close(&self) {
        self.hang_if_requested("CLOSE POOL").await;
        self.record("CLOSE POOL");
    }
}

/// Autocommit session on a [`MemoryDatabase`]
pub(crate) struct MemoryConnection {
    db: MemoryDatabase,
    session: u64,
}

impl MemoryConnection {
    async fn statement(&self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<Outcome> {
        self.db.hang_if_requested(sql).await;

        if sql.starts_with("SELECT pg_advisory_lock") {
            self.db.record(sql);
            self.advisory_lock(lock_key(params)?).await;
            Ok(Outcome::affected(1))
        } else if sql.starts_with("SELECT pg_advisory_unlock") {
            self.db.record(sql);
            let released = self.advisory_unlock(&lock_key(params)?);
            Ok(Outcome::rows(vec![DatabaseRow::new(vec![(
                "released".to_string(),
                DatabaseValue::Bool(released),
            )])]))
        } else {
            run_statement(&self.db, Target::Committed, sql, params)
        }
    }

    /// Wait until no other session holds `key`, then take it
    async fn advisory_lock(&self, key: String) {
        loop {
            let released = self.db.released.notified();
            {
                let mut shared = self.db.lock();
                let holder = shared.locks.entry(key.clone()).or_insert((self.session, 0));
                if holder.0 == self.session {
                    holder.1 += 1;
                    return;
                }
            }
            released.await;
        }
    }

    fn advisory_unlock(&self, key: &str) -> bool {
        let released = match self.db.lock().locks.entry(key.to_string()) {
            Entry::Occupied(mut held) if held.get().0 == self.session => {
                held.get_mut().1 -= 1;
                if held.get().1 == 0 {
                    held.remove();
                }
                true
            }
            _ => false,
        };
        self.db.released.notify_waiters();
        released
    }
}

/// Which state a statement runs against
enum Target<'a> {
    Committed,
    Staged(&'a mut State),
}

struct Outcome {
    rows_affected: u64,
    rows: Vec<DatabaseRow>,
}

impl Outcome {
    fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            rows: Vec::new(),
        }
    }

    fn rows(rows: Vec<DatabaseRow>) -> Self {
        Self {
            rows_affected: rows.len() as u64,
            rows,
        }
    }
}

fn db_error(code: &str, message: impl Into<String>) -> MigrateError {
    MigrateError::Database {
        message: message.into(),
        code: Some(code.to_string()),
    }
}

fn string_param(params: &[DatabaseValue], index: usize) -> MigrateResult<String> {
    params
        .get(index)
        .and_then(DatabaseValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| MigrateError::database(format!("missing text parameter ${}", index + 1)))
}

/// `schema.table` the lock statement hashes; an unqualified name resolves to `public`
fn lock_key(params: &[DatabaseValue]) -> MigrateResult<String> {
    let schema = params.first().and_then(DatabaseValue::as_str).unwrap_or("public");
    Ok(format!("{}.{}", schema, string_param(params, 1)?))
}

fn id_row(id: &str) -> DatabaseRow {
    DatabaseRow::new(vec![("id".to_string(), DatabaseValue::from(id))])
}

fn require_ledger(state: &State) -> MigrateResult<()> {
    if state.ledger_exists {
        Ok(())
    } else {
        Err(db_error(UNDEFINED_TABLE, "relation does not exist"))
    }
}

fn run_statement(
    db: &MemoryDatabase,
    target: Target<'_>,
    sql: &str,
    params: &[DatabaseValue],
) -> MigrateResult<Outcome> {
    let mut shared = db.lock();
    shared.log.push(sql.to_string());

    let fail_insert = shared.fail_ledger_insert.clone();
    let state = match target {
        Target::Committed => &mut shared.committed,
        Target::Staged(state) => state,
    };

    if sql.starts_with("CREATE TABLE IF NOT EXISTS") {
        state.ledger_exists = true;
        Ok(Outcome::affected(0))
    } else if sql.starts_with("SELECT 1 FROM information_schema.tables") {
        let rows = if state.ledger_exists {
            vec![DatabaseRow::new(vec![("exists".to_string(), DatabaseValue::Int64(1))])]
        } else {
            Vec::new()
        };
        Ok(Outcome::rows(rows))
    } else if sql.starts_with("INSERT INTO") {
        require_ledger(state)?;
        let id = string_param(params, 0)?;
        let applied_at = params
            .get(1)
            .and_then(DatabaseValue::as_datetime)
            .ok_or_else(|| MigrateError::database("missing timestamp parameter $2"))?;
        if fail_insert.as_deref() == Some(id.as_str()) {
            return Err(MigrateError::database("injected ledger insert failure"));
        }
        if state.ledger.contains_key(&id) {
            return Err(db_error(
                UNIQUE_VIOLATION,
                "duplicate key value violates unique constraint",
            ));
        }
        state.ledger.insert(id, applied_at);
        Ok(Outcome::affected(1))
    } else if sql.starts_with("DELETE FROM") {
        require_ledger(state)?;
        let id = string_param(params, 0)?;
        Ok(Outcome::affected(u64::from(state.ledger.remove(&id).is_some())))
    } else if sql.starts_with("SELECT id FROM") && sql.ends_with("DESC, id DESC LIMIT 1") {
        require_ledger(state)?;
        let latest = state
            .ledger
            .iter()
            .max_by(|(a_id, a_at), (b_id, b_at)| a_at.cmp(b_at).then_with(|| a_id.cmp(b_id)))
            .map(|(id, _)| id_row(id));
        Ok(Outcome::rows(latest.into_iter().collect()))
    } else if sql.starts_with("SELECT id FROM") {
        require_ledger(state)?;
        let id = string_param(params, 0)?;
        let rows = state.ledger.get_key_value(&id).map(|(id, _)| id_row(id));
        Ok(Outcome::rows(rows.into_iter().collect()))
    } else if sql.starts_with("SELECT id, created_at FROM") {
        require_ledger(state)?;
        let mut entries: Vec<_> = state.ledger.iter().collect();
        entries.sort_by(|(a_id, a_at), (b_id, b_at)| {
            a_at.cmp(b_at).then_with(|| a_id.cmp(b_id))
        });
        let rows = entries
            .into_iter()
            .map(|(id, applied_at)| {
                DatabaseRow::new(vec![
                    ("id".to_string(), DatabaseValue::from(id.as_str())),
                    ("created_at".to_string(), DatabaseValue::from(*applied_at)),
                ])
            })
            .collect();
        Ok(Outcome::rows(rows))
    } else {
        Err(db_error(SYNTAX_ERROR, format!("unrecognised statement: {}", sql)))
    }
}

/// Where a script stopped after its last statement
enum Pause {
    None,
    Sleep,
    Forever,
}

impl Pause {
    async fn wait(self) {
        match self {
            Pause::None => {}
            Pause::Sleep => tokio::time::sleep(SLEEP).await,
            Pause::Forever => std::future::pending::<()>().await,
        }
    }
}

fn run_script(db: &MemoryDatabase, target: Target<'_>, sql: &str) -> MigrateResult<Pause> {
    let mut shared = db.lock();
    shared.log.push(sql.to_string());
    let state = match target {
        Target::Committed => &mut shared.committed,
        Target::Staged(state) => state,
    };

    let mut pause = Pause::None;
    for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let words: Vec<&str> = statement.split_whitespace().collect();
        match words.as_slice() {
            ["CREATE", "TABLE", name, ..] => {
                if !state.tables.insert(name.to_string()) {
                    let message = format!("relation \"{}\" already exists", name);
                    return Err(db_error(DUPLICATE_TABLE, message));
                }
            }
            ["DROP", "TABLE", name, ..] => {
                if !state.tables.remove(*name) {
                    let message = format!("table \"{}\" does not exist", name);
                    return Err(db_error(UNDEFINED_TABLE, message));
                }
            }
            ["HANG"] => return Ok(Pause::Forever),
            ["SLEEP"] => pause = Pause::Sleep,
            _ => {
                return Err(db_error(
                    SYNTAX_ERROR,
                    format!("syntax error at or near \"{}\"", words.first().unwrap_or(&"")),
                ))
            }
        }
    }
    Ok(pause)
}

#[async_trait]
impl DatabaseExecutor for MemoryConnection {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<u64> {
        self.statement(sql, params).await.map(|o| o.rows_affected)
    }

    async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrateResult<Option<DatabaseRow>> {
        self.statement(sql, params).await.map(|o| o.rows.into_iter().next())
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrateResult<Vec<DatabaseRow>> {
        self.statement(sql, params).await.map(|o| o.rows)
    }

    async fn execute_script(&mut self, sql: &str) -> MigrateResult<()> {
        self.db.hang_if_requested(sql).await;
        run_script(&self.db, Target::Committed, sql)?.wait().await;
        Ok(())
    }
}

#[async_trait]
impl DatabaseConnection for MemoryConnection {
    async fn begin<'c>(&'c mut self) -> MigrateResult<Box<dyn DatabaseTransaction + 'c>> {
        self.db.record("BEGIN");
        let staged = self.db.lock().committed.clone();
        Ok(Box::new(MemoryTransaction {
            db: self.db.clone(),
            staged,
        }))
    }

    async fn close(self: Box<Self>) -> MigrateResult<()> {
        {
            let mut shared = self.db.lock();
            shared.log.push("CLOSE".to_string());
            // Session-level advisory locks end with the session
            shared.locks.retain(|_, (session, _)| *session != self.session);
        }
        self.db.released.notify_waiters();
        Ok(())
    }
}

/// Transaction over a staged copy of the committed state
pub(crate) struct MemoryTransaction {
    db: MemoryDatabase,
    staged: State,
}

impl MemoryTransaction {
    async fn statement(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<Outcome> {
        self.db.hang_if_requested(sql).await;
        run_statement(&self.db, Target::Staged(&mut self.staged), sql, params)
    }
}

#[async_trait]
impl DatabaseExecutor for MemoryTransaction {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<u64> {
        self.statement(sql, params).await.map(|o| o.rows_affected)
    }

    async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrateResult<Option<DatabaseRow>> {
        self.statement(sql, params).await.map(|o| o.rows.into_iter().next())
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrateResult<Vec<DatabaseRow>> {
        self.statement(sql, params).await.map(|o| o.rows)
    }

    async fn execute_script(&mut self, sql: &str) -> MigrateResult<()> {
        self.db.hang_if_requested(sql).await;
        run_script(&self.db, Target::Staged(&mut self.staged), sql)?.wait().await;
        Ok(())
    }
}

#[async_trait]
impl DatabaseTransaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> MigrateResult<()> {
        self.db.hang_if_requested("COMMIT").await;
        let MemoryTransaction { db, staged } = *self;
        let mut shared = db.lock();
        shared.committed = staged;
        shared.log.push("COMMIT".to_string());
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> MigrateResult<()> {
        self.db.hang_if_requested("ROLLBACK").await;
        self.db.record("ROLLBACK");
        Ok(())
    }
}
