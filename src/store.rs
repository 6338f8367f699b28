//! Durable state: every committed change is written to SQLite before it is
//! applied in memory.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, Transaction};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{EscrowError, StoreError};
use crate::escrow::{AccountBalance, EscrowVault, InMemoryBank, UserPosition};
use crate::registry::{
    ActivityEntry, ActivityKind, AssetId, BookChange, EventBook, EventRegistry, EventTerms,
    Identity, Outcome, RegistryPolicy, Resolution,
};

/// Write-ahead sink for committed changes.
///
/// Each call is one atomic write. Callers only apply a change in memory after
/// the matching call returned `Ok`.
pub trait Journal: Send + Sync + fmt::Debug {
    /// Record a newly created event with its first activity entry.
    fn insert_event(&self, book: &EventBook) -> Result<(), StoreError>;

    /// Record a staged book change and the account balances it moved.
    fn apply(&self, change: &BookChange, accounts: &[AccountBalance]) -> Result<(), StoreError>;

    /// Overwrite collateral account balances.
    fn put_accounts(&self, accounts: &[AccountBalance]) -> Result<(), StoreError>;
}

/// Journal for purely in-memory operation. Accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoJournal;

impl Journal for NoJournal {
    fn insert_event(&self, _book: &EventBook) -> Result<(), StoreError> {
        Ok(())
    }

    fn apply(&self, _change: &BookChange, _accounts: &[AccountBalance]) -> Result<(), StoreError> {
        Ok(())
    }

    fn put_accounts(&self, _accounts: &[AccountBalance]) -> Result<(), StoreError> {
        Ok(())
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    event_id TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    settlement_time INTEGER NOT NULL,
    reporter TEXT NOT NULL,
    collateral_asset TEXT NOT NULL,
    creator TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    outcome TEXT,
    resolved_at INTEGER,
    vault_balance INTEGER NOT NULL,
    total_deposited INTEGER NOT NULL,
    total_withdrawn INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS positions (
    event_id TEXT NOT NULL,
    holder TEXT NOT NULL,
    yes_amount INTEGER NOT NULL,
    no_amount INTEGER NOT NULL,
    PRIMARY KEY (event_id, holder)
);
CREATE TABLE IF NOT EXISTS activity (
    event_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    at INTEGER NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (event_id, seq)
);
CREATE TABLE IF NOT EXISTS accounts (
    holder TEXT NOT NULL,
    asset TEXT NOT NULL,
    balance INTEGER NOT NULL,
    PRIMARY KEY (holder, asset)
);
";

/// Everything read back from the store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoredState {
    pub events: Vec<EventBook>,
    pub accounts: Vec<AccountBalance>,
}

impl StoredState {
    /// Rebuild registry and bank, re-verifying every event. The registry keeps
    /// writing through `journal`.
    pub fn restore(
        self,
        clock: Arc<dyn Clock>,
        policy: RegistryPolicy,
        journal: Arc<dyn Journal>,
    ) -> Result<(EventRegistry, InMemoryBank), EscrowError> {
        let registry = EventRegistry::restore(self.events, clock, policy)?.with_journal(journal);
        let bank = InMemoryBank::from_accounts(self.accounts);
        Ok((registry, bank))
    }
}

/// SQLite-backed journal. One row per event, position and account; activity
/// is append-only.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    location: String,
}

impl fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStore")
            .field("location", &self.location)
            .finish()
    }
}

impl SqliteStore {
    /// Open or create the database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(%mode, "Journal mode set");
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::init(conn, path.display().to_string())
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, ":memory:".to_string())
    }

    fn init(conn: Connection, location: String) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        info!(%location, "State store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            location,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Read the full state.
    pub fn load(&self) -> Result<StoredState, StoreError> {
        let conn = self.conn()?;

        let rows = {
            let mut stmt = conn.prepare(
                "SELECT event_id, description, settlement_time, reporter, collateral_asset,
                        creator, created_at, outcome, resolved_at, vault_balance,
                        total_deposited, total_withdrawn
                 FROM events ORDER BY event_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(EventRow {
                    event_id: row.get(0)?,
                    description: row.get(1)?,
                    settlement_time: row.get(2)?,
                    reporter: row.get(3)?,
                    collateral_asset: row.get(4)?,
                    creator: row.get(5)?,
                    created_at: row.get(6)?,
                    outcome: row.get(7)?,
                    resolved_at: row.get(8)?,
                    vault_balance: row.get(9)?,
                    total_deposited: row.get(10)?,
                    total_withdrawn: row.get(11)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            events.push(read_book(&conn, row)?);
        }

        let accounts = {
            let mut stmt =
                conn.prepare("SELECT holder, asset, balance FROM accounts ORDER BY holder, asset")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            let mut accounts = Vec::new();
            for row in rows {
                let (holder, asset, balance) = row?;
                accounts.push(AccountBalance {
                    holder: Identity::new(holder).map_err(corrupt)?,
                    asset: AssetId::new(asset).map_err(corrupt)?,
                    balance: from_sql(balance, "balance")?,
                });
            }
            accounts
        };

        info!(
            location = %self.location,
            events = events.len(),
            accounts = accounts.len(),
            "State loaded"
        );
        Ok(StoredState { events, accounts })
    }
}

impl Journal for SqliteStore {
    fn insert_event(&self, book: &EventBook) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let terms = book.terms();
        let vault = book.vault();
        let resolution = book.resolution();
        tx.execute(
            "INSERT INTO events (event_id, description, settlement_time, reporter,
                                 collateral_asset, creator, created_at, outcome, resolved_at,
                                 vault_balance, total_deposited, total_withdrawn)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                terms.event_id,
                terms.description,
                terms.settlement_time,
                terms.reporter.as_str(),
                terms.collateral_asset.as_str(),
                terms.creator.as_str(),
                terms.created_at,
                resolution.map(|r| r.outcome.to_string()),
                resolution.map(|r| r.resolved_at),
                to_sql(vault.balance(), "vault_balance")?,
                to_sql(vault.total_deposited(), "total_deposited")?,
                to_sql(vault.total_withdrawn(), "total_withdrawn")?,
            ],
        )?;
        for position in book.ledger().positions() {
            upsert_position(&tx, position)?;
        }
        for entry in book.activity() {
            insert_activity(&tx, book.event_id(), entry)?;
        }

        tx.commit()?;
        debug!(event_id = book.event_id(), "Event persisted");
        Ok(())
    }

    fn apply(&self, change: &BookChange, accounts: &[AccountBalance]) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        if let Some(vault) = &change.vault {
            let updated = tx.execute(
                "UPDATE events SET vault_balance = ?2, total_deposited = ?3, total_withdrawn = ?4
                 WHERE event_id = ?1",
                params![
                    change.event_id,
                    to_sql(vault.balance(), "vault_balance")?,
                    to_sql(vault.total_deposited(), "total_deposited")?,
                    to_sql(vault.total_withdrawn(), "total_withdrawn")?,
                ],
            )?;
            if updated != 1 {
                return Err(StoreError::Corrupt(format!("no event row for {}", change.event_id)));
            }
        }

        if let Some(resolution) = &change.resolution {
            let updated = tx.execute(
                "UPDATE events SET outcome = ?2, resolved_at = ?3
                 WHERE event_id = ?1 AND outcome IS NULL",
                params![
                    change.event_id,
                    resolution.outcome.to_string(),
                    resolution.resolved_at
                ],
            )?;
            if updated != 1 {
                return Err(StoreError::Corrupt(format!(
                    "event {} missing or already resolved",
                    change.event_id
                )));
            }
        }

        if let Some(position) = &change.position {
            upsert_position(&tx, position)?;
        }
        insert_activity(&tx, &change.event_id, &change.entry)?;
        upsert_accounts(&tx, accounts)?;

        tx.commit()?;
        debug!(event_id = %change.event_id, seq = change.entry.seq, "Change persisted");
        Ok(())
    }

    fn put_accounts(&self, accounts: &[AccountBalance]) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        upsert_accounts(&tx, accounts)?;
        tx.commit()?;
        Ok(())
    }
}

struct EventRow {
    event_id: String,
    description: String,
    settlement_time: i64,
    reporter: String,
    collateral_asset: String,
    creator: String,
    created_at: i64,
    outcome: Option<String>,
    resolved_at: Option<i64>,
    vault_balance: i64,
    total_deposited: i64,
    total_withdrawn: i64,
}

fn read_book(conn: &Connection, row: EventRow) -> Result<EventBook, StoreError> {
    let terms = EventTerms {
        event_id: row.event_id,
        description: row.description,
        settlement_time: row.settlement_time,
        reporter: Identity::new(row.reporter).map_err(corrupt)?,
        collateral_asset: AssetId::new(row.collateral_asset).map_err(corrupt)?,
        creator: Identity::new(row.creator).map_err(corrupt)?,
        created_at: row.created_at,
    };

    let resolution = match (row.outcome, row.resolved_at) {
        (Some(outcome), Some(resolved_at)) => Some(Resolution {
            outcome: Outcome::from_str(&outcome)
                .map_err(|_| StoreError::Corrupt(format!("unknown outcome {:?}", outcome)))?,
            resolved_at,
        }),
        (None, None) => None,
        _ => {
            return Err(StoreError::Corrupt(format!(
                "event {} has a partial resolution",
                terms.event_id
            )))
        }
    };

    let vault = EscrowVault::from_parts(
        terms.event_id.clone(),
        terms.collateral_asset.clone(),
        from_sql(row.vault_balance, "vault_balance")?,
        from_sql(row.total_deposited, "total_deposited")?,
        from_sql(row.total_withdrawn, "total_withdrawn")?,
    );

    let mut positions = Vec::new();
    let mut stmt = conn.prepare_cached(
        "SELECT holder, yes_amount, no_amount FROM positions WHERE event_id = ?1 ORDER BY holder",
    )?;
    let rows = stmt.query_map(params![terms.event_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;
    for row in rows {
        let (holder, yes, no) = row?;
        positions.push(UserPosition {
            event_id: terms.event_id.clone(),
            holder: Identity::new(holder).map_err(corrupt)?,
            yes_amount: from_sql(yes, "yes_amount")?,
            no_amount: from_sql(no, "no_amount")?,
        });
    }

    let mut activity = Vec::new();
    let mut stmt = conn
        .prepare_cached("SELECT seq, at, body FROM activity WHERE event_id = ?1 ORDER BY seq")?;
    let rows = stmt.query_map(params![terms.event_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;
    for row in rows {
        let (seq, at, body) = row?;
        let kind: ActivityKind = serde_json::from_str(&body)?;
        activity.push(ActivityEntry {
            seq: from_sql(seq, "seq")?,
            at,
            kind,
        });
    }

    EventBook::from_parts(terms, resolution, vault, positions, activity).map_err(corrupt)
}

fn upsert_position(tx: &Transaction<'_>, position: &UserPosition) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO positions (event_id, holder, yes_amount, no_amount)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(event_id, holder) DO UPDATE SET
             yes_amount = excluded.yes_amount,
             no_amount = excluded.no_amount",
        params![
            position.event_id,
            position.holder.as_str(),
            to_sql(position.yes_amount, "yes_amount")?,
            to_sql(position.no_amount, "no_amount")?,
        ],
    )?;
    Ok(())
}

fn insert_activity(
    tx: &Transaction<'_>,
    event_id: &str,
    entry: &ActivityEntry,
) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO activity (event_id, seq, at, body) VALUES (?1, ?2, ?3, ?4)",
        params![
            event_id,
            to_sql(entry.seq, "seq")?,
            entry.at,
            serde_json::to_string(&entry.kind)?,
        ],
    )?;
    Ok(())
}

fn upsert_accounts(tx: &Transaction<'_>, accounts: &[AccountBalance]) -> Result<(), StoreError> {
    for account in accounts {
        tx.execute(
            "INSERT INTO accounts (holder, asset, balance) VALUES (?1, ?2, ?3)
             ON CONFLICT(holder, asset) DO UPDATE SET balance = excluded.balance",
            params![
                account.holder.as_str(),
                account.asset.as_str(),
                to_sql(account.balance, "balance")?,
            ],
        )?;
    }
    Ok(())
}

fn to_sql(value: u64, field: &'static str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::OutOfRange(field))
}

fn from_sql(value: i64, field: &'static str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {}: {}", field, value)))
}

fn corrupt(e: EscrowError) -> StoreError {
    StoreError::Corrupt(e.to_string())
}
