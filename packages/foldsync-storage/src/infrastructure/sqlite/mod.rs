//! SQLite adapter for [`RecordStore`]
//!
//! Four tables: `sequences`, `per_residue`, `per_pair` and `completion_flags`.
//! A commit replaces every row for one (accession, source flag) inside a
//! single transaction, so the two data stores never disagree because of us.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::domain::{
    AccessionKey, PairRow, ReconciledRecord, RecordStore, ResidueRow, SequenceRecord, SourceFlag,
    StorePresence,
};
use crate::{Result, StorageError};

const RESIDUE_COLUMNS: &str = "site, aa, plddt, plddt10, asa, asa10, rel_asa, rel_asa10, \
     dis, dis10, surf, surf10, sec, iso, phi, psi, omega, tau, chi1, chi2, chi3, chi4, chi5";

/// SQLite-backed record store
#[derive(Clone)]
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    /// Open (or create) a store at the given path
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(30))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing and dry runs)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sequences (
                accession TEXT NOT NULL,
                source_flag INTEGER NOT NULL,
                length INTEGER NOT NULL,
                sequence TEXT NOT NULL,
                observed_at TEXT NOT NULL,
                PRIMARY KEY (accession, source_flag)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS per_residue (
                accession TEXT NOT NULL,
                source_flag INTEGER NOT NULL,
                site INTEGER NOT NULL,
                aa TEXT NOT NULL,
                plddt REAL NOT NULL,
                plddt10 REAL NOT NULL,
                asa REAL NOT NULL,
                asa10 REAL NOT NULL,
                rel_asa REAL NOT NULL,
                rel_asa10 REAL NOT NULL,
                dis TEXT NOT NULL,
                dis10 TEXT NOT NULL,
                surf TEXT NOT NULL,
                surf10 TEXT NOT NULL,
                sec TEXT NOT NULL,
                iso TEXT,
                phi REAL,
                psi REAL,
                omega REAL,
                tau REAL,
                chi1 REAL,
                chi2 REAL,
                chi3 REAL,
                chi4 REAL,
                chi5 REAL,
                PRIMARY KEY (accession, source_flag, site)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS per_pair (
                accession TEXT NOT NULL,
                source_flag INTEGER NOT NULL,
                site1 INTEGER NOT NULL,
                site2 INTEGER NOT NULL,
                metric_type TEXT NOT NULL,
                value REAL NOT NULL,
                PRIMARY KEY (accession, source_flag, site1, site2, metric_type)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS completion_flags (
                accession TEXT NOT NULL,
                source_flag INTEGER NOT NULL,
                no_contacts INTEGER NOT NULL DEFAULT 0,
                completed_at TEXT NOT NULL,
                PRIMARY KEY (accession, source_flag)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_per_residue_angles
             ON per_residue(accession, source_flag, phi, psi, omega)",
            [],
        )?;

        Ok(())
    }
}

fn first_char(s: String) -> char {
    s.chars().next().unwrap_or(' ')
}

fn residue_from_row(row: &Row<'_>) -> rusqlite::Result<ResidueRow> {
    Ok(ResidueRow {
        site: row.get(0)?,
        aa: first_char(row.get(1)?),
        plddt: row.get(2)?,
        plddt10: row.get(3)?,
        asa: row.get(4)?,
        asa10: row.get(5)?,
        rel_asa: row.get(6)?,
        rel_asa10: row.get(7)?,
        dis: first_char(row.get(8)?),
        dis10: first_char(row.get(9)?),
        surf: first_char(row.get(10)?),
        surf10: first_char(row.get(11)?),
        sec: first_char(row.get(12)?),
        iso: row.get::<_, Option<String>>(13)?.map(first_char),
        phi: row.get(14)?,
        psi: row.get(15)?,
        omega: row.get(16)?,
        tau: row.get(17)?,
        chi: [row.get(18)?, row.get(19)?, row.get(20)?, row.get(21)?, row.get(22)?],
    })
}

fn sequence_from_row(row: &Row<'_>) -> rusqlite::Result<(String, i64, String, chrono::DateTime<Utc>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_sequence_record(
    (accession, code, sequence, observed_at): (String, i64, String, chrono::DateTime<Utc>),
) -> Result<SequenceRecord> {
    Ok(SequenceRecord {
        key: AccessionKey::new(accession, SourceFlag::from_code(code)?),
        length: sequence.chars().count(),
        sequence,
        observed_at,
    })
}

fn presence_locked(conn: &Connection, key: &AccessionKey) -> Result<StorePresence> {
    let flag = key.source_flag.as_code();
    let presence = conn.query_row(
        "SELECT
            (SELECT COUNT(*) FROM per_residue WHERE accession = ?1 AND source_flag = ?2),
            (SELECT COUNT(*) FROM per_residue WHERE accession = ?1 AND source_flag = ?2
                AND phi IS NOT NULL AND psi IS NOT NULL AND omega IS NOT NULL),
            (SELECT COUNT(*) FROM per_pair WHERE accession = ?1 AND source_flag = ?2),
            (SELECT COALESCE(MAX(no_contacts), 0) FROM completion_flags
                WHERE accession = ?1 AND source_flag = ?2)",
        params![&key.accession, flag],
        |row| {
            Ok(StorePresence {
                residue_rows: row.get::<_, i64>(0)? as usize,
                angular_rows: row.get::<_, i64>(1)? as usize,
                pair_rows: row.get::<_, i64>(2)? as usize,
                no_contacts: row.get::<_, i64>(3)? != 0,
            })
        },
    )?;
    Ok(presence)
}

fn delete_locked(conn: &Connection, key: &AccessionKey) -> Result<()> {
    let flag = key.source_flag.as_code();
    for table in ["per_residue", "per_pair", "completion_flags"] {
        conn.execute(
            &format!("DELETE FROM {} WHERE accession = ?1 AND source_flag = ?2", table),
            params![&key.accession, flag],
        )?;
    }
    Ok(())
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn register_sequence(&self, record: &SequenceRecord) -> Result<bool> {
        let conn = self.conn.lock();
        let existing: Option<String> = conn
            .query_row(
                "SELECT sequence FROM sequences WHERE accession = ?1 AND source_flag = ?2",
                params![&record.key.accession, record.key.source_flag.as_code()],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(seq) if seq == record.sequence => Ok(false),
            Some(seq) => Err(StorageError::invalid_record(format!(
                "{}: sequence is immutable once observed (stored length {}, new length {})",
                record.key,
                seq.chars().count(),
                record.length
            ))),
            None => {
                conn.execute(
                    "INSERT INTO sequences (accession, source_flag, length, sequence, observed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        &record.key.accession,
                        record.key.source_flag.as_code(),
                        record.length as i64,
                        &record.sequence,
                        record.observed_at
                    ],
                )?;
                Ok(true)
            }
        }
    }

    async fn get_sequence(&self, key: &AccessionKey) -> Result<Option<SequenceRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT accession, source_flag, sequence, observed_at FROM sequences
                 WHERE accession = ?1 AND source_flag = ?2",
                params![&key.accession, key.source_flag.as_code()],
                sequence_from_row,
            )
            .optional()?;
        row.map(into_sequence_record).transpose()
    }

    async fn list_sequences(&self, source_flag: Option<SourceFlag>) -> Result<Vec<SequenceRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT accession, source_flag, sequence, observed_at FROM sequences
             WHERE ?1 IS NULL OR source_flag = ?1
             ORDER BY accession, source_flag",
        )?;
        let rows = stmt
            .query_map(params![source_flag.map(|f| f.as_code())], sequence_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(into_sequence_record).collect()
    }

    async fn commit_record(&self, record: &ReconciledRecord) -> Result<()> {
        record.validate()?;

        let conn = self.conn.lock();
        let key = &record.key;
        let flag = key.source_flag.as_code();

        let stored: Option<String> = conn
            .query_row(
                "SELECT sequence FROM sequences WHERE accession = ?1 AND source_flag = ?2",
                params![&key.accession, flag],
                |row| row.get(0),
            )
            .optional()?;
        match stored {
            None => return Err(StorageError::sequence_not_found(key.to_string())),
            Some(seq) if seq != record.sequence => {
                return Err(StorageError::invalid_record(format!(
                    "{}: reconciled sequence differs from registered sequence",
                    key
                )))
            }
            Some(_) => {}
        }

        let tx = conn.unchecked_transaction()?;
        delete_locked(&tx, key)?;

        {
            let mut insert = tx.prepare_cached(&format!(
                "INSERT INTO per_residue (accession, source_flag, {}) VALUES
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                  ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
                RESIDUE_COLUMNS
            ))?;
            for r in &record.residues {
                insert.execute(params![
                    &key.accession,
                    flag,
                    r.site,
                    r.aa.to_string(),
                    r.plddt,
                    r.plddt10,
                    r.asa,
                    r.asa10,
                    r.rel_asa,
                    r.rel_asa10,
                    r.dis.to_string(),
                    r.dis10.to_string(),
                    r.surf.to_string(),
                    r.surf10.to_string(),
                    r.sec.to_string(),
                    r.iso.map(|c| c.to_string()),
                    r.phi,
                    r.psi,
                    r.omega,
                    r.tau,
                    r.chi[0],
                    r.chi[1],
                    r.chi[2],
                    r.chi[3],
                    r.chi[4],
                ])?;
            }

            let mut insert = tx.prepare_cached(
                "INSERT INTO per_pair (accession, source_flag, site1, site2, metric_type, value)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for p in &record.pairs {
                insert.execute(params![
                    &key.accession,
                    flag,
                    p.site1,
                    p.site2,
                    &p.metric_type,
                    p.value
                ])?;
            }
        }

        tx.execute(
            "INSERT INTO completion_flags (accession, source_flag, no_contacts, completed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![&key.accession, flag, record.no_contacts() as i64, Utc::now()],
        )?;

        tx.commit()
            .map_err(|e| StorageError::transaction(format!("{}: commit failed", key)).with_source(e))?;
        Ok(())
    }

    async fn presence(&self, key: &AccessionKey) -> Result<StorePresence> {
        let conn = self.conn.lock();
        presence_locked(&conn, key)
    }

    async fn completed_keys(&self) -> Result<BTreeSet<AccessionKey>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT r.accession, r.source_flag FROM per_residue r
             WHERE r.phi IS NOT NULL AND r.psi IS NOT NULL AND r.omega IS NOT NULL
               AND (EXISTS (SELECT 1 FROM per_pair p
                            WHERE p.accession = r.accession AND p.source_flag = r.source_flag)
                    OR EXISTS (SELECT 1 FROM completion_flags f
                               WHERE f.accession = r.accession AND f.source_flag = r.source_flag
                                 AND f.no_contacts = 1))",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(acc, code)| -> Result<AccessionKey> {
                Ok(AccessionKey::new(acc, SourceFlag::from_code(code)?))
            })
            .collect()
    }

    async fn partial_keys(&self) -> Result<BTreeSet<AccessionKey>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT accession, source_flag FROM per_residue
             UNION SELECT accession, source_flag FROM per_pair
             UNION SELECT accession, source_flag FROM completion_flags",
        )?;
        let candidates = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut partial = BTreeSet::new();
        for (acc, code) in candidates {
            let key = AccessionKey::new(acc, SourceFlag::from_code(code)?);
            if !presence_locked(&conn, &key)?.status().is_complete() {
                partial.insert(key);
            }
        }
        Ok(partial)
    }

    async fn delete_record(&self, key: &AccessionKey) -> Result<()> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        delete_locked(&tx, key)?;
        tx.commit()?;
        Ok(())
    }

    async fn residues(&self, key: &AccessionKey) -> Result<Vec<ResidueRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM per_residue WHERE accession = ?1 AND source_flag = ?2 ORDER BY site",
            RESIDUE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![&key.accession, key.source_flag.as_code()], residue_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn pairs(&self, key: &AccessionKey) -> Result<Vec<PairRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT site1, site2, metric_type, value FROM per_pair
             WHERE accession = ?1 AND source_flag = ?2
             ORDER BY site1, site2, metric_type",
        )?;
        let rows = stmt
            .query_map(params![&key.accession, key.source_flag.as_code()], |row| {
                Ok(PairRow {
                    site1: row.get(0)?,
                    site2: row.get(1)?,
                    metric_type: row.get(2)?,
                    value: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
