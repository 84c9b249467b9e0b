use std::fs;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Row, params};

use crate::config::Settings;
use crate::error::{Result, WardenError};
use crate::model::{Agent, Lease, Project};
use crate::naming::slugify;

// ---------------------------------------------------------------------------
// Timestamp helpers: TEXT columns, RFC 3339 UTC with fixed precision so
// lexicographic comparison in SQL matches chronological order.
// ---------------------------------------------------------------------------

pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_dt(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_dt_opt(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|v| parse_dt(idx, &v)).transpose()
}

// ---------------------------------------------------------------------------
// CoordinationDb
// ---------------------------------------------------------------------------

/// The single source of truth for project, agent, and lease state.
///
/// Construction performs one-time schema setup on the handle; there is no
/// process-wide "schema ready" flag.
pub struct CoordinationDb {
    conn: Connection,
}

impl CoordinationDb {
    /// Open (or create) the coordination database at the given file path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA foreign_keys=ON;\
             PRAGMA busy_timeout=5000;",
        )?;
        let db = Self { conn };
        db.create_tables()?;
        Ok(db)
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys=ON;\
             PRAGMA busy_timeout=5000;",
        )?;
        let db = Self { conn };
        db.create_tables()?;
        Ok(db)
    }

    /// Convenience: open the database under the configured storage root,
    /// creating the directory if needed.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        fs::create_dir_all(&settings.storage_root)?;
        Self::open(&settings.database_path())
    }

    fn create_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                slug TEXT NOT NULL UNIQUE,
                human_key TEXT NOT NULL,
                created_ts TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL REFERENCES projects(id),
                name TEXT NOT NULL,
                program TEXT NOT NULL DEFAULT '',
                model TEXT NOT NULL DEFAULT '',
                task_description TEXT NOT NULL DEFAULT '',
                inception_ts TEXT NOT NULL,
                last_active_ts TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_agents_project_name
                ON agents(project_id, name COLLATE NOCASE);

            CREATE TABLE IF NOT EXISTS leases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL REFERENCES projects(id),
                agent_id INTEGER NOT NULL REFERENCES agents(id),
                path_pattern TEXT NOT NULL,
                exclusive INTEGER NOT NULL,
                reason TEXT NOT NULL DEFAULT '',
                created_ts TEXT NOT NULL,
                expires_ts TEXT NOT NULL,
                released_ts TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_leases_project_active
                ON leases(project_id, released_ts, expires_ts);
            CREATE INDEX IF NOT EXISTS idx_leases_agent
                ON leases(agent_id);",
        )?;
        Ok(())
    }

    /// Expose the raw connection (for tests or advanced usage).
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
        Ok(Project {
            id: row.get(0)?,
            slug: row.get(1)?,
            human_key: row.get(2)?,
            created_ts: parse_dt(3, &row.get::<_, String>(3)?)?,
        })
    }

    /// Find or create the project for a human-readable key. The slug is the
    /// normalized identity; the first human key seen for a slug wins.
    pub fn upsert_project(&self, human_key: &str) -> Result<Project> {
        let slug = slugify(human_key);
        if let Some(existing) = self.find_project(&slug)? {
            return Ok(existing);
        }
        self.conn.execute(
            "INSERT INTO projects (slug, human_key, created_ts) VALUES (?1, ?2, ?3)
             ON CONFLICT(slug) DO NOTHING",
            params![&slug, human_key, ts(Utc::now())],
        )?;
        self.find_project(&slug)?
            .ok_or_else(|| WardenError::ProjectNotFound(human_key.to_string()))
    }

    fn find_project(&self, slug: &str) -> Result<Option<Project>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, slug, human_key, created_ts FROM projects WHERE slug = ?1")?;
        let mut rows = stmt.query_map(params![slug], Self::project_from_row)?;
        rows.next().transpose().map_err(Into::into)
    }

    /// Resolve a project by identifier (human key or slug). Errors when the
    /// project has never been registered.
    pub fn get_project(&self, identifier: &str) -> Result<Project> {
        let slug = slugify(identifier);
        self.find_project(&slug)?
            .ok_or_else(|| WardenError::ProjectNotFound(identifier.to_string()))
    }

    /// Every project that has ever held at least one lease, for the sweeper.
    pub fn projects_with_leases(&self) -> Result<Vec<Project>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT p.id, p.slug, p.human_key, p.created_ts
             FROM projects p JOIN leases l ON l.project_id = p.id
             ORDER BY p.slug",
        )?;
        let rows = stmt.query_map([], Self::project_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
        Ok(Agent {
            id: row.get(0)?,
            project_id: row.get(1)?,
            name: row.get(2)?,
            program: row.get(3)?,
            model: row.get(4)?,
            task_description: row.get(5)?,
            inception_ts: parse_dt(6, &row.get::<_, String>(6)?)?,
            last_active_ts: parse_dt(7, &row.get::<_, String>(7)?)?,
        })
    }

    /// Register or re-register an agent. Names are unique per project,
    /// case-insensitively; re-registration refreshes the descriptive fields
    /// and the liveness timestamp.
    pub fn register_agent(
        &self,
        project: &Project,
        name: &str,
        program: &str,
        model: &str,
        task_description: &str,
    ) -> Result<Agent> {
        let now = ts(Utc::now());
        let updated = self.conn.execute(
            "UPDATE agents SET program = ?3, model = ?4, task_description = ?5, last_active_ts = ?6
             WHERE project_id = ?1 AND name = ?2 COLLATE NOCASE",
            params![project.id, name, program, model, task_description, &now],
        )?;
        if updated == 0 {
            self.conn.execute(
                "INSERT INTO agents (project_id, name, program, model, task_description, inception_ts, last_active_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![project.id, name, program, model, task_description, &now],
            )?;
        }
        self.get_agent(project, name)
    }

    /// Look up an agent by name (case-insensitive) within a project.
    pub fn get_agent(&self, project: &Project, name: &str) -> Result<Agent> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, name, program, model, task_description, inception_ts, last_active_ts
             FROM agents WHERE project_id = ?1 AND name = ?2 COLLATE NOCASE",
        )?;
        stmt.query_row(params![project.id, name], Self::agent_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    WardenError::AgentNotFound(name.to_string(), project.human_key.clone())
                }
                other => WardenError::Db(other),
            })
    }

    /// Refresh an agent's liveness timestamp.
    pub fn touch_agent(&self, agent_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE agents SET last_active_ts = ?2 WHERE id = ?1",
            params![agent_id, ts(Utc::now())],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Leases
    // -----------------------------------------------------------------------

    const LEASE_COLUMNS: &'static str = "l.id, l.project_id, l.agent_id, a.name, l.path_pattern, \
         l.exclusive, l.reason, l.created_ts, l.expires_ts, l.released_ts";

    fn lease_from_row(row: &Row<'_>) -> rusqlite::Result<Lease> {
        Ok(Lease {
            id: row.get(0)?,
            project_id: row.get(1)?,
            agent_id: row.get(2)?,
            agent_name: row.get(3)?,
            path_pattern: row.get(4)?,
            exclusive: row.get::<_, i64>(5)? != 0,
            reason: row.get(6)?,
            created_ts: parse_dt(7, &row.get::<_, String>(7)?)?,
            expires_ts: parse_dt(8, &row.get::<_, String>(8)?)?,
            released_ts: parse_dt_opt(9, row.get(9)?)?,
        })
    }

    /// Leases that are neither released nor expired as of `now`.
    pub fn list_active_leases(&self, project_id: i64, now: DateTime<Utc>) -> Result<Vec<Lease>> {
        let sql = format!(
            "SELECT {} FROM leases l JOIN agents a ON a.id = l.agent_id
             WHERE l.project_id = ?1 AND l.released_ts IS NULL AND l.expires_ts > ?2
             ORDER BY l.id",
            Self::LEASE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![project_id, ts(now)], Self::lease_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Persist a new lease. `expires_ts` must be after `created_ts`; callers
    /// validate the ttl before getting here.
    pub fn insert_lease(
        &self,
        project_id: i64,
        agent_id: i64,
        path_pattern: &str,
        exclusive: bool,
        reason: &str,
        created_ts: DateTime<Utc>,
        expires_ts: DateTime<Utc>,
    ) -> Result<Lease> {
        debug_assert!(expires_ts > created_ts);
        self.conn.execute(
            "INSERT INTO leases (project_id, agent_id, path_pattern, exclusive, reason, created_ts, expires_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                project_id,
                agent_id,
                path_pattern,
                exclusive as i64,
                reason,
                ts(created_ts),
                ts(expires_ts)
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_lease(id)
    }

    fn get_lease(&self, id: i64) -> Result<Lease> {
        let sql = format!(
            "SELECT {} FROM leases l JOIN agents a ON a.id = l.agent_id WHERE l.id = ?1",
            Self::LEASE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        stmt.query_row(params![id], Self::lease_from_row)
            .map_err(Into::into)
    }

    /// Release an agent's active leases, optionally restricted to specific
    /// lease ids and/or exact path patterns. Returns the rows that were
    /// released (with `released_ts` set) so callers can rewrite artifacts.
    pub fn release_leases(
        &self,
        project_id: i64,
        agent_id: i64,
        ids: &[i64],
        paths: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<Lease>> {
        let candidates: Vec<Lease> = self
            .list_active_leases(project_id, now)?
            .into_iter()
            .filter(|l| l.agent_id == agent_id)
            .filter(|l| ids.is_empty() || ids.contains(&l.id))
            .filter(|l| paths.is_empty() || paths.iter().any(|p| *p == l.path_pattern))
            .collect();

        let tx = self.conn.unchecked_transaction()?;
        let now_str = ts(now);
        let mut released = Vec::with_capacity(candidates.len());
        for mut lease in candidates {
            let changed = tx.execute(
                "UPDATE leases SET released_ts = ?2 WHERE id = ?1 AND released_ts IS NULL",
                params![lease.id, &now_str],
            )?;
            if changed > 0 {
                lease.released_ts = Some(now);
                released.push(lease);
            }
        }
        tx.commit()?;
        Ok(released)
    }

    /// Mark every lease whose expiry has passed and that was never released.
    /// Returns the newly expired rows; running this twice in a row with no
    /// newly expired leases returns an empty vec and changes nothing.
    pub fn mark_expired_batch(&self, project_id: i64, now: DateTime<Utc>) -> Result<Vec<Lease>> {
        let sql = format!(
            "SELECT {} FROM leases l JOIN agents a ON a.id = l.agent_id
             WHERE l.project_id = ?1 AND l.released_ts IS NULL AND l.expires_ts < ?2
             ORDER BY l.id",
            Self::LEASE_COLUMNS
        );
        let now_str = ts(now);
        let tx = self.conn.unchecked_transaction()?;
        let mut expired: Vec<Lease> = {
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params![project_id, &now_str], Self::lease_from_row)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };
        tx.execute(
            "UPDATE leases SET released_ts = ?2
             WHERE project_id = ?1 AND released_ts IS NULL AND expires_ts < ?2",
            params![project_id, &now_str],
        )?;
        tx.commit()?;
        for lease in &mut expired {
            lease.released_ts = Some(now);
        }
        Ok(expired)
    }
}
