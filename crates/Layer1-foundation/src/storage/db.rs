//! SQLite Storage for isolation records
//!
//! 런타임 데이터 저장:
//! - Projects: 프로젝트 루트와 기본 이미지
//! - Agents: 에이전트 이미지 선호
//! - Sessions: 모드, 상태, 워크트리 경로, 재개 토큰
//!
//! Container entries are never stored here; they live only in the
//! in-memory registry of the container manager.

use super::types::{Agent, Project, Session, SessionMode, SessionStatus};
use super::IsolationStore;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Current schema version
const CURRENT_SCHEMA_VERSION: i32 = 1;

const SESSION_COLUMNS: &str = "id, project_id, agent_id, mode, status, image, worktree_path, \
     agent_session_token, created_at, updated_at";

/// Storage service for isolation records
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open (or create) the store under `data_dir`
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| Error::Storage(format!("Failed to create data directory: {}", e)))?;

        let db_path = data_dir.join("berth.db");
        let conn = Connection::open(&db_path)
            .map_err(|e| Error::Storage(format!("Failed to open database: {}", e)))?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| Error::Storage(format!("Failed to set pragmas: {}", e)))?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        info!("Opened isolation store at {}", db_path.display());

        Ok(storage)
    }

    /// Create an in-memory storage (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to create in-memory database: {}", e)))?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;

        Ok(storage)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))
    }

    /// Get current schema version from database
    pub fn get_schema_version(&self) -> Result<i32> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(|e| Error::Storage(format!("Failed to get schema version: {}", e)))
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                root_path TEXT NOT NULL,
                default_image TEXT
            );

            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                image TEXT
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                agent_id TEXT,
                mode TEXT NOT NULL CHECK(mode IN ('explore', 'write')),
                status TEXT NOT NULL CHECK(status IN ('backlog', 'in_progress', 'review', 'done', 'cancelled')),
                image TEXT,
                worktree_path TEXT,
                agent_session_token TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
                FOREIGN KEY (agent_id) REFERENCES agents(id) ON DELETE SET NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_project_status
                ON sessions(project_id, status);
            "#,
        )
        .map_err(|e| Error::Storage(format!("Failed to initialize schema: {}", e)))?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| Error::Storage(format!("Failed to record schema version: {}", e)))?;

        debug!("Isolation store schema at version {}", CURRENT_SCHEMA_VERSION);
        Ok(())
    }

    fn query_sessions(&self, where_clause: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Session>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM sessions {} ORDER BY created_at ASC",
            SESSION_COLUMNS, where_clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args, SessionRow::from_row)?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?.into_session()?);
        }
        Ok(sessions)
    }

    fn touch_session(&self, sql: &str, session_id: &str, value: Option<String>) -> Result<()> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(sql, params![session_id, value, now])?;
        if changed == 0 {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Row Mapping
// ============================================================================

struct SessionRow {
    id: String,
    project_id: String,
    agent_id: Option<String>,
    mode: String,
    status: String,
    image: Option<String>,
    worktree_path: Option<String>,
    agent_session_token: Option<String>,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            agent_id: row.get(2)?,
            mode: row.get(3)?,
            status: row.get(4)?,
            image: row.get(5)?,
            worktree_path: row.get(6)?,
            agent_session_token: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_session(self) -> Result<Session> {
        Ok(Session {
            mode: self.mode.parse::<SessionMode>()?,
            status: self.status.parse::<SessionStatus>()?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
            project_id: self.project_id,
            agent_id: self.agent_id,
            image: self.image,
            worktree_path: self.worktree_path.map(PathBuf::from),
            agent_session_token: self.agent_session_token,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("Bad timestamp {:?}: {}", raw, e)))
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

// ============================================================================
// IsolationStore
// ============================================================================

impl IsolationStore for Storage {
    fn insert_project(&self, project: &Project) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO projects (id, name, root_path, default_image) VALUES (?1, ?2, ?3, ?4)",
            params![
                project.id,
                project.name,
                path_string(&project.root_path),
                project.default_image
            ],
        )?;
        Ok(())
    }

    fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let conn = self.lock()?;
        let project = conn
            .query_row(
                "SELECT id, name, root_path, default_image FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        root_path: PathBuf::from(row.get::<_, String>(2)?),
                        default_image: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(project)
    }

    fn list_projects(&self) -> Result<Vec<Project>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT id, name, root_path, default_image FROM projects ORDER BY name")?;
        let projects = stmt
            .query_map([], |row| {
                Ok(Project {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    root_path: PathBuf::from(row.get::<_, String>(2)?),
                    default_image: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(projects)
    }

    fn insert_agent(&self, agent: &Agent) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO agents (id, name, image) VALUES (?1, ?2, ?3)",
            params![agent.id, agent.name, agent.image],
        )?;
        Ok(())
    }

    fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        let conn = self.lock()?;
        let agent = conn
            .query_row(
                "SELECT id, name, image FROM agents WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Agent {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        image: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(agent)
    }

    fn insert_session(&self, session: &Session) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO sessions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                SESSION_COLUMNS
            ),
            params![
                session.id,
                session.project_id,
                session.agent_id,
                session.mode.as_str(),
                session.status.as_str(),
                session.image,
                session.worktree_path.as_deref().map(path_string),
                session.agent_session_token,
                session.created_at.to_rfc3339(),
                session.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let mut sessions = self.query_sessions("WHERE id = ?1", &[&id])?;
        Ok(sessions.pop())
    }

    fn update_session_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        self.touch_session(
            "UPDATE sessions SET status = ?2, updated_at = ?3 WHERE id = ?1",
            id,
            Some(status.as_str().to_string()),
        )
    }

    fn set_worktree_path(&self, id: &str, path: Option<&Path>) -> Result<()> {
        self.touch_session(
            "UPDATE sessions SET worktree_path = ?2, updated_at = ?3 WHERE id = ?1",
            id,
            path.map(path_string),
        )
    }

    fn set_agent_session_token(&self, id: &str, token: Option<&str>) -> Result<()> {
        self.touch_session(
            "UPDATE sessions SET agent_session_token = ?2, updated_at = ?3 WHERE id = ?1",
            id,
            token.map(str::to_string),
        )
    }

    fn list_active_write_sessions(&self, project_id: &str) -> Result<Vec<Session>> {
        self.query_sessions(
            "WHERE project_id = ?1 AND mode = 'write' AND status = 'in_progress'",
            &[&project_id],
        )
    }

    fn list_sessions_with_worktrees(&self) -> Result<Vec<Session>> {
        self.query_sessions("WHERE worktree_path IS NOT NULL", &[])
    }

    fn delete_session(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }
}
