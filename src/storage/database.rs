//! SQLite store for runtime configuration.
//!
//! Holds generic AI config rows, optimization configs, agents, tools and
//! their bindings, knowledge providers and remote tool servers. Every row
//! carries `updated_at` (unix ms); the hot-reload poller watches the maximum
//! across all tables. Stamps are strictly increasing so two writes in the same
//! millisecond still register as a change.
//!
//! Uses `rusqlite` behind a mutex. WAL mode is enabled for file-backed stores.

use std::sync::{Mutex, MutexGuard};

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;

use super::errors::StoreError;
use super::records::{ConfigRow, HealthRecord, HealthState, OptimizationConfigRow};
use crate::agents::types::{Agent, ModelOverride};
use crate::knowledge::types::ProviderRecord;
use crate::mcp_client::types::RemoteServerRecord;
use crate::tools::types::ToolConfig;

// ─── Database ───────────────────────────────────────────────────────────────

/// SQLite handle for assistant configuration.
pub struct AssistantDatabase {
    conn: Mutex<Connection>,
}

impl AssistantDatabase {
    /// Open (or create) the database at `path`.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        if path != ":memory:" {
            conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        }
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.create_tables()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|e| StoreError::Unavailable {
            reason: format!("database lock poisoned: {e}"),
        })
    }

    fn create_tables(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS ai_configs (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ai_optimization_configs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                config_type TEXT NOT NULL,
                config_key TEXT NOT NULL,
                value TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                updated_at INTEGER NOT NULL,
                UNIQUE (config_type, config_key)
            );

            CREATE TABLE IF NOT EXISTS ai_agents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                system_prompt TEXT NOT NULL DEFAULT '',
                model TEXT,
                temperature REAL,
                max_tokens INTEGER,
                keywords TEXT NOT NULL DEFAULT '[]',
                priority INTEGER NOT NULL DEFAULT 0,
                agent_type TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ai_tools (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                implementation TEXT NOT NULL,
                parameters TEXT,
                risk_level TEXT NOT NULL DEFAULT 'low',
                enabled INTEGER NOT NULL DEFAULT 1,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ai_agent_tools (
                agent_id INTEGER NOT NULL,
                tool_id INTEGER NOT NULL,
                position INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (agent_id, tool_id),
                FOREIGN KEY (agent_id) REFERENCES ai_agents(id) ON DELETE CASCADE,
                FOREIGN KEY (tool_id) REFERENCES ai_tools(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS ai_knowledge_providers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                provider_type TEXT NOT NULL,
                config TEXT NOT NULL DEFAULT '{}',
                enabled INTEGER NOT NULL DEFAULT 1,
                health_state TEXT NOT NULL DEFAULT 'unknown',
                last_check_at INTEGER,
                last_error TEXT,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ai_remote_servers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                transport TEXT NOT NULL DEFAULT 'http',
                endpoint TEXT NOT NULL,
                health_check_url TEXT,
                health_check_interval_secs INTEGER NOT NULL DEFAULT 60,
                timeout_secs INTEGER NOT NULL DEFAULT 30,
                allowed_envs TEXT NOT NULL DEFAULT '[]',
                allowed_prefixes TEXT NOT NULL DEFAULT '[]',
                allowed_ips TEXT NOT NULL DEFAULT '[]',
                enabled INTEGER NOT NULL DEFAULT 1,
                health_state TEXT NOT NULL DEFAULT 'unknown',
                last_check_at INTEGER,
                last_error TEXT,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ai_change_marks (
                entity TEXT PRIMARY KEY,
                updated_at INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ─── Change tracking ────────────────────────────────────────────────

    /// Latest `updated_at` across every configuration table, deletions included.
    pub fn max_updated_at(&self) -> Result<i64, StoreError> {
        max_updated_at(&*self.conn()?)
    }

    // ─── Generic configs ────────────────────────────────────────────────

    /// Fetch an enabled config row.
    pub fn get_config(&self, key: &str) -> Result<Option<ConfigRow>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT key, value, enabled, updated_at FROM ai_configs
                 WHERE key = ?1 AND enabled = 1",
                params![key],
                |row| {
                    Ok(ConfigRow {
                        key: row.get(0)?,
                        value: row.get(1)?,
                        enabled: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_configs(&self) -> Result<Vec<ConfigRow>, StoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT key, value, enabled, updated_at FROM ai_configs ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            Ok(ConfigRow {
                key: row.get(0)?,
                value: row.get(1)?,
                enabled: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })?;
        collect_rows(rows)
    }

    pub fn upsert_config(&self, key: &str, value: &str, enabled: bool) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let stamp = next_stamp(&conn)?;
        conn.execute(
            "INSERT INTO ai_configs (key, value, enabled, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET value = ?2, enabled = ?3, updated_at = ?4",
            params![key, value, enabled, stamp],
        )?;
        Ok(())
    }

    // ─── Optimization configs ───────────────────────────────────────────

    /// Raw JSON of an enabled optimization config row.
    pub fn get_optimization_config(
        &self,
        config_type: &str,
        config_key: &str,
    ) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM ai_optimization_configs
                 WHERE config_type = ?1 AND config_key = ?2 AND enabled = 1",
                params![config_type, config_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn list_optimization_configs(&self) -> Result<Vec<OptimizationConfigRow>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT config_type, config_key, value, enabled, updated_at
             FROM ai_optimization_configs ORDER BY config_type, config_key",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(OptimizationConfigRow {
                config_type: row.get(0)?,
                config_key: row.get(1)?,
                value: row.get(2)?,
                enabled: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })?;
        collect_rows(rows)
    }

    pub fn upsert_optimization_config(
        &self,
        config_type: &str,
        config_key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let stamp = next_stamp(&conn)?;
        conn.execute(
            "INSERT INTO ai_optimization_configs (config_type, config_key, value, enabled, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(config_type, config_key) DO UPDATE SET value = ?3, enabled = 1, updated_at = ?4",
            params![config_type, config_key, value, stamp],
        )?;
        Ok(())
    }

    // ─── Agents ─────────────────────────────────────────────────────────

    pub fn list_agents(&self, include_disabled: bool) -> Result<Vec<Agent>, StoreError> {
        let conn = self.conn()?;
        query_agents(&conn, include_disabled)
    }

    pub fn get_agent(&self, name: &str) -> Result<Option<Agent>, StoreError> {
        let conn = self.conn()?;
        let agent = conn
            .query_row(
                &format!("{AGENT_COLUMNS} WHERE name = ?1"),
                params![name],
                row_to_agent,
            )
            .optional()?;
        Ok(agent)
    }

    /// Every agent together with its bound, enabled tools, read in one transaction.
    pub fn load_agents_with_tools(
        &self,
        include_disabled: bool,
    ) -> Result<Vec<(Agent, Vec<ToolConfig>)>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let agents = query_agents(&tx, include_disabled)?;
        let mut loaded = Vec::with_capacity(agents.len());
        for agent in agents {
            let tools = query_agent_tools(&tx, agent.id)?;
            loaded.push((agent, tools));
        }
        tx.commit()?;
        Ok(loaded)
    }

    /// Insert or update an agent by name. Returns its id.
    pub fn upsert_agent(&self, agent: &Agent) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let stamp = next_stamp(&conn)?;
        let keywords = serde_json::to_string(&agent.keywords)?;
        conn.execute(
            "INSERT INTO ai_agents
             (name, description, system_prompt, model, temperature, max_tokens,
              keywords, priority, agent_type, enabled, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(name) DO UPDATE SET
                description = ?2, system_prompt = ?3, model = ?4, temperature = ?5,
                max_tokens = ?6, keywords = ?7, priority = ?8, agent_type = ?9,
                enabled = ?10, updated_at = ?11",
            params![
                agent.name,
                agent.description,
                agent.system_prompt,
                agent.model.model,
                agent.model.temperature,
                agent.model.max_tokens,
                keywords,
                agent.priority,
                agent.agent_type.as_str(),
                agent.enabled,
                stamp,
            ],
        )?;
        id_by_name(&conn, "ai_agents", &agent.name)
    }

    /// Insert agents whose names are not present yet. Returns how many were added.
    pub fn insert_missing_agents(&self, agents: &[Agent]) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let mut inserted = 0;
        for agent in agents {
            let stamp = next_stamp(&conn)?;
            let keywords = serde_json::to_string(&agent.keywords)?;
            inserted += conn.execute(
                "INSERT OR IGNORE INTO ai_agents
                 (name, description, system_prompt, model, temperature, max_tokens,
                  keywords, priority, agent_type, enabled, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    agent.name,
                    agent.description,
                    agent.system_prompt,
                    agent.model.model,
                    agent.model.temperature,
                    agent.model.max_tokens,
                    keywords,
                    agent.priority,
                    agent.agent_type.as_str(),
                    agent.enabled,
                    stamp,
                ],
            )?;
        }
        Ok(inserted)
    }

    pub fn set_agent_enabled(&self, name: &str, enabled: bool) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let stamp = next_stamp(&conn)?;
        let changed = conn.execute(
            "UPDATE ai_agents SET enabled = ?2, updated_at = ?3 WHERE name = ?1",
            params![name, enabled, stamp],
        )?;
        if changed == 0 {
            return Err(not_found("agent", name));
        }
        Ok(())
    }

    pub fn delete_agent(&self, name: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM ai_agents WHERE name = ?1", params![name])?;
        if changed == 0 {
            return Err(not_found("agent", name));
        }
        mark_change(&conn, "ai_agents")
    }

    /// Replace an agent's tool bindings with `tool_names`, in order.
    pub fn bind_agent_tools(&self, agent_name: &str, tool_names: &[String]) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let stamp = next_stamp(&conn)?;
        let tx = conn.transaction()?;
        let agent_id = id_by_name(&tx, "ai_agents", agent_name)?;
        let mut tool_ids = Vec::with_capacity(tool_names.len());
        for name in tool_names {
            tool_ids.push(id_by_name(&tx, "ai_tools", name)?);
        }
        tx.execute("DELETE FROM ai_agent_tools WHERE agent_id = ?1", params![agent_id])?;
        for (position, tool_id) in tool_ids.iter().enumerate() {
            tx.execute(
                "INSERT OR IGNORE INTO ai_agent_tools (agent_id, tool_id, position) VALUES (?1, ?2, ?3)",
                params![agent_id, tool_id, position as i64],
            )?;
        }
        tx.execute(
            "UPDATE ai_agents SET updated_at = ?2 WHERE id = ?1",
            params![agent_id, stamp],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ─── Tools ──────────────────────────────────────────────────────────

    pub fn list_tools(&self, include_disabled: bool) -> Result<Vec<ToolConfig>, StoreError> {
        let conn = self.conn()?;
        let sql = if include_disabled {
            format!("{TOOL_COLUMNS} ORDER BY t.name")
        } else {
            format!("{TOOL_COLUMNS} WHERE t.enabled = 1 ORDER BY t.name")
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_tool)?;
        collect_rows(rows)
    }

    pub fn get_tool(&self, name: &str) -> Result<Option<ToolConfig>, StoreError> {
        let conn = self.conn()?;
        let tool = conn
            .query_row(
                &format!("{TOOL_COLUMNS} WHERE t.name = ?1"),
                params![name],
                row_to_tool,
            )
            .optional()?;
        Ok(tool)
    }

    /// Insert or update a tool by name. Returns its id.
    pub fn upsert_tool(&self, tool: &ToolConfig) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let stamp = next_stamp(&conn)?;
        let implementation = serde_json::to_string(&tool.implementation)?;
        let parameters = tool
            .parameters
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT INTO ai_tools
             (name, description, implementation, parameters, risk_level, enabled, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(name) DO UPDATE SET
                description = ?2, implementation = ?3, parameters = ?4,
                risk_level = ?5, enabled = ?6, updated_at = ?7",
            params![
                tool.name,
                tool.description,
                implementation,
                parameters,
                tool.risk_level.as_str(),
                tool.enabled,
                stamp,
            ],
        )?;
        id_by_name(&conn, "ai_tools", &tool.name)
    }

    pub fn delete_tool(&self, name: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM ai_tools WHERE name = ?1", params![name])?;
        if changed == 0 {
            return Err(not_found("tool", name));
        }
        mark_change(&conn, "ai_tools")
    }

    // ─── Knowledge providers ────────────────────────────────────────────

    pub fn list_knowledge_providers(
        &self,
        include_disabled: bool,
    ) -> Result<Vec<ProviderRecord>, StoreError> {
        let conn = self.conn()?;
        let sql = if include_disabled {
            format!("{PROVIDER_COLUMNS} ORDER BY id")
        } else {
            format!("{PROVIDER_COLUMNS} WHERE enabled = 1 ORDER BY id")
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_provider)?;
        collect_rows(rows)
    }

    pub fn upsert_knowledge_provider(&self, provider: &ProviderRecord) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let stamp = next_stamp(&conn)?;
        let config = serde_json::to_string(&provider.config)?;
        conn.execute(
            "INSERT INTO ai_knowledge_providers (name, provider_type, config, enabled, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name) DO UPDATE SET
                provider_type = ?2, config = ?3, enabled = ?4, updated_at = ?5",
            params![provider.name, provider.provider_type, config, provider.enabled, stamp],
        )?;
        id_by_name(&conn, "ai_knowledge_providers", &provider.name)
    }

    /// Record a health probe. Does not bump `updated_at`.
    pub fn update_provider_health(
        &self,
        id: i64,
        state: HealthState,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE ai_knowledge_providers
             SET health_state = ?2, last_check_at = ?3, last_error = ?4 WHERE id = ?1",
            params![id, state.as_str(), now_ms(), error],
        )?;
        Ok(())
    }

    // ─── Remote tool servers ────────────────────────────────────────────

    pub fn list_remote_servers(
        &self,
        include_disabled: bool,
    ) -> Result<Vec<RemoteServerRecord>, StoreError> {
        let conn = self.conn()?;
        let sql = if include_disabled {
            format!("{SERVER_COLUMNS} ORDER BY id")
        } else {
            format!("{SERVER_COLUMNS} WHERE enabled = 1 ORDER BY id")
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_server)?;
        collect_rows(rows)
    }

    pub fn get_remote_server(&self, id: i64) -> Result<Option<RemoteServerRecord>, StoreError> {
        let conn = self.conn()?;
        let server = conn
            .query_row(
                &format!("{SERVER_COLUMNS} WHERE id = ?1"),
                params![id],
                row_to_server,
            )
            .optional()?;
        Ok(server)
    }

    pub fn upsert_remote_server(&self, server: &RemoteServerRecord) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let stamp = next_stamp(&conn)?;
        conn.execute(
            "INSERT INTO ai_remote_servers
             (name, transport, endpoint, health_check_url, health_check_interval_secs,
              timeout_secs, allowed_envs, allowed_prefixes, allowed_ips, enabled, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(name) DO UPDATE SET
                transport = ?2, endpoint = ?3, health_check_url = ?4,
                health_check_interval_secs = ?5, timeout_secs = ?6, allowed_envs = ?7,
                allowed_prefixes = ?8, allowed_ips = ?9, enabled = ?10, updated_at = ?11",
            params![
                server.name,
                server.transport,
                server.endpoint,
                server.health_check_url,
                server.health_check_interval_secs as i64,
                server.timeout_secs as i64,
                serde_json::to_string(&server.allowed_envs)?,
                serde_json::to_string(&server.allowed_prefixes)?,
                serde_json::to_string(&server.allowed_ips)?,
                server.enabled,
                stamp,
            ],
        )?;
        id_by_name(&conn, "ai_remote_servers", &server.name)
    }

    /// Record a health probe. Does not bump `updated_at`.
    pub fn update_server_health(
        &self,
        id: i64,
        state: HealthState,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE ai_remote_servers
             SET health_state = ?2, last_check_at = ?3, last_error = ?4 WHERE id = ?1",
            params![id, state.as_str(), now_ms(), error],
        )?;
        Ok(())
    }
}

// ─── Queries ────────────────────────────────────────────────────────────────

const AGENT_COLUMNS: &str = "SELECT id, name, description, system_prompt, model, temperature,
        max_tokens, keywords, priority, agent_type, enabled, updated_at FROM ai_agents";

const TOOL_COLUMNS: &str = "SELECT t.id, t.name, t.description, t.implementation, t.parameters,
        t.risk_level, t.enabled, t.updated_at FROM ai_tools t";

const PROVIDER_COLUMNS: &str = "SELECT id, name, provider_type, config, enabled, health_state,
        last_check_at, last_error, updated_at FROM ai_knowledge_providers";

const SERVER_COLUMNS: &str = "SELECT id, name, transport, endpoint, health_check_url,
        health_check_interval_secs, timeout_secs, allowed_envs, allowed_prefixes, allowed_ips,
        enabled, health_state, last_check_at, last_error, updated_at FROM ai_remote_servers";

fn query_agents(conn: &Connection, include_disabled: bool) -> Result<Vec<Agent>, StoreError> {
    let sql = if include_disabled {
        format!("{AGENT_COLUMNS} ORDER BY id")
    } else {
        format!("{AGENT_COLUMNS} WHERE enabled = 1 ORDER BY id")
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_agent)?;
    collect_rows(rows)
}

fn query_agent_tools(conn: &Connection, agent_id: i64) -> Result<Vec<ToolConfig>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "{TOOL_COLUMNS} JOIN ai_agent_tools b ON b.tool_id = t.id
         WHERE b.agent_id = ?1 AND t.enabled = 1 ORDER BY b.position"
    ))?;
    let rows = stmt.query_map(params![agent_id], row_to_tool)?;
    collect_rows(rows)
}

fn max_updated_at(conn: &Connection) -> Result<i64, StoreError> {
    let max: Option<i64> = conn.query_row(
        "SELECT MAX(m) FROM (
            SELECT MAX(updated_at) AS m FROM ai_configs
            UNION ALL SELECT MAX(updated_at) FROM ai_optimization_configs
            UNION ALL SELECT MAX(updated_at) FROM ai_agents
            UNION ALL SELECT MAX(updated_at) FROM ai_tools
            UNION ALL SELECT MAX(updated_at) FROM ai_knowledge_providers
            UNION ALL SELECT MAX(updated_at) FROM ai_remote_servers
            UNION ALL SELECT MAX(updated_at) FROM ai_change_marks
        )",
        [],
        |row| row.get(0),
    )?;
    Ok(max.unwrap_or(0))
}

/// A stamp strictly greater than anything already stored.
fn next_stamp(conn: &Connection) -> Result<i64, StoreError> {
    Ok(now_ms().max(max_updated_at(conn)? + 1))
}

fn mark_change(conn: &Connection, entity: &str) -> Result<(), StoreError> {
    let stamp = next_stamp(conn)?;
    conn.execute(
        "INSERT INTO ai_change_marks (entity, updated_at) VALUES (?1, ?2)
         ON CONFLICT(entity) DO UPDATE SET updated_at = ?2",
        params![entity, stamp],
    )?;
    Ok(())
}

fn id_by_name(conn: &Connection, table: &'static str, name: &str) -> Result<i64, StoreError> {
    conn.query_row(
        &format!("SELECT id FROM {table} WHERE name = ?1"),
        params![name],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| not_found(entity_name(table), name))
}

fn entity_name(table: &str) -> &'static str {
    match table {
        "ai_agents" => "agent",
        "ai_tools" => "tool",
        "ai_knowledge_providers" => "knowledge provider",
        "ai_remote_servers" => "remote server",
        _ => "row",
    }
}

fn not_found(entity: &'static str, key: &str) -> StoreError {
    StoreError::NotFound {
        entity,
        key: key.to_string(),
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>, StoreError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

// ─── Row mapping ────────────────────────────────────────────────────────────

fn conversion_error(idx: usize, e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

/// Parse a JSON text column.
fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

/// Parse a text column holding a serde enum tag (`"high"`, `"expert"`, …).
fn tag_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_value(serde_json::Value::String(raw)).map_err(|e| conversion_error(idx, e))
}

fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        system_prompt: row.get(3)?,
        model: ModelOverride {
            model: row.get(4)?,
            temperature: row.get::<_, Option<f64>>(5)?.map(|t| t as f32),
            max_tokens: row.get(6)?,
        },
        keywords: json_col(row, 7)?,
        priority: row.get(8)?,
        agent_type: tag_col(row, 9)?,
        enabled: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn row_to_tool(row: &Row<'_>) -> rusqlite::Result<ToolConfig> {
    let parameters: Option<String> = row.get(4)?;
    let parameters = parameters
        .map(|p| serde_json::from_str(&p).map_err(|e| conversion_error(4, e)))
        .transpose()?;
    Ok(ToolConfig {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        implementation: json_col(row, 3)?,
        parameters,
        risk_level: tag_col(row, 5)?,
        enabled: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn row_to_provider(row: &Row<'_>) -> rusqlite::Result<ProviderRecord> {
    Ok(ProviderRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        provider_type: row.get(2)?,
        config: json_col(row, 3)?,
        enabled: row.get(4)?,
        health: HealthRecord {
            state: tag_col(row, 5)?,
            last_check_at: row.get(6)?,
            last_error: row.get(7)?,
        },
        updated_at: row.get(8)?,
    })
}

fn row_to_server(row: &Row<'_>) -> rusqlite::Result<RemoteServerRecord> {
    Ok(RemoteServerRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        transport: row.get(2)?,
        endpoint: row.get(3)?,
        health_check_url: row.get(4)?,
        health_check_interval_secs: row.get::<_, i64>(5)?.max(1) as u64,
        timeout_secs: row.get::<_, i64>(6)?.max(1) as u64,
        allowed_envs: json_col(row, 7)?,
        allowed_prefixes: json_col(row, 8)?,
        allowed_ips: json_col(row, 9)?,
        enabled: row.get(10)?,
        health: HealthRecord {
            state: tag_col(row, 11)?,
            last_check_at: row.get(12)?,
            last_error: row.get(13)?,
        },
        updated_at: row.get(14)?,
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────
