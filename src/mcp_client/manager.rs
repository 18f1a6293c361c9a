//! Connection manager for remote tool servers.
//!
//! Each enabled server row gets a client, a `tools/list` handshake and a
//! health ticker that writes probe results back to the store. Dispatch looks
//! clients up by server id and fails fast when a server is absent or
//! unhealthy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::client::RemoteToolClient;
use super::errors::McpError;
use super::types::{RemoteServerRecord, RemoteToolDefinition};
use crate::config::{ConfigError, Reloadable};
use crate::storage::{AssistantDatabase, HealthState};

// ─── Types ───────────────────────────────────────────────────────────────────

/// A live connection to one server.
struct ServerHandle {
    record: RemoteServerRecord,
    client: Arc<RemoteToolClient>,
    healthy: Arc<AtomicBool>,
    tools: Vec<RemoteToolDefinition>,
    /// Stops this server's health ticker.
    cancel: CancellationToken,
    ticker: Option<JoinHandle<()>>,
}

impl ServerHandle {
    fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

/// Admin view of one configured server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub connected: bool,
    pub health: HealthState,
    pub tool_count: usize,
    pub last_check_at: Option<i64>,
    pub last_error: Option<String>,
}

// ─── Access control ──────────────────────────────────────────────────────────

/// Apply a server's allow-lists to one call. An empty list allows everything.
pub fn check_access(
    record: &RemoteServerRecord,
    remote_tool: &str,
    env: Option<&str>,
    caller_ip: Option<&str>,
) -> Result<(), String> {
    if !record.allowed_envs.is_empty() {
        let env = env.unwrap_or_default();
        if !record.allowed_envs.iter().any(|e| e == env) {
            return Err(format!("environment '{env}' not allowed"));
        }
    }
    if !record.allowed_prefixes.is_empty()
        && !record
            .allowed_prefixes
            .iter()
            .any(|p| remote_tool.starts_with(p.as_str()))
    {
        return Err(format!("tool '{remote_tool}' not in allowed prefixes"));
    }
    if !record.allowed_ips.is_empty() {
        let ip = caller_ip.unwrap_or_default();
        if !record.allowed_ips.iter().any(|a| a == ip) {
            return Err(format!("caller ip '{ip}' not allowed"));
        }
    }
    Ok(())
}

// ─── RemoteServerManager ─────────────────────────────────────────────────────

pub struct RemoteServerManager {
    db: Arc<AssistantDatabase>,
    servers: RwLock<HashMap<i64, ServerHandle>>,
    /// Parent of every per-server ticker token.
    root: CancellationToken,
}

impl RemoteServerManager {
    pub fn new(db: Arc<AssistantDatabase>, root: CancellationToken) -> Self {
        Self {
            db,
            servers: RwLock::new(HashMap::new()),
            root,
        }
    }

    /// Connect every enabled server. Returns the failures; partial startup is OK.
    pub async fn start_all(&self) -> Vec<(String, McpError)> {
        let records = match self.db.list_remote_servers(false) {
            Ok(r) => r,
            Err(e) => return vec![("*".to_string(), McpError::Store(e))],
        };
        let mut errors = Vec::new();
        for record in records {
            let name = record.name.clone();
            if let Err(e) = self.connect(record).await {
                errors.push((name, e));
            }
        }
        tracing::info!(
            connected = self.connected_count(),
            failed = errors.len(),
            "remote tool servers started"
        );
        errors
    }

    /// Handshake with one server and start its health ticker.
    ///
    /// On failure the server is marked unhealthy in the store and not registered.
    pub async fn connect(&self, record: RemoteServerRecord) -> Result<(), McpError> {
        let id = record.id;
        let outcome = async {
            let client = RemoteToolClient::new(&record)?;
            let tools = client.list_tools(&self.root).await?;
            Ok::<_, McpError>((client, tools))
        }
        .await;

        let (client, tools) = match outcome {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!(server = %record.name, error = %e, "remote server handshake failed");
                self.record_health(id, HealthState::Unhealthy, Some(&e.to_string()));
                return Err(e);
            }
        };
        self.record_health(id, HealthState::Healthy, None);
        tracing::info!(server = %record.name, tools = tools.len(), "remote server connected");

        let client = Arc::new(client);
        let healthy = Arc::new(AtomicBool::new(true));
        let cancel = self.root.child_token();
        let ticker = spawn_health_ticker(
            Arc::clone(&self.db),
            Arc::clone(&client),
            Arc::clone(&healthy),
            &record,
            cancel.clone(),
        );

        let handle = ServerHandle {
            record,
            client,
            healthy,
            tools,
            cancel,
            ticker: Some(ticker),
        };
        if let Ok(mut servers) = self.servers.write() {
            if let Some(mut old) = servers.insert(id, handle) {
                old.stop();
            }
        }
        Ok(())
    }

    /// Drop a server's client and stop its ticker.
    pub fn disconnect(&self, server_id: i64) -> bool {
        let removed = self
            .servers
            .write()
            .ok()
            .and_then(|mut servers| servers.remove(&server_id));
        match removed {
            Some(mut handle) => {
                handle.stop();
                tracing::info!(server = %handle.record.name, "remote server disconnected");
                true
            }
            None => false,
        }
    }

    /// Re-read the row and run the handshake again.
    pub async fn reconnect(&self, server_id: i64) -> Result<(), McpError> {
        self.disconnect(server_id);
        let record = self
            .db
            .get_remote_server(server_id)?
            .filter(|r| r.enabled)
            .ok_or(McpError::NotConnected { server_id })?;
        self.connect(record).await
    }

    /// Client for `server_id`, failing fast when absent or unhealthy.
    pub fn client(&self, server_id: i64) -> Result<Arc<RemoteToolClient>, McpError> {
        let servers = self
            .servers
            .read()
            .map_err(|_| McpError::NotConnected { server_id })?;
        let handle = servers
            .get(&server_id)
            .ok_or(McpError::NotConnected { server_id })?;
        if !handle.healthy.load(Ordering::SeqCst) {
            return Err(McpError::Unhealthy {
                name: handle.record.name.clone(),
            });
        }
        Ok(Arc::clone(&handle.client))
    }

    /// Row the connection was built from (for allow-list checks).
    pub fn record(&self, server_id: i64) -> Option<RemoteServerRecord> {
        self.servers
            .read()
            .ok()
            .and_then(|s| s.get(&server_id).map(|h| h.record.clone()))
    }

    /// Tools the server reported at handshake.
    pub fn tools(&self, server_id: i64) -> Vec<RemoteToolDefinition> {
        self.servers
            .read()
            .ok()
            .and_then(|s| s.get(&server_id).map(|h| h.tools.clone()))
            .unwrap_or_default()
    }

    pub fn is_connected(&self, server_id: i64) -> bool {
        self.servers
            .read()
            .map(|s| s.contains_key(&server_id))
            .unwrap_or(false)
    }

    pub fn connected_count(&self) -> usize {
        self.servers.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Probe one connected server now.
    pub async fn check_server(&self, server_id: i64) -> Result<HealthState, McpError> {
        let (client, healthy, url) = {
            let servers = self
                .servers
                .read()
                .map_err(|_| McpError::NotConnected { server_id })?;
            let handle = servers
                .get(&server_id)
                .ok_or(McpError::NotConnected { server_id })?;
            (
                Arc::clone(&handle.client),
                Arc::clone(&handle.healthy),
                handle.record.health_check_url.clone(),
            )
        };
        Ok(probe_once(&self.db, server_id, &client, &healthy, url.as_deref(), &self.root).await)
    }

    /// Every configured server with its stored health and connection state.
    pub fn status(&self) -> Result<Vec<ServerStatus>, McpError> {
        let records = self.db.list_remote_servers(true)?;
        let servers = self.servers.read().ok();
        Ok(records
            .into_iter()
            .map(|r| {
                let handle = servers.as_ref().and_then(|s| s.get(&r.id));
                ServerStatus {
                    id: r.id,
                    name: r.name,
                    enabled: r.enabled,
                    connected: handle.is_some(),
                    health: r.health.state,
                    tool_count: handle.map(|h| h.tools.len()).unwrap_or(0),
                    last_check_at: r.health.last_check_at,
                    last_error: r.health.last_error,
                }
            })
            .collect())
    }

    /// Stop every ticker and drop every client.
    pub fn shutdown(&self) {
        if let Ok(mut servers) = self.servers.write() {
            for (_, mut handle) in servers.drain() {
                handle.stop();
            }
        }
    }

    fn record_health(&self, id: i64, state: HealthState, error: Option<&str>) {
        if let Err(e) = self.db.update_server_health(id, state, error) {
            tracing::warn!(server_id = id, error = %e, "failed to record server health");
        }
    }
}

impl Drop for RemoteServerManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl Reloadable for RemoteServerManager {
    fn component(&self) -> &str {
        "remote_servers"
    }

    /// Reconnect rows that changed, drop rows that were removed or disabled.
    async fn reload(&self) -> Result<(), ConfigError> {
        let records = self
            .db
            .list_remote_servers(false)
            .map_err(|e| ConfigError::Reload {
                component: self.component().to_string(),
                reason: e.to_string(),
            })?;

        let current: HashMap<i64, i64> = self
            .servers
            .read()
            .map(|s| s.iter().map(|(id, h)| (*id, h.record.updated_at)).collect())
            .unwrap_or_default();

        for id in current.keys() {
            if !records.iter().any(|r| r.id == *id) {
                self.disconnect(*id);
            }
        }
        for record in records {
            if current.get(&record.id) == Some(&record.updated_at) {
                continue;
            }
            // failures are already logged and written to the store
            let _ = self.connect(record).await;
        }
        Ok(())
    }
}

// ─── Health ticker ───────────────────────────────────────────────────────────

async fn probe_once(
    db: &AssistantDatabase,
    server_id: i64,
    client: &RemoteToolClient,
    healthy: &AtomicBool,
    health_url: Option<&str>,
    token: &CancellationToken,
) -> HealthState {
    let (state, error) = match client.health(token, health_url).await {
        Ok(()) => (HealthState::Healthy, None),
        Err(e) => {
            tracing::warn!(server = client.server_name(), error = %e, "remote server health check failed");
            (HealthState::Unhealthy, Some(e.to_string()))
        }
    };
    let was_healthy = healthy.swap(state == HealthState::Healthy, Ordering::SeqCst);
    if was_healthy != (state == HealthState::Healthy) {
        tracing::info!(server = client.server_name(), state = %state, "remote server health changed");
    }
    if let Err(e) = db.update_server_health(server_id, state, error.as_deref()) {
        tracing::warn!(server_id, error = %e, "failed to record server health");
    }
    state
}

fn spawn_health_ticker(
    db: Arc<AssistantDatabase>,
    client: Arc<RemoteToolClient>,
    healthy: Arc<AtomicBool>,
    record: &RemoteServerRecord,
    token: CancellationToken,
) -> JoinHandle<()> {
    let server_id = record.id;
    let health_url = record.health_check_url.clone();
    let interval = Duration::from_secs(record.health_check_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the handshake just ran
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    probe_once(&db, server_id, &client, &healthy, health_url.as_deref(), &token).await;
                }
            }
        }
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
