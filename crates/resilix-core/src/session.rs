use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio::sync::RwLock;
use tracing::warn;

use crate::config::Config;
use crate::types::IncidentState;

/// Query parameters the postgres driver does not accept in a connection
/// string; stripped before the URL is parsed.
const UNSUPPORTED_DB_QUERY_KEYS: &[&str] = &["sslmode", "channel_binding"];

// ── Store contract ───────────────────────────────────────────────────────

/// Durable keyed mapping `incident_id → state record`. Writes are always
/// whole-record; the store provides no cross-request locking.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn init(&self) -> Result<()>;
    async fn save(&self, session_id: &str, state: &IncidentState) -> Result<()>;
    async fn get(&self, session_id: &str) -> Result<Option<IncidentState>>;
    async fn list_items(&self) -> Result<Vec<(String, IncidentState)>>;
}

// ── In-memory store ──────────────────────────────────────────────────────

/// Process-local store; not durable across restarts.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, IncidentState>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn save(&self, session_id: &str, state: &IncidentState) -> Result<()> {
        // Clone is a deep copy; in-flight mutation can't bleed across reads.
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), state.clone());
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<IncidentState>> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn list_items(&self) -> Result<Vec<(String, IncidentState)>> {
        Ok(self
            .sessions
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

// ── Postgres store ───────────────────────────────────────────────────────

pub struct PostgresSessionStore {
    pool: Pool,
}

/// Strip connection-string query parameters the driver rejects
/// (managed-postgres URLs routinely carry `sslmode` / `channel_binding`).
pub fn normalize_database_url(url: &str) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or("").to_lowercase();
            !UNSUPPORTED_DB_QUERY_KEYS.contains(&key.as_str())
        })
        .collect();
    if kept.is_empty() {
        base.to_string()
    } else {
        format!("{}?{}", base, kept.join("&"))
    }
}

impl PostgresSessionStore {
    pub fn connect(database_url: &str) -> Result<Self> {
        let normalized = normalize_database_url(database_url);
        let pg_config = tokio_postgres::Config::from_str(&normalized)
            .context("failed to parse DATABASE_URL")?;
        let manager = Manager::from_config(
            pg_config,
            tokio_postgres::NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(8)
            .build()
            .context("failed to build postgres pool")?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl SessionStore for PostgresSessionStore {
    async fn init(&self) -> Result<()> {
        let client = self.pool.get().await.context("postgres pool get")?;
        client
            .execute(
                "CREATE TABLE IF NOT EXISTS resilix_sessions ( \
                 session_id TEXT PRIMARY KEY, \
                 state JSONB NOT NULL, \
                 updated_at TIMESTAMPTZ NOT NULL DEFAULT now())",
                &[],
            )
            .await
            .context("create resilix_sessions")?;
        Ok(())
    }

    async fn save(&self, session_id: &str, state: &IncidentState) -> Result<()> {
        let payload = serde_json::to_value(state).context("serialize incident state")?;
        let client = self.pool.get().await.context("postgres pool get")?;
        client
            .execute(
                "INSERT INTO resilix_sessions (session_id, state, updated_at) \
                 VALUES ($1, $2, now()) \
                 ON CONFLICT (session_id) DO UPDATE SET \
                   state = excluded.state, \
                   updated_at = now()",
                &[&session_id, &payload],
            )
            .await
            .context("save session")?;
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<IncidentState>> {
        let client = self.pool.get().await.context("postgres pool get")?;
        let row = client
            .query_opt(
                "SELECT state FROM resilix_sessions WHERE session_id = $1",
                &[&session_id],
            )
            .await
            .context("get session")?;
        match row {
            None => Ok(None),
            Some(row) => {
                let value: serde_json::Value = row.get(0);
                let state =
                    serde_json::from_value(value).context("deserialize incident state")?;
                Ok(Some(state))
            }
        }
    }

    async fn list_items(&self) -> Result<Vec<(String, IncidentState)>> {
        let client = self.pool.get().await.context("postgres pool get")?;
        let rows = client
            .query("SELECT session_id, state FROM resilix_sessions", &[])
            .await
            .context("list sessions")?;
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get(0);
            let value: serde_json::Value = row.get(1);
            match serde_json::from_value(value) {
                Ok(state) => items.push((id, state)),
                Err(e) => warn!("skipping undecodable session {id}: {e}"),
            }
        }
        Ok(items)
    }
}

// ── Startup protocol ─────────────────────────────────────────────────────

/// Resolve and initialize the configured store. A database backend that
/// fails init falls back to memory once; anything else failing is fatal.
/// Unknown backend names fail startup rather than guessing.
pub async fn ensure_session_store(config: &Config) -> Result<Arc<dyn SessionStore>> {
    match config.adk_session_backend.trim().to_lowercase().as_str() {
        "in_memory" => {
            let store = Arc::new(MemorySessionStore::new());
            store.init().await?;
            Ok(store)
        }
        "database" => {
            if config.database_url.is_empty() {
                bail!("ADK_SESSION_BACKEND=database requires DATABASE_URL");
            }
            let attempt = async {
                let store = PostgresSessionStore::connect(&config.database_url)?;
                store.init().await?;
                Ok::<_, anyhow::Error>(store)
            };
            match attempt.await {
                Ok(store) => Ok(Arc::new(store)),
                Err(e) => {
                    warn!("database session store init failed; falling back to in-memory: {e:#}");
                    let store = Arc::new(MemorySessionStore::new());
                    store.init().await?;
                    Ok(store)
                }
            }
        }
        other => bail!("unknown session backend {other:?} (expected in_memory or database)"),
    }
}
