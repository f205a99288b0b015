use crate::store::{RunStore, StoreError, StoreTransaction};
use crate::types::{BuildKey, BuildRecord, LogKey, LogRecord};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script, ScriptInvocation};
use tracing::debug;
use uuid::Uuid;

/// Redis key layout - builds and logs live under one configurable prefix
/// so several deployments can share a server without colliding.
pub const DEFAULT_KEY_PREFIX: &str = "sandrun";

/// Key holding the JSON-encoded BuildRecord
pub fn build_key(prefix: &str, key: &BuildKey) -> String {
    format!("{}:build:{}", prefix, key)
}

/// Key holding the JSON-encoded LogRecord of a build
/// Derived from the parent so a build can never own two logs
pub fn log_key(prefix: &str, build: &BuildKey) -> String {
    format!("{}:log:{}", prefix, build)
}

/// Redis-backed run store
///
/// Builds get a fresh UUID key written with SET NX. Completion stages both
/// writes and applies them with one Lua script, so Redis writes them
/// together or not at all, and an existing log record is never replaced. Credentials travel in the connection URL
/// (`redis://:password@host:6379`).
#[derive(Clone)]
pub struct RedisRunStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisRunStore {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self::new(conn, prefix))
    }

    pub async fn get_build(&self, key: &BuildKey) -> Result<Option<BuildRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(build_key(&self.prefix, key)).await?;
        payload
            .map(|data| serde_json::from_str(&data).map_err(StoreError::from))
            .transpose()
    }

    pub async fn get_log(&self, build: &BuildKey) -> Result<Option<LogRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(log_key(&self.prefix, build)).await?;
        payload
            .map(|data| serde_json::from_str(&data).map_err(StoreError::from))
            .transpose()
    }
}

impl RunStore for RedisRunStore {
    type Transaction = RedisTransaction;

    async fn create_build(&self, build: &BuildRecord) -> Result<BuildKey, StoreError> {
        let key = BuildKey::new(Uuid::new_v4().to_string());
        let payload = serde_json::to_string(build)?;

        let mut conn = self.conn.clone();
        let created: bool = conn.set_nx(build_key(&self.prefix, &key), payload).await?;
        if !created {
            return Err(StoreError::KeyCollision(key.to_string()));
        }

        Ok(key)
    }

    async fn begin(&self) -> Result<RedisTransaction, StoreError> {
        Ok(RedisTransaction {
            conn: self.conn.clone(),
            prefix: self.prefix.clone(),
            staged: StagedWrites::default(),
        })
    }
}

/// Applies a completion in one server-side step: every log key must be
/// absent, otherwise nothing is written and 0 is returned.
///
/// KEYS = log keys, then build keys. ARGV[1] = number of log keys, then one
/// payload per key in the same order.
const COMMIT_SCRIPT: &str = r#"
local logs = tonumber(ARGV[1])
for i = 1, logs do
  if redis.call('EXISTS', KEYS[i]) == 1 then
    return 0
  end
end
for i = 1, #KEYS do
  redis.call('SET', KEYS[i], ARGV[i + 1])
end
return #KEYS
"#;

/// Writes buffered client-side until commit
#[derive(Debug, Default)]
struct StagedWrites {
    logs: Vec<(String, String)>,
    builds: Vec<(String, String)>,
}

impl StagedWrites {
    fn len(&self) -> usize {
        self.logs.len() + self.builds.len()
    }

    fn keys(&self) -> Vec<&str> {
        self.logs
            .iter()
            .chain(self.builds.iter())
            .map(|(key, _)| key.as_str())
            .collect()
    }

    fn args(&self) -> Vec<String> {
        std::iter::once(self.logs.len().to_string())
            .chain(self.logs.iter().chain(self.builds.iter()).map(|(_, payload)| payload.clone()))
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn apply(&self, invocation: &mut ScriptInvocation<'_>) {
        for key in self.keys() {
            invocation.key(key);
        }
        for arg in self.args() {
            invocation.arg(arg);
        }
    }
}

/// Build and log writes of one completion; log inserts never overwrite
pub struct RedisTransaction {
    conn: ConnectionManager,
    prefix: String,
    staged: StagedWrites,
}

impl StoreTransaction for RedisTransaction {
    async fn put_build(&mut self, key: &BuildKey, build: &BuildRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_string(build)?;
        self.staged.builds.push((build_key(&self.prefix, key), payload));
        Ok(())
    }

    async fn insert_log(&mut self, log: &LogRecord) -> Result<LogKey, StoreError> {
        let payload = serde_json::to_string(log)?;
        let key = log_key(&self.prefix, &log.build);
        self.staged.logs.push((key.clone(), payload));
        Ok(LogKey::new(key))
    }

    async fn commit(self) -> Result<(), StoreError> {
        let RedisTransaction { mut conn, staged, .. } = self;
        if staged.is_empty() {
            return Ok(());
        }

        let script = Script::new(COMMIT_SCRIPT);
        let mut invocation = script.prepare_invoke();
        staged.apply(&mut invocation);
        let written: usize = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Aborted(e.to_string()))?;
        if written == 0 {
            let existing = staged.logs.first().map(|(key, _)| key.as_str()).unwrap_or_default();
            return Err(StoreError::Aborted(format!("log {} already exists", existing)));
        }

        debug!(writes = written, "Redis transaction committed");
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        // Nothing reached the server yet
        debug!(writes = self.staged.len(), "Redis transaction discarded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExitOutcome, ResourceUsage, RunTranscripts};

    #[test]
    fn test_build_key_format() {
        let key = BuildKey::new("abc");
        assert_eq!(build_key("sandrun", &key), "sandrun:build:abc");
        assert_eq!(build_key("staging", &key), "staging:build:abc");
    }

    #[test]
    fn test_log_key_derived_from_build() {
        let key = BuildKey::new(Uuid::new_v4().to_string());
        let log = log_key(DEFAULT_KEY_PREFIX, &key);
        assert!(log.starts_with("sandrun:log:"));
        assert!(log.ends_with(key.as_str()));
        assert_eq!(log, log_key(DEFAULT_KEY_PREFIX, &key));
    }

    #[test]
    fn test_staged_logs_lead_the_script_keys() {
        let mut staged = StagedWrites::default();
        staged.builds.push(("sandrun:build:1".to_string(), "{\"b\":1}".to_string()));
        staged.logs.push(("sandrun:log:1".to_string(), "{\"l\":1}".to_string()));

        assert_eq!(staged.len(), 2);
        assert_eq!(staged.keys(), vec!["sandrun:log:1", "sandrun:build:1"]);
        assert_eq!(staged.args(), vec!["1", "{\"l\":1}", "{\"b\":1}"]);
    }

    #[test]
    fn test_staged_without_logs_has_zero_guarded_keys() {
        let mut staged = StagedWrites::default();
        assert!(staged.is_empty());
        staged.builds.push(("sandrun:build:1".to_string(), "{}".to_string()));
        assert_eq!(staged.args(), vec!["0", "{}"]);
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_url() {
        let result = RedisRunStore::connect("not a redis url", DEFAULT_KEY_PREFIX).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis instance
    async fn test_second_log_insert_is_rejected() {
        let store = RedisRunStore::connect("redis://127.0.0.1:6379", "sandrun-test")
            .await
            .expect("Failed to connect to Redis");

        let build = BuildRecord::started("challenge", "user", "commit");
        let key = store.create_build(&build).await.unwrap();
        let first = RunTranscripts {
            out_log: b"first".to_vec(),
            ..RunTranscripts::default()
        }
        .into_log_record(key.clone(), ResourceUsage::default());

        let mut tx = store.begin().await.unwrap();
        tx.insert_log(&first).await.unwrap();
        tx.commit().await.unwrap();

        let mut finished = build.clone();
        finished.finish(&ExitOutcome::Success, chrono::Utc::now());
        let second = RunTranscripts::default().into_log_record(key.clone(), ResourceUsage::default());
        let mut tx = store.begin().await.unwrap();
        tx.put_build(&key, &finished).await.unwrap();
        tx.insert_log(&second).await.unwrap();
        let result = tx.commit().await;

        assert!(matches!(result, Err(StoreError::Aborted(_))));
        assert_eq!(store.get_build(&key).await.unwrap(), Some(build));
        assert_eq!(store.get_log(&key).await.unwrap(), Some(first));
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis instance
    async fn test_create_and_complete_roundtrip() {
        let store = RedisRunStore::connect("redis://127.0.0.1:6379", "sandrun-test")
            .await
            .expect("Failed to connect to Redis");

        let mut build = BuildRecord::started("challenge", "user", "commit");
        let key = store.create_build(&build).await.unwrap();
        assert_eq!(store.get_build(&key).await.unwrap(), Some(build.clone()));

        build.finish(&ExitOutcome::Success, chrono::Utc::now());
        let log = RunTranscripts::default().into_log_record(key.clone(), ResourceUsage::default());

        let mut tx = store.begin().await.unwrap();
        tx.put_build(&key, &build).await.unwrap();
        tx.insert_log(&log).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.get_build(&key).await.unwrap(), Some(build));
        assert_eq!(store.get_log(&key).await.unwrap(), Some(log));
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis instance
    async fn test_rollback_leaves_build_started() {
        let store = RedisRunStore::connect("redis://127.0.0.1:6379", "sandrun-test")
            .await
            .expect("Failed to connect to Redis");

        let build = BuildRecord::started("challenge", "user", "commit");
        let key = store.create_build(&build).await.unwrap();

        let mut finished = build.clone();
        finished.finish(&ExitOutcome::Success, chrono::Utc::now());
        let mut tx = store.begin().await.unwrap();
        tx.put_build(&key, &finished).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.get_build(&key).await.unwrap(), Some(build));
        assert_eq!(store.get_log(&key).await.unwrap(), None);
    }
}
