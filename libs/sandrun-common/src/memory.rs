use crate::store::{RunStore, StoreError, StoreTransaction};
use crate::types::{BuildKey, BuildRecord, LogKey, LogRecord};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

/// Step at which a `MemoryRunStore` reports a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    CreateBuild,
    Begin,
    PutBuild,
    InsertLog,
    Commit,
}

#[derive(Default)]
struct MemoryState {
    builds: HashMap<BuildKey, BuildRecord>,
    logs: HashMap<BuildKey, (LogKey, LogRecord)>,
}

/// In-process run store
///
/// Used for local runs without Redis and as the test double for the
/// lifecycle logger. Clones share the same state. A fault point makes the
/// matching operation fail, which is how partial-commit behaviour is
/// exercised.
#[derive(Clone, Default)]
pub struct MemoryRunStore {
    state: Arc<Mutex<MemoryState>>,
    fault: Option<FaultPoint>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fault(fault: FaultPoint) -> Self {
        Self {
            fault: Some(fault),
            ..Self::default()
        }
    }

    pub fn build(&self, key: &BuildKey) -> Option<BuildRecord> {
        self.lock().builds.get(key).cloned()
    }

    pub fn log(&self, build: &BuildKey) -> Option<LogRecord> {
        self.lock().logs.get(build).map(|(_, log)| log.clone())
    }

    pub fn build_count(&self) -> usize {
        self.lock().builds.len()
    }

    pub fn log_count(&self) -> usize {
        self.lock().logs.len()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panicking test thread must not hide the records from later assertions
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self, point: FaultPoint) -> Result<(), StoreError> {
        if self.fault == Some(point) {
            return Err(StoreError::Unavailable(format!("injected fault at {:?}", point)));
        }
        Ok(())
    }
}

impl RunStore for MemoryRunStore {
    type Transaction = MemoryTransaction;

    async fn create_build(&self, build: &BuildRecord) -> Result<BuildKey, StoreError> {
        self.check(FaultPoint::CreateBuild)?;
        let key = BuildKey::new(Uuid::new_v4().to_string());
        let mut state = self.lock();
        if state.builds.contains_key(&key) {
            return Err(StoreError::KeyCollision(key.to_string()));
        }
        state.builds.insert(key.clone(), build.clone());
        Ok(key)
    }

    async fn begin(&self) -> Result<MemoryTransaction, StoreError> {
        self.check(FaultPoint::Begin)?;
        Ok(MemoryTransaction {
            store: self.clone(),
            builds: Vec::new(),
            logs: Vec::new(),
        })
    }
}

/// Writes buffered until commit, then applied under a single lock
pub struct MemoryTransaction {
    store: MemoryRunStore,
    builds: Vec<(BuildKey, BuildRecord)>,
    logs: Vec<(LogKey, LogRecord)>,
}

impl StoreTransaction for MemoryTransaction {
    async fn put_build(&mut self, key: &BuildKey, build: &BuildRecord) -> Result<(), StoreError> {
        self.store.check(FaultPoint::PutBuild)?;
        self.builds.push((key.clone(), build.clone()));
        Ok(())
    }

    async fn insert_log(&mut self, log: &LogRecord) -> Result<LogKey, StoreError> {
        self.store.check(FaultPoint::InsertLog)?;
        let key = LogKey::new(format!("log:{}", log.build));
        self.logs.push((key.clone(), log.clone()));
        Ok(key)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.store.check(FaultPoint::Commit)?;
        let mut state = self.store.lock();

        for (_, log) in &self.logs {
            if state.logs.contains_key(&log.build) {
                return Err(StoreError::Aborted(format!("log for build {} already exists", log.build)));
            }
        }

        for (key, build) in self.builds {
            state.builds.insert(key, build);
        }
        for (key, log) in self.logs {
            state.logs.insert(log.build.clone(), (key, log));
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        debug!(builds = self.builds.len(), logs = self.logs.len(), "Memory transaction discarded");
        Ok(())
    }
}
