//! Run Lifecycle Logger
//!
//! **Responsibility:**
//! Persist a build record when a run starts and, when it ends, update that
//! record and insert its log record in one transaction.
//!
//! The store is injected once at construction and reused for every call.
//! A `BuildHandle` is consumed by `complete_run`, so a build cannot be
//! completed twice from the same process.

use chrono::Utc;
use sandrun_common::store::{RunStore, StoreError, StoreTransaction};
use sandrun_common::types::{
    BuildKey, BuildRecord, ExitOutcome, LogKey, LogRecord, ResourceUsage, RunTranscripts,
};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("failed to record build start: {0}")]
    Begin(#[source] StoreError),

    #[error("failed to record completion of build {key}: {source}")]
    Complete {
        key: BuildKey,
        #[source]
        source: StoreError,
    },
}

/// A started build, waiting for its completion to be recorded
#[derive(Debug)]
pub struct BuildHandle {
    key: BuildKey,
    record: BuildRecord,
}

impl BuildHandle {
    pub fn key(&self) -> &BuildKey {
        &self.key
    }
}

#[derive(Debug)]
pub struct CompletedRun {
    pub key: BuildKey,
    pub record: BuildRecord,
    pub log_key: LogKey,
}

pub struct RunLifecycle<S> {
    store: S,
}

impl<S: RunStore> RunLifecycle<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[tracing::instrument(skip(self))]
    pub async fn begin_run(
        &self,
        challenge: &str,
        commit: &str,
        user: &str,
    ) -> Result<BuildHandle, LifecycleError> {
        let record = BuildRecord::started(challenge, user, commit);
        let key = self
            .store
            .create_build(&record)
            .await
            .map_err(LifecycleError::Begin)?;

        info!(build = %key, "Build started");
        Ok(BuildHandle { key, record })
    }

    /// Record the end of a run
    ///
    /// Any failure inside the transaction rolls it back; neither the status
    /// change nor the log record becomes visible.
    #[tracing::instrument(skip_all, fields(build = %handle.key, exit = %exit))]
    pub async fn complete_run(
        &self,
        handle: BuildHandle,
        transcripts: RunTranscripts,
        exit: &ExitOutcome,
        usage: ResourceUsage,
    ) -> Result<CompletedRun, LifecycleError> {
        let BuildHandle { key, mut record } = handle;
        record.finish(exit, Utc::now());
        let log = transcripts.into_log_record(key.clone(), usage);

        let failed = |source| LifecycleError::Complete {
            key: key.clone(),
            source,
        };

        let mut tx = self.store.begin().await.map_err(failed)?;
        let log_key = match stage(&mut tx, &key, &record, &log).await {
            Ok(log_key) => log_key,
            Err(source) => {
                if let Err(e) = tx.rollback().await {
                    error!(error = %e, "Rollback failed");
                }
                return Err(failed(source));
            }
        };
        tx.commit().await.map_err(failed)?;

        info!(
            status = %record.status,
            cpu_time_ms = usage.cpu_time().as_millis() as u64,
            out_bytes = log.out_log.len(),
            "Build completed"
        );

        Ok(CompletedRun {
            key,
            record,
            log_key,
        })
    }
}

async fn stage<T: StoreTransaction>(
    tx: &mut T,
    key: &BuildKey,
    record: &BuildRecord,
    log: &LogRecord,
) -> Result<LogKey, StoreError> {
    tx.put_build(key, record).await?;
    tx.insert_log(log).await
}
