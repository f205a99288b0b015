//! Completion Barrier - one per run
//!
//! Counts relay completions. Each relay owns a `CompletionSignal` token;
//! the token signals exactly once, when it is consumed or dropped, so a
//! relay that errors out or panics still releases the barrier.

use std::sync::Arc;
use tokio::sync::Semaphore;

pub struct CompletionBarrier {
    expected: u32,
    permits: Arc<Semaphore>,
}

impl CompletionBarrier {
    pub fn new(expected: u32) -> Self {
        Self {
            expected,
            permits: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    /// Hand out a single-use completion token
    pub fn signal(&self) -> CompletionSignal {
        CompletionSignal {
            permits: Arc::clone(&self.permits),
        }
    }

    /// Block until `expected` tokens have signaled
    pub async fn wait(&self) {
        // The semaphore is never closed, so acquisition only fails if it were
        if let Ok(permits) = self.permits.acquire_many(self.expected).await {
            permits.forget();
        }
    }
}

pub struct CompletionSignal {
    permits: Arc<Semaphore>,
}

impl CompletionSignal {
    pub fn complete(self) {}
}

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        self.permits.add_permits(1);
    }
}
