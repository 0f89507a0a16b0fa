//! 取件码分配。
//!
//! 候选码只经由存储的原子插入检验，并发分配不会发出重复的活跃取件码。

use thiserror::Error;
use tracing::{debug, error};

use crate::code::{CodeFormat, PickupCode};
use crate::session::{SessionStore, StoreError, TransferSession};

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("no free pickup code after {attempts} attempts")]
    Exhausted { attempts: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct CodeAllocator {
    format: CodeFormat,
    max_attempts: u32,
}

impl CodeAllocator {
    pub fn new(format: CodeFormat, max_attempts: u32) -> Self {
        Self {
            format,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn format(&self) -> &CodeFormat {
        &self.format
    }

    /// 随机抽取取件码并插入 `build(code)`，直到某次插入成功。
    pub async fn reserve<F>(
        &self,
        store: &dyn SessionStore,
        mut build: F,
    ) -> Result<TransferSession, AllocationError>
    where
        F: FnMut(PickupCode) -> TransferSession + Send,
    {
        for attempt in 1..=self.max_attempts {
            let candidate = self.format.generate(&mut rand::rng());
            let session = build(candidate);
            if store.create_if_absent(&session).await? {
                debug!(code = %session.code, attempt, "pickup code reserved");
                return Ok(session);
            }
            debug!(code = %session.code, attempt, "pickup code collision");
        }

        error!(
            attempts = self.max_attempts,
            capacity = %self.format.capacity(),
            code_length = self.format.length(),
            "pickup code space exhausted"
        );
        Err(AllocationError::Exhausted {
            attempts: self.max_attempts,
        })
    }
}
