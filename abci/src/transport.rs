//! In-process consensus transport.
//!
//! `LocalTransport` stands in for the consensus layer when every participant
//! runs in the same process: payloads land in a shared mempool, and
//! [`LocalTransport::next_block`] cuts the mempool into one ordered block that
//! is then delivered to every replica.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::trace;

use crate::app::Block;
use crate::behaviour::{ConsensusTransport, ExternalCallError};
use crate::payload::Payload;

#[derive(Debug, Clone, Default)]
pub struct LocalTransport {
    mempool: Arc<Mutex<Vec<Payload>>>,
    height: Arc<AtomicU64>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn mempool(&self) -> MutexGuard<'_, Vec<Payload>> {
        self.mempool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Payloads waiting for the next block
    pub fn pending(&self) -> usize {
        self.mempool().len()
    }

    /// Height of the last block produced
    pub fn height(&self) -> u64 {
        self.height.load(Ordering::SeqCst)
    }

    /// Drain the mempool, in submission order, into the next block
    pub fn next_block(&self, timestamp: DateTime<Utc>) -> Block {
        let payloads = std::mem::take(&mut *self.mempool());
        let height = self.height.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(height, payloads = payloads.len(), "Block produced");
        Block {
            height,
            timestamp,
            payloads,
        }
    }
}

#[async_trait]
impl ConsensusTransport for LocalTransport {
    async fn submit(&self, payload: Payload) -> Result<(), ExternalCallError> {
        self.mempool().push(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_tools::timestamp;
    use serde_json::json;

    #[tokio::test]
    async fn test_blocks_preserve_submission_order() {
        let transport = LocalTransport::new();
        for sender in ["agent_2", "agent_0", "agent_1"] {
            transport
                .submit(Payload::new("collect", sender, json!(1)))
                .await
                .unwrap();
        }

        let block = transport.next_block(timestamp(1));
        let senders: Vec<_> = block.payloads.iter().map(|p| p.sender().to_string()).collect();
        assert_eq!(senders, vec!["agent_2", "agent_0", "agent_1"]);
        assert_eq!(block.height, 1);
        assert_eq!(transport.pending(), 0);

        let empty = transport.next_block(timestamp(2));
        assert!(empty.payloads.is_empty());
        assert_eq!(transport.height(), 2);
    }
}
