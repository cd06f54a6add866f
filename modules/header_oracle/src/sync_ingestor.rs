//! Batches of headers delivered by a sync server.
//!
//! A batch is checked as a whole before any header in it is applied: every
//! entry must decode to the header it claims to be, and the headers must
//! form one chain hanging off the batch's prior hash.

use opentxs_common::{BlockHash, Header, Height};
use tracing::debug;

use crate::{
    fork_choice::{ChainChanges, ForkChoice},
    oracle_error::OracleError,
};

/// Decoded, internally consistent sync batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncBatch {
    pub prior_hash: BlockHash,
    pub headers: Vec<Header>,
}

impl SyncBatch {
    /// Decode `(hash, header bytes)` entries, checking each declared hash
    /// and the linkage between consecutive headers.
    pub fn decode(prior_hash: BlockHash, entries: &[(BlockHash, Vec<u8>)]) -> Result<Self, String> {
        let mut headers: Vec<Header> = Vec::with_capacity(entries.len());
        for (index, (declared, bytes)) in entries.iter().enumerate() {
            let header = Header::from_bytes(bytes).map_err(|e| format!("entry {index}: {e}"))?;
            if header.hash != *declared {
                return Err(format!(
                    "entry {index}: declared hash {declared} but header is {}",
                    header.hash
                ));
            }
            if header.hash == header.parent_hash || header.height == 0 {
                return Err(format!("entry {index}: header {} cannot follow any parent", header.hash));
            }
            if header.work.is_zero() {
                return Err(format!("entry {index}: header {} carries no work", header.hash));
            }

            match headers.last() {
                None if header.parent_hash != prior_hash => {
                    return Err(format!(
                        "first header {} does not build on prior hash {prior_hash}",
                        header.hash
                    ));
                }
                Some(previous) if header.parent_hash != previous.hash => {
                    return Err(format!(
                        "header {} does not build on {}",
                        header.hash, previous.hash
                    ));
                }
                Some(previous) if previous.height.checked_add(1) != Some(header.height) => {
                    return Err(format!(
                        "header {} at height {} follows height {}",
                        header.hash, header.height, previous.height
                    ));
                }
                _ => {}
            }
            headers.push(header);
        }

        Ok(Self {
            prior_hash,
            headers,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestStatus {
    /// Headers were connected to the chain
    Applied,
    /// Prior hash is not connected yet; headers are held until it is
    Queued,
    /// Batch failed validation; nothing was applied
    Inconsistent(String),
}

#[derive(Debug)]
pub struct IngestResult {
    pub status: IngestStatus,
    pub changes: ChainChanges,
    /// Headers that were new to the store
    pub accepted: usize,
}

impl IngestResult {
    fn inconsistent(reason: String) -> Self {
        Self {
            status: IngestStatus::Inconsistent(reason),
            changes: ChainChanges::default(),
            accepted: 0,
        }
    }
}

/// Apply one sync batch as a single mutation.
///
/// `prior_height` is the height of the batch's prior header when that
/// header is connected, `None` when it is unknown or itself disconnected.
pub fn ingest(
    fork_choice: &mut ForkChoice<'_>,
    prior_height: Option<Height>,
    batch: Result<SyncBatch, String>,
) -> Result<IngestResult, OracleError> {
    let batch = match batch {
        Ok(batch) => batch,
        Err(reason) => return Ok(IngestResult::inconsistent(reason)),
    };

    if let (Some(prior_height), Some(first)) = (prior_height, batch.headers.first()) {
        if prior_height.checked_add(1) != Some(first.height) {
            return Ok(IngestResult::inconsistent(format!(
                "first header at height {} does not follow prior height {prior_height}",
                first.height
            )));
        }
    }

    let prior_hash = batch.prior_hash;
    let count = batch.headers.len();
    let result = fork_choice.accept_all(batch.headers)?;

    let mut accepted = 0;
    for outcome in result.outcomes {
        if outcome?.is_new() {
            accepted += 1;
        }
    }

    let status = match prior_height {
        Some(_) => IngestStatus::Applied,
        None => IngestStatus::Queued,
    };
    debug!(prior = %prior_hash, count, accepted, ?status, "Ingested sync batch");
    Ok(IngestResult {
        status,
        changes: result.changes,
        accepted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        checkpoint::CheckpointGuard, disconnected_pool::DisconnectedPool,
        header_store::HeaderStore,
    };
    use opentxs_common::{Position, Reorg, Work};

    fn hash(n: u8) -> BlockHash {
        let mut bytes = [0u8; 32];
        bytes[0] = n;
        BlockHash::from(bytes)
    }

    fn header(n: u8, parent: u8, height: Height) -> Header {
        Header {
            hash: hash(n),
            parent_hash: hash(parent),
            height,
            work: Work::from(1),
            timestamp: 0,
        }
    }

    fn entry(header: &Header) -> (BlockHash, Vec<u8>) {
        (header.hash, header.to_bytes())
    }

    struct Chain {
        store: HeaderStore,
        guard: CheckpointGuard,
        pool: DisconnectedPool,
    }

    impl Chain {
        fn new() -> Self {
            Self {
                store: HeaderStore::new(header(1, 0, 0), Work::from(1)),
                guard: CheckpointGuard::default(),
                pool: DisconnectedPool::default(),
            }
        }

        fn ingest(&mut self, prior: u8, headers: &[Header]) -> IngestResult {
            let entries: Vec<_> = headers.iter().map(entry).collect();
            let prior_height = self
                .store
                .get(&hash(prior))
                .filter(|r| r.is_connected())
                .map(|r| r.header.height);
            let batch = SyncBatch::decode(hash(prior), &entries);
            let mut fork_choice = ForkChoice::new(&mut self.store, &self.guard, &mut self.pool);
            ingest(&mut fork_choice, prior_height, batch).unwrap()
        }
    }

    #[test]
    fn linked_batch_is_applied_with_one_reorg() {
        let mut chain = Chain::new();
        let result = chain.ingest(1, &[header(2, 1, 1), header(3, 2, 2), header(4, 3, 3)]);

        assert_eq!(result.status, IngestStatus::Applied);
        assert_eq!(result.accepted, 3);
        assert_eq!(
            result.changes.reorg,
            Some(Reorg {
                disconnect: vec![],
                connect: vec![
                    Position::new(1, hash(2)),
                    Position::new(2, hash(3)),
                    Position::new(3, hash(4)),
                ],
            })
        );
        assert_eq!(chain.store.best_tip(), Position::new(3, hash(4)));
    }

    #[test]
    fn mismatched_declared_hash_rejects_whole_batch() {
        let mut chain = Chain::new();
        let mut entries = vec![entry(&header(2, 1, 1)), entry(&header(3, 2, 2))];
        entries[1].0 = hash(9);

        let batch = SyncBatch::decode(hash(1), &entries);
        assert!(batch.is_err());

        let mut fork_choice = ForkChoice::new(&mut chain.store, &chain.guard, &mut chain.pool);
        let result = ingest(&mut fork_choice, Some(0), batch).unwrap();
        assert!(matches!(result.status, IngestStatus::Inconsistent(_)));
        assert!(!chain.store.contains(&hash(2)));
    }

    #[test]
    fn broken_linkage_rejects_whole_batch() {
        let mut chain = Chain::new();
        let result = chain.ingest(1, &[header(2, 1, 1), header(4, 3, 2)]);
        assert!(matches!(result.status, IngestStatus::Inconsistent(_)));
        assert_eq!(result.accepted, 0);
        assert!(!chain.store.contains(&hash(2)));

        let result = chain.ingest(1, &[header(2, 7, 1)]);
        assert!(matches!(result.status, IngestStatus::Inconsistent(_)));
    }

    #[test]
    fn height_gap_after_prior_rejects_batch() {
        let mut chain = Chain::new();
        let result = chain.ingest(1, &[header(2, 1, 5), header(3, 2, 6)]);
        assert!(matches!(result.status, IngestStatus::Inconsistent(_)));
        assert_eq!(chain.store.len(), 1);
    }

    #[test]
    fn height_at_numeric_limit_rejects_batch() {
        let mut chain = Chain::new();
        let result = chain.ingest(1, &[header(2, 1, u64::MAX), header(3, 2, 5)]);
        assert!(matches!(result.status, IngestStatus::Inconsistent(_)));
        assert_eq!(result.accepted, 0);
        assert!(!chain.store.contains(&hash(2)));
    }

    #[test]
    fn garbage_bytes_reject_batch() {
        let entries = vec![(hash(2), vec![0xff, 0x01])];
        assert!(SyncBatch::decode(hash(1), &entries).is_err());
    }

    #[test]
    fn unknown_prior_queues_batch_until_it_connects() {
        let mut chain = Chain::new();
        let result = chain.ingest(3, &[header(4, 3, 3), header(5, 4, 4)]);
        assert_eq!(result.status, IngestStatus::Queued);
        assert_eq!(result.accepted, 2);
        assert!(result.changes.reorg.is_none());
        assert_eq!(chain.pool.len(), 2);

        let result = chain.ingest(1, &[header(2, 1, 1), header(3, 2, 2)]);
        assert_eq!(result.status, IngestStatus::Applied);
        assert_eq!(chain.store.best_tip(), Position::new(4, hash(5)));
        assert_eq!(result.changes.reorg.unwrap().connect.len(), 4);
        assert!(chain.pool.is_empty());
    }

    #[test]
    fn replayed_batch_changes_nothing() {
        let mut chain = Chain::new();
        let headers = [header(2, 1, 1), header(3, 2, 2)];
        chain.ingest(1, &headers);
        let result = chain.ingest(1, &headers);
        assert_eq!(result.status, IngestStatus::Applied);
        assert_eq!(result.accepted, 0);
        assert!(result.changes.reorg.is_none());
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let mut chain = Chain::new();
        let result = chain.ingest(1, &[]);
        assert_eq!(result.status, IngestStatus::Applied);
        assert_eq!(result.changes, crate::fork_choice::ChainChanges::default());
    }
}
