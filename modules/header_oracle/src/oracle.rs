//! The header oracle: owns the header store, checkpoint guard and
//! disconnected pool as one unit, persists every mutation atomically and
//! answers queries about the best chain.

use std::sync::Arc;

use opentxs_common::{
    BlockHash, Checkpoint, Header, Height, OracleState, Position, Work,
};
use tracing::{error, info, warn};

use crate::{
    checkpoint::CheckpointGuard,
    disconnected_pool::DisconnectedPool,
    fork_choice::{AcceptResult, BatchResult, ChainChanges, ForkChoice},
    header_record::HeaderRecord,
    header_store::HeaderStore,
    oracle_error::OracleError,
    oracle_observer::HeaderOracleObserver,
    stores::{Store, SCHEMA_VERSION},
    sync_ingestor::{self, IngestResult, SyncBatch},
};

pub struct HeaderOracle {
    store: HeaderStore,
    guard: CheckpointGuard,
    pool: DisconnectedPool,
    backend: Arc<dyn Store>,
    observer: Box<dyn HeaderOracleObserver + Send + Sync>,
    state: OracleState,
    /// Changes made in memory whose write failed, reported once it succeeds
    withheld: Vec<ChainChanges>,
}

impl HeaderOracle {
    /// Load chain state from `backend`, or initialise it with `genesis`
    /// when the backend is empty.
    pub fn open(
        backend: Arc<dyn Store>,
        genesis: Header,
        genesis_work: Work,
        observer: Box<dyn HeaderOracleObserver + Send + Sync>,
    ) -> Result<Self, OracleError> {
        let stored = backend.load().map_err(OracleError::StorageFailure)?;

        let (store, guard, pool) = match stored.version {
            None if stored.records.is_empty() => {
                info!(genesis = %genesis.hash, "Initialising header chain state");
                let mut store = HeaderStore::new(genesis, genesis_work);
                store.batch().version = Some(SCHEMA_VERSION);
                (store, CheckpointGuard::default(), DisconnectedPool::default())
            }
            None => {
                return Err(OracleError::IncompatibleVersion {
                    expected: SCHEMA_VERSION,
                    found: 0,
                })
            }
            Some(found) if found != SCHEMA_VERSION => {
                return Err(OracleError::IncompatibleVersion {
                    expected: SCHEMA_VERSION,
                    found,
                })
            }
            Some(_) => {
                let stored_genesis = stored.records.iter().find(|r| r.header.height == 0);
                match stored_genesis {
                    Some(record) if record.header.hash == genesis.hash => {}
                    Some(record) => {
                        return Err(OracleError::GenesisMismatch {
                            configured: genesis.hash,
                            stored: record.header.hash,
                        })
                    }
                    None => return Err(OracleError::UnknownHeader { hash: genesis.hash }),
                }

                info!(
                    headers = stored.records.len(),
                    disconnected = stored.disconnected.len(),
                    "Restoring header chain state"
                );
                let store =
                    HeaderStore::restore(genesis.hash, stored.records, stored.best_chain)?;
                (
                    store,
                    CheckpointGuard::new(stored.checkpoint),
                    DisconnectedPool::restore(stored.disconnected),
                )
            }
        };

        let mut oracle = Self {
            store,
            guard,
            pool,
            backend,
            observer,
            state: OracleState::Available,
            withheld: Vec::new(),
        };

        let changes = ForkChoice::new(&mut oracle.store, &oracle.guard, &mut oracle.pool).recover()?;
        if let Some(reorg) = &changes.reorg {
            warn!(
                disconnected = reorg.disconnect.len(),
                connected = reorg.connect.len(),
                "Rebuilt best chain from stored headers"
            );
        }
        oracle.commit()?;

        info!(tip = %oracle.best_tip(), "Header oracle available");
        oracle.observer.state_changed(&oracle.state);
        Ok(oracle)
    }

    /// Stop accepting mutations. Reads keep working.
    pub fn shutdown(&mut self) -> Result<(), OracleError> {
        if self.state == OracleState::Stopped {
            return Ok(());
        }
        let result = self.commit();
        self.set_state(OracleState::Stopped);
        result
    }

    pub fn state(&self) -> &OracleState {
        &self.state
    }

    fn set_state(&mut self, state: OracleState) {
        if self.state != state {
            self.state = state;
            self.observer.state_changed(&self.state);
        }
    }

    fn ensure_available(&self) -> Result<(), OracleError> {
        match &self.state {
            OracleState::Available => Ok(()),
            OracleState::Degraded { reason } => Err(OracleError::Degraded {
                reason: reason.clone(),
            }),
            OracleState::Stopped => Err(OracleError::Stopped),
        }
    }

    /// Write the pending batch. A failed write leaves memory ahead of disk,
    /// so the oracle stops accepting mutations and keeps the batch for
    /// [`resume`](Self::resume).
    fn commit(&mut self) -> Result<(), OracleError> {
        let batch = self.store.take_batch();
        if batch.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.backend.write(&batch) {
            error!("Failed to persist header chain state: {e:#}");
            self.store.return_batch(batch);
            self.set_state(OracleState::Degraded {
                reason: e.to_string(),
            });
            return Err(OracleError::StorageFailure(e));
        }
        Ok(())
    }

    /// Persist, then report. Pending writes are committed even when the
    /// mutation itself failed part way.
    fn complete<T>(
        &mut self,
        result: Result<T, OracleError>,
        changes: impl FnOnce(&T) -> &ChainChanges,
    ) -> Result<T, OracleError> {
        if let Err(e) = self.commit() {
            if let Ok(value) = &result {
                self.withheld.push(changes(value).clone());
            }
            return Err(e);
        }
        let value = result?;
        self.report(changes(&value));
        Ok(value)
    }

    fn report(&self, changes: &ChainChanges) {
        for position in &changes.banned {
            self.observer.header_banned(position);
        }
        if let Some(reorg) = changes.reorg.as_ref().filter(|r| !r.is_empty()) {
            self.observer.reorg(reorg);
        }
    }

    /// Retry the write that degraded the oracle. On success mutations are
    /// accepted again and the withheld bans and reorgs are reported in
    /// order. A no-op while available.
    pub fn resume(&mut self) -> Result<(), OracleError> {
        match self.state {
            OracleState::Available => return Ok(()),
            OracleState::Stopped => return Err(OracleError::Stopped),
            OracleState::Degraded { .. } => {}
        }
        self.commit()?;

        info!(tip = %self.best_tip(), "Header chain state persisted, resuming");
        self.set_state(OracleState::Available);
        for changes in std::mem::take(&mut self.withheld) {
            self.report(&changes);
        }
        Ok(())
    }

    fn fork_choice(&mut self) -> ForkChoice<'_> {
        ForkChoice::new(&mut self.store, &self.guard, &mut self.pool)
    }

    /// Accept one header from a peer.
    pub fn accept(&mut self, header: Header) -> Result<AcceptResult, OracleError> {
        self.ensure_available()?;
        let result = self.fork_choice().accept(header);
        self.complete(result, |r| &r.changes)
    }

    /// Accept a peer's headers as one mutation with at most one reorg.
    pub fn accept_headers(&mut self, headers: Vec<Header>) -> Result<BatchResult, OracleError> {
        self.ensure_available()?;
        let result = self.fork_choice().accept_all(headers);
        self.complete(result, |r| &r.changes)
    }

    /// Apply a sync-server batch of `(hash, encoded header)` entries
    /// building on `prior_hash`.
    pub fn ingest(
        &mut self,
        prior_hash: BlockHash,
        entries: &[(BlockHash, Vec<u8>)],
    ) -> Result<IngestResult, OracleError> {
        self.ensure_available()?;
        let prior_height = self
            .store
            .get(&prior_hash)
            .filter(|r| r.is_connected())
            .map(|r| r.header.height);
        let batch = SyncBatch::decode(prior_hash, entries);
        let result = sync_ingestor::ingest(&mut self.fork_choice(), prior_height, batch);
        self.complete(result, |r| &r.changes)
    }

    /// Replace the active checkpoint and reclassify affected headers.
    pub fn set_checkpoint(&mut self, checkpoint: Checkpoint) -> Result<ChainChanges, OracleError> {
        self.ensure_available()?;
        CheckpointGuard::validate(&checkpoint, &self.store.genesis())?;
        if self.guard.get() == Some(&checkpoint) {
            return Ok(ChainChanges::default());
        }

        info!(
            height = checkpoint.height,
            hash = %checkpoint.block_hash,
            "Setting checkpoint"
        );
        let mut heights = self.guard.heights();
        self.guard.set(checkpoint.clone());
        heights.extend(self.guard.heights());
        heights.sort_unstable();
        heights.dedup();

        self.store.batch().set_checkpoint(Some(checkpoint));
        let result = self.fork_choice().reclassify(&heights);
        self.complete(result, |c| c)
    }

    /// Stop enforcing the checkpoint. Headers it banned stay banned.
    pub fn clear_checkpoint(&mut self) -> Result<ChainChanges, OracleError> {
        self.ensure_available()?;
        let heights = self.guard.heights();
        if self.guard.clear().is_none() {
            return Ok(ChainChanges::default());
        }

        info!("Clearing checkpoint");
        self.store.batch().set_checkpoint(None);
        let result = self.fork_choice().reclassify(&heights);
        self.complete(result, |c| c)
    }

    /// Reset the checkpoint status of one header, lifting its ban unless
    /// the active checkpoint still conflicts with it.
    pub fn remove_checkpoint_state(&mut self, hash: &BlockHash) -> Result<ChainChanges, OracleError> {
        self.ensure_available()?;
        info!(%hash, "Removing checkpoint state");
        let result = self.fork_choice().reset_status(hash);
        self.complete(result, |c| c)
    }

    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.guard.get()
    }

    pub fn best_tip(&self) -> Position {
        self.store.best_tip()
    }

    pub fn best_work(&self) -> Work {
        self.store.best_record().ok().and_then(|r| r.work.clone()).unwrap_or_default()
    }

    pub fn height_at(&self, height: Height) -> Option<BlockHash> {
        self.store.height_index(height)
    }

    pub fn header(&self, hash: &BlockHash) -> Option<&HeaderRecord> {
        self.store.get(hash)
    }

    pub fn is_in_best_chain(&self, position: &Position) -> bool {
        self.store.is_in_best_chain(position)
    }

    /// Best chain hashes from `start`, at most `limit` of them (0 for no
    /// limit).
    pub fn best_hashes(&self, start: Height, limit: usize) -> Vec<BlockHash> {
        let end = match limit {
            0 => self.store.best_len() as Height,
            _ => start.saturating_add(limit as Height),
        };
        (start..end).map_while(|height| self.store.height_index(height)).collect()
    }

    /// Up to `limit` best chain hashes, newest first.
    pub fn recent_hashes(&self, limit: usize) -> Vec<BlockHash> {
        let tip = self.store.best_tip().height;
        (0..=tip)
            .rev()
            .take(limit)
            .filter_map(|height| self.store.height_index(height))
            .collect()
    }

    /// Where `hash`'s branch leaves the best chain, and the current tip.
    pub fn common_parent(&self, hash: &BlockHash) -> Result<(Position, Position), OracleError> {
        let record = self.store.get(hash).ok_or(OracleError::UnknownHeader { hash: *hash })?;
        if !record.is_connected() {
            return Err(OracleError::UnknownHeader { hash: *hash });
        }
        Ok((self.store.fork_point(hash)?, self.store.best_tip()))
    }

    /// Tips of connected branches other than the best chain.
    pub fn siblings(&self) -> Vec<Position> {
        let tip = self.store.best_tip();
        let mut siblings: Vec<Position> = self
            .store
            .records()
            .filter(|r| r.is_connected() && r.header.hash != tip.hash)
            .filter(|r| self.store.children(&r.header.hash).next().is_none())
            .map(|r| r.position())
            .collect();
        siblings.sort();
        siblings
    }

    /// Chain from the common ancestor of `start` and `stop` up to `stop`.
    pub fn ancestors(&self, start: &BlockHash, stop: &BlockHash) -> Result<Vec<Position>, OracleError> {
        let ancestor = self.store.common_ancestor(start, stop)?;
        self.store.chain_between(&ancestor, stop)
    }

    /// Number of headers waiting for a parent.
    pub fn disconnected_count(&self) -> usize {
        self.pool.len()
    }

    pub fn header_count(&self) -> usize {
        self.store.len()
    }
}
