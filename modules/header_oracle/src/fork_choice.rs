//! Header acceptance and best chain selection.
//!
//! [`ForkChoice`] borrows the header store, checkpoint guard and
//! disconnected pool for the duration of one mutation. Every mutation
//! produces at most one reorg, from the tip before the call to the tip
//! after it.

use std::{cmp::Ordering, collections::VecDeque};

use opentxs_common::{BlockHash, Header, HeaderStatus, Height, Position, Reorg, Work};
use tracing::{debug, warn};

use crate::{
    checkpoint::CheckpointGuard,
    disconnected_pool::DisconnectedPool,
    header_record::HeaderRecord,
    header_store::HeaderStore,
    oracle_error::OracleError,
    work_accumulator::{accumulate, compare, outranks},
};

/// What happened to one submitted header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Already known; nothing changed
    Duplicate,
    /// Parent unknown; held until it arrives
    Disconnected,
    /// Connected, but conflicts with the checkpoint
    Banned,
    Accepted,
}

impl AcceptOutcome {
    /// Whether the header was stored by this call
    pub fn is_new(self) -> bool {
        self != AcceptOutcome::Duplicate
    }
}

/// Chain changes caused by one mutation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChainChanges {
    /// Best chain switch, if the tip moved
    pub reorg: Option<Reorg>,

    /// Every header connected by the call, including reconnected orphans
    pub connected: Vec<Position>,

    /// Headers that became banned
    pub banned: Vec<Position>,
}

#[derive(Debug)]
pub struct AcceptResult {
    pub outcome: AcceptOutcome,
    pub changes: ChainChanges,
}

/// Result of accepting several headers as one mutation.
#[derive(Debug)]
pub struct BatchResult {
    /// One entry per submitted header, in submission order
    pub outcomes: Vec<Result<AcceptOutcome, OracleError>>,
    pub changes: ChainChanges,
}

/// Running state of one mutation.
#[derive(Default)]
struct Progress {
    /// Strongest candidate connected so far that beats the tip
    best: Option<(BlockHash, Work)>,
    connected: Vec<Position>,
    banned: Vec<Position>,
}

impl Progress {
    fn note(&mut self, record: &HeaderRecord, tip_work: &Work) {
        let position = record.position();
        self.connected.push(position);

        if record.status == HeaderStatus::CheckpointBanned {
            self.banned.push(position);
            return;
        }
        if !record.is_candidate() {
            return;
        }
        let Some(work) = &record.work else {
            return;
        };

        // Later connections always have later sequence numbers, so only
        // strictly more work can displace the running best
        let running = self.best.as_ref().map(|(_, work)| work).unwrap_or(tip_work);
        if compare(work, running) == Ordering::Greater {
            self.best = Some((position.hash, work.clone()));
        }
    }
}

pub struct ForkChoice<'a> {
    store: &'a mut HeaderStore,
    guard: &'a CheckpointGuard,
    pool: &'a mut DisconnectedPool,
}

impl<'a> ForkChoice<'a> {
    pub fn new(
        store: &'a mut HeaderStore,
        guard: &'a CheckpointGuard,
        pool: &'a mut DisconnectedPool,
    ) -> Self {
        Self { store, guard, pool }
    }

    /// Accept one header and update the best chain.
    ///
    /// Invalid headers are rejected before anything is stored.
    pub fn accept(&mut self, header: Header) -> Result<AcceptResult, OracleError> {
        let mut progress = Progress::default();
        let outcome = self.submit(header, &mut progress)?;
        let changes = self.finish(progress)?;
        Ok(AcceptResult { outcome, changes })
    }

    /// Accept headers in order, reporting a single reorg for the whole set.
    /// An invalid header is reported in its outcome and does not stop the
    /// rest.
    pub fn accept_all(&mut self, headers: Vec<Header>) -> Result<BatchResult, OracleError> {
        let mut progress = Progress::default();
        let outcomes = headers.into_iter().map(|header| self.submit(header, &mut progress)).collect();
        let changes = self.finish(progress)?;
        Ok(BatchResult { outcomes, changes })
    }

    fn submit(
        &mut self,
        header: Header,
        progress: &mut Progress,
    ) -> Result<AcceptOutcome, OracleError> {
        let hash = header.hash;
        if self.store.contains(&hash) {
            debug!(%hash, "Duplicate header");
            return Ok(AcceptOutcome::Duplicate);
        }
        if header.work.is_zero() {
            return Err(OracleError::invalid(hash, "header carries no work"));
        }

        let parent = self
            .store
            .get(&header.parent_hash)
            .and_then(|p| p.work.clone().map(|work| (p.header.height, work, p.status)));
        let Some((parent_height, parent_work, parent_status)) = parent else {
            let parent_hash = header.parent_hash;
            self.store.put(HeaderRecord::disconnected(header))?;
            self.pool.hold(parent_hash, hash);
            self.store.batch().hold_disconnected(parent_hash, hash);
            debug!(%hash, parent = %parent_hash, "Holding disconnected header");
            return Ok(AcceptOutcome::Disconnected);
        };

        if header.height != parent_height + 1 {
            return Err(OracleError::invalid(
                hash,
                format!(
                    "height {} does not follow parent height {parent_height}",
                    header.height
                ),
            ));
        }

        let local_status = self.guard.classify(&header);
        let status = local_status.inherit(parent_status);
        let work = accumulate(&parent_work, &header);
        let sequence = self.store.take_sequence();
        self.store.put(HeaderRecord {
            header,
            work: Some(work),
            local_status,
            status,
            sequence,
        })?;
        self.note(&hash, progress)?;
        self.drain_reconnections(hash, progress)?;

        Ok(match status {
            HeaderStatus::CheckpointBanned => AcceptOutcome::Banned,
            _ => AcceptOutcome::Accepted,
        })
    }

    fn note(&self, hash: &BlockHash, progress: &mut Progress) -> Result<(), OracleError> {
        let record = self.store.get(hash).ok_or(OracleError::UnknownHeader { hash: *hash })?;
        let tip = self.store.best_record()?;
        if let Some(tip_work) = &tip.work {
            progress.note(record, tip_work);
        }
        Ok(())
    }

    /// Connect every held descendant of `root`, breadth first.
    fn drain_reconnections(
        &mut self,
        root: BlockHash,
        progress: &mut Progress,
    ) -> Result<(), OracleError> {
        let mut queue = VecDeque::from([root]);
        while let Some(parent_hash) = queue.pop_front() {
            let children = self.pool.reconnect(&parent_hash);
            if children.is_empty() {
                continue;
            }
            let parent = self
                .store
                .get(&parent_hash)
                .and_then(|p| p.work.clone().map(|work| (p.header.height, work, p.status)));
            let Some((parent_height, parent_work, parent_status)) = parent else {
                for child in children {
                    self.pool.hold(parent_hash, child);
                }
                continue;
            };

            for child in children {
                self.store.batch().release_disconnected(parent_hash, child);
                let Some(record) = self.store.get(&child) else {
                    continue;
                };

                if record.header.height != parent_height + 1 {
                    warn!(
                        hash = %child,
                        height = record.header.height,
                        parent_height,
                        "Discarding reconnected header with inconsistent height"
                    );
                    self.discard(child);
                    continue;
                }

                let local_status = self.guard.classify(&record.header);
                let status = local_status.inherit(parent_status);
                let work = accumulate(&parent_work, &record.header);
                self.store.connect(&child, work, local_status, status)?;
                self.note(&child, progress)?;
                queue.push_back(child);
            }
        }
        Ok(())
    }

    /// Drop a never-connected header together with everything held behind it.
    fn discard(&mut self, root: BlockHash) {
        let mut queue = VecDeque::from([root]);
        while let Some(hash) = queue.pop_front() {
            self.store.remove(&hash);
            for child in self.pool.reconnect(&hash) {
                self.store.batch().release_disconnected(hash, child);
                queue.push_back(child);
            }
        }
    }

    fn finish(&mut self, progress: Progress) -> Result<ChainChanges, OracleError> {
        let reorg = match progress.best {
            Some((hash, _)) => Some(self.reorg_to(hash)?),
            None => None,
        };
        Ok(ChainChanges {
            reorg,
            connected: progress.connected,
            banned: progress.banned,
        })
    }

    /// Switch the best chain to end at `new_tip`.
    fn reorg_to(&mut self, new_tip: BlockHash) -> Result<Reorg, OracleError> {
        let old_tip = self.store.best_tip();
        if new_tip == old_tip.hash {
            return Ok(Reorg::default());
        }

        let fork = self.store.fork_point(&new_tip)?;

        let mut connect = Vec::new();
        let mut current = new_tip;
        while current != fork.hash {
            let record =
                self.store.get(&current).ok_or(OracleError::UnknownHeader { hash: current })?;
            connect.push(record.position());
            current = record.header.parent_hash;
        }
        connect.reverse();

        let disconnect = ((fork.height + 1)..=old_tip.height)
            .rev()
            .map(|height| {
                self.store
                    .height_index(height)
                    .map(|hash| Position::new(height, hash))
                    .ok_or(OracleError::MissingBestChainEntry { height })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let reorg = Reorg {
            disconnect,
            connect,
        };
        self.store.apply_reorg(&reorg)?;
        debug!(
            from = %old_tip,
            to = %new_tip,
            fork = %fork,
            "Best chain switched"
        );
        Ok(reorg)
    }

    /// Full scan for the best tip. The current tip is kept on equal work;
    /// otherwise the earliest accepted candidate wins.
    pub fn recompute_best(&mut self) -> Result<Option<Reorg>, OracleError> {
        let tip = self.store.best_record()?;
        let tip_hash = tip.header.hash;

        let mut best = tip.is_candidate().then_some(tip);
        for record in self.store.records().filter(|r| r.is_candidate()) {
            let replace = match best {
                None => true,
                // Equal work never displaces the current tip
                Some(current) if current.header.hash == tip_hash => {
                    outranks(record, current) && record.work != current.work
                }
                Some(current) => outranks(record, current),
            };
            if replace {
                best = Some(record);
            }
        }

        let new_tip = best.map(|r| r.header.hash).unwrap_or(self.store.genesis());
        if new_tip == tip_hash {
            return Ok(None);
        }
        self.reorg_to(new_tip).map(Some)
    }

    /// Reapply the checkpoint to headers at `heights`, then refresh
    /// effective statuses and the best tip. A banned header stays banned.
    pub fn reclassify(&mut self, heights: &[Height]) -> Result<ChainChanges, OracleError> {
        let genesis = self.store.genesis();
        let affected: Vec<(BlockHash, HeaderStatus, HeaderStatus)> = self
            .store
            .records()
            .filter(|r| {
                r.is_connected() && r.header.hash != genesis && heights.contains(&r.header.height)
            })
            .map(|r| (r.header.hash, r.local_status, self.guard.classify(&r.header)))
            .collect();

        for (hash, current, classified) in affected {
            if current == HeaderStatus::CheckpointBanned || current == classified {
                continue;
            }
            let status = self.store.get(&hash).map(|r| r.status).unwrap_or(classified);
            self.store.set_status(&hash, classified, status)?;
        }

        self.settle()
    }

    /// Reset the local status of one header to what the active checkpoint
    /// implies, lifting a ban when no checkpoint conflicts with it.
    pub fn reset_status(&mut self, hash: &BlockHash) -> Result<ChainChanges, OracleError> {
        let record = self.store.get(hash).ok_or(OracleError::UnknownHeader { hash: *hash })?;
        if !record.is_connected() {
            return Ok(ChainChanges::default());
        }
        let local_status = self.guard.classify(&record.header);
        let status = record.status;
        self.store.set_status(hash, local_status, status)?;
        self.settle()
    }

    fn settle(&mut self) -> Result<ChainChanges, OracleError> {
        let banned = self.refresh_statuses()?;
        let reorg = self.recompute_best()?;
        Ok(ChainChanges {
            reorg,
            connected: Vec::new(),
            banned,
        })
    }

    /// Recompute effective statuses from genesis down. Returns headers
    /// that became banned.
    fn refresh_statuses(&mut self) -> Result<Vec<Position>, OracleError> {
        let mut newly_banned = Vec::new();
        let mut queue = VecDeque::from([self.store.genesis()]);
        while let Some(parent_hash) = queue.pop_front() {
            let parent_status = self
                .store
                .get(&parent_hash)
                .map(|r| r.status)
                .ok_or(OracleError::UnknownHeader { hash: parent_hash })?;
            let children: Vec<BlockHash> = self.store.children(&parent_hash).copied().collect();
            for child in children {
                let Some(record) = self.store.get(&child) else {
                    continue;
                };
                let was_banned = record.status == HeaderStatus::CheckpointBanned;
                let position = record.position();
                let local_status = record.local_status;
                let status = local_status.inherit(parent_status);
                if self.store.set_status(&child, local_status, status)?
                    && status == HeaderStatus::CheckpointBanned
                    && !was_banned
                {
                    newly_banned.push(position);
                }
                queue.push_back(child);
            }
        }
        Ok(newly_banned)
    }

    /// Startup recovery: connect held headers whose parent is present and
    /// make sure the best chain ends at the best candidate.
    pub fn recover(&mut self) -> Result<ChainChanges, OracleError> {
        let mut progress = Progress::default();
        let ready: Vec<BlockHash> = self
            .pool
            .missing_parents()
            .filter(|parent| self.store.get(parent).is_some_and(|r| r.is_connected()))
            .copied()
            .collect();
        for parent in ready {
            self.drain_reconnections(parent, &mut progress)?;
        }

        let reorg = self.recompute_best()?;
        Ok(ChainChanges {
            reorg,
            connected: progress.connected,
            banned: progress.banned,
        })
    }
}
