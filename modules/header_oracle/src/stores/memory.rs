//! In-memory store, for tests and ephemeral nodes

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use anyhow::{anyhow, bail, Result};
use opentxs_common::{BlockHash, Checkpoint, Height};
use tracing::info;

use crate::{
    header_record::HeaderRecord,
    stores::{Store, StoreBatch, StoredState},
};

#[derive(Default)]
struct Tables {
    version: Option<u32>,
    headers: HashMap<BlockHash, HeaderRecord>,
    best_chain: BTreeMap<Height, BlockHash>,
    disconnected: BTreeSet<(BlockHash, BlockHash)>,
    checkpoint: Option<Checkpoint>,
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        info!("Storing header chain state in memory");
        Self::default()
    }

    /// Make every following write fail, simulating an unavailable disk.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    pub fn header_count(&self) -> usize {
        self.tables.lock().map(|t| t.headers.len()).unwrap_or(0)
    }

    pub fn best_chain(&self) -> Vec<(Height, BlockHash)> {
        self.tables
            .lock()
            .map(|t| t.best_chain.iter().map(|(h, hash)| (*h, *hash)).collect())
            .unwrap_or_default()
    }
}

impl Store for InMemoryStore {
    fn load(&self) -> Result<StoredState> {
        let tables = self.tables.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        Ok(StoredState {
            version: tables.version,
            records: tables.headers.values().cloned().collect(),
            best_chain: tables.best_chain.iter().map(|(h, hash)| (*h, *hash)).collect(),
            disconnected: tables.disconnected.iter().copied().collect(),
            checkpoint: tables.checkpoint.clone(),
        })
    }

    fn write(&self, batch: &StoreBatch) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            bail!("write refused");
        }
        let mut tables = self.tables.lock().map_err(|_| anyhow!("store lock poisoned"))?;

        for (hash, record) in &batch.headers {
            match record {
                Some(record) => {
                    tables.headers.insert(*hash, record.clone());
                }
                None => {
                    tables.headers.remove(hash);
                }
            }
        }
        for (height, hash) in &batch.best_chain {
            match hash {
                Some(hash) => {
                    tables.best_chain.insert(*height, *hash);
                }
                None => {
                    tables.best_chain.remove(height);
                }
            }
        }
        for (pair, held) in &batch.disconnected {
            if *held {
                tables.disconnected.insert(*pair);
            } else {
                tables.disconnected.remove(pair);
            }
        }
        if let Some(checkpoint) = &batch.checkpoint {
            tables.checkpoint = checkpoint.clone();
        }
        if let Some(version) = batch.version {
            tables.version = Some(version);
        }

        Ok(())
    }
}
