use std::{fs, path::PathBuf};

use anyhow::{anyhow, Context, Result};
use config::Config;
use fjall::{Database, Keyspace, PersistMode};
use opentxs_common::{BlockHash, Checkpoint, Height};
use tracing::info;

use crate::{
    header_record::HeaderRecord,
    stores::{Store, StoreBatch, StoredState},
};

const DEFAULT_DATABASE_PATH: &str = "fjall-headers";
const DEFAULT_CLEAR_ON_START: bool = false;
const HEADERS_KEYSPACE: &str = "headers";
const BEST_CHAIN_KEYSPACE: &str = "best-chain";
const DISCONNECTED_KEYSPACE: &str = "disconnected";
const META_KEYSPACE: &str = "meta";
const CHECKPOINT_KEY: &[u8] = b"checkpoint";
const VERSION_KEY: &[u8] = b"version";

pub struct FjallStore {
    database: Database,
    headers: Keyspace,
    best_chain: Keyspace,
    disconnected: Keyspace,
    meta: Keyspace,
}

impl FjallStore {
    pub fn new(config: &Config) -> Result<Self> {
        let path = config
            .get_string("database-path")
            .unwrap_or_else(|_| DEFAULT_DATABASE_PATH.to_string());
        let clear = config.get_bool("clear-on-start").unwrap_or(DEFAULT_CLEAR_ON_START);
        Self::open(PathBuf::from(path), clear)
    }

    pub fn open(path: PathBuf, clear: bool) -> Result<Self> {
        if clear && path.exists() {
            fs::remove_dir_all(&path)?;
        }
        info!("Opening header database at {}", path.display());
        let database = Database::builder(&path).open()?;
        let headers = database.keyspace(HEADERS_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        let best_chain =
            database.keyspace(BEST_CHAIN_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        let disconnected =
            database.keyspace(DISCONNECTED_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        let meta = database.keyspace(META_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;

        Ok(Self {
            database,
            headers,
            best_chain,
            disconnected,
            meta,
        })
    }

    fn load_version(&self) -> Result<Option<u32>> {
        let Some(bytes) = self.meta.get(VERSION_KEY)? else {
            return Ok(None);
        };
        let bytes: [u8; 4] =
            bytes.as_ref().try_into().map_err(|_| anyhow!("malformed schema version"))?;
        Ok(Some(u32::from_be_bytes(bytes)))
    }

    fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let Some(bytes) = self.meta.get(CHECKPOINT_KEY)? else {
            return Ok(None);
        };
        Ok(Some(minicbor::decode(&bytes).context("could not decode checkpoint")?))
    }
}

impl Store for FjallStore {
    fn load(&self) -> Result<StoredState> {
        let mut records = Vec::new();
        for entry in self.headers.iter() {
            let (_, value) = entry.into_inner()?;
            records.push(HeaderRecord::from_bytes(&value)?);
        }

        // Height keys are big-endian so iteration is already ascending
        let mut best_chain = Vec::new();
        for entry in self.best_chain.iter() {
            let (key, value) = entry.into_inner()?;
            let height: [u8; 8] =
                key.as_ref().try_into().map_err(|_| anyhow!("malformed best chain key"))?;
            let hash = BlockHash::try_from(value.as_ref())?;
            best_chain.push((Height::from_be_bytes(height), hash));
        }

        let mut disconnected = Vec::new();
        for entry in self.disconnected.iter() {
            let (key, _) = entry.into_inner()?;
            disconnected.push(split_pair_key(&key)?);
        }

        Ok(StoredState {
            version: self.load_version()?,
            records,
            best_chain,
            disconnected,
            checkpoint: self.load_checkpoint()?,
        })
    }

    fn write(&self, batch: &StoreBatch) -> Result<()> {
        let mut tx = self.database.batch();

        for (hash, record) in &batch.headers {
            match record {
                Some(record) => tx.insert(&self.headers, hash.as_ref(), record.to_bytes()),
                None => tx.remove(&self.headers, hash.as_ref()),
            }
        }
        for (height, hash) in &batch.best_chain {
            match hash {
                Some(hash) => tx.insert(&self.best_chain, height.to_be_bytes(), hash.as_ref()),
                None => tx.remove(&self.best_chain, height.to_be_bytes()),
            }
        }
        for ((parent, child), held) in &batch.disconnected {
            let key = pair_key(parent, child);
            if *held {
                tx.insert(&self.disconnected, key, Vec::<u8>::new());
            } else {
                tx.remove(&self.disconnected, key);
            }
        }
        match &batch.checkpoint {
            Some(Some(checkpoint)) => {
                let bytes = minicbor::to_vec(checkpoint).expect("infallible");
                tx.insert(&self.meta, CHECKPOINT_KEY, bytes);
            }
            Some(None) => tx.remove(&self.meta, CHECKPOINT_KEY),
            None => {}
        }
        if let Some(version) = batch.version {
            tx.insert(&self.meta, VERSION_KEY, version.to_be_bytes());
        }

        tx.commit()?;
        self.database.persist(PersistMode::Buffer)?;
        Ok(())
    }
}

fn pair_key(parent: &BlockHash, child: &BlockHash) -> [u8; 64] {
    let mut key = [0; 64];
    key[..32].copy_from_slice(parent.as_ref());
    key[32..].copy_from_slice(child.as_ref());
    key
}

fn split_pair_key(key: &[u8]) -> Result<(BlockHash, BlockHash)> {
    if key.len() != 64 {
        return Err(anyhow!("malformed disconnected key of {} bytes", key.len()));
    }
    Ok((BlockHash::try_from(&key[..32])?, BlockHash::try_from(&key[32..])?))
}
