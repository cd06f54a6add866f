//! opentxs header oracle module for Caryatid
//! Chooses the best header chain, reports reorgs and enforces checkpoints

pub mod checkpoint;
pub mod disconnected_pool;
pub mod fork_choice;
pub mod header_record;
pub mod header_store;
pub mod oracle;
pub mod oracle_error;
pub mod oracle_observer;
pub mod stores;
pub mod sync_ingestor;
pub mod work_accumulator;

use anyhow::{bail, Context as _, Result};
use caryatid_sdk::{module, Context};
use config::Config;
use opentxs_common::{
    commands::header_oracle::{
        HeaderOracleCommand, HeaderOracleCommandResponse, DEFAULT_HEADER_ORACLE_COMMAND_TOPIC,
    },
    messages::{
        Command, CommandResponse, FilterHeadersMessage, Message, OracleStatusMessage,
        ReorgMessage, StateQuery, StateQueryResponse, SyncHeadersMessage,
    },
    queries::headers::{
        BestTip, CommonParent, HeaderInfo, HeadersStateQuery, HeadersStateQueryResponse,
        DEFAULT_HEADERS_QUERY_TOPIC,
    },
    BlockHash, Checkpoint, Header, OracleState, Position, Reorg, Work,
};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    oracle::HeaderOracle,
    oracle_error::OracleError,
    oracle_observer::HeaderOracleObserver,
    stores::{fjall::FjallStore, memory::InMemoryStore, Store},
    sync_ingestor::IngestStatus,
};

const DEFAULT_HEADERS_TOPIC: &str = "opentxs.headers";
const DEFAULT_SYNC_HEADERS_TOPIC: &str = "opentxs.sync.headers";
const DEFAULT_REORG_TOPIC: &str = "opentxs.chain.reorg";
const DEFAULT_FILTER_HEADERS_TOPIC: &str = "opentxs.filter.headers";
const DEFAULT_STATUS_TOPIC: &str = "opentxs.header-oracle.status";
const DEFAULT_STORE: &str = "fjall";

// Bitcoin mainnet
const DEFAULT_GENESIS_HASH: &str =
    "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
const DEFAULT_GENESIS_TIMESTAMP: i64 = 1_231_006_505;
const DEFAULT_GENESIS_WORK: i64 = 1;

/// Events emitted by the oracle observer, queued for async publishing.
#[derive(Debug, PartialEq)]
enum ObserverEvent {
    Reorg(Reorg),
    Banned(Position),
    State(OracleState),
}

/// Shared event queue between the observer and the publishing side.
type EventQueue = Arc<std::sync::Mutex<Vec<ObserverEvent>>>;

/// Observer that queues oracle events for later async publishing.
struct QueueObserver {
    events: EventQueue,
}

impl HeaderOracleObserver for QueueObserver {
    fn reorg(&self, reorg: &Reorg) {
        self.events.lock().unwrap().push(ObserverEvent::Reorg(reorg.clone()));
    }

    fn header_banned(&self, position: &Position) {
        self.events.lock().unwrap().push(ObserverEvent::Banned(*position));
    }

    fn state_changed(&self, state: &OracleState) {
        self.events.lock().unwrap().push(ObserverEvent::State(state.clone()));
    }
}

/// Topics the module publishes on
#[derive(Clone)]
struct Topics {
    reorg: String,
    status: String,
    filter_headers: String,
}

/// Header oracle module
#[module(
    message_type(Message),
    name = "header-oracle",
    description = "Header chain fork choice"
)]
pub struct HeaderOracleModule;

impl HeaderOracleModule {
    /// Main init function
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let headers_topic = config
            .get_string("subscribe-headers-topic")
            .unwrap_or(DEFAULT_HEADERS_TOPIC.to_string());
        info!("Creating headers subscriber on '{headers_topic}'");

        let sync_headers_topic = config
            .get_string("subscribe-sync-topic")
            .unwrap_or(DEFAULT_SYNC_HEADERS_TOPIC.to_string());
        info!("Creating sync headers subscriber on '{sync_headers_topic}'");

        let topics = Topics {
            reorg: config
                .get_string("publish-reorg-topic")
                .unwrap_or(DEFAULT_REORG_TOPIC.to_string()),
            status: config
                .get_string("publish-status-topic")
                .unwrap_or(DEFAULT_STATUS_TOPIC.to_string()),
            filter_headers: config
                .get_string("publish-filter-topic")
                .unwrap_or(DEFAULT_FILTER_HEADERS_TOPIC.to_string()),
        };
        info!("Publishing reorgs on '{}'", topics.reorg);

        let query_topic = config
            .get_string(DEFAULT_HEADERS_QUERY_TOPIC.0)
            .unwrap_or(DEFAULT_HEADERS_QUERY_TOPIC.1.to_string());
        let command_topic = config
            .get_string(DEFAULT_HEADER_ORACLE_COMMAND_TOPIC.0)
            .unwrap_or(DEFAULT_HEADER_ORACLE_COMMAND_TOPIC.1.to_string());

        let store_type = config.get_string("store").unwrap_or(DEFAULT_STORE.to_string());
        let backend: Arc<dyn Store> = match store_type.as_str() {
            "fjall" => Arc::new(FjallStore::new(&config)?),
            "memory" => Arc::new(InMemoryStore::new()),
            _ => bail!("Unknown store type {store_type}"),
        };

        let (genesis, genesis_work) = genesis_from_config(&config)?;
        let checkpoint = checkpoint_from_config(&config)?;

        let event_queue: EventQueue = Arc::new(std::sync::Mutex::new(Vec::new()));
        let observer = Box::new(QueueObserver {
            events: event_queue.clone(),
        });
        let mut oracle = HeaderOracle::open(backend, genesis, genesis_work, observer)?;
        if let Some(checkpoint) = checkpoint {
            oracle.set_checkpoint(checkpoint).context("could not apply configured checkpoint")?;
        }
        let oracle = Arc::new(RwLock::new(oracle));

        let mut headers_subscription = context.subscribe(&headers_topic).await?;
        let mut sync_subscription = context.subscribe(&sync_headers_topic).await?;

        // Queries
        let query_oracle = oracle.clone();
        context.handle(&query_topic, move |req| {
            let query_oracle = query_oracle.clone();
            async move {
                let Message::StateQuery(StateQuery::Headers(query)) = req.as_ref() else {
                    return Arc::new(Message::StateQueryResponse(StateQueryResponse::Headers(
                        HeadersStateQueryResponse::Error("Invalid message for header-oracle".into()),
                    )));
                };
                let oracle = query_oracle.read().await;
                let response = handle_query(&oracle, query);
                Arc::new(Message::StateQueryResponse(StateQueryResponse::Headers(response)))
            }
        });

        // Commands
        let command_oracle = oracle.clone();
        let command_queue = event_queue.clone();
        let command_context = context.clone();
        let command_topics = topics.clone();
        context.handle(&command_topic, move |req| {
            let command_oracle = command_oracle.clone();
            let command_queue = command_queue.clone();
            let command_context = command_context.clone();
            let command_topics = command_topics.clone();
            async move {
                let Message::Command(Command::HeaderOracle(command)) = req.as_ref() else {
                    return Arc::new(Message::CommandResponse(CommandResponse::HeaderOracle(
                        HeaderOracleCommandResponse::Error("Invalid message for header-oracle".into()),
                    )));
                };
                let span = info_span!("header-oracle-command");
                let response = async {
                    let result = {
                        let mut oracle = command_oracle.write().await;
                        handle_command(&mut oracle, command)
                    };
                    publish_events(&command_context, &command_queue, &command_topics).await;
                    result
                }
                .instrument(span)
                .await;
                Arc::new(Message::CommandResponse(CommandResponse::HeaderOracle(response)))
            }
        });

        // Anything queued while opening
        publish_events(&context, &event_queue, &topics).await;

        context.clone().run(async move {
            loop {
                tokio::select! {
                    result = headers_subscription.read() => {
                        let Ok((_, message)) = result else {
                            error!("Headers message read failed");
                            break;
                        };

                        match message.as_ref() {
                            Message::Headers(msg) => {
                                let span = info_span!("header-oracle", count = msg.headers.len());
                                async {
                                    let result = oracle.write().await.accept_headers(msg.headers.clone());
                                    match result {
                                        Ok(result) => {
                                            let accepted = result
                                                .outcomes
                                                .iter()
                                                .filter(|o| matches!(o, Ok(outcome) if outcome.is_new()))
                                                .count();
                                            for error in result.outcomes.iter().filter_map(|o| o.as_ref().err()) {
                                                warn!("Header rejected: {error}");
                                            }
                                            debug!(accepted, "Processed peer headers");
                                        }
                                        Err(e) => error!("Failed to process headers: {e}"),
                                    }
                                    publish_events(&context, &event_queue, &topics).await;
                                }
                                .instrument(span)
                                .await;
                            }

                            _ => debug!("Ignoring unexpected message on headers topic"),
                        }
                    }

                    result = sync_subscription.read() => {
                        let Ok((_, message)) = result else {
                            error!("Sync headers message read failed");
                            break;
                        };

                        match message.as_ref() {
                            Message::SyncHeaders(msg) => {
                                let span = info_span!("header-oracle-sync", prior = %msg.prior_hash);
                                async {
                                    let entries: Vec<(BlockHash, Vec<u8>)> =
                                        msg.headers.iter().map(|h| (h.hash, h.bytes.clone())).collect();
                                    let result = oracle.write().await.ingest(msg.prior_hash, &entries);
                                    publish_events(&context, &event_queue, &topics).await;

                                    match result {
                                        Ok(result) => match result.status {
                                            IngestStatus::Applied | IngestStatus::Queued => {
                                                publish_filters(&context, &topics.filter_headers, msg).await;
                                            }
                                            IngestStatus::Inconsistent(reason) => {
                                                warn!("Discarding sync batch: {reason}");
                                            }
                                        },
                                        Err(e) => error!("Failed to ingest sync batch: {e}"),
                                    }
                                }
                                .instrument(span)
                                .await;
                            }

                            _ => debug!("Ignoring unexpected message on sync headers topic"),
                        }
                    }
                }
            }

            if let Err(e) = oracle.write().await.shutdown() {
                error!("Header oracle shutdown failed: {e}");
            }
            publish_events(&context, &event_queue, &topics).await;
        });

        Ok(())
    }
}

/// Build the genesis header from config, defaulting to Bitcoin mainnet.
fn genesis_from_config(config: &Config) -> Result<(Header, Work)> {
    let hash = config.get_string("genesis-hash").unwrap_or(DEFAULT_GENESIS_HASH.to_string());
    let hash: BlockHash = hash.parse().with_context(|| format!("invalid genesis-hash {hash}"))?;
    let timestamp =
        config.get_int("genesis-timestamp").unwrap_or(DEFAULT_GENESIS_TIMESTAMP) as u64;
    let work = config.get_int("genesis-work").unwrap_or(DEFAULT_GENESIS_WORK);
    if work <= 0 {
        bail!("genesis-work must be positive, got {work}");
    }
    let work = Work::from(work as u64);

    let genesis = Header {
        hash,
        parent_hash: BlockHash::default(),
        height: 0,
        work: work.clone(),
        timestamp,
    };
    Ok((genesis, work))
}

/// Read the optional `[checkpoint]` table.
fn checkpoint_from_config(config: &Config) -> Result<Option<Checkpoint>> {
    let Ok(height) = config.get_int("checkpoint.height") else {
        return Ok(None);
    };
    let hash = |key: &str| -> Result<BlockHash> {
        let value = config.get_string(key).with_context(|| format!("missing {key}"))?;
        value.parse().with_context(|| format!("invalid {key} {value}"))
    };

    let filter_hash = match config.get_string("checkpoint.filter-hash") {
        Ok(value) => Some(value.parse().with_context(|| format!("invalid filter hash {value}"))?),
        Err(_) => None,
    };
    let checkpoint = Checkpoint {
        height: u64::try_from(height).context("checkpoint.height must not be negative")?,
        block_hash: hash("checkpoint.hash")?,
        previous_block_hash: hash("checkpoint.previous-hash")?,
        filter_hash,
    };
    info!(height = checkpoint.height, hash = %checkpoint.block_hash, "Configured checkpoint");
    Ok(Some(checkpoint))
}

fn handle_query(oracle: &HeaderOracle, query: &HeadersStateQuery) -> HeadersStateQueryResponse {
    match query {
        HeadersStateQuery::GetBestTip => HeadersStateQueryResponse::BestTip(BestTip {
            position: oracle.best_tip(),
            work: oracle.best_work(),
        }),
        HeadersStateQuery::GetHeightAt { height } => {
            HeadersStateQueryResponse::HeightAt(oracle.height_at(*height))
        }
        HeadersStateQuery::GetHeader { hash } => match oracle.header(hash) {
            Some(record) => HeadersStateQueryResponse::Header(HeaderInfo {
                header: record.header.clone(),
                work: record.work.clone(),
                status: record.status,
                in_best_chain: oracle.is_in_best_chain(&record.position()),
            }),
            None => HeadersStateQueryResponse::NotFound,
        },
        HeadersStateQuery::GetBestHashes { start, limit } => {
            HeadersStateQueryResponse::BestHashes(oracle.best_hashes(*start, *limit))
        }
        HeadersStateQuery::GetRecentHashes { limit } => {
            HeadersStateQueryResponse::RecentHashes(oracle.recent_hashes(*limit))
        }
        HeadersStateQuery::IsInBestChain { position } => {
            HeadersStateQueryResponse::IsInBestChain(oracle.is_in_best_chain(position))
        }
        HeadersStateQuery::GetCommonParent { position } => {
            match oracle.common_parent(&position.hash) {
                Ok((parent, best)) => {
                    HeadersStateQueryResponse::CommonParent(CommonParent { parent, best })
                }
                Err(OracleError::UnknownHeader { .. }) => HeadersStateQueryResponse::NotFound,
                Err(e) => HeadersStateQueryResponse::Error(e.to_string()),
            }
        }
        HeadersStateQuery::GetSiblings => HeadersStateQueryResponse::Siblings(oracle.siblings()),
        HeadersStateQuery::GetAncestors { start, stop } => {
            match oracle.ancestors(&start.hash, &stop.hash) {
                Ok(positions) => HeadersStateQueryResponse::Ancestors(positions),
                Err(OracleError::UnknownHeader { .. }) => HeadersStateQueryResponse::NotFound,
                Err(e) => HeadersStateQueryResponse::Error(e.to_string()),
            }
        }
        HeadersStateQuery::GetCheckpoint => {
            HeadersStateQueryResponse::Checkpoint(oracle.checkpoint().cloned())
        }
        HeadersStateQuery::GetStatus => HeadersStateQueryResponse::Status(oracle.state().clone()),
    }
}

fn handle_command(
    oracle: &mut HeaderOracle,
    command: &HeaderOracleCommand,
) -> HeaderOracleCommandResponse {
    let result = match command {
        HeaderOracleCommand::SetCheckpoint(checkpoint) => {
            oracle.set_checkpoint(checkpoint.clone()).map(drop)
        }
        HeaderOracleCommand::ClearCheckpoint => oracle.clear_checkpoint().map(drop),
        HeaderOracleCommand::RemoveCheckpointState { hash } => {
            oracle.remove_checkpoint_state(hash).map(drop)
        }
        HeaderOracleCommand::Resume => oracle.resume(),
    };
    match result {
        Ok(_) => HeaderOracleCommandResponse::Done,
        Err(e) => {
            warn!("Header oracle command failed: {e}");
            HeaderOracleCommandResponse::Error(e.to_string())
        }
    }
}

/// Drain queued observer events into publishable messages.
///
/// Sync function, so the queue lock is never held across an await point.
fn collect_observer_events(event_queue: &EventQueue, topics: &Topics) -> Vec<(String, Arc<Message>)> {
    let events: Vec<ObserverEvent> = event_queue.lock().unwrap().drain(..).collect();
    let mut messages = Vec::new();

    for event in events {
        match event {
            ObserverEvent::Reorg(reorg) => {
                info!(
                    disconnected = reorg.disconnect.len(),
                    connected = reorg.connect.len(),
                    from = ?reorg.old_tip(),
                    to = ?reorg.new_tip(),
                    "Best chain changed"
                );
                messages.push((topics.reorg.clone(), Arc::new(Message::from(ReorgMessage { reorg }))));
            }
            ObserverEvent::Banned(position) => {
                warn!("Header {position} banned by checkpoint");
            }
            ObserverEvent::State(state) => {
                info!("Header oracle state {state:?}");
                messages.push((
                    topics.status.clone(),
                    Arc::new(Message::from(OracleStatusMessage { state })),
                ));
            }
        }
    }

    messages
}

async fn publish_events(context: &Arc<Context<Message>>, event_queue: &EventQueue, topics: &Topics) {
    for (topic, msg) in collect_observer_events(event_queue, topics) {
        context
            .message_bus
            .publish(&topic, msg)
            .await
            .unwrap_or_else(|e| error!("Failed to publish to {topic}: {e}"));
    }
}

/// Pass compact-filter data from an accepted sync batch to the filter oracle.
async fn publish_filters(context: &Arc<Context<Message>>, topic: &str, msg: &SyncHeadersMessage) {
    if msg.headers.is_empty() {
        return;
    }
    let filters = msg.headers.iter().map(|h| (h.hash, h.filter_header, h.filter_hash)).collect();
    let msg = Arc::new(Message::FilterHeaders(FilterHeadersMessage {
        prior_hash: msg.prior_hash,
        filters,
    }));
    context
        .message_bus
        .publish(topic, msg)
        .await
        .unwrap_or_else(|e| error!("Failed to publish filter headers: {e}"));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let mut builder = Config::builder();
        for (key, value) in pairs {
            builder = builder.set_override(*key, *value).unwrap();
        }
        builder.build().unwrap()
    }

    fn topics() -> Topics {
        Topics {
            reorg: "reorg".to_string(),
            status: "status".to_string(),
            filter_headers: "filters".to_string(),
        }
    }

    #[test]
    fn genesis_defaults_to_mainnet() {
        let (genesis, work) = genesis_from_config(&config(&[])).unwrap();
        assert_eq!(genesis.hash.to_string(), DEFAULT_GENESIS_HASH);
        assert_eq!(genesis.height, 0);
        assert_eq!(genesis.timestamp, 1_231_006_505);
        assert_eq!(work, Work::from(1));
    }

    #[test]
    fn genesis_rejects_bad_hash_and_work() {
        assert!(genesis_from_config(&config(&[("genesis-hash", "zz")])).is_err());
        assert!(genesis_from_config(&config(&[("genesis-work", "0")])).is_err());
    }

    #[test]
    fn checkpoint_is_optional() {
        assert_eq!(checkpoint_from_config(&config(&[])).unwrap(), None);
    }

    #[test]
    fn checkpoint_reads_table() {
        let hash = "11".repeat(32);
        let previous = "22".repeat(32);
        let checkpoint = checkpoint_from_config(&config(&[
            ("checkpoint.height", "5"),
            ("checkpoint.hash", hash.as_str()),
            ("checkpoint.previous-hash", previous.as_str()),
        ]))
        .unwrap()
        .unwrap();

        assert_eq!(checkpoint.height, 5);
        assert_eq!(checkpoint.block_hash.to_string(), hash);
        assert_eq!(checkpoint.previous_block_hash.to_string(), previous);
        assert_eq!(checkpoint.filter_hash, None);
    }

    #[test]
    fn checkpoint_without_hash_fails() {
        assert!(checkpoint_from_config(&config(&[("checkpoint.height", "5")])).is_err());
    }

    #[test]
    fn observer_events_become_messages() {
        let queue: EventQueue = Arc::new(std::sync::Mutex::new(Vec::new()));
        let observer = QueueObserver {
            events: queue.clone(),
        };
        let tip = Position::new(1, BlockHash::from([1u8; 32]));
        observer.state_changed(&OracleState::Available);
        observer.header_banned(&tip);
        observer.reorg(&Reorg {
            disconnect: vec![],
            connect: vec![tip],
        });

        let messages = collect_observer_events(&queue, &topics());
        let topics: Vec<&str> = messages.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(topics, vec!["status", "reorg"]);
        assert!(matches!(
            messages[1].1.as_ref(),
            Message::Reorg(ReorgMessage { reorg }) if reorg.new_tip() == Some(tip)
        ));
        assert!(queue.lock().unwrap().is_empty());
    }

    #[test]
    fn resume_command_recovers_degraded_oracle() {
        let backend = Arc::new(InMemoryStore::new());
        let queue: EventQueue = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (genesis, work) = genesis_from_config(&config(&[])).unwrap();
        let observer = QueueObserver {
            events: queue.clone(),
        };
        let mut oracle =
            HeaderOracle::open(backend.clone(), genesis.clone(), work, Box::new(observer)).unwrap();

        backend.set_fail_writes(true);
        let next = Header {
            hash: BlockHash::from([7u8; 32]),
            parent_hash: genesis.hash,
            height: 1,
            work: Work::from(1),
            timestamp: genesis.timestamp + 600,
        };
        assert!(oracle.accept(next).is_err());
        assert!(matches!(
            handle_command(&mut oracle, &HeaderOracleCommand::ClearCheckpoint),
            HeaderOracleCommandResponse::Error(_)
        ));

        backend.set_fail_writes(false);
        assert!(matches!(
            handle_command(&mut oracle, &HeaderOracleCommand::Resume),
            HeaderOracleCommandResponse::Done
        ));
        assert_eq!(oracle.best_tip().height, 1);

        let messages = collect_observer_events(&queue, &topics());
        let topics: Vec<&str> = messages.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(topics, vec!["status", "status", "status", "reorg"]);
    }
}
