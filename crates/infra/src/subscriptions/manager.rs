use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::event_store::{EventStore, EventStoreError};

use super::checkpoint_store::{CheckpointStore, InMemoryCheckpointStore};
use super::durable::{spawn_group, DurableTransport, GroupClient, JoinError};
use super::subscription::Subscription;
use super::transport::{CatchUpTransport, StandardTransport, SubscriptionTransport};
use super::{DurableSubscriptionOptions, SubscriptionError, SubscriptionOptions};

/// Default number of deliveries buffered per subscription.
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 16;

type GroupKey = (String, String);

struct GroupEntry {
    client: GroupClient,
    task: JoinHandle<()>,
}

/// Entry point for subscribing to streams.
///
/// Owns the durable groups: the first consumer of `(durable_name, stream)` starts the
/// group, later consumers join it.
pub struct SubscriptionManager<S> {
    store: S,
    checkpoints: Arc<dyn CheckpointStore>,
    groups: Mutex<HashMap<GroupKey, GroupEntry>>,
    buffer: usize,
}

impl<S> SubscriptionManager<S>
where
    S: EventStore + Clone + 'static,
{
    /// Manager keeping durable checkpoints in memory.
    pub fn new(store: S) -> Self {
        Self::with_checkpoint_store(store, Arc::new(InMemoryCheckpointStore::new()))
    }

    pub fn with_checkpoint_store(store: S, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            checkpoints,
            groups: Mutex::new(HashMap::new()),
            buffer: DEFAULT_SUBSCRIPTION_BUFFER,
        }
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Subscribe to `stream_id`.
    ///
    /// Fails with `StreamNotFound` when the stream does not exist, and for durable
    /// subscriptions with `MaxSubscribersReached` when the group is full.
    #[instrument(skip(self, options), fields(kind = ?options.kind()))]
    pub async fn subscribe(
        &self,
        stream_id: &str,
        options: SubscriptionOptions,
    ) -> Result<Subscription, SubscriptionError> {
        self.store.get(stream_id).await?;

        let transport: Arc<dyn SubscriptionTransport> = match options {
            SubscriptionOptions::Standard => {
                Arc::new(StandardTransport::new(self.store.clone(), stream_id))
            }
            SubscriptionOptions::CatchUp { from } => {
                Arc::new(CatchUpTransport::new(self.store.clone(), stream_id, from))
            }
            SubscriptionOptions::Durable(options) => {
                options.validate()?;
                Arc::new(self.join_group(stream_id, options).await?)
            }
        };
        Ok(Subscription::open(stream_id, transport, self.buffer))
    }

    async fn join_group(
        &self,
        stream_id: &str,
        options: DurableSubscriptionOptions,
    ) -> Result<DurableTransport, SubscriptionError> {
        // A group that stopped (failed or shut down) between lookup and join is
        // replaced once.
        for _ in 0..2 {
            let client = self.group(stream_id, &options)?;
            match client.join().await {
                Ok(lease) => return Ok(DurableTransport::new(client, lease)),
                Err(JoinError::Rejected(err)) => return Err(err),
                Err(JoinError::GroupStopped) => {
                    debug!(group = %options.durable_name, stream_id, "group stopped, restarting");
                    self.forget(&options.durable_name, stream_id)?;
                }
            }
        }
        Err(SubscriptionError::Disposed)
    }

    fn group(
        &self,
        stream_id: &str,
        options: &DurableSubscriptionOptions,
    ) -> Result<GroupClient, SubscriptionError> {
        let mut groups = self.groups.lock().map_err(|_| poisoned())?;
        prune_stopped(&mut groups);
        let key = (options.durable_name.clone(), stream_id.to_string());
        if let Some(entry) = groups.get(&key) {
            if !entry.client.is_closed() {
                return Ok(entry.client.clone());
            }
        }

        let (client, task) = spawn_group(
            self.store.clone(),
            Arc::clone(&self.checkpoints),
            stream_id.to_string(),
            options.clone(),
        );
        info!(group = %options.durable_name, stream_id, "durable group created");
        groups.insert(key, GroupEntry {
            client: client.clone(),
            task,
        });
        Ok(client)
    }

    fn forget(&self, durable_name: &str, stream_id: &str) -> Result<Option<GroupEntry>, SubscriptionError> {
        let mut groups = self.groups.lock().map_err(|_| poisoned())?;
        Ok(groups.remove(&(durable_name.to_string(), stream_id.to_string())))
    }

    /// Number of durable groups whose actor is still running.
    pub fn active_groups(&self) -> usize {
        match self.groups.lock() {
            Ok(mut groups) => {
                prune_stopped(&mut groups);
                groups.len()
            }
            Err(_) => 0,
        }
    }

    /// Persisted checkpoint of a durable group.
    pub async fn checkpoint(
        &self,
        durable_name: &str,
        stream_id: &str,
    ) -> Result<Option<u64>, SubscriptionError> {
        Ok(self.checkpoints.load(durable_name, stream_id).await?)
    }

    /// Stop a durable group and forget its checkpoint; its next consumer starts over.
    pub async fn delete_durable(&self, durable_name: &str, stream_id: &str) -> Result<(), SubscriptionError> {
        if let Some(entry) = self.forget(durable_name, stream_id)? {
            entry.client.shutdown();
            if let Err(err) = entry.task.await {
                warn!(group = durable_name, error = %err, "durable group task failed");
            }
        }
        self.checkpoints.clear(durable_name, stream_id).await?;
        info!(group = durable_name, stream_id, "durable group deleted");
        Ok(())
    }

    /// Stop every durable group, writing their final checkpoints.
    pub async fn shutdown(&self) {
        let entries: Vec<(GroupKey, GroupEntry)> = match self.groups.lock() {
            Ok(mut groups) => groups.drain().collect(),
            Err(_) => return,
        };
        for ((name, stream_id), entry) in entries {
            entry.client.shutdown();
            if let Err(err) = entry.task.await {
                warn!(group = %name, stream_id = %stream_id, error = %err, "durable group task failed");
            }
        }
    }
}

/// Drop groups whose actor exited on its own (failure or lost stream).
fn prune_stopped(groups: &mut HashMap<GroupKey, GroupEntry>) {
    groups.retain(|(name, stream_id), entry| {
        let running = !entry.client.is_closed();
        if !running {
            debug!(group = %name, stream_id = %stream_id, "pruning stopped durable group");
        }
        running
    });
}

fn poisoned() -> SubscriptionError {
    SubscriptionError::Store(EventStoreError::Storage("subscription registry lock poisoned".into()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use streamfold_core::{EventDescriptor, ExpectedVersion, StreamPosition};

    use super::*;
    use crate::event_store::InMemoryEventStore;
    use crate::subscriptions::{SubscriptionKind, SubscriptionState};

    fn tick(n: u64) -> EventDescriptor {
        EventDescriptor::new("Tick", json!({ "n": n }))
    }

    async fn manager_with(count: u64) -> SubscriptionManager<Arc<InMemoryEventStore>> {
        let store = Arc::new(InMemoryEventStore::new());
        store
            .append("ticks", (0..count).map(tick).collect(), ExpectedVersion::Any)
            .await
            .unwrap();
        SubscriptionManager::new(store)
    }

    async fn next_offset(sub: &mut Subscription) -> u64 {
        tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("timed out")
            .expect("ended")
            .expect("failed")
            .position()
    }

    #[tokio::test]
    async fn subscribing_to_a_missing_stream_fails() {
        let manager = SubscriptionManager::new(Arc::new(InMemoryEventStore::new()));
        for options in [
            SubscriptionOptions::Standard,
            SubscriptionOptions::catch_up(),
            SubscriptionOptions::Durable(DurableSubscriptionOptions::new("g")),
        ] {
            let err = manager.subscribe("nope", options).await.unwrap_err();
            assert_eq!(err, SubscriptionError::Store(EventStoreError::StreamNotFound("nope".into())));
        }
    }

    #[tokio::test]
    async fn standard_subscription_only_sees_new_events() {
        let manager = manager_with(2).await;
        let mut sub = manager
            .subscribe("ticks", SubscriptionOptions::Standard)
            .await
            .unwrap();
        assert_eq!(sub.kind(), SubscriptionKind::Standard);
        assert_eq!(sub.wait_for_state(SubscriptionState::Live).await, SubscriptionState::Live);

        manager.store().append("ticks", vec![tick(2)], ExpectedVersion::Any).await.unwrap();
        assert_eq!(next_offset(&mut sub).await, 2);
        assert_eq!(sub.ack(2), Err(SubscriptionError::NotAcknowledgeable));
    }

    #[tokio::test]
    async fn catch_up_from_an_offset_skips_earlier_history() {
        let manager = manager_with(4).await;
        let mut sub = manager
            .subscribe("ticks", SubscriptionOptions::CatchUp {
                from: StreamPosition::Offset(2),
            })
            .await
            .unwrap();
        assert_eq!(next_offset(&mut sub).await, 2);
        assert_eq!(next_offset(&mut sub).await, 3);
    }

    #[tokio::test]
    async fn consumers_with_the_same_name_share_a_group() {
        let manager = manager_with(2).await;
        let options = DurableSubscriptionOptions::new("g").max_subscribers(2);

        let mut a = manager
            .subscribe("ticks", SubscriptionOptions::Durable(options.clone()))
            .await
            .unwrap();
        assert_eq!(next_offset(&mut a).await, 0);
        let mut b = manager
            .subscribe("ticks", SubscriptionOptions::Durable(options.clone()))
            .await
            .unwrap();
        assert_eq!(next_offset(&mut b).await, 1);

        let err = manager
            .subscribe("ticks", SubscriptionOptions::Durable(options))
            .await
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::MaxSubscribersReached { max: 2, .. }));
    }

    #[tokio::test]
    async fn last_consumer_leaving_writes_the_checkpoint() {
        let manager = manager_with(3).await;
        let options = DurableSubscriptionOptions::new("g");
        let mut sub = manager
            .subscribe("ticks", SubscriptionOptions::Durable(options.clone()))
            .await
            .unwrap();
        for expected in 0..2 {
            assert_eq!(next_offset(&mut sub).await, expected);
            sub.ack(expected).unwrap();
        }
        // Offset 2 is delivered but never acknowledged.
        assert_eq!(next_offset(&mut sub).await, 2);
        sub.dispose().await;

        let mut checkpoint = None;
        for _ in 0..100 {
            checkpoint = manager.checkpoint("g", "ticks").await.unwrap();
            if checkpoint.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(checkpoint, Some(1));

        let mut again = manager
            .subscribe("ticks", SubscriptionOptions::Durable(options))
            .await
            .unwrap();
        let redelivered = tokio::time::timeout(Duration::from_secs(2), again.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(redelivered.position(), 2);
    }

    #[tokio::test]
    async fn groups_that_stop_on_their_own_are_pruned() {
        let manager = manager_with(1).await;
        let mut sub = manager
            .subscribe("ticks", SubscriptionOptions::Durable(DurableSubscriptionOptions::new("g")))
            .await
            .unwrap();
        assert_eq!(next_offset(&mut sub).await, 0);
        sub.ack(0).unwrap();
        assert_eq!(manager.active_groups(), 1);

        manager.store().delete("ticks").await.unwrap();
        let lost = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("timed out");
        assert!(matches!(lost, Some(Err(_)) | None));

        let mut remaining = manager.active_groups();
        for _ in 0..100 {
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            remaining = manager.active_groups();
        }
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn deleting_a_group_restarts_it_from_the_beginning() {
        let manager = manager_with(2).await;
        let options = DurableSubscriptionOptions::new("g").checkpoint_window(1, 1);
        let mut sub = manager
            .subscribe("ticks", SubscriptionOptions::Durable(options.clone()))
            .await
            .unwrap();
        assert_eq!(next_offset(&mut sub).await, 0);
        sub.ack(0).unwrap();
        sub.dispose().await;

        manager.delete_durable("g", "ticks").await.unwrap();
        assert_eq!(manager.checkpoint("g", "ticks").await.unwrap(), None);

        let mut fresh = manager
            .subscribe("ticks", SubscriptionOptions::Durable(options))
            .await
            .unwrap();
        assert_eq!(next_offset(&mut fresh).await, 0);
        manager.shutdown().await;
    }
}
