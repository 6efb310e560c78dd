use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, OnceLock};
use tokio::runtime::Runtime;

use streamfold_core::{Aggregate, AggregateRoot, DomainEvent, EventDescriptor, EventHandlers, ExpectedVersion};
use streamfold_infra::event_store::{EventStore, InMemoryEventStore};
use streamfold_infra::projections::ProjectionManager;
use streamfold_infra::repository::{EventSourcingRepository, RepositoryOptions, SnapshotPolicy};
use streamfold_infra::subscriptions::{SubscriptionManager, SubscriptionOptions};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Deposited {
    amount: i64,
}

impl DomainEvent for Deposited {
    const EVENT_TYPE: &'static str = "deposited";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Account {
    balance: i64,
    deposits: u64,
}

impl Aggregate for Account {
    const AGGREGATE_TYPE: &'static str = "account";

    fn handlers() -> &'static EventHandlers<Self> {
        static HANDLERS: OnceLock<EventHandlers<Account>> = OnceLock::new();
        HANDLERS.get_or_init(|| {
            EventHandlers::new().on(|a: &mut Account, e: Deposited| {
                a.balance += e.amount;
                a.deposits += 1;
            })
        })
    }
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn deposits(count: usize) -> Vec<EventDescriptor> {
    (0..count)
        .map(|i| EventDescriptor::new(Deposited::EVENT_TYPE, json!({ "amount": i as i64 })))
        .collect()
}

/// Commit `count` deposits one by one, so snapshots are written as they come due.
fn seeded_repository(
    rt: &Runtime,
    count: u64,
    policy: SnapshotPolicy,
) -> EventSourcingRepository<Account, Arc<InMemoryEventStore>> {
    let store = Arc::new(InMemoryEventStore::new());
    let repository = EventSourcingRepository::<Account, _>::new(store)
        .with_options(RepositoryOptions { snapshot_policy: policy });

    rt.block_on(async {
        let mut account = AggregateRoot::<Account>::new("bench");
        account.raise(Deposited { amount: 0 }).unwrap();
        repository.add(&mut account).await.unwrap();
        for i in 1..count {
            account.raise(Deposited { amount: i as i64 }).unwrap();
            repository.update(&mut account).await.unwrap();
        }
    });
    repository
}

fn bench_event_append_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("event_append_throughput");

    for batch_size in [1, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("batch_append", batch_size),
            batch_size,
            |b, &size| {
                let store = InMemoryEventStore::new();
                b.iter(|| {
                    let committed = rt
                        .block_on(store.append("bench", deposits(size), ExpectedVersion::Any))
                        .unwrap();
                    black_box(committed);
                });
            },
        );
    }

    group.finish();
}

fn bench_aggregate_load(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("aggregate_load");

    for event_count in [10u64, 100, 1000, 10000].iter() {
        let policies = [
            ("full_replay", SnapshotPolicy::Disabled),
            ("with_snapshots", SnapshotPolicy::default()),
        ];
        for (label, policy) in policies {
            let repository = seeded_repository(&rt, *event_count, policy);
            group.throughput(Throughput::Elements(*event_count));
            group.bench_with_input(BenchmarkId::new(label, event_count), event_count, |b, _| {
                b.iter(|| {
                    let account = rt.block_on(repository.load("bench")).unwrap();
                    black_box(account.state().balance);
                });
            });
        }
    }

    group.finish();
}

fn bench_catch_up_replay(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("catch_up_replay");
    group.sample_size(20);

    for event_count in [100usize, 1000].iter() {
        let store = Arc::new(InMemoryEventStore::new());
        rt.block_on(store.append("history", deposits(*event_count), ExpectedVersion::Any))
            .unwrap();
        let manager = SubscriptionManager::new(store.clone());

        group.throughput(Throughput::Elements(*event_count as u64));
        group.bench_with_input(
            BenchmarkId::new("replay_to_live", event_count),
            event_count,
            |b, &count| {
                b.iter(|| {
                    rt.block_on(async {
                        let mut subscription = manager
                            .subscribe("history", SubscriptionOptions::catch_up())
                            .await
                            .unwrap();
                        for _ in 0..count {
                            black_box(subscription.next().await.unwrap().unwrap());
                        }
                        subscription.dispose().await;
                    })
                });
            },
        );
    }

    group.finish();
}

fn bench_projection_create_to_state(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("projection_rebuild_speed");
    group.sample_size(20);

    for event_count in [100usize, 1000].iter() {
        let store = Arc::new(InMemoryEventStore::new());
        rt.block_on(store.append("account-bench", deposits(*event_count), ExpectedVersion::Any))
            .unwrap();

        group.bench_with_input(
            BenchmarkId::new("rebuild_from_events", event_count),
            event_count,
            |b, &count| {
                b.iter(|| {
                    rt.block_on(async {
                        let projections = ProjectionManager::new(store.clone());
                        let definition = streamfold_events::ProjectionDefinition::<i64>::builder()
                            .from_stream("account-bench")
                            .given(|| 0)
                            .then(|total, e, _| {
                                *total += e
                                    .data
                                    .as_ref()
                                    .and_then(|d| d["amount"].as_i64())
                                    .unwrap_or(0);
                            })
                            .build()
                            .unwrap();
                        projections.create("totals", definition).await.unwrap();
                        let expected = (0..count as i64).sum::<i64>();
                        while projections.get_state::<i64>("totals").await.unwrap() != expected {
                            tokio::task::yield_now().await;
                        }
                        projections.shutdown().await;
                    })
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_event_append_throughput,
    bench_aggregate_load,
    bench_catch_up_replay,
    bench_projection_create_to_state
);
criterion_main!(benches);
