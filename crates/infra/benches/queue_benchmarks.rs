use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;

use courseforge_core::{CoreConfig, EntityId, RequestContext, UserId};
use courseforge_events::{BusNotifier, InMemoryEventBus, Notification, Notifier};
use courseforge_infra::chat::ChatCoordinator;
use courseforge_infra::jobs::{JobQueue, JobService, NewJob};
use courseforge_infra::store::InMemoryStore;
use tokio::runtime::Runtime;

struct Fixture {
    jobs: JobService<InMemoryStore>,
    queue: JobQueue<InMemoryStore>,
    chat: ChatCoordinator<InMemoryStore>,
}

fn setup() -> Fixture {
    let store = Arc::new(InMemoryStore::new());
    let bus: Arc<InMemoryEventBus<Notification>> = Arc::new(InMemoryEventBus::new());
    let notifier: Arc<dyn Notifier> = Arc::new(BusNotifier::new(bus));
    let config = CoreConfig::default();
    Fixture {
        jobs: JobService::new(store.clone(), notifier.clone(), config.clone()),
        queue: JobQueue::new(store.clone(), notifier.clone(), &config),
        chat: ChatCoordinator::new(store, notifier),
    }
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn bench_enqueue(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("enqueue");

    group.bench_function("enqueue_unbound", |b| {
        let fx = setup();
        let owner = UserId::new();
        b.iter(|| {
            rt.block_on(fx.jobs.enqueue(NewJob::new(owner, black_box("ingest"))))
                .unwrap();
        });
    });

    // Every entity slot is fresh, so the singleton check scans a growing table.
    group.bench_function("enqueue_entity_bound", |b| {
        let fx = setup();
        let owner = UserId::new();
        b.iter(|| {
            let job = NewJob::new(owner, "ingest").for_entity("material", EntityId::new());
            rt.block_on(fx.jobs.enqueue(job)).unwrap();
        });
    });

    group.finish();
}

fn bench_claim_cycle(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_cycle");

    for backlog in [10usize, 100, 1000] {
        group.throughput(Throughput::Elements(backlog as u64));
        group.bench_with_input(BenchmarkId::new("drain", backlog), &backlog, |b, &backlog| {
            b.iter(|| {
                let fx = setup();
                let owner = UserId::new();
                rt.block_on(async {
                    for _ in 0..backlog {
                        fx.jobs.enqueue(NewJob::new(owner, "ingest")).await.unwrap();
                    }
                    while let Some(job) = fx.queue.claim().await.unwrap() {
                        fx.queue.complete(&job.lease().unwrap(), None).await.unwrap();
                    }
                });
            });
        });
    }

    group.finish();
}

fn bench_chat_send(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("chat_send");

    // Send, then settle the reply job so the thread is free again.
    group.bench_function("send_and_settle", |b| {
        let fx = setup();
        let ctx = RequestContext::new(UserId::new());
        let thread = rt.block_on(fx.chat.create_thread(&ctx, "bench")).unwrap();
        b.iter(|| {
            rt.block_on(async {
                let sent = fx
                    .chat
                    .send_message(&ctx, thread.id, black_box("hello"), None)
                    .await
                    .unwrap();
                let job = fx.queue.claim().await.unwrap().unwrap();
                fx.chat.complete_turn(ctx.owner(), job.id, "hi").await.unwrap();
                fx.queue.complete(&job.lease().unwrap(), None).await.unwrap();
                black_box(sent);
            });
        });
    });

    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_claim_cycle, bench_chat_send);
criterion_main!(benches);
