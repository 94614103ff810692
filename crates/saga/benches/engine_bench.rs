use std::time::Duration;

use chrono::Utc;
use common::SagaId;
use criterion::{Criterion, criterion_group, criterion_main};
use saga::order_saga::{self, ORDER_SAGA, events};
use saga::{DefinitionRegistry, EngineConfig, LeaseLockManager, SagaContext, SagaEngine, machine};
use saga_store::InMemorySagaStore;

type Engine = SagaEngine<InMemorySagaStore, LeaseLockManager<InMemorySagaStore>>;

fn engine(store: &InMemorySagaStore) -> Engine {
    SagaEngine::new(
        store.clone(),
        LeaseLockManager::new(store.clone(), "bench", Duration::from_secs(30)),
        DefinitionRegistry::new().with(order_saga::definition().unwrap()),
        EngineConfig::default(),
    )
}

fn bench_apply_event(c: &mut Criterion) {
    let definition = order_saga::definition().unwrap();
    let (instance, _) = machine::initial_instance(
        &definition,
        SagaId::new(),
        SagaContext::for_order("O1", 100.0).with_product("SKU-1", 2),
        Utc::now(),
    );

    c.bench_function("machine/apply_start_event", |b| {
        b.iter(|| {
            machine::apply_event(&definition, &instance, &events::START_SAGA, Utc::now(), "bench")
                .unwrap()
        });
    });
}

fn bench_launch(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("engine/launch", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemorySagaStore::new();
                engine(&store)
                    .launch(ORDER_SAGA, SagaContext::for_order("O1", 100.0))
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_happy_path(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemorySagaStore::new();
    let engine = engine(&store);

    c.bench_function("engine/launch_to_payment_completed", |b| {
        b.iter(|| {
            rt.block_on(async {
                let id = engine
                    .launch(ORDER_SAGA, SagaContext::for_order("O1", 100.0))
                    .await
                    .unwrap();
                engine
                    .send_event(id, &events::PAYMENT_SUCCESS)
                    .await
                    .unwrap();
            });
        });
    });
}

criterion_group!(benches, bench_apply_event, bench_launch, bench_happy_path);
criterion_main!(benches);
