//! Integration tests across the whole engine.
//!
//! Append → inline projections → projection daemon → admin managers, and
//! append → subscription daemon → replay, all against the in-memory backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use keelson_core::{ExpectedVersion, StreamId, TenantId};
use keelson_events::{EventEnvelope, EventTypeRegistry, NewEvent};

use crate::admin::{AdminError, ProjectionManager, SubscriptionManager};
use crate::config::{ProjectionDaemonConfig, SubscriptionDaemonConfig};
use crate::event_store::{EventStore, EventStoreError};
use crate::locks::InMemoryLockProvider;
use crate::projections::{
    BatchOutcome, HandledEvents, Projection, ProjectionContext, ProjectionDaemon, ProjectionRegistry,
};
use crate::storage::{InMemoryStorage, InMemoryTx, ProjectionState, Storage, StorageTx};
use crate::subscriptions::{SubscriptionContext, SubscriptionDaemon, SubscriptionHandler, SubscriptionRegistry};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserCreated {
    name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserNameUpdated {
    name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserDeactivated;

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
struct UserView {
    name: String,
    renames: u32,
}

/// Eventual projection of user names. Rejects names listed in `reject`.
struct UserNames {
    reject: Vec<&'static str>,
}

impl UserNames {
    fn new() -> Self {
        Self { reject: Vec::new() }
    }
}

#[async_trait]
impl Projection<InMemoryTx> for UserNames {
    type Snapshot = UserView;

    fn name(&self) -> &str {
        "user_names"
    }

    fn handled_events(&self) -> HandledEvents {
        HandledEvents::only().with::<UserCreated>().with::<UserNameUpdated>()
    }

    async fn evolve(
        &self,
        view: &mut UserView,
        event: &EventEnvelope,
        _ctx: &mut ProjectionContext<'_, InMemoryTx>,
    ) -> anyhow::Result<()> {
        let name = if let Some(created) = event.payload::<UserCreated>() {
            created.name.clone()
        } else if let Some(updated) = event.payload::<UserNameUpdated>() {
            view.renames += 1;
            updated.name.clone()
        } else {
            return Ok(());
        };
        if self.reject.contains(&name.as_str()) {
            anyhow::bail!("name '{name}' is not allowed");
        }
        view.name = name;
        Ok(())
    }
}

/// Inline projection counting events per stream.
struct EventCounts {
    fail_on: Option<&'static str>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Count {
    events: u64,
}

#[async_trait]
impl Projection<InMemoryTx> for EventCounts {
    type Snapshot = Count;

    fn name(&self) -> &str {
        "event_counts"
    }

    async fn evolve(
        &self,
        count: &mut Count,
        event: &EventEnvelope,
        _ctx: &mut ProjectionContext<'_, InMemoryTx>,
    ) -> anyhow::Result<()> {
        if let (Some(bad), Some(created)) = (self.fail_on, event.payload::<UserCreated>()) {
            if created.name == bad {
                anyhow::bail!("refusing to count {bad}");
            }
        }
        count.events += 1;
        Ok(())
    }
}

/// Inline counter whose failures can be switched on and off.
#[derive(Clone)]
struct FlakyCounts {
    version: u32,
    failing: Arc<AtomicBool>,
}

impl FlakyCounts {
    fn new(version: u32) -> Self {
        Self {
            version,
            failing: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Projection<InMemoryTx> for FlakyCounts {
    type Snapshot = Count;

    fn name(&self) -> &str {
        "flaky_counts"
    }

    fn version(&self) -> u32 {
        self.version
    }

    async fn evolve(
        &self,
        count: &mut Count,
        _event: &EventEnvelope,
        _ctx: &mut ProjectionContext<'_, InMemoryTx>,
    ) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("counter offline");
        }
        count.events += 1;
        Ok(())
    }
}

/// Records every sequence it is handed.
#[derive(Clone, Default)]
struct Audit {
    seen: Arc<Mutex<Vec<u64>>>,
}

impl Audit {
    fn seen(&self) -> Vec<u64> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl SubscriptionHandler<InMemoryTx> for Audit {
    fn name(&self) -> &str {
        "audit"
    }

    async fn handle(
        &self,
        event: &EventEnvelope,
        _ctx: &mut SubscriptionContext<'_, InMemoryTx>,
    ) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(event.sequence());
        Ok(())
    }
}

fn event_types() -> EventTypeRegistry {
    EventTypeRegistry::builder()
        .register::<UserCreated>()
        .and_then(|b| b.register::<UserNameUpdated>())
        .and_then(|b| b.register::<UserDeactivated>())
        .unwrap()
        .build()
}

fn created(name: &str) -> NewEvent {
    NewEvent::new(UserCreated { name: name.to_string() }).unwrap()
}

fn renamed(name: &str) -> NewEvent {
    NewEvent::new(UserNameUpdated { name: name.to_string() }).unwrap()
}

struct Engine {
    store: EventStore<InMemoryStorage>,
    locks: Arc<InMemoryLockProvider>,
}

impl Engine {
    fn new(projections: ProjectionRegistry<InMemoryTx>) -> Self {
        Self {
            store: EventStore::new(InMemoryStorage::new(), event_types()).with_projections(projections),
            locks: Arc::new(InMemoryLockProvider::new()),
        }
    }

    fn with_user_names(users: UserNames) -> Self {
        Self::new(ProjectionRegistry::builder().eventual(users).unwrap().build())
    }

    fn daemon(&self) -> ProjectionDaemon<InMemoryStorage, InMemoryLockProvider> {
        ProjectionDaemon::new(
            self.store.clone(),
            Arc::clone(&self.locks),
            ProjectionDaemonConfig::default().with_lock_timeout(Duration::from_millis(10)),
        )
    }

    fn projections(&self) -> ProjectionManager<InMemoryStorage, InMemoryLockProvider> {
        ProjectionManager::new(self.store.clone(), Arc::clone(&self.locks), Duration::from_millis(100))
    }

    async fn flaky_count(&self, tenant: TenantId, user: StreamId) -> Option<u64> {
        self.store
            .load_snapshot::<Count>("flaky_counts", tenant, &user.to_string())
            .await
            .unwrap()
            .map(|count| count.events)
    }

    async fn user(&self, tenant: TenantId, user: StreamId) -> Option<UserView> {
        self.store
            .load_snapshot::<UserView>("user_names", tenant, &user.to_string())
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn rebuild_reproduces_the_same_view() {
    let engine = Engine::with_user_names(UserNames::new());
    let daemon = engine.daemon();
    let manager = engine.projections();
    let (tenant, user) = (TenantId::new(), StreamId::new());

    engine
        .store
        .start_stream(tenant, "user", user, vec![created("John"), renamed("Mary")])
        .await
        .unwrap();
    daemon.catch_up().await;

    let before = engine.user(tenant, user).await.unwrap();
    assert_eq!(before, UserView { name: "Mary".to_string(), renames: 1 });

    let status = manager.rebuild("user_names").await.unwrap();
    assert_eq!(status.state, ProjectionState::Rebuilding);
    assert_eq!(status.position, 0);
    assert_eq!(status.total_events, Some(2));
    assert!(engine.user(tenant, user).await.is_none());

    daemon.catch_up().await;
    assert_eq!(engine.user(tenant, user).await.unwrap(), before);

    let status = manager.get_status("user_names").await.unwrap().unwrap();
    assert_eq!(status.state, ProjectionState::Active);
    assert_eq!(status.position, 2);
    assert_eq!(status.progress_percentage, Some(100.0));
    assert!(status.rebuild_completed_at.is_some());
}

#[tokio::test]
async fn faulted_projection_is_retried_then_skipped() {
    let engine = Engine::with_user_names(UserNames { reject: vec!["Mallory"] });
    let daemon = engine.daemon();
    let manager = engine.projections();
    let tenant = TenantId::new();
    let (alice, bob, mallory) = (StreamId::new(), StreamId::new(), StreamId::new());

    for (user, name) in [(alice, "Alice"), (bob, "Bob"), (mallory, "Mallory")] {
        engine.store.start_stream(tenant, "user", user, vec![created(name)]).await.unwrap();
    }

    let outcome = daemon.process("user_names").await.unwrap();
    assert!(matches!(outcome, BatchOutcome::Faulted { sequence: 3, .. }));

    let status = manager.get_status("user_names").await.unwrap().unwrap();
    assert_eq!(status.state, ProjectionState::Faulted);
    assert_eq!(status.position, 2);
    assert_eq!(status.failed_event_sequence, Some(3));
    assert!(status.last_error.as_deref().unwrap().contains("Mallory"));
    assert_eq!(engine.user(tenant, bob).await.unwrap().name, "Bob");

    let failed = manager.get_failed_event("user_names").await.unwrap().unwrap();
    assert_eq!(failed.stream_id, mallory);
    assert_eq!(failed.event_type, "user_created");
    assert_eq!(failed.version, 1);

    // Faulted projections are left alone until an operator steps in.
    assert_eq!(daemon.process("user_names").await.unwrap(), BatchOutcome::Inert);

    manager.retry_failed_event("user_names").await.unwrap();
    let outcome = daemon.process("user_names").await.unwrap();
    assert!(matches!(outcome, BatchOutcome::Faulted { sequence: 3, .. }));
    let status = manager.get_status("user_names").await.unwrap().unwrap();
    assert_eq!((status.position, status.failed_event_sequence), (2, Some(3)));

    let skipped = manager.skip_failed_event("user_names").await.unwrap();
    assert_eq!(skipped.state, ProjectionState::Active);
    assert_eq!(skipped.position, 3);
    assert_eq!(skipped.last_error, None);
    assert!(engine.user(tenant, mallory).await.is_none());

    engine
        .store
        .append_to(tenant, "user", alice, ExpectedVersion::Exact(1), vec![renamed("Alicia")])
        .await
        .unwrap();
    daemon.catch_up().await;
    assert_eq!(engine.user(tenant, alice).await.unwrap().name, "Alicia");
}

#[tokio::test]
async fn unregistered_name_cannot_be_managed() {
    let engine = Engine::with_user_names(UserNames::new());
    let manager = engine.projections();

    assert!(matches!(
        manager.rebuild("ghost").await.unwrap_err(),
        AdminError::UnknownProjection(_)
    ));
    assert!(manager.get_status("ghost").await.unwrap().is_none());
    assert!(manager.get_failed_event("user_names").await.unwrap().is_none());
}

#[tokio::test]
async fn inline_projection_commits_with_the_append() {
    let engine = Engine::new(
        ProjectionRegistry::builder()
            .inline(EventCounts { fail_on: Some("Eve") })
            .unwrap()
            .build(),
    );
    let (tenant, user) = (TenantId::new(), StreamId::new());

    let stored = engine
        .store
        .start_stream(tenant, "user", user, vec![created("Ann"), renamed("Anna")])
        .await
        .unwrap();
    let count: Count = engine
        .store
        .load_snapshot("event_counts", tenant, &user.to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(count.events, 2);

    let status = engine.projections().get_status("event_counts").await.unwrap().unwrap();
    assert_eq!(status.position, stored[1].sequence);

    // A failing inline projection aborts the whole append.
    let other = StreamId::new();
    let err = engine
        .store
        .start_stream(tenant, "user", other, vec![created("Eve")])
        .await
        .unwrap_err();
    assert!(matches!(err, EventStoreError::Projection { ref name, .. } if name == "event_counts"));
    assert!(engine.store.fetch_for_reading(tenant, "user", other, None).await.unwrap().is_none());

    let mut tx = engine.store.storage().begin().await.unwrap();
    assert_eq!(tx.count_events().await.unwrap(), 2);
}

#[tokio::test]
async fn inline_projection_rebuilds_through_the_daemon() {
    let engine = Engine::new(
        ProjectionRegistry::builder()
            .inline(EventCounts { fail_on: None })
            .unwrap()
            .build(),
    );
    let daemon = engine.daemon();
    let manager = engine.projections();
    let (tenant, user) = (TenantId::new(), StreamId::new());

    engine.store.start_stream(tenant, "user", user, vec![created("Ann")]).await.unwrap();
    assert_eq!(daemon.process("event_counts").await.unwrap(), BatchOutcome::Inert);

    manager.rebuild("event_counts").await.unwrap();
    // Appends during a rebuild skip the inline pass; the daemon picks them up.
    engine
        .store
        .append_to(tenant, "user", user, ExpectedVersion::Exact(1), vec![renamed("Anna")])
        .await
        .unwrap();

    daemon.catch_up().await;
    let count: Count = engine
        .store
        .load_snapshot("event_counts", tenant, &user.to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(count.events, 2);

    let status = manager.get_status("event_counts").await.unwrap().unwrap();
    assert_eq!(status.state, ProjectionState::Active);
    assert_eq!(status.position, 2);
}

#[tokio::test]
async fn appends_leave_a_faulted_inline_rebuild_to_the_operator() {
    let counts = FlakyCounts::new(1);
    let engine = Engine::new(ProjectionRegistry::builder().inline(counts.clone()).unwrap().build());
    let daemon = engine.daemon();
    let manager = engine.projections();
    let (tenant, user) = (TenantId::new(), StreamId::new());

    engine
        .store
        .start_stream(tenant, "user", user, vec![created("Ann"), renamed("Anna"), renamed("Annie")])
        .await
        .unwrap();
    assert_eq!(engine.flaky_count(tenant, user).await, Some(3));

    manager.rebuild("flaky_counts").await.unwrap();
    counts.failing.store(true, Ordering::SeqCst);
    let outcome = daemon.process("flaky_counts").await.unwrap();
    assert!(matches!(outcome, BatchOutcome::Faulted { sequence: 1, .. }));
    counts.failing.store(false, Ordering::SeqCst);

    engine
        .store
        .append_to(tenant, "user", user, ExpectedVersion::Exact(3), vec![renamed("Anne")])
        .await
        .unwrap();

    let status = manager.get_status("flaky_counts").await.unwrap().unwrap();
    assert_eq!(status.state, ProjectionState::Faulted);
    assert_eq!(status.position, 0);
    assert_eq!(status.failed_event_sequence, Some(1));
    assert_eq!(engine.flaky_count(tenant, user).await, None);
    assert_eq!(daemon.process("flaky_counts").await.unwrap(), BatchOutcome::Inert);

    let retried = manager.retry_failed_event("flaky_counts").await.unwrap();
    assert_eq!(retried.state, ProjectionState::Rebuilding);
    daemon.catch_up().await;

    let status = manager.get_status("flaky_counts").await.unwrap().unwrap();
    assert_eq!(status.state, ProjectionState::Active);
    assert_eq!(status.position, 4);
    assert!(status.rebuild_completed_at.is_some());
    assert_eq!(engine.flaky_count(tenant, user).await, Some(4));
}

#[tokio::test]
async fn inline_status_follows_a_version_bump_without_rebuild() {
    let engine = Engine::new(ProjectionRegistry::builder().inline(FlakyCounts::new(1)).unwrap().build());
    let (tenant, user) = (TenantId::new(), StreamId::new());
    engine.store.start_stream(tenant, "user", user, vec![created("Bo")]).await.unwrap();

    let bumped = EventStore::new(engine.store.storage().clone(), event_types())
        .with_projections(ProjectionRegistry::builder().inline(FlakyCounts::new(2)).unwrap().build());
    let daemon = ProjectionDaemon::new(
        bumped.clone(),
        Arc::clone(&engine.locks),
        ProjectionDaemonConfig::default().with_auto_rebuild(false),
    );
    assert_eq!(daemon.process("flaky_counts").await.unwrap(), BatchOutcome::Inert);

    let stored = bumped
        .append_to(tenant, "user", user, ExpectedVersion::Exact(1), vec![renamed("Bob")])
        .await
        .unwrap();

    let manager = ProjectionManager::new(bumped, Arc::clone(&engine.locks), Duration::from_millis(100));
    let status = manager.get_status("flaky_counts").await.unwrap().unwrap();
    assert_eq!(status.version, 2);
    assert_eq!(status.state, ProjectionState::Active);
    assert_eq!(status.position, stored[0].sequence);
    assert!(status.rebuild_started_at.is_none());
}

#[tokio::test]
async fn tenants_with_the_same_stream_id_stay_apart() {
    let engine = Engine::with_user_names(UserNames::new());
    let daemon = engine.daemon();
    let (acme, globex, user) = (TenantId::new(), TenantId::new(), StreamId::new());

    engine.store.start_stream(acme, "user", user, vec![created("Ada")]).await.unwrap();
    engine
        .store
        .start_stream(globex, "user", user, vec![created("Grace"), renamed("Hopper")])
        .await
        .unwrap();
    daemon.catch_up().await;

    let acme_stream = engine.store.fetch_for_reading(acme, "user", user, None).await.unwrap().unwrap();
    let globex_stream = engine.store.fetch_for_reading(globex, "user", user, None).await.unwrap().unwrap();
    assert_eq!(acme_stream.version(), 1);
    assert_eq!(globex_stream.version(), 2);

    assert_eq!(engine.user(acme, user).await.unwrap().name, "Ada");
    assert_eq!(engine.user(globex, user).await.unwrap().name, "Hopper");
}

#[tokio::test]
async fn started_stream_can_be_extended_in_the_same_session() {
    let engine = Engine::with_user_names(UserNames::new());
    let (tenant, user) = (TenantId::new(), StreamId::new());

    let mut session = engine.store.begin().await.unwrap();
    session
        .start_stream(tenant, "user", user, vec![created("Kim"), renamed("Kimberly")])
        .await
        .unwrap();
    let mut stream = session.fetch_for_writing(tenant, "user", user).await.unwrap().unwrap();
    assert_eq!(stream.version(), 2);
    assert!(stream.events().is_empty());

    session
        .append(&mut stream, vec![NewEvent::new(UserDeactivated).unwrap()])
        .unwrap();
    let stored = session.commit().await.unwrap();
    assert_eq!(stored.iter().map(|e| e.version).collect::<Vec<_>>(), vec![1, 2, 3]);

    let stream = engine.store.fetch_for_reading(tenant, "user", user, None).await.unwrap().unwrap();
    assert_eq!(stream.version(), 3);
    assert_eq!(stream.events()[2].type_name(), "user_deactivated");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appenders_get_contiguous_sequences() {
    let engine = Engine::with_user_names(UserNames::new());
    let tenant = TenantId::new();

    let mut tasks = Vec::new();
    for writer in 0..8 {
        let store = engine.store.clone();
        tasks.push(tokio::spawn(async move {
            let user = StreamId::new();
            store
                .start_stream(tenant, "user", user, vec![created(&format!("user-{writer}"))])
                .await
                .unwrap();
            for round in 1..5u64 {
                store
                    .append_to(
                        tenant,
                        "user",
                        user,
                        ExpectedVersion::Exact(round),
                        vec![renamed(&format!("user-{writer}-{round}"))],
                    )
                    .await
                    .unwrap();
            }
            user
        }));
    }
    let mut users = Vec::new();
    for task in tasks {
        users.push(task.await.unwrap());
    }

    let mut tx = engine.store.storage().begin().await.unwrap();
    let events = tx.events_after(0, 1_000).await.unwrap();
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (1..=40).collect::<Vec<_>>());

    for user in users {
        let versions: Vec<u64> = events
            .iter()
            .filter(|e| e.stream_id == user)
            .map(|e| e.version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    }
}

#[tokio::test]
async fn racing_writers_on_one_stream_lose_optimistically() {
    let engine = Engine::with_user_names(UserNames::new());
    let (tenant, user) = (TenantId::new(), StreamId::new());
    engine.store.start_stream(tenant, "user", user, vec![created("Lee")]).await.unwrap();

    let mut first = engine.store.begin().await.unwrap();
    let mut second = engine.store.begin().await.unwrap();
    let mut a = first.fetch_for_writing(tenant, "user", user).await.unwrap().unwrap();
    let mut b = second.fetch_for_writing(tenant, "user", user).await.unwrap().unwrap();
    first.append(&mut a, vec![renamed("Lea")]).unwrap();
    second.append(&mut b, vec![renamed("Leo")]).unwrap();

    first.commit().await.unwrap();
    let err = second.commit().await.unwrap_err();
    assert!(matches!(err, EventStoreError::OptimisticConcurrency(_)));

    let stream = engine.store.fetch_for_reading(tenant, "user", user, None).await.unwrap().unwrap();
    assert_eq!(stream.version(), 2);
}

#[tokio::test]
async fn subscription_replays_from_a_sequence() {
    let engine = Engine::with_user_names(UserNames::new());
    let audit = Audit::default();
    let subscriptions = Arc::new(SubscriptionRegistry::builder().register(audit.clone()).unwrap().build());
    let daemon = SubscriptionDaemon::new(
        engine.store.clone(),
        Arc::clone(&subscriptions),
        Arc::clone(&engine.locks),
        SubscriptionDaemonConfig::default(),
    );
    let manager = SubscriptionManager::new(
        engine.store.clone(),
        subscriptions,
        Arc::clone(&engine.locks),
        Duration::from_millis(100),
    );

    let tenant = TenantId::new();
    let user = StreamId::new();
    let events = (0..6).map(|i| renamed(&format!("name-{i}"))).collect();
    engine.store.start_stream(tenant, "user", user, events).await.unwrap();

    daemon.catch_up().await;
    assert_eq!(audit.seen(), vec![1, 2, 3, 4, 5, 6]);

    let status = manager.replay("audit", Some(5), None).await.unwrap();
    assert_eq!(status.position, 4);

    daemon.catch_up().await;
    assert_eq!(audit.seen(), vec![1, 2, 3, 4, 5, 6, 5, 6]);
    let status = manager.get_status("audit").await.unwrap().unwrap();
    assert_eq!(status.position, 6);
    assert_eq!(status.progress_percentage, Some(100.0));
}

#[tokio::test]
async fn spawned_daemons_keep_up_until_shutdown() {
    let engine = Engine::with_user_names(UserNames::new());
    let audit = Audit::default();
    let subscriptions = Arc::new(SubscriptionRegistry::builder().register(audit.clone()).unwrap().build());

    let projections = ProjectionDaemon::new(
        engine.store.clone(),
        Arc::clone(&engine.locks),
        ProjectionDaemonConfig::default().with_polling_interval(Duration::from_millis(5)),
    )
    .spawn();
    let deliveries = SubscriptionDaemon::new(
        engine.store.clone(),
        subscriptions,
        Arc::clone(&engine.locks),
        SubscriptionDaemonConfig::default().with_polling_interval(Duration::from_millis(5)),
    )
    .spawn();

    let (tenant, user) = (TenantId::new(), StreamId::new());
    engine
        .store
        .start_stream(tenant, "user", user, vec![created("Sam"), renamed("Samantha")])
        .await
        .unwrap();

    let caught_up = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let projected = engine.user(tenant, user).await.map(|view| view.name);
            if projected.as_deref() == Some("Samantha") && audit.seen().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(caught_up.is_ok(), "daemons did not catch up");

    projections.shutdown().await;
    deliveries.shutdown().await;
}
