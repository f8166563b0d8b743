//! The per-entity write pipeline.
//!
//! An [`Entity`] owns the in-memory state of one event-sourced entity and
//! serializes every change to it. Events reach the log in one of three ways:
//!
//! - [`Entity::write`] appends one event with an optimistic version check and
//!   reports a lost race as `Ok(false)`.
//! - [`Entity::concurrent_write`] queues the event. A background worker drains
//!   the queue and commits whatever accumulated as one atomic batch, so every
//!   caller in a batch shares the same outcome.
//! - [`Entity::begin_transaction`] stages events explicitly and commits them
//!   together.
//!
//! Every path stores first, then applies. If a stored event fails to apply,
//! the in-memory state no longer matches the log and the entity is blocked:
//! all further writes fail fast until it is reactivated.

use std::{
    fmt,
    marker::PhantomData,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::{
    sync::{Mutex as AsyncMutex, Notify, mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    codec::{Codec, JsonCodec},
    config::Options,
    coordinator::Coordinator,
    error::{InitError, StorageError, WriteError},
    event::{Event, EventKind, RecordedEvent},
    publish::{NoPublisher, PublishRoutes, Publisher},
    shard::ShardResolver,
    snapshot::SnapshotStore,
    state::{State, Versioned},
    store::{AppendError, EventLog, Transaction},
};

/// Write gate shared by every write path.
///
/// `Blocked` is terminal for the instance: nothing moves it back to `Idle`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Idle,
    InTransaction,
    Blocked { requested: u64, stored: u64 },
}

struct Core<S: State> {
    state: Versioned<S>,
    /// Version of the last persisted snapshot.
    snapshot_version: u64,
}

impl<S: State> Core<S> {
    const fn since_snapshot(&self) -> u64 {
        self.state.version().saturating_sub(self.snapshot_version)
    }
}

/// A queued concurrent write waiting for its batch.
struct Pending<E> {
    payload: E,
    publish: bool,
    done: oneshot::Sender<Result<u64, WriteError>>,
}

#[derive(Clone, Copy, Debug)]
enum Checkpoint {
    /// Follow the configured [`SnapshotPolicy`](crate::snapshot::SnapshotPolicy).
    Policy,
    /// Snapshot whenever anything is unsnapshotted.
    Always,
}

/// Events staged in a store transaction, kept alongside their typed form for
/// the apply step and the subset to publish.
struct Staging<'a, S, L>
where
    S: State,
    L: EventLog<S::Id>,
{
    tx: Transaction<'a, S::Id, L>,
    events: Vec<Event<S::Id, S::Event>>,
    outgoing: Vec<RecordedEvent<S::Id>>,
}

impl<'a, S, L> Staging<'a, S, L>
where
    S: State,
    L: EventLog<S::Id>,
{
    const fn new(tx: Transaction<'a, S::Id, L>) -> Self {
        Self {
            tx,
            events: Vec::new(),
            outgoing: Vec::new(),
        }
    }

    fn stage<SS, C>(
        &mut self,
        coordinator: &Coordinator<S, L, SS, C>,
        event: Event<S::Id, S::Event>,
        publish: bool,
    ) -> Result<(), StorageError>
    where
        SS: SnapshotStore<S::Id>,
        C: Codec,
    {
        let recorded = coordinator.record(&event)?;
        if publish {
            self.outgoing.push(recorded.clone());
        }
        self.tx.stage(recorded);
        self.events.push(event);
        Ok(())
    }

    fn len(&self) -> usize {
        self.events.len()
    }

    fn versions(&self) -> Vec<u64> {
        self.events.iter().map(|event| event.version).collect()
    }
}

struct Shared<S, L, SS, P, C>
where
    S: State,
{
    coordinator: Coordinator<S, L, SS, C>,
    publisher: P,
    routes: PublishRoutes,
    core: AsyncMutex<Core<S>>,
    mode: Mutex<Mode>,
    idle: Notify,
}

impl<S, L, SS, P, C> Shared<S, L, SS, P, C>
where
    S: State,
    L: EventLog<S::Id>,
    SS: SnapshotStore<S::Id>,
    P: Publisher<S::Id>,
    C: Codec,
{
    fn state_id(&self) -> String {
        self.coordinator.state_id().to_string()
    }

    // The gate is never held across an await.
    fn mode(&self) -> MutexGuard<'_, Mode> {
        self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn blocked(&self, requested: u64, stored: u64) -> WriteError {
        WriteError::Blocked {
            state_id: self.state_id(),
            requested,
            stored,
        }
    }

    fn ensure_unblocked(&self) -> Result<(), WriteError> {
        let mode = *self.mode();
        match mode {
            Mode::Blocked { requested, stored } => Err(self.blocked(requested, stored)),
            Mode::Idle | Mode::InTransaction => Ok(()),
        }
    }

    fn ensure_idle(&self) -> Result<(), WriteError> {
        let mode = *self.mode();
        match mode {
            Mode::Idle => Ok(()),
            Mode::InTransaction => Err(WriteError::ConcurrentModification {
                state_id: self.state_id(),
            }),
            Mode::Blocked { requested, stored } => Err(self.blocked(requested, stored)),
        }
    }

    fn enter_transaction(&self) -> Result<(), WriteError> {
        let mut mode = self.mode();
        match *mode {
            Mode::Idle => {
                *mode = Mode::InTransaction;
                Ok(())
            }
            Mode::InTransaction => Err(WriteError::AlreadyInTransaction {
                state_id: self.state_id(),
            }),
            Mode::Blocked { requested, stored } => Err(self.blocked(requested, stored)),
        }
    }

    fn leave_transaction(&self) {
        {
            let mut mode = self.mode();
            if *mode == Mode::InTransaction {
                *mode = Mode::Idle;
            }
        }
        self.idle.notify_one();
    }

    fn block(&self, requested: u64, stored: u64) {
        *self.mode() = Mode::Blocked { requested, stored };
        tracing::error!(
            kind = S::KIND,
            state_id = %self.coordinator.state_id(),
            requested,
            stored,
            "stored event failed to apply; entity blocked"
        );
    }

    /// Apply committed events as one unit, blocking the entity on failure.
    fn apply(
        &self,
        core: &mut Core<S>,
        events: &[Event<S::Id, S::Event>],
    ) -> Result<(), WriteError> {
        core.state.player_all(events).map_err(|e| {
            let version = e.version();
            self.block(version, core.state.version());
            WriteError::Apply {
                state_id: self.state_id(),
                version,
                source: Box::new(e),
            }
        })
    }

    async fn publish(&self, events: &[RecordedEvent<S::Id>]) {
        for event in events {
            let Some(route) = self.routes.resolve(&event.type_code) else {
                tracing::trace!(type_code = %event.type_code, "no publish route");
                continue;
            };
            if let Err(e) = self
                .publisher
                .publish(event, &route.topic, &route.provider)
                .await
            {
                tracing::warn!(
                    error = %e,
                    version = event.version,
                    topic = %route.topic,
                    provider = %route.provider,
                    "publish failed; event stays committed"
                );
            }
        }
    }

    /// Persist a snapshot if one is due.
    ///
    /// Under [`Checkpoint::Policy`] the save is awaited in full and a failure
    /// is returned; the events stay committed and applied. The snapshot that
    /// ends an explicit transaction is bounded by the configured timeout and
    /// its failures are only logged.
    async fn checkpoint(&self, core: &mut Core<S>, when: Checkpoint) -> Result<(), WriteError> {
        let pending = core.since_snapshot();
        let version = core.state.version();
        match when {
            Checkpoint::Policy => {
                if !self.coordinator.options().snapshot.should_snapshot(pending) {
                    return Ok(());
                }
                self.coordinator.save_snapshot(&core.state).await?;
                core.snapshot_version = version;
            }
            Checkpoint::Always => {
                if pending == 0 {
                    return Ok(());
                }
                let limit = self.coordinator.options().snapshot_timeout();
                match tokio::time::timeout(limit, self.coordinator.save_snapshot(&core.state)).await
                {
                    Ok(Ok(())) => core.snapshot_version = version,
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, version, "snapshot after commit failed");
                    }
                    Err(_) => tracing::warn!(
                        version,
                        timeout_ms = self.coordinator.options().snapshot_timeout_ms,
                        "snapshot after commit timed out"
                    ),
                }
            }
        }
        Ok(())
    }

    /// Commit staged events atomically, then apply, publish and checkpoint.
    async fn commit(
        &self,
        core: &mut Core<S>,
        staging: Staging<'_, S, L>,
        when: Checkpoint,
    ) -> Result<(), WriteError> {
        let Staging {
            tx,
            events,
            outgoing,
        } = staging;
        tx.commit().await.map_err(|e| match e {
            AppendError::Conflict(conflict) => WriteError::Conflict(conflict),
            AppendError::Store(e) => WriteError::Storage(StorageError::event_log(e)),
        })?;
        self.apply(core, &events)?;
        self.publish(&outgoing).await;
        self.checkpoint(core, when).await
    }

    /// Commit one drained batch of concurrent writes and resolve its waiters.
    #[tracing::instrument(skip_all, fields(kind = S::KIND, state_id = %self.coordinator.state_id(), size = batch.len()))]
    async fn commit_batch(&self, batch: Vec<Pending<S::Event>>) {
        let mut core = loop {
            let idle = self.idle.notified();
            let core = self.core.lock().await;
            match self.enter_transaction() {
                Ok(()) => break core,
                Err(WriteError::AlreadyInTransaction { .. }) => {
                    drop(core);
                    tracing::trace!("waiting for open transaction to end");
                    idle.await;
                }
                Err(e) => {
                    fail_all(batch.into_iter().map(|pending| pending.done), e);
                    return;
                }
            }
        };

        let base = core.state.version();
        let mut staging = Staging::new(self.coordinator.begin());
        let mut waiters = Vec::with_capacity(batch.len());
        let mut staged = Ok(());
        for (offset, pending) in batch.into_iter().enumerate() {
            let version = base + offset as u64 + 1;
            let event = Event::stamp(
                self.coordinator.state_id().clone(),
                version,
                pending.payload,
            );
            if staged.is_ok() {
                staged = staging.stage(&self.coordinator, event, pending.publish);
            }
            waiters.push((version, pending.done));
        }

        let result = match staged {
            Ok(()) => self.commit(&mut core, staging, Checkpoint::Policy).await,
            Err(e) => Err(WriteError::Storage(e)),
        };
        self.leave_transaction();
        drop(core);

        match result {
            Ok(()) => {
                tracing::debug!("batch committed");
                for (version, done) in waiters {
                    let _ = done.send(Ok(version));
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "batch failed");
                fail_all(waiters.into_iter().map(|(_, done)| done), e);
            }
        }
    }
}

fn fail_all<I>(waiters: I, error: WriteError)
where
    I: IntoIterator<Item = oneshot::Sender<Result<u64, WriteError>>>,
{
    let shared = Arc::new(error);
    for done in waiters {
        let _ = done.send(Err(WriteError::Batch(Arc::clone(&shared))));
    }
}

async fn run_batches<S, L, SS, P, C>(
    shared: Arc<Shared<S, L, SS, P, C>>,
    mut queue: mpsc::UnboundedReceiver<Pending<S::Event>>,
) where
    S: State,
    L: EventLog<S::Id>,
    SS: SnapshotStore<S::Id>,
    P: Publisher<S::Id>,
    C: Codec,
{
    let limit = shared.coordinator.options().batch_limit();
    let mut batch = Vec::new();
    while queue.recv_many(&mut batch, limit).await > 0 {
        shared.commit_batch(std::mem::take(&mut batch)).await;
    }
    tracing::trace!(state_id = %shared.coordinator.state_id(), "batch queue closed");
}

fn validate<E: EventKind>(payload: &E) -> Result<(), WriteError> {
    if payload.kind().trim().is_empty() {
        return Err(WriteError::InvalidArgument(
            "event type code must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Configures and activates an [`Entity`].
///
/// ```ignore
/// let entity = Entity::<Account, _, _>::builder(log, snapshots)
///     .with_publisher(bus, PublishRoutes::to(PublishOptions::new("accounts", "nats")))
///     .with_options(Options::default().with_snapshot(SnapshotPolicy::Synchronous))
///     .activate("a-1".to_string(), &resolver)
///     .await?;
/// ```
pub struct EntityBuilder<S, L, SS, P = NoPublisher, C = JsonCodec> {
    log: L,
    snapshots: SS,
    publisher: P,
    routes: PublishRoutes,
    codec: C,
    options: Options,
    _state: PhantomData<fn() -> S>,
}

impl<S, L, SS> EntityBuilder<S, L, SS> {
    #[must_use]
    pub fn new(log: L, snapshots: SS) -> Self {
        Self {
            log,
            snapshots,
            publisher: NoPublisher,
            routes: PublishRoutes::default(),
            codec: JsonCodec,
            options: Options::default(),
            _state: PhantomData,
        }
    }
}

impl<S, L, SS, P, C> EntityBuilder<S, L, SS, P, C> {
    /// Publish committed events through `publisher` according to `routes`.
    #[must_use]
    pub fn with_publisher<P2>(
        self,
        publisher: P2,
        routes: PublishRoutes,
    ) -> EntityBuilder<S, L, SS, P2, C> {
        EntityBuilder {
            log: self.log,
            snapshots: self.snapshots,
            publisher,
            routes,
            codec: self.codec,
            options: self.options,
            _state: PhantomData,
        }
    }

    #[must_use]
    pub fn with_codec<C2>(self, codec: C2) -> EntityBuilder<S, L, SS, P, C2> {
        EntityBuilder {
            log: self.log,
            snapshots: self.snapshots,
            publisher: self.publisher,
            routes: self.routes,
            codec,
            options: self.options,
            _state: PhantomData,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }
}

impl<S, L, SS, P, C> EntityBuilder<S, L, SS, P, C>
where
    S: State,
    L: EventLog<S::Id>,
    SS: SnapshotStore<S::Id>,
    P: Publisher<S::Id>,
    C: Codec,
{
    /// Bind to `state_id`, restore its state and start the batch worker.
    ///
    /// State is restored from the latest snapshot, then every event stored
    /// after it is replayed. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`InitError`] if the id is invalid, storage cannot be resolved,
    /// or the stored history cannot be restored.
    #[tracing::instrument(skip_all, fields(kind = S::KIND, state_id = %state_id))]
    pub async fn activate<R>(
        self,
        state_id: S::Id,
        resolver: &R,
    ) -> Result<Entity<S, L, SS, P, C>, InitError>
    where
        R: ShardResolver,
    {
        let coordinator = Coordinator::<S, L, SS, C>::init(
            state_id,
            self.log,
            self.snapshots,
            self.codec,
            self.options,
            resolver,
        )
        .await?;
        let mut state = coordinator
            .read_snapshot()
            .await
            .map_err(|source| InitError::Restore {
                state_id: coordinator.state_id().to_string(),
                source,
            })?;
        let snapshot_version = state.version();
        coordinator.replay(&mut state).await?;
        tracing::debug!(snapshot_version, version = state.version(), "entity activated");

        let shared = Arc::new(Shared {
            coordinator,
            publisher: self.publisher,
            routes: self.routes,
            core: AsyncMutex::new(Core {
                state,
                snapshot_version,
            }),
            mode: Mutex::new(Mode::Idle),
            idle: Notify::new(),
        });
        let (queue, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_batches(Arc::clone(&shared), rx));
        Ok(Entity {
            shared,
            queue,
            worker,
        })
    }
}

impl<S, L, SS, P, C> fmt::Debug for EntityBuilder<S, L, SS, P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityBuilder")
            .field("routes", &self.routes)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// An activated event-sourced entity.
///
/// Dropping an entity without [`deactivate`](Self::deactivate) lets the batch
/// worker drain what is already queued, but skips the final snapshot.
pub struct Entity<S, L, SS, P = NoPublisher, C = JsonCodec>
where
    S: State,
{
    shared: Arc<Shared<S, L, SS, P, C>>,
    queue: mpsc::UnboundedSender<Pending<S::Event>>,
    worker: JoinHandle<()>,
}

impl<S, L, SS> Entity<S, L, SS>
where
    S: State,
{
    #[must_use]
    pub fn builder(log: L, snapshots: SS) -> EntityBuilder<S, L, SS> {
        EntityBuilder::new(log, snapshots)
    }
}

impl<S, L, SS, P, C> Entity<S, L, SS, P, C>
where
    S: State,
    L: EventLog<S::Id>,
    SS: SnapshotStore<S::Id>,
    P: Publisher<S::Id>,
    C: Codec,
{
    #[must_use]
    pub fn state_id(&self) -> &S::Id {
        self.shared.coordinator.state_id()
    }

    #[must_use]
    pub fn coordinator(&self) -> &Coordinator<S, L, SS, C> {
        &self.shared.coordinator
    }

    /// A copy of the current state and version.
    pub async fn state(&self) -> Versioned<S> {
        self.shared.core.lock().await.state.clone()
    }

    pub async fn version(&self) -> u64 {
        self.shared.core.lock().await.state.version()
    }

    #[must_use]
    pub fn is_blocked(&self) -> bool {
        matches!(*self.shared.mode(), Mode::Blocked { .. })
    }

    /// Store and apply a single event stamped `version + 1`.
    ///
    /// Returns `Ok(false)` if another writer already took that version; the
    /// state is unchanged and the caller may retry. Publish failures are
    /// logged and do not fail the write.
    ///
    /// # Errors
    ///
    /// - [`WriteError::InvalidArgument`] for an event without a type code.
    /// - [`WriteError::Blocked`] once the entity is blocked, without any I/O.
    /// - [`WriteError::ConcurrentModification`] while a transaction is open.
    /// - [`WriteError::Storage`] if the log fails, or if a snapshot due under
    ///   the configured policy fails to save. In the latter case the event is
    ///   already stored and applied.
    /// - [`WriteError::Apply`] if the stored event does not apply; the entity
    ///   is blocked from then on.
    #[tracing::instrument(skip_all, fields(kind = S::KIND, state_id = %self.state_id(), type_code = payload.kind()))]
    pub async fn write(&self, payload: S::Event, publish: bool) -> Result<bool, WriteError> {
        validate(&payload)?;
        self.shared.ensure_unblocked()?;
        let mut core = self.shared.core.lock().await;
        self.shared.ensure_idle()?;

        let event = Event::stamp(self.state_id().clone(), core.state.next_version(), payload);
        let recorded = self.shared.coordinator.record(&event)?;
        let outgoing = publish.then(|| recorded.clone());
        if !self.shared.coordinator.save_event(recorded).await? {
            return Ok(false);
        }
        self.shared.apply(&mut core, std::slice::from_ref(&event))?;
        tracing::trace!(version = event.version, "event applied");
        if let Some(recorded) = outgoing {
            self.shared.publish(std::slice::from_ref(&recorded)).await;
        }
        self.shared.checkpoint(&mut core, Checkpoint::Policy).await?;
        Ok(true)
    }

    /// Queue an event for the next batch commit and wait for its outcome.
    ///
    /// Events queued while a batch is committing are collected into the next
    /// one, up to [`Options::batch_max_size`] per commit. Versions are assigned
    /// contiguously in queue order. Resolves with the event's version once its
    /// batch is committed and applied.
    ///
    /// # Errors
    ///
    /// - [`WriteError::InvalidArgument`] or [`WriteError::Blocked`] before
    ///   queueing.
    /// - [`WriteError::Batch`] wrapping the shared failure if the batch fails.
    ///   Nothing from the batch is stored unless the failure is a policy
    ///   snapshot, which runs after the batch is committed and applied.
    /// - [`WriteError::Closed`] if the batch worker is gone.
    pub async fn concurrent_write(
        &self,
        payload: S::Event,
        publish: bool,
    ) -> Result<u64, WriteError> {
        validate(&payload)?;
        self.shared.ensure_unblocked()?;
        let closed = || WriteError::Closed {
            state_id: self.shared.state_id(),
        };
        let (done, outcome) = oneshot::channel();
        self.queue
            .send(Pending {
                payload,
                publish,
                done,
            })
            .map_err(|_| closed())?;
        outcome.await.map_err(|_| closed())?
    }

    /// Open an explicit transaction.
    ///
    /// While it is open, single writes fail with
    /// [`WriteError::ConcurrentModification`] and queued concurrent writes wait
    /// for it to end.
    ///
    /// # Errors
    ///
    /// [`WriteError::AlreadyInTransaction`] if one is already open, or
    /// [`WriteError::Blocked`].
    pub async fn begin_transaction(
        &self,
    ) -> Result<EntityTransaction<'_, S, L, SS, P, C>, WriteError> {
        let core = self.shared.core.lock().await;
        self.shared.enter_transaction()?;
        let base = core.state.version();
        drop(core);
        tracing::debug!(kind = S::KIND, state_id = %self.state_id(), base, "transaction opened");
        Ok(EntityTransaction {
            shared: &self.shared,
            base,
            staging: Staging::new(self.shared.coordinator.begin()),
            open: true,
        })
    }

    /// Drain queued writes, then persist a final snapshot.
    ///
    /// A blocked entity skips the snapshot, since its state is known to
    /// diverge from the log.
    ///
    /// # Errors
    ///
    /// [`WriteError::Blocked`] if the snapshot was skipped, or
    /// [`WriteError::Storage`] if saving it failed.
    #[tracing::instrument(skip_all, fields(kind = S::KIND, state_id = %self.state_id()))]
    pub async fn deactivate(self) -> Result<(), WriteError> {
        let Self {
            shared,
            queue,
            worker,
        } = self;
        drop(queue);
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "batch worker did not finish cleanly");
        }
        let core = shared.core.lock().await;
        if let Mode::Blocked { requested, stored } = *shared.mode() {
            tracing::warn!("entity is blocked; skipping final snapshot");
            return Err(shared.blocked(requested, stored));
        }
        shared.coordinator.save_snapshot(&core.state).await?;
        tracing::debug!(version = core.state.version(), "entity deactivated");
        Ok(())
    }
}

impl<S, L, SS, P, C> fmt::Debug for Entity<S, L, SS, P, C>
where
    S: State,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = *self.shared.mode.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Entity")
            .field("coordinator", &self.shared.coordinator)
            .field("mode", &mode)
            .finish_non_exhaustive()
    }
}

/// An open explicit transaction on an [`Entity`].
///
/// Staged events are invisible until [`commit`](Self::commit). Dropping the
/// transaction rolls it back.
pub struct EntityTransaction<'e, S, L, SS, P, C>
where
    S: State,
    L: EventLog<S::Id>,
{
    shared: &'e Shared<S, L, SS, P, C>,
    base: u64,
    staging: Staging<'e, S, L>,
    open: bool,
}

impl<S, L, SS, P, C> EntityTransaction<'_, S, L, SS, P, C>
where
    S: State,
    L: EventLog<S::Id>,
    SS: SnapshotStore<S::Id>,
    P: Publisher<S::Id>,
    C: Codec,
{
    /// Stage an event and return the version it will commit at.
    ///
    /// # Errors
    ///
    /// [`WriteError::InvalidArgument`] for an event without a type code, or
    /// [`WriteError::Storage`] if the payload does not encode. The transaction
    /// stays open either way.
    pub fn write(&mut self, payload: S::Event, publish: bool) -> Result<u64, WriteError> {
        validate(&payload)?;
        let version = self.base + self.staging.len() as u64 + 1;
        let event = Event::stamp(self.shared.coordinator.state_id().clone(), version, payload);
        self.staging.stage(&self.shared.coordinator, event, publish)?;
        Ok(version)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.staging.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.staging.len() == 0
    }

    /// Commit every staged event atomically, apply them, publish the flagged
    /// ones and snapshot with a bounded wait.
    ///
    /// Returns the committed versions in order.
    ///
    /// # Errors
    ///
    /// [`WriteError::Conflict`] or [`WriteError::Storage`] if the append
    /// fails (nothing is stored), or [`WriteError::Apply`] if the committed
    /// events do not apply (the entity is blocked).
    #[tracing::instrument(skip_all, fields(kind = S::KIND, state_id = %self.shared.coordinator.state_id(), size = self.len()))]
    pub async fn commit(mut self) -> Result<Vec<u64>, WriteError> {
        let empty = Staging::new(self.shared.coordinator.begin());
        let staging = std::mem::replace(&mut self.staging, empty);
        let versions = staging.versions();
        let result = if versions.is_empty() {
            Ok(())
        } else {
            let mut core = self.shared.core.lock().await;
            self.shared.commit(&mut core, staging, Checkpoint::Always).await
        };
        self.close();
        result.map(|()| versions)
    }

    /// Discard every staged event and end the transaction.
    pub fn rollback(mut self) {
        tracing::debug!(discarded = self.len(), "transaction rolled back");
        self.close();
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.shared.leave_transaction();
        }
    }
}

impl<S, L, SS, P, C> Drop for EntityTransaction<'_, S, L, SS, P, C>
where
    S: State,
    L: EventLog<S::Id>,
{
    fn drop(&mut self) {
        if self.open {
            self.open = false;
            {
                let mut mode = self.shared.mode.lock().unwrap_or_else(PoisonError::into_inner);
                if *mode == Mode::InTransaction {
                    *mode = Mode::Idle;
                }
            }
            self.shared.idle.notify_one();
        }
    }
}

impl<S, L, SS, P, C> fmt::Debug for EntityTransaction<'_, S, L, SS, P, C>
where
    S: State,
    L: EventLog<S::Id>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityTransaction")
            .field("base", &self.base)
            .field("staged", &self.staging.len())
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}
