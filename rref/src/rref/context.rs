//! Per-worker bookkeeping of owned and held remote references.
//!
//! The context of a worker tracks
//!
//!   * the values it owns together with the forks registered for each of them,
//!   * the user forks it created that the owner has not acknowledged yet,
//!   * the user forks that have been acknowledged,
//!   * the forks it pickled for other workers that have not been accepted yet.
//!
//! All state is guarded by a single mutex, which is never held while sending
//! a message or dropping a reference.
//!
//! Protocol anomalies, such as a duplicate fork registration or the deletion
//! of an unknown fork, are logged and otherwise ignored.

use bytes::Bytes;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt, mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::{Duration, Instant},
};
use tokio::sync::Notify;

use super::{OwnerRRef, RRef, RRefForkData, UserInner, UserRRef};
use crate::{
    agent::RpcAgent,
    id::IdGenerator,
    msg::{ChildAccept, FetchCall, ForkMsg, Message, MessageType},
    Cfg, ForkId, RRefId, RpcError, RpcFuture, TransportError, WorkerId, WorkerInfo,
};

/// An event of the remote reference protocol.
///
/// Events are only recorded when [Cfg::record_events] is enabled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RRefEvent {
    /// A user fork was created locally.
    ForkCreated {
        /// RRef.
        rref_id: RRefId,
        /// Created fork.
        fork_id: ForkId,
    },
    /// The owner registered a fork.
    ForkAdded {
        /// RRef.
        rref_id: RRefId,
        /// Registered fork.
        fork_id: ForkId,
        /// Worker holding the fork, if already known.
        holder: Option<WorkerId>,
    },
    /// The owner acknowledged a local user fork.
    ForkAcked {
        /// Acknowledged fork.
        fork_id: ForkId,
    },
    /// A local user fork was dropped and its deletion sent to the owner.
    UserDeleted {
        /// RRef.
        rref_id: RRefId,
        /// Dropped fork.
        fork_id: ForkId,
    },
    /// The owner removed a fork.
    ForkDeleted {
        /// RRef.
        rref_id: RRefId,
        /// Removed fork.
        fork_id: ForkId,
    },
    /// An owner entry was collected.
    OwnerCollected {
        /// RRef.
        rref_id: RRefId,
        /// Collected although forks were still registered.
        forced: bool,
    },
    /// Notifying the owner of a fork deletion failed.
    DeleteFailed {
        /// RRef.
        rref_id: RRefId,
        /// Dropped fork.
        fork_id: ForkId,
        /// Reason.
        error: RpcError,
    },
}

/// State of an owner entry at the time of a [snapshot](RRefContext::snapshot).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OwnerSnapshot {
    /// Registered forks and the workers holding them.
    pub forks: BTreeMap<ForkId, Option<WorkerId>>,
    /// Number of local [OwnerRRef] handles.
    pub local_refs: usize,
    /// Whether the value has been computed.
    pub materialized: bool,
}

/// State of a context at the time of a [snapshot](RRefContext::snapshot).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextSnapshot {
    /// Owned values.
    pub owners: BTreeMap<RRefId, OwnerSnapshot>,
    /// User forks awaiting acknowledgement by their owner.
    pub pending_users: BTreeSet<ForkId>,
    /// User forks acknowledged by their owner.
    pub confirmed_users: BTreeSet<ForkId>,
    /// Forks pickled by a local user that the owner has not accepted yet.
    pub pending_children: BTreeSet<ForkId>,
}

struct OwnerState {
    value: RpcFuture<Bytes>,
    forks: HashMap<ForkId, Option<WorkerId>>,
    local_refs: usize,
    last_activity: Instant,
}

impl OwnerState {
    fn new(value: RpcFuture<Bytes>) -> Self {
        Self { value, forks: HashMap::new(), local_refs: 0, last_activity: Instant::now() }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn is_unused(&self) -> bool {
        self.forks.is_empty() && self.local_refs == 0
    }
}

#[derive(Default)]
struct State {
    owners: HashMap<RRefId, OwnerState>,
    pending_users: HashMap<ForkId, UserRRef>,
    /// Confirmed user forks and the owners they are registered with.
    confirmed_users: HashMap<ForkId, WorkerId>,
    pending_children: HashMap<ForkId, UserRRef>,
    events: Vec<RRefEvent>,
}

pub(crate) struct CtxInner {
    agent: Arc<dyn RpcAgent>,
    me: WorkerInfo,
    cfg: Cfg,
    ids: IdGenerator,
    state: Mutex<State>,
    changed: Notify,
    destroyed: AtomicBool,
}

/// Remote reference context of a worker.
///
/// Clones share the same context.
#[derive(Clone)]
pub struct RRefContext {
    inner: Arc<CtxInner>,
}

impl fmt::Debug for RRefContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RRefContext")
            .field("worker", &self.inner.me)
            .field("destroyed", &self.inner.destroyed.load(Ordering::SeqCst))
            .finish()
    }
}

impl RRefContext {
    /// Creates the context of the local worker of the agent.
    pub fn new(agent: Arc<dyn RpcAgent>, cfg: Cfg) -> Self {
        let me = agent.worker_info().clone();
        Self {
            inner: Arc::new(CtxInner {
                ids: IdGenerator::new(me.id),
                me,
                agent,
                cfg,
                state: Mutex::new(State::default()),
                changed: Notify::new(),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<CtxInner>) -> Self {
        Self { inner }
    }

    fn weak(&self) -> Weak<CtxInner> {
        Arc::downgrade(&self.inner)
    }

    /// The local worker.
    pub fn worker_info(&self) -> &WorkerInfo {
        &self.inner.me
    }

    fn record(&self, state: &mut State, event: RRefEvent) {
        if self.inner.cfg.record_events {
            state.events.push(event);
        }
    }

    fn changed(&self) {
        self.inner.changed.notify_waiters();
    }

    fn check_alive(&self) -> Result<(), RpcError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            Err(RpcError::ShutdownInProgress)
        } else {
            Ok(())
        }
    }

    fn new_user(&self, owner: WorkerInfo, rref_id: RRefId, fork_id: ForkId, parent: Option<WorkerInfo>) -> UserRRef {
        UserRRef::new(UserInner { rref_id, fork_id, owner, parent, confirmed: RpcFuture::new(), ctx: self.weak() })
    }

    fn add_pending_user(&self, user: &UserRRef) {
        let mut state = self.inner.state.lock().unwrap();
        state.pending_users.insert(user.fork_id(), user.clone());
        self.record(&mut state, RRefEvent::ForkCreated { rref_id: user.rref_id(), fork_id: user.fork_id() });
        tracing::trace!(worker = %self.inner.me, rref_id = %user.rref_id(), fork_id = %user.fork_id(), "created pending user fork");
    }

    /// Creates a user reference to a new value that will be owned by `owner`.
    ///
    /// The fork is pending until [handle_fork_ack](Self::handle_fork_ack)
    /// or [handle_fork_failed](Self::handle_fork_failed) is called for it;
    /// until then the context keeps the reference alive.
    pub fn create_user_rref(&self, owner: &WorkerInfo) -> UserRRef {
        let user = self.new_user(owner.clone(), self.inner.ids.rref_id(), self.inner.ids.fork_id(), None);
        self.add_pending_user(&user);
        user
    }

    /// Wraps a local value into a new owner reference.
    pub fn create_owner_rref(&self, value: Bytes) -> OwnerRRef {
        let rref_id = self.inner.ids.rref_id();
        let value = RpcFuture::ready(Ok(value));

        let mut owner = OwnerState::new(value.clone());
        owner.local_refs = 1;
        self.inner.state.lock().unwrap().owners.insert(rref_id, owner);

        tracing::trace!(worker = %self.inner.me, %rref_id, "created owner entry");
        OwnerRRef::new(rref_id, self.inner.me.clone(), value, self.weak())
    }

    /// Returns a handle to the owner entry, creating an entry with a value yet
    /// to be computed if none exists.
    pub fn get_or_create_owner(&self, rref_id: RRefId) -> OwnerRRef {
        let value = {
            let mut state = self.inner.state.lock().unwrap();
            let owner = state.owners.entry(rref_id).or_insert_with(|| OwnerState::new(RpcFuture::new()));
            owner.local_refs += 1;
            owner.touch();
            owner.value.clone()
        };
        OwnerRRef::new(rref_id, self.inner.me.clone(), value, self.weak())
    }

    /// Returns a handle to an existing owner entry.
    pub fn owner_rref(&self, rref_id: RRefId) -> Result<OwnerRRef, RpcError> {
        let value = {
            let mut state = self.inner.state.lock().unwrap();
            let owner = state.owners.get_mut(&rref_id).ok_or(RpcError::UnknownRRef(rref_id))?;
            owner.local_refs += 1;
            owner.value.clone()
        };
        Ok(OwnerRRef::new(rref_id, self.inner.me.clone(), value, self.weak()))
    }

    /// Future of an owned value requested by a user.
    pub(crate) fn owner_value(&self, rref_id: RRefId) -> Result<RpcFuture<Bytes>, RpcError> {
        let mut state = self.inner.state.lock().unwrap();
        let owner = state.owners.get_mut(&rref_id).ok_or(RpcError::UnknownRRef(rref_id))?;
        owner.touch();
        Ok(owner.value.clone())
    }

    pub(crate) fn retain(&self, rref_id: RRefId) {
        if let Some(owner) = self.inner.state.lock().unwrap().owners.get_mut(&rref_id) {
            owner.local_refs += 1;
        }
    }

    pub(crate) fn release(&self, rref_id: RRefId) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(owner) = state.owners.get_mut(&rref_id) {
                owner.local_refs = owner.local_refs.saturating_sub(1);
            }
            self.collect_if_unused(&mut state, rref_id);
        }
        self.changed();
    }

    fn collect_if_unused(&self, state: &mut State, rref_id: RRefId) {
        if state.owners.get(&rref_id).map(OwnerState::is_unused).unwrap_or_default() {
            state.owners.remove(&rref_id);
            self.record(state, RRefEvent::OwnerCollected { rref_id, forced: false });
            tracing::debug!(worker = %self.inner.me, %rref_id, "collected owner entry");
        }
    }

    /// Registers a fork held by `holder` with the owner entry, which is
    /// created if necessary.
    ///
    /// Returns false if the fork was already registered.
    pub fn handle_fork_add(&self, holder: WorkerId, rref_id: RRefId, fork_id: ForkId) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        let owner = state.owners.entry(rref_id).or_insert_with(|| OwnerState::new(RpcFuture::new()));
        owner.touch();
        if owner.forks.contains_key(&fork_id) {
            tracing::debug!(worker = %self.inner.me, %rref_id, %fork_id, holder, "ignoring duplicate fork registration");
            return false;
        }
        owner.forks.insert(fork_id, Some(holder));
        self.record(&mut state, RRefEvent::ForkAdded { rref_id, fork_id, holder: Some(holder) });
        tracing::trace!(worker = %self.inner.me, %rref_id, %fork_id, holder, "registered fork");
        true
    }

    /// Confirms a pending user fork after its owner has acknowledged it.
    ///
    /// If the fork was received from a user, that user is notified that it
    /// may release its own fork.
    /// Returns false if the fork was not pending.
    pub fn handle_fork_ack(&self, fork_id: ForkId) -> bool {
        let user = {
            let mut state = self.inner.state.lock().unwrap();
            let Some(user) = state.pending_users.remove(&fork_id) else {
                tracing::debug!(worker = %self.inner.me, %fork_id, "ignoring acknowledgement of unknown fork");
                return false;
            };
            state.confirmed_users.insert(fork_id, user.owner().id);
            self.record(&mut state, RRefEvent::ForkAcked { fork_id });
            user
        };
        self.changed();

        tracing::trace!(worker = %self.inner.me, %fork_id, "fork confirmed");
        user.confirmed().complete(());
        if let Some(parent) = user.parent() {
            self.send_child_accept(parent, user.rref_id(), fork_id);
        }
        true
    }

    /// Fails a pending user fork whose registration with the owner failed.
    ///
    /// If the fork was received from a user, that user is released from
    /// keeping its own fork alive for it.
    /// Returns false if the fork was not pending.
    pub fn handle_fork_failed(&self, fork_id: ForkId, err: RpcError) -> bool {
        let user = self.inner.state.lock().unwrap().pending_users.remove(&fork_id);
        let Some(user) = user else { return false };
        self.changed();

        tracing::warn!(worker = %self.inner.me, rref_id = %user.rref_id(), %fork_id, %err, "registering fork failed");
        user.confirmed().fail(err);
        if let Some(parent) = user.parent() {
            self.send_child_accept(parent, user.rref_id(), fork_id);
        }
        true
    }

    /// Removes a fork deleted by its user from the owner entry.
    ///
    /// The entry is collected when no forks and no local handles remain.
    /// Returns false if the fork was not registered.
    pub fn handle_user_delete(&self, rref_id: RRefId, fork_id: ForkId) -> bool {
        {
            let mut state = self.inner.state.lock().unwrap();
            let removed = match state.owners.get_mut(&rref_id) {
                Some(owner) => {
                    owner.touch();
                    owner.forks.remove(&fork_id).is_some()
                }
                None => false,
            };
            if !removed {
                tracing::debug!(worker = %self.inner.me, %rref_id, %fork_id, "ignoring deletion of unknown fork");
                return false;
            }
            self.record(&mut state, RRefEvent::ForkDeleted { rref_id, fork_id });
            tracing::trace!(worker = %self.inner.me, %rref_id, %fork_id, "deleted fork");
            self.collect_if_unused(&mut state, rref_id);
        }
        self.changed();
        true
    }

    /// Handles the acceptance of a fork pickled by the local worker.
    ///
    /// A user releases the fork it kept alive for the child.
    /// The owner records `src` as holder of the fork.
    /// Returns false if the fork is unknown.
    pub fn handle_child_accept(&self, src: WorkerId, rref_id: RRefId, fork_id: ForkId) -> bool {
        let (child, holder_set) = {
            let mut state = self.inner.state.lock().unwrap();
            let mut holder_set = false;
            if let Some(owner) = state.owners.get_mut(&rref_id) {
                if let Some(holder @ None) = owner.forks.get_mut(&fork_id) {
                    *holder = Some(src);
                    owner.touch();
                    holder_set = true;
                }
            }
            (state.pending_children.remove(&fork_id), holder_set)
        };
        self.changed();

        tracing::trace!(worker = %self.inner.me, %rref_id, %fork_id, child = src, "child fork accepted");
        let known = child.is_some() || holder_set;
        drop(child);
        known
    }

    fn send_child_accept(&self, parent: &WorkerInfo, rref_id: RRefId, fork_id: ForkId) {
        let msg = match Message::encode(MessageType::RRefChildAccept, &ChildAccept { rref_id, fork_id }) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(worker = %self.inner.me, %fork_id, %err, "encoding child acceptance failed");
                return;
            }
        };
        let parent_name = parent.clone();
        self.inner.agent.send(parent, msg).add_callback(move |res| {
            if let Err(err) = res {
                tracing::warn!(parent = %parent_name, %rref_id, %fork_id, %err, "notifying parent of accepted fork failed");
            }
        });
    }

    /// Confirms or fails a pending user fork depending on the response of
    /// its registration request.
    pub(crate) fn track_registration(&self, fork_id: ForkId, response: RpcFuture<Message>, expected: MessageType) {
        let weak = self.weak();
        response.add_callback(move |res| {
            let Some(inner) = weak.upgrade() else { return };
            let ctx = RRefContext::from_inner(inner);
            match res.clone().and_then(|msg| msg.expect(expected)) {
                Ok(_) => {
                    ctx.handle_fork_ack(fork_id);
                }
                Err(err) => {
                    ctx.handle_fork_failed(fork_id, err);
                }
            }
        });
    }

    /// Creates a new fork of the reference for sending it to another worker.
    ///
    /// The owner registers the fork immediately.
    /// A user keeps its own fork alive until the owner has accepted the child.
    pub fn pickle(&self, rref: &RRef) -> Result<RRefForkData, RpcError> {
        self.check_alive()?;
        let rref_id = rref.rref_id();
        let fork_id = self.inner.ids.fork_id();

        {
            let mut state = self.inner.state.lock().unwrap();
            match rref {
                RRef::Owner(_) => {
                    let owner = state.owners.get_mut(&rref_id).ok_or(RpcError::UnknownRRef(rref_id))?;
                    owner.forks.insert(fork_id, None);
                    owner.touch();
                    self.record(&mut state, RRefEvent::ForkAdded { rref_id, fork_id, holder: None });
                }
                RRef::User(user) => {
                    state.pending_children.insert(fork_id, user.clone());
                }
            }
        }
        self.changed();

        tracing::trace!(worker = %self.inner.me, %rref_id, %fork_id, "pickled fork");
        Ok(RRefForkData { owner: rref.owner().clone(), rref_id, fork_id, parent: self.inner.me.clone() })
    }

    /// Materializes a reference from fork data received from another worker.
    ///
    /// On the owner this yields an [OwnerRRef].
    /// Elsewhere it yields a [UserRRef], which is registered with the owner
    /// unless the owner itself pickled it.
    pub fn unpickle(&self, data: RRefForkData) -> Result<RRef, RpcError> {
        self.check_alive()?;
        let RRefForkData { owner, rref_id, fork_id, parent } = data;
        let me = &self.inner.me;

        if owner.id == me.id {
            let handle = self.owner_rref(rref_id)?;
            if parent.id == me.id {
                self.handle_user_delete(rref_id, fork_id);
            } else {
                self.send_child_accept(&parent, rref_id, fork_id);
            }
            return Ok(RRef::Owner(handle));
        }

        if parent.id == owner.id {
            let user = self.new_user(owner.clone(), rref_id, fork_id, None);
            user.confirmed().complete(());
            {
                let mut state = self.inner.state.lock().unwrap();
                state.confirmed_users.insert(fork_id, owner.id);
                self.record(&mut state, RRefEvent::ForkCreated { rref_id, fork_id });
            }
            self.send_child_accept(&parent, rref_id, fork_id);
            return Ok(RRef::User(user));
        }

        let user = self.new_user(owner.clone(), rref_id, fork_id, Some(parent));
        self.add_pending_user(&user);
        let msg = match Message::encode(MessageType::RRefForkRequest, &ForkMsg { rref_id, fork_id }) {
            Ok(msg) => msg,
            Err(err) => {
                let err = RpcError::from(err);
                self.handle_fork_failed(fork_id, err.clone());
                return Err(err);
            }
        };
        self.track_registration(fork_id, self.inner.agent.send(&owner, msg), MessageType::RRefAck);
        Ok(RRef::User(user))
    }

    pub(crate) async fn fetch(&self, user: &UserRRef) -> Result<Bytes, RpcError> {
        let msg = Message::encode(MessageType::RRefFetchCall, &FetchCall { rref_id: user.rref_id() })?;
        self.inner.agent.send(user.owner(), msg).await?.expect(MessageType::RRefFetchRet)
    }

    pub(crate) fn user_dropped(&self, rref_id: RRefId, fork_id: ForkId, owner: &WorkerInfo) {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.inner.state.lock().unwrap();
            state.confirmed_users.remove(&fork_id);
            self.record(&mut state, RRefEvent::UserDeleted { rref_id, fork_id });
        }
        self.changed();

        let msg = match Message::encode(MessageType::RRefUserDelete, &ForkMsg { rref_id, fork_id }) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(worker = %self.inner.me, %rref_id, %fork_id, %err, "encoding fork deletion failed");
                return;
            }
        };

        tracing::trace!(worker = %self.inner.me, %rref_id, %fork_id, owner = %owner, "deleting fork");
        let weak = self.weak();
        let owner_name = owner.clone();
        self.inner.agent.send(owner, msg).add_callback(move |res| {
            if let Err(err) = res {
                tracing::warn!(owner = %owner_name, %rref_id, %fork_id, %err, "deleting fork failed");
                if let Some(inner) = weak.upgrade() {
                    let ctx = RRefContext::from_inner(inner);
                    let mut state = ctx.inner.state.lock().unwrap();
                    ctx.record(&mut state, RRefEvent::DeleteFailed { rref_id, fork_id, error: err.clone() });
                }
            }
        });
    }

    /// Drops all state involving a worker that has failed or left.
    ///
    /// Forks held by the worker are removed from owned entries.
    /// Local forks owned by the worker are forgotten and, if still pending,
    /// fail.
    pub fn peer_lost(&self, worker: &WorkerInfo) {
        let (removed, pending_users, pending_children, confirmed) = {
            let mut state = self.inner.state.lock().unwrap();
            let mut removed = Vec::new();
            for (rref_id, owner) in state.owners.iter_mut() {
                let before = owner.forks.len();
                owner.forks.retain(|fork_id, holder| {
                    let lost = *holder == Some(worker.id);
                    if lost {
                        removed.push((*rref_id, *fork_id));
                    }
                    !lost
                });
                if owner.forks.len() != before {
                    owner.touch();
                }
            }
            for &(rref_id, fork_id) in &removed {
                self.record(&mut state, RRefEvent::ForkDeleted { rref_id, fork_id });
                self.collect_if_unused(&mut state, rref_id);
            }

            let pending_users = drain_owned_by(&mut state.pending_users, worker.id);
            let pending_children = drain_owned_by(&mut state.pending_children, worker.id);
            let before = state.confirmed_users.len();
            state.confirmed_users.retain(|_, owner| *owner != worker.id);
            let confirmed = before - state.confirmed_users.len();

            (removed.len(), pending_users, pending_children, confirmed)
        };
        self.changed();

        if removed > 0 {
            tracing::warn!(worker = %self.inner.me, peer = %worker, forks = removed, "dropped forks of lost worker");
        }
        if !pending_users.is_empty() || !pending_children.is_empty() || confirmed > 0 {
            tracing::warn!(
                worker = %self.inner.me,
                peer = %worker,
                pending_users = pending_users.len(),
                pending_children = pending_children.len(),
                confirmed_users = confirmed,
                "forgot forks owned by lost worker"
            );
        }
        for user in &pending_users {
            user.confirmed().fail(TransportError::Unreachable(worker.id).into());
        }
        drop(pending_users);
        drop(pending_children);
    }

    /// Releases state of owned entries that was never acknowledged and has
    /// shown no activity for the [fork timeout](Cfg::fork_timeout).
    ///
    /// Forks pickled by the owner that no worker accepted are removed.
    /// Entries without local handles whose value was never provided are
    /// collected together with their forks.
    /// Forks confirmed for a provided value are never removed.
    ///
    /// Returns the number of collected entries.
    pub fn collect_expired(&self, now: Instant) -> usize {
        let Some(timeout) = self.inner.cfg.fork_timeout else { return 0 };

        let collected = {
            let mut state = self.inner.state.lock().unwrap();
            let idle: Vec<_> = state
                .owners
                .iter()
                .filter(|(_, owner)| now.saturating_duration_since(owner.last_activity) >= timeout)
                .map(|(rref_id, _)| *rref_id)
                .collect();

            let mut collected = 0;
            for rref_id in idle {
                let Some(owner) = state.owners.get_mut(&rref_id) else { continue };

                if owner.local_refs == 0 && !owner.value.is_done() {
                    let forks = owner.forks.len();
                    state.owners.remove(&rref_id);
                    self.record(&mut state, RRefEvent::OwnerCollected { rref_id, forced: true });
                    tracing::warn!(worker = %self.inner.me, %rref_id, forks, "collecting owner entry whose value never arrived");
                    collected += 1;
                    continue;
                }

                let mut unaccepted = Vec::new();
                owner.forks.retain(|fork_id, holder| {
                    if holder.is_none() {
                        unaccepted.push(*fork_id);
                    }
                    holder.is_some()
                });
                for fork_id in unaccepted {
                    tracing::warn!(worker = %self.inner.me, %rref_id, %fork_id, "dropping fork that was never accepted");
                    self.record(&mut state, RRefEvent::ForkDeleted { rref_id, fork_id });
                }
                if state.owners.get(&rref_id).map(OwnerState::is_unused).unwrap_or_default() {
                    state.owners.remove(&rref_id);
                    self.record(&mut state, RRefEvent::OwnerCollected { rref_id, forced: true });
                    tracing::warn!(worker = %self.inner.me, %rref_id, "collecting expired owner entry");
                    collected += 1;
                }
            }
            collected
        };
        self.changed();
        collected
    }

    fn is_quiescent(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        state.owners.values().all(|owner| owner.forks.is_empty())
            && state.pending_users.is_empty()
            && state.pending_children.is_empty()
    }

    /// Waits until no owned value has registered forks and no local fork is
    /// awaiting acknowledgement or acceptance.
    ///
    /// When the timeout expires, owner entries with remaining forks are
    /// collected forcibly and false is returned.
    pub async fn wait_quiescent(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.inner.changed.notified();
                if self.is_quiescent() {
                    return;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(timeout, wait).await.is_ok() {
            return true;
        }

        let mut state = self.inner.state.lock().unwrap();
        let referenced: Vec<_> =
            state.owners.iter().filter(|(_, owner)| !owner.forks.is_empty()).map(|(rref_id, _)| *rref_id).collect();
        for rref_id in referenced {
            if let Some(owner) = state.owners.remove(&rref_id) {
                tracing::warn!(worker = %self.inner.me, %rref_id, forks = owner.forks.len(), "forcibly collecting referenced owner entry");
            }
            self.record(&mut state, RRefEvent::OwnerCollected { rref_id, forced: true });
        }
        tracing::warn!(
            worker = %self.inner.me,
            pending_users = state.pending_users.len(),
            pending_children = state.pending_children.len(),
            "references still in use after {:?}", timeout
        );
        false
    }

    /// Captures the current state.
    pub fn snapshot(&self) -> ContextSnapshot {
        let state = self.inner.state.lock().unwrap();
        ContextSnapshot {
            owners: state
                .owners
                .iter()
                .map(|(rref_id, owner)| {
                    let snapshot = OwnerSnapshot {
                        forks: owner.forks.iter().map(|(fork_id, holder)| (*fork_id, *holder)).collect(),
                        local_refs: owner.local_refs,
                        materialized: owner.value.is_done(),
                    };
                    (*rref_id, snapshot)
                })
                .collect(),
            pending_users: state.pending_users.keys().copied().collect(),
            confirmed_users: state.confirmed_users.keys().copied().collect(),
            pending_children: state.pending_children.keys().copied().collect(),
        }
    }

    /// Counters describing the current state.
    pub fn debug_info(&self) -> BTreeMap<&'static str, usize> {
        let state = self.inner.state.lock().unwrap();
        let mut info = BTreeMap::new();
        info.insert("num_owner_rrefs", state.owners.len());
        info.insert("num_forks", state.owners.values().map(|owner| owner.forks.len()).sum());
        info.insert("num_pending_users", state.pending_users.len());
        info.insert("num_confirmed_users", state.confirmed_users.len());
        info.insert("num_pending_children", state.pending_children.len());
        info.insert("num_in_flight", self.inner.agent.in_flight());
        info
    }

    /// Recorded protocol events in order of occurrence.
    ///
    /// Empty unless [Cfg::record_events] is enabled.
    pub fn events(&self) -> Vec<RRefEvent> {
        self.inner.state.lock().unwrap().events.clone()
    }

    /// Destroys the context.
    ///
    /// All entries are discarded, pending forks fail and references dropped
    /// from now on no longer notify their owner.
    pub fn clear(&self) {
        self.inner.destroyed.store(true, Ordering::SeqCst);
        let (pending_users, pending_children) = {
            let mut state = self.inner.state.lock().unwrap();
            state.owners.clear();
            state.confirmed_users.clear();
            (mem::take(&mut state.pending_users), mem::take(&mut state.pending_children))
        };
        self.changed();

        for user in pending_users.values() {
            user.confirmed().fail(TransportError::Closed.into());
        }
        tracing::debug!(worker = %self.inner.me, "context cleared");
        drop(pending_users);
        drop(pending_children);
    }
}

fn drain_owned_by(users: &mut HashMap<ForkId, UserRRef>, owner: WorkerId) -> Vec<UserRRef> {
    let forks: Vec<_> = users.iter().filter(|(_, user)| user.owner().id == owner).map(|(fork_id, _)| *fork_id).collect();
    forks.into_iter().filter_map(|fork_id| users.remove(&fork_id)).collect()
}
