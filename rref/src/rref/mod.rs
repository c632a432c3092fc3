//! Remote references.
//!
//! A remote reference (RRef) refers to a value that is materialized on
//! exactly one worker, its owner.
//! The owner holds an [OwnerRRef], all other workers hold [UserRRef]s.
//! An RRef's owner never changes.
//!
//! Each copy of a user reference is a fork identified by a [ForkId].
//! The owner keeps the value alive as long as any fork is registered with it
//! or a local [OwnerRRef] handle exists.
//! Dropping the last clone of a [UserRRef] notifies the owner, which then
//! removes the fork.
//!
//! # Forking to another worker
//!
//! To send an RRef to another worker, [pickle](RRefContext::pickle) it into
//! [RRefForkData], transmit that data by any means and
//! [unpickle](RRefContext::unpickle) it on the destination.
//! A new fork is created for the child and registered with the owner.
//! The sending worker keeps its own fork alive until the owner has accepted
//! the child, so that the value cannot be collected in between.
//!
//! # Obtaining the value
//!
//! [RRef::to_here] returns the value.
//! For a user reference this always requests the value from the owner,
//! even when the owner is the local worker.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    fmt,
    sync::{Arc, Weak},
};

use crate::{codec, ForkId, RRefId, RpcError, RpcFuture, TransportError, WorkerInfo};

pub mod context;

pub use context::{ContextSnapshot, OwnerSnapshot, RRefContext, RRefEvent};

use context::CtxInner;

/// Serialized form of an RRef being forked to another worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RRefForkData {
    /// Owner of the referenced value.
    pub owner: WorkerInfo,
    /// Id of the RRef.
    pub rref_id: RRefId,
    /// Fork created for the receiving worker.
    pub fork_id: ForkId,
    /// Worker that forked the RRef.
    pub parent: WorkerInfo,
}

/// A remote reference held by either the owner or a user.
#[derive(Clone, Debug)]
pub enum RRef {
    /// Reference held by the owner.
    Owner(OwnerRRef),
    /// Reference held by a user.
    User(UserRRef),
}

impl RRef {
    /// Id of the referenced value.
    pub fn rref_id(&self) -> RRefId {
        match self {
            Self::Owner(owner) => owner.rref_id(),
            Self::User(user) => user.rref_id(),
        }
    }

    /// Worker owning the value.
    pub fn owner(&self) -> &WorkerInfo {
        match self {
            Self::Owner(owner) => owner.owner(),
            Self::User(user) => user.owner(),
        }
    }

    /// True, if this reference is held by the owner.
    pub fn is_owner(&self) -> bool {
        matches!(self, Self::Owner(_))
    }

    /// Future of the locally materialized value.
    ///
    /// Fails with [RpcError::NotOwner] for a user reference.
    pub fn local_value(&self) -> Result<RpcFuture<Bytes>, RpcError> {
        match self {
            Self::Owner(owner) => Ok(owner.local_value()),
            Self::User(user) => Err(RpcError::NotOwner(user.rref_id())),
        }
    }

    /// Obtains the value.
    ///
    /// The owner waits for the value to be materialized.
    /// A user requests it from the owner.
    pub async fn to_here(&self) -> Result<Bytes, RpcError> {
        match self {
            Self::Owner(owner) => owner.to_here().await,
            Self::User(user) => user.to_here().await,
        }
    }

    /// Obtains the value and decodes it using the default codec.
    pub async fn to_here_as<T>(&self) -> Result<T, RpcError>
    where
        T: DeserializeOwned,
    {
        Ok(codec::decode(&self.to_here().await?)?)
    }
}

impl From<OwnerRRef> for RRef {
    fn from(owner: OwnerRRef) -> Self {
        Self::Owner(owner)
    }
}

impl From<UserRRef> for RRef {
    fn from(user: UserRRef) -> Self {
        Self::User(user)
    }
}

/// Reference to a value owned by the local worker.
///
/// Each handle counts as a local reference that keeps the owner entry
/// alive; clones are counted separately.
pub struct OwnerRRef {
    rref_id: RRefId,
    owner: WorkerInfo,
    value: RpcFuture<Bytes>,
    ctx: Weak<CtxInner>,
}

impl fmt::Debug for OwnerRRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("OwnerRRef")
            .field("rref_id", &self.rref_id)
            .field("owner", &self.owner)
            .field("materialized", &self.value.is_done())
            .finish()
    }
}

impl OwnerRRef {
    /// Creates a handle; the caller must have accounted for it as local reference.
    pub(crate) fn new(rref_id: RRefId, owner: WorkerInfo, value: RpcFuture<Bytes>, ctx: Weak<CtxInner>) -> Self {
        Self { rref_id, owner, value, ctx }
    }

    /// Id of the referenced value.
    pub fn rref_id(&self) -> RRefId {
        self.rref_id
    }

    /// The local worker.
    pub fn owner(&self) -> &WorkerInfo {
        &self.owner
    }

    /// Future of the value, which completes once the value has been computed.
    pub fn local_value(&self) -> RpcFuture<Bytes> {
        self.value.clone()
    }

    /// Waits for the value to be materialized and returns it.
    pub async fn to_here(&self) -> Result<Bytes, RpcError> {
        self.value.clone().await
    }
}

impl Clone for OwnerRRef {
    fn clone(&self) -> Self {
        if let Some(ctx) = self.ctx.upgrade() {
            RRefContext::from_inner(ctx).retain(self.rref_id);
        }
        Self { rref_id: self.rref_id, owner: self.owner.clone(), value: self.value.clone(), ctx: self.ctx.clone() }
    }
}

impl Drop for OwnerRRef {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.upgrade() {
            RRefContext::from_inner(ctx).release(self.rref_id);
        }
    }
}

pub(crate) struct UserInner {
    pub rref_id: RRefId,
    pub fork_id: ForkId,
    pub owner: WorkerInfo,
    /// Worker this fork was received from, if it was forked by a user.
    pub parent: Option<WorkerInfo>,
    pub confirmed: RpcFuture<()>,
    pub ctx: Weak<CtxInner>,
}

impl Drop for UserInner {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.upgrade() {
            RRefContext::from_inner(ctx).user_dropped(self.rref_id, self.fork_id, &self.owner);
        }
    }
}

/// Reference to a value owned by another worker, or by the local worker
/// through a remote call.
///
/// Clones share the same fork.
/// Dropping the last clone deletes the fork on the owner.
#[derive(Clone)]
pub struct UserRRef {
    inner: Arc<UserInner>,
}

impl fmt::Debug for UserRRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UserRRef")
            .field("rref_id", &self.inner.rref_id)
            .field("fork_id", &self.inner.fork_id)
            .field("owner", &self.inner.owner)
            .field("confirmed", &self.inner.confirmed.is_done())
            .finish()
    }
}

impl UserRRef {
    pub(crate) fn new(inner: UserInner) -> Self {
        Self { inner: Arc::new(inner) }
    }

    pub(crate) fn parent(&self) -> Option<&WorkerInfo> {
        self.inner.parent.as_ref()
    }

    /// Id of the referenced value.
    pub fn rref_id(&self) -> RRefId {
        self.inner.rref_id
    }

    /// Fork of this reference.
    pub fn fork_id(&self) -> ForkId {
        self.inner.fork_id
    }

    /// Worker owning the value.
    pub fn owner(&self) -> &WorkerInfo {
        &self.inner.owner
    }

    /// Future that completes once the owner has registered this fork.
    ///
    /// It fails if the registration failed.
    pub fn confirmed(&self) -> RpcFuture<()> {
        self.inner.confirmed.clone()
    }

    /// True, if the owner has registered this fork.
    pub fn is_confirmed(&self) -> bool {
        matches!(self.inner.confirmed.result(), Some(Ok(())))
    }

    /// Requests the value from the owner.
    pub async fn to_here(&self) -> Result<Bytes, RpcError> {
        let ctx = self.inner.ctx.upgrade().ok_or(RpcError::Transport(TransportError::Closed))?;
        RRefContext::from_inner(ctx).fetch(self).await
    }
}
