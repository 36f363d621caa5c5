use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, unbounded};
use glam::Vec3;
use serde::{Deserialize, Serialize};
use worldspace_common::EntityId;

use crate::error::StreamError;

/// Transport-assigned identifier of a connected observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObserverId(pub u32);

impl std::fmt::Display for ObserverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What an update message describes. Codecs choose the payload; the tag is
/// kept alongside so transports and tests can route without decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    RegionFull,
    RegionCell,
    RegionBatch,
    RegionUnload,
    EntitySpawn,
    EntityDelta,
    EntityRemove,
}

/// An opaque, codec-produced payload bound for one observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateMessage {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl UpdateMessage {
    pub fn new(kind: MessageKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }
}

/// The outbound side of a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("outbound channel closed")]
pub struct ChannelClosed;

/// Fire-and-forget outbound channel. Must never block the caller.
pub trait MessageSink: Send + Sync {
    fn send(&self, msg: UpdateMessage) -> Result<(), ChannelClosed>;
}

/// Sink backed by an unbounded crossbeam channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<UpdateMessage>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<UpdateMessage>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl MessageSink for ChannelSink {
    fn send(&self, msg: UpdateMessage) -> Result<(), ChannelClosed> {
        self.tx.send(msg).map_err(|_| ChannelClosed)
    }
}

/// A connected viewer: where it is, how far it sees, where messages go.
pub struct Observer {
    pub id: ObserverId,
    /// The observer's own entity, never tracked for itself.
    pub avatar: Option<EntityId>,
    pub position: Vec3,
    /// Requested view radius in regions; capped by the server radius.
    pub view_radius: i32,
    sink: Arc<dyn MessageSink>,
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("id", &self.id)
            .field("avatar", &self.avatar)
            .field("position", &self.position)
            .field("view_radius", &self.view_radius)
            .finish_non_exhaustive()
    }
}

impl Observer {
    pub fn new(id: ObserverId, position: Vec3, view_radius: i32, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            id,
            avatar: None,
            position,
            view_radius,
            sink,
        }
    }

    /// Observer with a fresh channel sink; the receiver plays the transport.
    pub fn with_channel(
        id: ObserverId,
        position: Vec3,
        view_radius: i32,
    ) -> (Self, Receiver<UpdateMessage>) {
        let (sink, rx) = ChannelSink::new();
        (Self::new(id, position, view_radius, Arc::new(sink)), rx)
    }

    pub fn with_avatar(mut self, avatar: EntityId) -> Self {
        self.avatar = Some(avatar);
        self
    }

    pub fn send(&self, msg: UpdateMessage) -> Result<(), StreamError> {
        self.sink
            .send(msg)
            .map_err(|_| StreamError::ObserverChannelFailure(self.id))
    }
}

/// The transport's set of connected observers, borrowed by the engine.
#[derive(Debug, Default)]
pub struct ObserverTable {
    observers: BTreeMap<ObserverId, Observer>,
}

impl ObserverTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an observer. Returns the previous one.
    pub fn insert(&mut self, observer: Observer) -> Option<Observer> {
        self.observers.insert(observer.id, observer)
    }

    pub fn remove(&mut self, id: ObserverId) -> Option<Observer> {
        self.observers.remove(&id)
    }

    pub fn get(&self, id: ObserverId) -> Option<&Observer> {
        self.observers.get(&id)
    }

    pub fn get_mut(&mut self, id: ObserverId) -> Option<&mut Observer> {
        self.observers.get_mut(&id)
    }

    pub fn contains(&self, id: ObserverId) -> bool {
        self.observers.contains_key(&id)
    }

    /// Observers in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Observer> {
        self.observers.values()
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Send to an observer by id. A missing observer counts as a closed channel.
    pub fn send(&self, id: ObserverId, msg: UpdateMessage) -> Result<(), StreamError> {
        match self.observers.get(&id) {
            Some(observer) => observer.send(msg),
            None => Err(StreamError::ObserverChannelFailure(id)),
        }
    }
}
