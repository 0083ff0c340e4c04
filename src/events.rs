//! Outbound event streams (§6): `messageReceived`, `messageProcessed`
//! (published downstream, subscribed to by the confirmation tracker)
//! and `messageUpdated`. Each stream is multi-producer, single-consumer
//! per subscriber, implemented with [`tokio::sync::mpsc`].

use tokio::sync::mpsc;

use crate::message::MetaHeader;

pub type ReceiveSender = mpsc::Sender<MetaHeader>;
pub type ReceiveReceiver = mpsc::Receiver<MetaHeader>;

/// A `messageProcessed` notification, carrying just enough to let the
/// confirmation tracker enqueue a record without re-deriving it.
#[derive(Debug, Clone)]
pub struct ProcessedEvent {
    pub metaheader: MetaHeader,
}

pub type ProcessedSender = mpsc::Sender<ProcessedEvent>;
pub type ProcessedReceiver = mpsc::Receiver<ProcessedEvent>;

/// A `messageUpdated` notification, emitted on depth/confirmation change.
#[derive(Debug, Clone)]
pub struct UpdatedEvent {
    pub transaction_hash: String,
    pub block_depth: u64,
    pub confirmed: bool,
}

pub type UpdatedSender = mpsc::Sender<UpdatedEvent>;
pub type UpdatedReceiver = mpsc::Receiver<UpdatedEvent>;

/// Bundles the channel endpoints a backend needs to publish events,
/// injected at construction (per the "cyclic module references"
/// redesign note) rather than imported at runtime.
#[derive(Clone)]
pub struct EventSinks {
    pub receive: ReceiveSender,
    pub processed: ProcessedSender,
    pub updated: UpdatedSender,
}
