//! Inter-process message queues.
//!
//! Every supervised unit talks to its parent through an inbound and an
//! outbound [`MessageQueue`]. Queue pairs come from a [`QueueFactory`]; the
//! supervisor only ever holds an `Arc<dyn QueueFactory>` and does not know
//! whether it got fresh in-process pairs ([`LocalQueueFactory`]) or pairs
//! registered in a manager shared with other supervisors
//! ([`SharedQueueManager`]).
//!
//! Queues are unbounded FIFOs. Across the process boundary they are carried
//! as JSON lines over the child's stdio (see [`crate::process`]).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::error::{Result, VigilError};

/// Message type of the control message that stops a child loop.
pub const STOP_MESSAGE: &str = "stop";

/// Message type carrying a work item.
pub const ITEM_MESSAGE: &str = "item";

/// Child to parent: send up to `payload` more inbound messages.
pub const DEMAND_MESSAGE: &str = "vigil:demand";

/// Child to parent: the oldest message sent has been consumed.
pub const ACK_MESSAGE: &str = "vigil:ack";

/// One message exchanged over a queue.
///
/// The payload is opaque to the supervision layer; only `type` is inspected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Message {
    /// Create a message with a payload.
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// The control message asking a child loop to end.
    pub fn stop() -> Self {
        Self::new(STOP_MESSAGE, serde_json::Value::Null)
    }

    /// Wrap a serializable value as a typed payload.
    pub fn encode<T: Serialize>(kind: impl Into<String>, value: &T) -> Result<Self> {
        let payload = serde_json::to_value(value).map_err(|e| VigilError::json("encoding message", e))?;
        Ok(Self::new(kind, payload))
    }

    /// Decode the payload into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| VigilError::json(format!("decoding '{}' message", self.kind), e))
    }

    /// Returns true for the stop control message.
    pub fn is_stop(&self) -> bool {
        self.kind == STOP_MESSAGE
    }

    /// Request for `count` more inbound messages.
    pub fn demand(count: usize) -> Self {
        Self::new(DEMAND_MESSAGE, serde_json::json!(count))
    }

    /// Acknowledgement of one consumed inbound message.
    pub fn ack() -> Self {
        Self::new(ACK_MESSAGE, serde_json::Value::Null)
    }
}

/// An unbounded FIFO usable from several threads.
pub trait MessageQueue: Send + Sync + fmt::Debug {
    /// Append a message. Fails with `QueueClosed` once torn down.
    fn put(&self, message: Message) -> Result<()>;

    /// Pop the oldest message without blocking.
    ///
    /// Returns `Ok(None)` when empty and `Err(QueueClosed)` once torn down.
    fn try_get(&self) -> Result<Option<Message>>;

    /// Number of queued messages.
    fn len(&self) -> usize;

    /// Tear the queue down; pending messages are dropped.
    fn close(&self);

    /// Whether [`MessageQueue::close`] was called.
    fn is_closed(&self) -> bool;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask whoever feeds the queue to have up to `count` messages on the
    /// way. Queues filled directly by their owner ignore it.
    fn request(&self, _count: usize) -> Result<()> {
        Ok(())
    }
}

/// Shared handle to a queue.
pub type SharedQueue = Arc<dyn MessageQueue>;

/// In-process queue backed by a crossbeam channel.
pub struct LocalQueue {
    name: String,
    sender: Sender<Message>,
    receiver: Receiver<Message>,
    closed: AtomicBool,
}

impl LocalQueue {
    pub fn new(name: impl Into<String>) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            name: name.into(),
            sender,
            receiver,
            closed: AtomicBool::new(false),
        }
    }

    /// Create a queue behind a shared handle.
    pub fn shared(name: impl Into<String>) -> SharedQueue {
        Arc::new(Self::new(name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for LocalQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalQueue")
            .field("name", &self.name)
            .field("len", &self.receiver.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MessageQueue for LocalQueue {
    fn put(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(VigilError::queue_closed(&self.name));
        }
        self.sender
            .send(message)
            .map_err(|_| VigilError::queue_closed(&self.name))
    }

    fn try_get(&self) -> Result<Option<Message>> {
        if self.is_closed() {
            return Err(VigilError::queue_closed(&self.name));
        }
        match self.receiver.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(VigilError::queue_closed(&self.name)),
        }
    }

    fn len(&self) -> usize {
        self.receiver.len()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Drop whatever is pending so a released pair frees its memory.
            while self.receiver.try_recv().is_ok() {}
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// The two queues owned by one unit.
///
/// `inbound` flows parent → child, `outbound` flows child → parent.
#[derive(Debug, Clone)]
pub struct QueuePair {
    pub inbound: SharedQueue,
    pub outbound: SharedQueue,
}

impl QueuePair {
    /// Create a fresh in-process pair named after its owner.
    pub fn local(owner: &str) -> Self {
        Self {
            inbound: LocalQueue::shared(format!("{owner}:inbound")),
            outbound: LocalQueue::shared(format!("{owner}:outbound")),
        }
    }

    /// Close both queues.
    pub fn close(&self) {
        self.inbound.close();
        self.outbound.close();
    }
}

/// Produces queue pairs for supervised units.
pub trait QueueFactory: Send + Sync + fmt::Debug {
    /// Allocate a new pair for `owner`.
    fn create_pair(&self, owner: &str) -> Result<QueuePair>;

    /// Forget the pair allocated for `owner`, if the factory tracks it.
    fn release(&self, owner: &str);
}

/// Factory handing out independent in-process pairs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalQueueFactory;

impl QueueFactory for LocalQueueFactory {
    fn create_pair(&self, owner: &str) -> Result<QueuePair> {
        Ok(QueuePair::local(owner))
    }

    fn release(&self, _owner: &str) {}
}

/// Queue manager shared by several supervisors.
///
/// Pairs are registered under their owner's name so other components of the
/// daemon can find a unit's queues with [`SharedQueueManager::lookup`].
/// An optional pair limit makes allocation fail once exhausted.
#[derive(Debug, Default)]
pub struct SharedQueueManager {
    pairs: Mutex<HashMap<String, QueuePair>>,
    max_pairs: Option<usize>,
    shut_down: AtomicBool,
}

impl SharedQueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the number of live pairs.
    pub fn with_max_pairs(max_pairs: usize) -> Self {
        Self {
            max_pairs: Some(max_pairs),
            ..Self::default()
        }
    }

    /// Find the pair registered for `owner`.
    pub fn lookup(&self, owner: &str) -> Option<QueuePair> {
        self.pairs.lock().get(owner).cloned()
    }

    /// Number of live pairs.
    pub fn live_pairs(&self) -> usize {
        self.pairs.lock().len()
    }

    /// Close every pair and refuse further allocations.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        for (_, pair) in self.pairs.lock().drain() {
            pair.close();
        }
    }
}

impl QueueFactory for SharedQueueManager {
    fn create_pair(&self, owner: &str) -> Result<QueuePair> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(VigilError::queue_allocation(owner, "queue manager is shut down"));
        }

        let mut pairs = self.pairs.lock();
        if let Some(previous) = pairs.remove(owner) {
            previous.close();
        }
        if let Some(max) = self.max_pairs {
            if pairs.len() >= max {
                return Err(VigilError::queue_allocation(
                    owner,
                    format!("queue manager limit of {max} pairs reached"),
                ));
            }
        }

        let pair = QueuePair::local(owner);
        pairs.insert(owner.to_string(), pair.clone());
        debug!(owner, live = pairs.len(), "allocated shared queue pair");
        Ok(pair)
    }

    fn release(&self, owner: &str) {
        if let Some(pair) = self.pairs.lock().remove(owner) {
            pair.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = LocalQueue::new("test");
        for i in 0..3 {
            queue.put(Message::new("n", serde_json::json!(i))).unwrap();
        }
        assert_eq!(queue.len(), 3);
        for i in 0..3 {
            let message = queue.try_get().unwrap().unwrap();
            assert_eq!(message.payload, serde_json::json!(i));
        }
        assert!(queue.try_get().unwrap().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_closed_queue_rejects_io() {
        let queue = LocalQueue::new("test");
        queue.put(Message::stop()).unwrap();
        queue.close();
        assert!(queue.is_closed());
        assert_eq!(queue.len(), 0);
        assert!(queue.put(Message::stop()).unwrap_err().is_queue_closed());
        assert!(queue.try_get().unwrap_err().is_queue_closed());
    }

    #[test]
    fn test_stop_message_wire_format() {
        let text = serde_json::to_string(&Message::stop()).unwrap();
        assert!(text.contains("\"type\":\"stop\""));
        let back: Message = serde_json::from_str(r#"{"type":"stop"}"#).unwrap();
        assert!(back.is_stop());
    }

    #[test]
    fn test_encode_decode_payload() {
        let message = Message::encode(ITEM_MESSAGE, &vec![1u32, 2, 3]).unwrap();
        let values: Vec<u32> = message.decode().unwrap();
        assert_eq!(values, vec![1, 2, 3]);
        assert!(message.decode::<String>().is_err());
    }

    #[test]
    fn test_local_factory_gives_fresh_pairs() {
        let factory = LocalQueueFactory;
        let first = factory.create_pair("mod").unwrap();
        first.inbound.put(Message::stop()).unwrap();
        let second = factory.create_pair("mod").unwrap();
        assert_eq!(second.inbound.len(), 0);
        assert_eq!(first.inbound.len(), 1);
    }

    #[test]
    fn test_shared_manager_registers_and_releases() {
        let manager = SharedQueueManager::new();
        let pair = manager.create_pair("retention").unwrap();
        pair.inbound.put(Message::stop()).unwrap();

        let found = manager.lookup("retention").unwrap();
        assert_eq!(found.inbound.len(), 1);

        manager.release("retention");
        assert!(manager.lookup("retention").is_none());
        assert!(pair.inbound.is_closed());
    }

    #[test]
    fn test_shared_manager_replaces_previous_pair() {
        let manager = SharedQueueManager::new();
        let old = manager.create_pair("retention").unwrap();
        let _new = manager.create_pair("retention").unwrap();
        assert!(old.inbound.is_closed());
        assert_eq!(manager.live_pairs(), 1);
    }

    #[test]
    fn test_shared_manager_limit() {
        let manager = SharedQueueManager::with_max_pairs(1);
        manager.create_pair("a").unwrap();
        let err = manager.create_pair("b").unwrap_err();
        assert!(matches!(err, VigilError::QueueAllocation { .. }));
        manager.release("a");
        assert!(manager.create_pair("b").is_ok());
    }

    #[test]
    fn test_shared_manager_shutdown() {
        let manager = SharedQueueManager::new();
        let pair = manager.create_pair("a").unwrap();
        manager.shutdown();
        assert!(pair.outbound.is_closed());
        assert!(manager.create_pair("b").is_err());
    }
}
