//! Wire batching for outgoing updates.
//!
//! The builder accumulates encoded entries up to a configurable cap. A
//! flushed message is serialized exactly once; the sender then dispatches the
//! same payload to every recipient of the batch with only the receiver field
//! rewritten, so fan-out costs one encode regardless of audience size.

use std::mem;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::update::{StateRef, Update, UpdateKind};
use crate::graph::Graph;

/// Default number of entries batched into one message.
pub const DEFAULT_OBJECTS_PER_MESSAGE: usize = 64;

/// Reference to a node by identity, used for link endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub node_type: String,
    pub name: String,
}

/// One entry of an update message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectDiff {
    NodeUpdate {
        node_type: String,
        name: String,
        config: Vec<u8>,
    },
    NodeDelete {
        node_type: String,
        name: String,
    },
    LinkUpdate {
        metadata: String,
        left: ObjectRef,
        right: ObjectRef,
    },
    LinkDelete {
        metadata: String,
        left: ObjectRef,
        right: ObjectRef,
    },
}

impl ObjectDiff {
    fn from_update(update: &Update, graph: &Graph) -> Self {
        match (update.target(), update.kind()) {
            (StateRef::Node(id), kind) => {
                let node = graph.node(id);
                match kind {
                    UpdateKind::Update => ObjectDiff::NodeUpdate {
                        node_type: node.node_type().to_owned(),
                        name: node.name().to_owned(),
                        config: node.config().to_vec(),
                    },
                    UpdateKind::Delete => ObjectDiff::NodeDelete {
                        node_type: node.node_type().to_owned(),
                        name: node.name().to_owned(),
                    },
                }
            }
            (StateRef::Link(id), kind) => {
                let (left, right) = graph.endpoints(id);
                let endpoint = |id| {
                    let node = graph.node(id);
                    ObjectRef {
                        node_type: node.node_type().to_owned(),
                        name: node.name().to_owned(),
                    }
                };
                let metadata = graph.link(id).metadata().to_owned();
                match kind {
                    UpdateKind::Update => ObjectDiff::LinkUpdate {
                        metadata,
                        left: endpoint(left),
                        right: endpoint(right),
                    },
                    UpdateKind::Delete => ObjectDiff::LinkDelete {
                        metadata,
                        left: endpoint(left),
                        right: endpoint(right),
                    },
                }
            }
        }
    }
}

/// A closed message addressed to one client.
#[derive(Debug, Clone)]
pub struct UpdateMessage {
    /// Identifier of the client this copy is addressed to.
    pub receiver: String,
    /// Number of [`ObjectDiff`] entries in the payload.
    pub object_count: usize,
    /// Postcard-encoded sequence of [`ObjectDiff`] entries, shared across
    /// all recipients of the batch.
    pub payload: Bytes,
}

/// Accumulates entries for the message currently being built.
#[derive(Debug)]
pub struct MessageBuilder {
    buf: Vec<u8>,
    count: usize,
    objects_per_message: usize,
}

impl MessageBuilder {
    pub fn new(objects_per_message: usize) -> Self {
        Self {
            buf: Vec::new(),
            count: 0,
            objects_per_message,
        }
    }

    pub fn set_objects_per_message(&mut self, count: usize) {
        self.objects_per_message = count;
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count >= self.objects_per_message
    }

    pub fn object_count(&self) -> usize {
        self.count
    }

    /// Appends one update to the message being built.
    pub fn encode_update(&mut self, update: &Update, graph: &Graph) -> postcard::Result<()> {
        let diff = ObjectDiff::from_update(update, graph);
        self.buf = postcard::to_extend(&diff, mem::take(&mut self.buf))?;
        self.count += 1;
        Ok(())
    }

    /// Closes the message, returning the shared payload and entry count and
    /// leaving the builder empty for the next batch.
    pub fn finish(&mut self) -> (Bytes, usize) {
        let payload = Bytes::from(mem::take(&mut self.buf));
        let count = mem::take(&mut self.count);
        (payload, count)
    }
}

/// Decodes a message payload back into its entries.
pub fn decode_objects(mut payload: &[u8]) -> postcard::Result<Vec<ObjectDiff>> {
    let mut objects = Vec::new();
    while !payload.is_empty() {
        let (diff, rest) = postcard::take_from_bytes(payload)?;
        objects.push(diff);
        payload = rest;
    }
    Ok(objects)
}
