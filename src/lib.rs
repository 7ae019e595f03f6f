#![warn(clippy::doc_markdown)]
#![doc = include_str!("../README.md")]

pub mod bitset;
pub mod graph;
pub mod server;

pub mod prelude {
    pub use super::{
        bitset::BitSet,
        graph::{Graph, GraphEvent, LinkId, NodeId},
        server::{
            Server, ServerConfig,
            client::{Client, ClientStats},
            graph_walker::TraversalWhiteList,
            message::{ObjectDiff, UpdateMessage, decode_objects},
            update_sender::SenderHandle,
        },
    };
}
