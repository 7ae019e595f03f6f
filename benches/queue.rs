use std::time::{Duration, Instant};

use bytes::Bytes;
use criterion::{Criterion, criterion_group, criterion_main};
use ifmap_server::prelude::*;

const NETWORKS: usize = 50;
const CLIENTS: usize = 8;

struct SinkClient {
    identifier: String,
}

impl Client for SinkClient {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn send_update(&mut self, _message: &UpdateMessage) -> bool {
        true
    }
}

fn white_list() -> TraversalWhiteList {
    let mut list = TraversalWhiteList::new();
    list.allow_metadata("virtual-router-virtual-machine");
    list.allow_metadata("virtual-machine-virtual-network");
    list.allow_neighbor("virtual-router", "virtual-machine");
    list.allow_neighbor("virtual-machine", "virtual-network");
    list
}

/// Server with every client subscribed to every network through its own vm.
fn build_server() -> (Server, Vec<NodeId>) {
    let mut server = Server::new(ServerConfig::default(), white_list());
    let graph = server.graph_mut();
    let networks: Vec<NodeId> = (0..NETWORKS)
        .map(|n| {
            let vn = graph.insert_node("virtual-network", &format!("vn-{n}"));
            graph.set_config(vn, Bytes::from(format!("vn {n}")));
            vn
        })
        .collect();
    for c in 0..CLIENTS {
        let graph = server.graph_mut();
        let vr = graph.insert_node("virtual-router", &format!("vr-{c}"));
        let vm = graph.insert_node("virtual-machine", &format!("vm-{c}"));
        graph.insert_link(vr, vm, "virtual-router-virtual-machine");
        for &vn in &networks {
            graph.insert_link(vm, vn, "virtual-machine-virtual-network");
        }
        server.client_register(Box::new(SinkClient {
            identifier: format!("vr-{c}"),
        }));
    }
    server.run().unwrap();
    (server, networks)
}

fn fan_out(c: &mut Criterion) {
    c.bench_function("config update fan-out", |b| {
        b.iter_custom(|iters| {
            let mut elapsed = Duration::ZERO;
            for iter in 0..iters {
                let (mut server, networks) = build_server();
                for (n, &vn) in networks.iter().enumerate() {
                    server
                        .graph_mut()
                        .set_config(vn, Bytes::from(format!("rev {iter} {n}")));
                }

                let instant = Instant::now();
                server.run().unwrap();
                elapsed += instant.elapsed();

                assert!(server.queue_is_empty());
            }
            elapsed
        });
    });
}

criterion_group!(benches, fan_out);
criterion_main!(benches);
