pub mod sources;

use gw_core::replication::{LoopbackBus, PeerId, ReplicationClient, ReplicationServer};

/// Deliver every queued message in both directions until the bus is quiet.
pub fn pump(
	bus: &LoopbackBus,
	server: &ReplicationServer,
	clients: &[(PeerId, &ReplicationClient)],
) {
	loop {
		let mut delivered = false;

		for (peer, message) in bus.drain_server() {
			server.handle_message(peer, message);
			delivered = true;
		}
		for (peer, client) in clients {
			for message in bus.drain_client(*peer) {
				client.apply(message);
				delivered = true;
			}
		}

		if !delivered {
			break;
		}
	}
}
