use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

/// State shared by every room manager built from the same context: the
/// first-connection flag and the set of candidate addresses already seen.
#[derive(Debug, Default)]
pub struct MeshContext {
    first_connection_opened: AtomicBool,
    seen_addresses: Mutex<HashSet<IpAddr>>,
}

impl MeshContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn first_connection_opened(&self) -> bool {
        self.first_connection_opened.load(Ordering::Acquire)
    }

    /// Returns true only for the call that flipped the flag.
    pub(crate) fn mark_connection_opened(&self) -> bool {
        !self.first_connection_opened.swap(true, Ordering::AcqRel)
    }

    /// Records the address carried by an ICE candidate line. Returns true the
    /// first time an address is seen.
    pub fn observe_candidate(&self, candidate: &str) -> bool {
        let Some(address) = candidate_address(candidate) else {
            return false;
        };
        let fresh = self.seen_addresses.lock().insert(address);
        if fresh {
            debug!(target = "mesh::context", %address, "new candidate address");
        }
        fresh
    }
}

// candidate:<foundation> <component> <transport> <priority> <address> <port> typ <kind>
fn candidate_address(candidate: &str) -> Option<IpAddr> {
    candidate.split_whitespace().nth(4)?.parse().ok()
}
