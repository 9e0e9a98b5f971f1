use tidepool_core::hlc::ManualTime;
use tidepool_engine::{EngineConfig, EngineError};

use crate::TestPeer;
use crate::remote::MemoryRemote;

const START_MS: u64 = 1_700_000_000_000;

/// Several replicas sharing one remote and one manually driven clock.
pub struct TestNetwork {
    pub remote: MemoryRemote,
    pub time: ManualTime,
    peers: Vec<TestPeer>,
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl TestNetwork {
    pub fn new() -> Self {
        Self {
            remote: MemoryRemote::new(),
            time: ManualTime::new(START_MS),
            peers: Vec::new(),
        }
    }

    pub fn add_peer(&mut self, owner_key: &str) -> Result<usize, EngineError> {
        let peer = TestPeer::new(owner_key, &self.remote, &self.time)?;
        let index = self.peers.len();
        self.peers.push(peer);
        Ok(index)
    }

    pub fn peer(&self, index: usize) -> &TestPeer {
        &self.peers[index]
    }

    pub fn peer_mut(&mut self, index: usize) -> &mut TestPeer {
        &mut self.peers[index]
    }

    pub fn advance(&self, ms: u64) {
        self.time.advance(ms);
    }

    /// Let every replica push and then pull, twice, with the clock moved past
    /// the grace window in between so no pull is held back by an old write.
    pub fn settle(&mut self) -> Result<(), EngineError> {
        let grace = EngineConfig::default().grace_window_ms;
        for _ in 0..2 {
            for peer in &mut self.peers {
                peer.engine.flush()?;
            }
            self.time.advance(grace + 1);
            for peer in &mut self.peers {
                peer.engine.pull()?;
            }
        }
        Ok(())
    }
}
