pub mod network;
pub mod peer;
pub mod remote;
pub mod schema;

pub use network::TestNetwork;
pub use peer::TestPeer;
pub use remote::{MemoryRemote, RemoteLink};
pub use schema::Table;

use tracing_subscriber::EnvFilter;

/// Install a test subscriber honouring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
