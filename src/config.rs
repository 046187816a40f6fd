//! Node configuration.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;

use tokio::time::Duration;

/// Default bucket size and replication factor.
pub const DEFAULT_KSIZE: usize = 20;

/// Default number of peers asked in parallel during a refresh.
pub const DEFAULT_ALPHA: usize = 3;

/// A bucket untouched for this long is lonely and gets refreshed (1 hour).
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(3600);

/// How long a stored value lives without being re-stored (1 week).
pub const DEFAULT_STORAGE_TTL: Duration = Duration::from_secs(604_800);

/// Maximum number of small values held in memory.
pub const DEFAULT_STORAGE_CAPACITY: usize = 100_000;

/// How long an outbound call waits for its answer.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Period of the bucket refresh loop.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// Settings for one DHT node.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// UDP address the transport binds to.
    pub bind: SocketAddr,
    /// Root directory of the blob store.
    pub data_dir: PathBuf,
    /// Bucket capacity `k`, also the replication factor.
    pub ksize: usize,
    /// Parallelism used by the refresh loop.
    pub alpha: usize,
    pub staleness: Duration,
    pub storage_ttl: Duration,
    pub storage_capacity: NonZeroUsize,
    pub rpc_timeout: Duration,
    pub refresh_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8468)),
            data_dir: PathBuf::from("store"),
            ksize: DEFAULT_KSIZE,
            alpha: DEFAULT_ALPHA,
            staleness: DEFAULT_STALENESS,
            storage_ttl: DEFAULT_STORAGE_TTL,
            storage_capacity: NonZeroUsize::new(DEFAULT_STORAGE_CAPACITY)
                .unwrap_or(NonZeroUsize::MIN),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}
