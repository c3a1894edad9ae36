use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::time::Duration;

use lazy_static::lazy_static;

/// Entries in the hard-coded root hint list (RFC 1035 §6.1.2). The canonical
/// value is a.root-servers.net, 198.41.0.4; additional roots may be added but
/// at least one must always be present.
pub const ROOT_SERVERS: &[Ipv4Addr] = &[Ipv4Addr::new(198, 41, 0, 4)];

/// Hard ceiling on recursion depth across nested `resolve` calls for one
/// top-level query (§4.3). Exceeding this is a fatal ResolutionFailure.
pub const MAX_RECURSION_DEPTH: u32 = 5;

/// Connect timeout and read deadline for a single upstream exchange (§4.1).
/// Both are independent 5s budgets, not a combined one.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the cache sweeper prunes expired entries (§4.2). Lazy expiry in
/// `get` already guarantees correctness; the sweeper only reclaims memory for
/// keys nobody has read since they expired.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Maximum size of an inbound client datagram the server driver will read
/// (§6): RFC 1035's classic non-EDNS UDP bound plus a little slack.
pub const MAX_INBOUND_DATAGRAM: usize = 514;

/// Maximum size of an upstream reply datagram the backend will read, per the
/// RFC 6891 §6.2.5 buffer-sizing guidance the teacher crate already used.
/// EDNS(0) itself is out of scope (§1 Non-goals); this is purely a
/// conservative allocation so a larger-than-classic UDP reply from a modern
/// upstream isn't truncated mid-read.
pub const MAX_UPSTREAM_DATAGRAM: usize = 4096;

/// Default bind address for the daemon (§6): `:53` on all interfaces.
pub const DEFAULT_BIND_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 53);

lazy_static! {
    /// Number of (name, type) entries the record cache holds before LRU
    /// eviction kicks in, independent of TTL expiry.
    pub static ref CACHE_CAPACITY: NonZeroUsize = NonZeroUsize::new(100_000).unwrap();
}
