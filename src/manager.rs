//! Manager subsystem: the placement index and the WebDAV dispatch
//! that fans commands out to storage nodes.
//!
//! A manager holds no object bytes. It knows which storages own which
//! key ranges (loaded from the metadata store, refreshed on demand),
//! asks the replicas what they have (ITEM_INFO fan-out), and pipes
//! object bytes between HTTP clients and the storage wire protocol
//! through a pool of reusable connections.

mod cluster;
pub use cluster::*;

mod meta;
pub use meta::*;

mod range;
pub use range::*;

mod pool;
pub use pool::*;

mod dispatch;
pub use dispatch::*;
