//! Storage node subsystem: the slice engine and its TCP command
//! service.
//!
//! On-disk layout per node:
//!
//! ```text
//! <data_path>/<level>/<sub_level>/data/<slice_id>
//! <data_path>/<level>/<sub_level>/index/<slice_id>
//! ```
//!
//! Data files are append-only sequences of header + payload records;
//! each has a sibling index file carrying one fixed-size record per
//! write. The index is derived state: any slice can be rebuilt from
//! its data file alone, which is what happens on open after a crash.

mod slice;
pub use slice::*;

mod slice_manager;
pub use slice_manager::*;

mod item_index;
pub use item_index::*;

mod store;
pub use store::*;

mod service;
pub use service::*;

mod sync;
pub use sync::*;
