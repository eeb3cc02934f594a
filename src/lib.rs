//! A shared-memory slab allocator: carves a fixed, externally
//! supplied region of raw memory into variable-sized chunks for many
//! concurrent small allocations, plus occasional multi-page ones,
//! behind a single embedded lock. See [`Pool`] for the main entry
//! point.

mod bitmap;
mod constants;
mod descriptor;
mod error;
mod freelist;
mod lock;
mod pool;
mod region;
mod slot;
mod stats;

pub use constants::{size_constants_init, system_page_size, SizeClassConstants, DEFAULT_MIN_SHIFT};
pub use error::{Diagnostic, InitError};
pub use pool::{Pool, PoolConfig};
pub use region::MappedRegion;
pub use stats::ClassStats;
