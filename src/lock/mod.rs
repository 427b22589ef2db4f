//! TTL-scoped resource locks.
//!
//! A lock records why a resource is held (`LockStatus`) and expires on its own
//! if the holder never releases it.

mod cache;
mod resources;
mod status;

pub use cache::{LockEntry, ResourceLocker, TtlCache};
pub use resources::{LockTtls, ResourceLocks};
pub use status::LockStatus;
