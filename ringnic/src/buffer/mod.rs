//! Receive buffer memory: per-packet mapped blocks and shared half pages.

pub(crate) mod page;
pub(crate) mod pool;

pub(crate) use pool::{AllocLevel, RxAllocator, RxBuffer};
