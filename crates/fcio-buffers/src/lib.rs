//! Exchange buffer pool for the FCP exchange engine.
//!
//! Buffers live in an arena indexed by exchange tag. Each buffer carries one
//! DMA area holding the FCP command unit, the FCP response unit and the
//! scatter-gather table, laid out according to the adapter generation.

mod area;
mod backend;
mod pool;
mod tags;

pub use area::DmaArea;
pub use backend::{
    AreaLayout, ExchangeBackend, Generation, LegacyBackend, ModernBackend, RegistrationError,
    ReuseHold, ReuseHolds, SGL_POST_BLOCK, SglPost, SglRegistrar, backend_for,
};
pub use pool::{Exchange, ExchangePool, ExchangeRef, ExchangeSlot, PoolSnapshot, SlotState};
pub use tags::{ExchangeTag, TagAllocator};
