//! Dense multi-view stereo patch engine.
//!
//! Given calibrated photographs and seed patches, the engine refines each
//! patch's depth and orientation against a multi-image normalized
//! cross-correlation score, then filters the patch cloud with visibility,
//! depth-map, neighbor-support and component-size passes.

pub mod config;
pub mod filter;
pub mod optim;
pub mod patch;
pub mod photo;
pub mod store;
pub mod system;

#[cfg(test)]
pub(crate) mod testutil;
