//! Token classifier model: the forward-pass contract, a transformer encoder
//! implementation of it, and the host/device tensor bridge.

pub mod bridge;
pub mod classifier;
pub mod tagger;
