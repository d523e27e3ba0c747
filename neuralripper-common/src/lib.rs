//! NeuralRipper Common Types
//!
//! Wire types shared between the backend and its streaming clients.

pub mod protocol;

pub use protocol::{GenerateRequest, StreamMessage};
