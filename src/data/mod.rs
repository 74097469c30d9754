//! Chunk buffers and the manager that owns them.
//!
//! - [`stream_buffer`]: FIFO pool of chunks for high-rate stream data
//! - [`service_buffer`]: versioned store for low-rate service data
//! - [`manager`]: per-type buffer registry and consumer matching
//! - [`requirements`]: what consumers need and what the server provides
//! - [`signal`]: wake-ups for consumers waiting on new chunks

pub mod manager;
pub mod requirements;
pub mod service_buffer;
pub mod signal;
pub mod stream_buffer;

pub use manager::{DataManager, MatchedData};
pub use requirements::{DataRequirements, DataSpec};
pub use service_buffer::{ServiceDataBuffer, ServiceReadHandle};
pub use signal::ActivationSignal;
pub use stream_buffer::{BufferStats, StreamDataBuffer};
