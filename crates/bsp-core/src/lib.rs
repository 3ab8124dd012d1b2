//! BSP-Core: Foundation types for biosignal streaming
//!
//! Sample records, batches, fan-out events and the shared error type.

pub mod sample;
pub mod events;
pub mod error;

pub use sample::*;
pub use events::{ControlEvent, WidgetFrame};
pub use error::{BspError, BspResult};
