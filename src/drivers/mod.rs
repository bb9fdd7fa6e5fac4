// src/drivers/mod.rs
pub mod buffer;
pub mod decoder;
pub mod error;
pub mod schema;
pub mod slcan;
pub mod source;
pub mod store;
pub mod window;

pub use buffer::{RingBuffer, SeriesSnapshot};
pub use decoder::FrameDecoder;
pub use error::{DecodeError, SchemaError, StoreError, TransportError};
pub use schema::{MessageDescriptor, Schema, SignalDatabase};
pub use slcan::{list_ports, SlcanSource};
pub use source::{FrameSource, ManualSource, SyntheticSource};
pub use store::ChannelStore;
pub use window::{
    visible_bounds, Layout, SeriesView, SurfaceFrame, TickSchedule, ValueBounds, WindowedConsumer,
};
