//! `lidarfx-middleware` – sensor plumbing around the perception pipeline.
//!
//! Moves sensor messages in and results out without caring about their
//! geometric meaning.
//!
//! # Modules
//!
//! - [`bus`] – topic-based publish/subscribe event bus built on Tokio
//!   broadcast channels.
//! - [`adapter`] – [`FrameSource`] / [`OutputSink`] traits, an in-process
//!   channel source and the bus-backed sink.
//! - [`replay`] – JSON-lines recording source.

pub mod adapter;
pub mod bus;
pub mod replay;

pub use adapter::{BusSink, ChannelSource, FrameSource, OutputSink, SensorMessage};
pub use bus::{EventBus, Topic, TopicReceiver};
pub use replay::ReplaySource;
