//! AirPlay receiver subprocess: configuration, supervision, metadata

pub mod config;
pub mod metadata;
pub mod supervisor;

pub use config::{OutputMode, ReceiverConfig};
pub use metadata::{MetadataItem, MetadataParseError, MetadataParser, TrackAssembler};
pub use supervisor::{kill_stale_receivers, LogStream, ReceiverEvent, ReceiverSupervisor};
