//! Genomic Data SDK - Retrieval of genomic interval data from heterogeneous sources
//!
//! Provides unified interfaces for:
//! - Data tracks with ordered, mirrored sources (via the track registry)
//! - Protocol loaders: local files, SQL databases, DAS XML servers, UCSC JSON API
//! - Field mapping between region properties and source fields
//! - Per-server access coordination (rate limiting)
//! - Track configuration persistence with obfuscated credentials

pub mod access;
pub mod auth;
pub mod config;
pub mod format;
pub mod models;
pub mod source;

// Re-export commonly used types
pub use access::AccessCoordinator;
pub use config::{ConfigError, LoaderSettings};
pub use format::{DataFormat, FormatError, FormatRegistry};
pub use source::{
    DataLoader, DataSource, LoadContext, LoadTask, SegmentLoader, SourceError, SourceProtocol,
    TaskHandle,
};

// Re-export models
pub use models::{
    DataSegment, DataTrack, DataType, FieldSpec, FieldTransform, FieldValue, Orientation, Region,
    SegmentData, TrackError, TrackRegistry, ValueType,
};
