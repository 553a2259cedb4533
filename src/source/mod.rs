//! Data source abstraction
//!
//! Defines the [`SegmentLoader`] trait and one implementation per wire protocol:
//! - [`file::FileSource`]: local flat files, whole or split into fixed-size chunks
//! - [`sql::SqlSource`]: relational databases (DuckDB, PostgreSQL)
//! - [`das::DasSource`]: DAS-style XML annotation servers
//! - [`ucsc::UcscSource`]: the UCSC-style JSON REST API
//!
//! A [`DataSource`] couples one protocol with the organism/genome build it serves
//! and the settings shared by all protocols.

pub mod das;
pub mod file;
#[cfg(feature = "api-backend")]
pub mod http;
pub mod sql;
pub mod ucsc;

use crate::access::AccessCoordinator;
use crate::config::{ConfigError, LoaderSettings};
use crate::config::xml::XmlElement;
use crate::format::{FormatError, FormatRegistry};
use crate::models::field::FieldSpecError;
use crate::models::{DataSegment, DataType, Region, SegmentData};
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Error type for segment loads
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Inconsistent or incomplete source configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Field specification could not be applied
    #[error("Field specification error: {0}")]
    FieldSpec(#[from] FieldSpecError),
    /// Connection, protocol or redirect failure
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Request to {url} timed out after {seconds} seconds")]
    Timeout { seconds: u64, url: String },
    #[error("HTTP error {status} from {url}")]
    HttpStatus { status: u16, url: String },
    #[error("Database error: {0}")]
    Database(String),
    /// The source answered, but not with the requested window
    #[error("Data contract violation: {0}")]
    DataContract(String),
    /// A file the source layout requires does not exist
    #[error("Missing data file: {}", .0.display())]
    MissingResource(PathBuf),
    #[error("Format error: {0}")]
    Format(FormatError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The task was cancelled while loading
    #[error("Load interrupted")]
    Interrupted,
}

impl SourceError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, SourceError::Interrupted)
    }

    /// Whether another mirror may be tried after this failure
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            SourceError::Interrupted | SourceError::Configuration(_) | SourceError::FieldSpec(_)
        )
    }

    pub fn is_data_contract(&self) -> bool {
        matches!(self, SourceError::DataContract(_))
    }

    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            SourceError::Timeout { seconds, url } => format!(
                "Request to {url} timed out after {seconds} seconds.\n\n\
                Hint: Increase 'http_timeout_secs' in the loader settings or configure a mirror."
            ),
            SourceError::MissingResource(path) => format!(
                "Missing data file: {}\n\nHint: Check the source's file path and segment size.",
                path.display()
            ),
            SourceError::Configuration(msg) => {
                format!("Invalid source configuration: {msg}\n\nHint: Check the track configuration file.")
            }
            _ => self.to_string(),
        }
    }
}

impl From<FormatError> for SourceError {
    fn from(err: FormatError) -> Self {
        match err {
            FormatError::Interrupted => SourceError::Interrupted,
            other => SourceError::Format(other),
        }
    }
}

/// Progress and cancellation hooks of the task a load runs in
pub trait LoadTask: Send + Sync {
    /// Whether the task has been asked to stop
    fn is_cancelled(&self) -> bool;

    /// Report the number of records processed so far
    fn report_progress(&self, _processed: u64) {}
}

/// Shareable [`LoadTask`] backed by atomics
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
}

impl TaskHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

impl LoadTask for TaskHandle {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn report_progress(&self, processed: u64) {
        self.processed.store(processed, Ordering::Relaxed);
    }
}

/// Everything a load call needs besides the source and the segment
#[derive(Clone, Copy)]
pub struct LoadContext<'a> {
    pub task: &'a dyn LoadTask,
    pub access: &'a AccessCoordinator,
    pub settings: &'a LoaderSettings,
    pub formats: &'a FormatRegistry,
}

impl<'a> LoadContext<'a> {
    pub fn new(
        task: &'a dyn LoadTask,
        access: &'a AccessCoordinator,
        settings: &'a LoaderSettings,
        formats: &'a FormatRegistry,
    ) -> Self {
        Self {
            task,
            access,
            settings,
            formats,
        }
    }

    pub fn check_cancelled(&self) -> Result<(), SourceError> {
        if self.task.is_cancelled() {
            Err(SourceError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Wait until `server` may be contacted again, honouring `delay_ms`
    /// (or the default delay when it is zero)
    pub fn throttle(&self, server: &str, delay_ms: u64) -> Duration {
        let delay = if delay_ms > 0 {
            delay_ms
        } else {
            self.settings.default_delay_ms
        };
        self.access.wait_turn(server, Duration::from_millis(delay))
    }
}

/// Owns the shared state load calls borrow through a [`LoadContext`]
#[derive(Clone, Default)]
pub struct DataLoader {
    access: Arc<AccessCoordinator>,
    settings: LoaderSettings,
    formats: FormatRegistry,
}

impl DataLoader {
    pub fn new(settings: LoaderSettings) -> Self {
        Self {
            access: Arc::new(AccessCoordinator::new()),
            settings,
            formats: FormatRegistry::new(),
        }
    }

    /// Share an existing access coordinator between loaders
    pub fn with_access(mut self, access: Arc<AccessCoordinator>) -> Self {
        self.access = access;
        self
    }

    pub fn with_formats(mut self, formats: FormatRegistry) -> Self {
        self.formats = formats;
        self
    }

    pub fn settings(&self) -> &LoaderSettings {
        &self.settings
    }

    pub fn formats_mut(&mut self) -> &mut FormatRegistry {
        &mut self.formats
    }

    pub fn context<'a>(&'a self, task: &'a dyn LoadTask) -> LoadContext<'a> {
        LoadContext::new(task, &self.access, &self.settings, &self.formats)
    }
}

/// Trait implemented by every protocol
pub trait SegmentLoader {
    /// Protocol name used in persisted configuration
    fn protocol(&self) -> &'static str;

    /// Data types this protocol can deliver
    fn supported_data(&self) -> &'static [DataType];

    /// Whether results should go through the engine cache
    fn use_cache(&self) -> bool;

    /// Address of the server this protocol talks to, if any
    fn server_address(&self) -> Option<String>;

    /// Point this protocol at another server (used to build mirrors)
    fn set_server_address(&mut self, address: &str) -> Result<(), SourceError>;

    /// Fill `segment` with data for `source`
    fn load(
        &self,
        source: &DataSource,
        segment: &mut DataSegment,
        ctx: &LoadContext<'_>,
    ) -> Result<(), SourceError>;
}

/// Protocol-specific part of a data source
#[derive(Debug, Clone, PartialEq)]
pub enum SourceProtocol {
    File(file::FileSource),
    Sql(sql::SqlSource),
    Das(das::DasSource),
    Ucsc(ucsc::UcscSource),
}

impl SourceProtocol {
    pub fn loader(&self) -> &dyn SegmentLoader {
        match self {
            SourceProtocol::File(p) => p,
            SourceProtocol::Sql(p) => p,
            SourceProtocol::Das(p) => p,
            SourceProtocol::Ucsc(p) => p,
        }
    }

    pub fn loader_mut(&mut self) -> &mut dyn SegmentLoader {
        match self {
            SourceProtocol::File(p) => p,
            SourceProtocol::Sql(p) => p,
            SourceProtocol::Das(p) => p,
            SourceProtocol::Ucsc(p) => p,
        }
    }

    pub fn name(&self) -> &'static str {
        self.loader().protocol()
    }
}

/// One source of data for a track: a protocol serving one organism/genome build
#[derive(Debug, Clone, PartialEq)]
pub struct DataSource {
    /// Name of the track this source belongs to
    pub track_name: String,
    /// Data type of the owning track
    pub data_type: DataType,
    /// NCBI taxonomy id
    pub organism: i32,
    pub genome_build: String,
    /// Name of the format codec used for local files
    pub data_format: Option<String>,
    pub format_settings: BTreeMap<String, String>,
    /// Largest window requested in one call (0 = unlimited)
    pub max_sequence_span: usize,
    /// Minimum milliseconds between requests to this source's server
    pub delay_ms: u64,
    pub protocol: SourceProtocol,
}

impl DataSource {
    pub fn new(
        data_type: DataType,
        organism: i32,
        genome_build: impl Into<String>,
        protocol: SourceProtocol,
    ) -> Self {
        Self {
            track_name: String::new(),
            data_type,
            organism,
            genome_build: genome_build.into(),
            data_format: None,
            format_settings: BTreeMap::new(),
            max_sequence_span: 0,
            delay_ms: 0,
            protocol,
        }
    }

    pub fn with_data_format(mut self, format: impl Into<String>) -> Self {
        self.data_format = Some(format.into());
        self
    }

    pub fn with_format_setting(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.format_settings.insert(name.into(), value.into());
        self
    }

    pub fn with_max_span(mut self, span: usize) -> Self {
        self.max_sequence_span = span;
        self
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn protocol_name(&self) -> &'static str {
        self.protocol.name()
    }

    pub fn supported_data(&self) -> &'static [DataType] {
        self.protocol.loader().supported_data()
    }

    pub fn supports(&self, data_type: DataType) -> bool {
        self.supported_data().contains(&data_type)
    }

    pub fn use_cache(&self) -> bool {
        self.protocol.loader().use_cache()
    }

    pub fn server_address(&self) -> Option<String> {
        self.protocol.loader().server_address()
    }

    pub fn set_server_address(&mut self, address: &str) -> Result<(), SourceError> {
        self.protocol.loader_mut().set_server_address(address)
    }

    /// Copy of this source pointed at another server
    pub fn mirrored(&self, address: &str) -> Result<Self, SourceError> {
        let mut mirror = self.clone();
        mirror.set_server_address(address)?;
        Ok(mirror)
    }

    pub fn serves(&self, organism: i32, genome_build: &str) -> bool {
        self.organism == organism && self.genome_build == genome_build
    }

    /// Load data for `segment`, splitting windows larger than `max_sequence_span`
    pub fn load_data_segment(
        &self,
        segment: &mut DataSegment,
        ctx: &LoadContext<'_>,
    ) -> Result<(), SourceError> {
        if !self.supports(self.data_type) {
            return Err(SourceError::Configuration(format!(
                "{} sources cannot provide {} data",
                self.protocol_name(),
                self.data_type
            )));
        }
        ctx.check_cancelled()?;

        let span = self.max_sequence_span;
        if span > 0 && segment.length() > span {
            return self.load_in_spans(segment, span, ctx);
        }
        self.load_window(segment, ctx)
    }

    fn load_window(
        &self,
        segment: &mut DataSegment,
        ctx: &LoadContext<'_>,
    ) -> Result<(), SourceError> {
        tracing::debug!(
            "Loading {} from {} source for track '{}'",
            segment.location(),
            self.protocol_name(),
            self.track_name
        );
        self.protocol.loader().load(self, segment, ctx)?;
        match segment.payload() {
            Some(payload) if payload.data_type() == self.data_type => Ok(()),
            Some(payload) => Err(SourceError::DataContract(format!(
                "{} source returned {} data for a {} track",
                self.protocol_name(),
                payload.data_type(),
                self.data_type
            ))),
            None => Err(SourceError::DataContract(format!(
                "{} source returned no data for {}",
                self.protocol_name(),
                segment.location()
            ))),
        }
    }

    fn load_in_spans(
        &self,
        segment: &mut DataSegment,
        span: usize,
        ctx: &LoadContext<'_>,
    ) -> Result<(), SourceError> {
        let span = span as i64;
        let total = segment.length() as i64;
        tracing::debug!(
            "Splitting {} into windows of at most {} positions",
            segment.location(),
            span
        );

        let mut sequence = String::new();
        let mut numeric = Vec::new();
        let mut regions: Vec<Region> = Vec::new();
        let mut offset = 0;
        while offset < total {
            ctx.check_cancelled()?;
            let mut part = segment
                .sub_segment(offset, span)
                .map_err(SourceError::Configuration)?;
            self.load_window(&mut part, ctx)?;
            match part.take_payload() {
                Some(SegmentData::Sequence(s)) => sequence.push_str(&s),
                Some(SegmentData::Numeric(v)) => numeric.extend(v),
                Some(SegmentData::Regions(found)) => {
                    let boundary = offset;
                    for mut region in found {
                        region.shift(offset);
                        // Regions crossing a split are reported by both windows
                        if region.relative_start < boundary && regions.contains(&region) {
                            continue;
                        }
                        regions.push(region);
                    }
                }
                None => {}
            }
            offset += span;
        }

        let payload = match self.data_type {
            DataType::Sequence => SegmentData::Sequence(sequence),
            DataType::Numeric => SegmentData::Numeric(numeric),
            DataType::Region => SegmentData::Regions(regions),
        };
        segment
            .set_payload(payload)
            .map_err(SourceError::DataContract)
    }
}

/// Entry of the static protocol registry
pub struct ProtocolKind {
    pub name: &'static str,
    pub description: &'static str,
    pub supported: &'static [DataType],
    /// Default-configured protocol for the "add source" flow
    pub create: fn() -> SourceProtocol,
    /// Build the protocol from its persisted configuration element
    pub parse: fn(&XmlElement) -> Result<SourceProtocol, ConfigError>,
}

static PROTOCOLS: Lazy<HashMap<&'static str, ProtocolKind>> = Lazy::new(|| {
    let kinds = [
        ProtocolKind {
            name: file::PROTOCOL,
            description: "Local flat file or directory of fixed-size chunk files",
            supported: file::SUPPORTED,
            create: || SourceProtocol::File(file::FileSource::default()),
            parse: crate::config::tracks::parse_file_protocol,
        },
        ProtocolKind {
            name: sql::PROTOCOL,
            description: "Relational database table of regions",
            supported: sql::SUPPORTED,
            create: || SourceProtocol::Sql(sql::SqlSource::default()),
            parse: crate::config::tracks::parse_sql_protocol,
        },
        ProtocolKind {
            name: das::PROTOCOL,
            description: "DAS XML annotation server",
            supported: das::SUPPORTED,
            create: || SourceProtocol::Das(das::DasSource::default()),
            parse: crate::config::tracks::parse_das_protocol,
        },
        ProtocolKind {
            name: ucsc::PROTOCOL,
            description: "UCSC-style JSON REST API",
            supported: ucsc::SUPPORTED,
            create: || SourceProtocol::Ucsc(ucsc::UcscSource::default()),
            parse: crate::config::tracks::parse_ucsc_protocol,
        },
    ];
    kinds.into_iter().map(|kind| (kind.name, kind)).collect()
});

/// Look up a protocol by its configuration name (case-insensitive)
pub fn protocol_kind(name: &str) -> Option<&'static ProtocolKind> {
    PROTOCOLS.get(name.trim().to_uppercase().as_str())
}

/// Names of all registered protocols, sorted
pub fn protocol_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = PROTOCOLS.keys().copied().collect();
    names.sort_unstable();
    names
}

/// Protocols able to deliver `data_type`
pub fn protocols_supporting(data_type: DataType) -> Vec<&'static str> {
    let mut names: Vec<&'static str> = PROTOCOLS
        .values()
        .filter(|kind| kind.supported.contains(&data_type))
        .map(|kind| kind.name)
        .collect();
    names.sort_unstable();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        assert_eq!(protocol_names(), vec!["DAS", "FILE", "SQL", "UCSC"]);
        let kind = protocol_kind("sql").unwrap();
        assert_eq!(kind.name, "SQL");
        assert!(matches!((kind.create)(), SourceProtocol::Sql(_)));
        assert!(protocol_kind("ftp").is_none());
        assert_eq!(protocols_supporting(DataType::Numeric), vec!["FILE", "UCSC"]);
    }

    #[test]
    fn test_interrupted_is_not_recoverable() {
        assert!(!SourceError::Interrupted.is_recoverable());
        assert!(SourceError::Transport("refused".into()).is_recoverable());
        assert!(!SourceError::Configuration("bad".into()).is_recoverable());
        assert!(SourceError::from(FormatError::Interrupted).is_interrupted());
    }

    #[test]
    fn test_task_handle_cancellation_is_shared() {
        let task = TaskHandle::new();
        let clone = task.clone();
        assert!(!task.is_cancelled());
        clone.cancel();
        assert!(task.is_cancelled());
    }
}
