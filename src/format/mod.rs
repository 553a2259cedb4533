//! Format codec collaborator interface
//!
//! Standard file formats (FASTA, BED, WIG, ...) are parsed by external codecs.
//! Local-file sources look them up by name in a [`FormatRegistry`].

use crate::models::DataSegment;
use crate::source::LoadTask;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

/// Error type for format codecs
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("Unknown data format: {0}")]
    UnknownFormat(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The task was cancelled while parsing
    #[error("Parsing interrupted")]
    Interrupted,
}

/// A codec able to fill a segment from a local file
pub trait DataFormat: Send + Sync {
    /// Name the format is registered under
    fn name(&self) -> &str;

    /// Whether the codec needs direct (random) access to a whole local file, e.g.
    /// indexed binary formats. Such formats bypass the chunked file reader.
    fn can_only_parse_directly_from_local_file(&self) -> bool {
        false
    }

    /// Fill `segment` with the data of `input` that falls inside its window
    fn parse_input(
        &self,
        input: &Path,
        segment: &mut DataSegment,
        settings: &BTreeMap<String, String>,
        task: &dyn LoadTask,
    ) -> Result<(), FormatError>;
}

/// Format codecs keyed by case-insensitive name
#[derive(Clone, Default)]
pub struct FormatRegistry {
    formats: HashMap<String, Arc<dyn DataFormat>>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a codec, replacing any codec with the same name
    pub fn register(&mut self, format: Arc<dyn DataFormat>) {
        self.formats.insert(format.name().to_lowercase(), format);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DataFormat>> {
        self.formats.get(&name.to_lowercase()).cloned()
    }

    /// Like [`FormatRegistry::get`], failing for unknown names
    pub fn require(&self, name: &str) -> Result<Arc<dyn DataFormat>, FormatError> {
        self.get(name)
            .ok_or_else(|| FormatError::UnknownFormat(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.formats.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatRegistry")
            .field("formats", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SegmentData;

    struct Constant;

    impl DataFormat for Constant {
        fn name(&self) -> &str {
            "Constant"
        }

        fn parse_input(
            &self,
            _input: &Path,
            segment: &mut DataSegment,
            _settings: &BTreeMap<String, String>,
            _task: &dyn LoadTask,
        ) -> Result<(), FormatError> {
            let values = vec![1.0; segment.length()];
            segment
                .set_payload(SegmentData::Numeric(values))
                .map_err(FormatError::Parse)
        }
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut registry = FormatRegistry::new();
        registry.register(Arc::new(Constant));
        assert!(registry.get("constant").is_some());
        assert!(registry.get("CONSTANT").is_some());
        assert!(matches!(
            registry.require("fasta"),
            Err(FormatError::UnknownFormat(_))
        ));
        assert_eq!(registry.names(), vec!["constant".to_string()]);
    }
}
