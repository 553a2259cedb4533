//! Models module for the SDK
//!
//! Defines the data structures every data source works with: the requested
//! window ([`DataSegment`]), the payload a source fills into it, region records
//! and the typed values read from external sources.

pub mod field;
pub mod track;

pub use field::{FieldSpec, FieldSpecError, FieldTransform};
pub use track::{DataTrack, TrackError, TrackRegistry};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Kind of data a track (and every source of that track) provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    /// DNA sequence
    Sequence,
    /// One numeric value per position (e.g. conservation scores)
    Numeric,
    /// Region/annotation records
    Region,
}

impl DataType {
    /// Name used in persisted configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Sequence => "Sequence",
            DataType::Numeric => "Numeric",
            DataType::Region => "Region",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sequence" | "dna" => Ok(DataType::Sequence),
            "numeric" | "signal" => Ok(DataType::Numeric),
            "region" | "regions" | "feature" => Ok(DataType::Region),
            _ => Err(format!(
                "Invalid data type: {}. Expected: Sequence, Numeric, Region",
                s
            )),
        }
    }
}

/// Strand orientation of a region
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Orientation {
    Direct,
    Reverse,
    #[default]
    Indeterminate,
}

impl Orientation {
    /// Classify a raw strand token.
    ///
    /// `DIRECT`, anything starting with `+` and `"1"` are direct; `REVERSE` and
    /// anything starting with `-` are reverse; everything else is indeterminate.
    pub fn from_token(token: &str) -> Self {
        let token = token.trim();
        if token.eq_ignore_ascii_case("DIRECT") || token.starts_with('+') || token == "1" {
            Orientation::Direct
        } else if token.eq_ignore_ascii_case("REVERSE") || token.starts_with('-') {
            Orientation::Reverse
        } else {
            Orientation::Indeterminate
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            Orientation::Direct => '+',
            Orientation::Reverse => '-',
            Orientation::Indeterminate => '.',
        }
    }
}

/// Declared type of a field value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    #[default]
    Text,
    Integer,
    Real,
    Boolean,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Text => "Text",
            ValueType::Integer => "Integer",
            ValueType::Real => "Real",
            ValueType::Boolean => "Boolean",
        }
    }

    /// Parse a literal into a value of this type
    pub fn parse_value(&self, raw: &str) -> Result<FieldValue, String> {
        let trimmed = raw.trim();
        match self {
            ValueType::Text => Ok(FieldValue::Text(raw.to_string())),
            ValueType::Integer => trimmed
                .parse::<i64>()
                .map(FieldValue::Integer)
                .map_err(|_| format!("Not an integer value: '{}'", raw)),
            ValueType::Real => trimmed
                .parse::<f64>()
                .map(FieldValue::Real)
                .map_err(|_| format!("Not a numeric value: '{}'", raw)),
            ValueType::Boolean => match trimmed.to_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(FieldValue::Boolean(true)),
                "false" | "no" | "0" => Ok(FieldValue::Boolean(false)),
                _ => Err(format!("Not a boolean value: '{}'", raw)),
            },
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" | "string" => Ok(ValueType::Text),
            "integer" | "int" => Ok(ValueType::Integer),
            "real" | "double" | "float" | "numeric" => Ok(ValueType::Real),
            "boolean" | "bool" => Ok(ValueType::Boolean),
            _ => Err(format!(
                "Invalid value type: {}. Expected: Text, Integer, Real, Boolean",
                s
            )),
        }
    }
}

/// A value read from (or configured for) an external field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Null,
}

impl FieldValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view of the value; text is parsed leniently
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(n) => Some(*n as f64),
            FieldValue::Real(f) => Some(*f),
            FieldValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Integer(n) => write!(f, "{}", n),
            FieldValue::Real(r) => write!(f, "{}", r),
            FieldValue::Boolean(b) => write!(f, "{}", b),
            FieldValue::Null => Ok(()),
        }
    }
}

/// A region/annotation record positioned relative to its segment's start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Start offset relative to the segment start (0 = first position)
    pub relative_start: i64,
    /// End offset relative to the segment start, inclusive
    pub relative_end: i64,
    /// Region type (e.g. "exon", "repeat")
    pub region_type: String,
    pub score: f64,
    pub orientation: Orientation,
    /// Properties beyond the core attributes
    #[serde(default)]
    pub extra_properties: BTreeMap<String, FieldValue>,
}

impl Region {
    pub fn new(relative_start: i64, relative_end: i64, region_type: impl Into<String>) -> Self {
        Self {
            relative_start,
            relative_end,
            region_type: region_type.into(),
            score: 0.0,
            orientation: Orientation::Indeterminate,
            extra_properties: BTreeMap::new(),
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: FieldValue) {
        self.extra_properties.insert(name.into(), value);
    }

    /// Move both coordinates by `delta`
    pub fn shift(&mut self, delta: i64) {
        self.relative_start += delta;
        self.relative_end += delta;
    }
}

/// Payload a source fills into a segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SegmentData {
    Sequence(String),
    Numeric(Vec<f64>),
    Regions(Vec<Region>),
}

impl SegmentData {
    pub fn data_type(&self) -> DataType {
        match self {
            SegmentData::Sequence(_) => DataType::Sequence,
            SegmentData::Numeric(_) => DataType::Numeric,
            SegmentData::Regions(_) => DataType::Region,
        }
    }
}

/// A request window on one chromosome plus the payload slot a source fills.
///
/// Coordinates are 1-based and inclusive. Once set, a sequence or numeric payload
/// covers exactly `end - start + 1` positions.
///
/// # Example
///
/// ```rust
/// use genomic_data_sdk::models::{DataSegment, SegmentData};
///
/// let mut segment = DataSegment::new("chr1", 100, 109).unwrap();
/// assert_eq!(segment.length(), 10);
/// segment.set_payload(SegmentData::Sequence("ACGTACGTAC".to_string())).unwrap();
/// assert_eq!(segment.sequence(), Some("ACGTACGTAC"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSegment {
    pub chromosome: String,
    pub start: i64,
    pub end: i64,
    payload: Option<SegmentData>,
}

impl DataSegment {
    /// Create an empty segment for `chromosome:start-end`
    pub fn new(chromosome: impl Into<String>, start: i64, end: i64) -> Result<Self, String> {
        let chromosome = chromosome.into();
        if chromosome.trim().is_empty() {
            return Err("Segment chromosome cannot be empty".to_string());
        }
        if start < 1 {
            return Err(format!("Segment start must be >= 1, got {}", start));
        }
        if end < start {
            return Err(format!(
                "Segment end ({}) must not be before start ({})",
                end, start
            ));
        }
        Ok(Self {
            chromosome,
            start,
            end,
            payload: None,
        })
    }

    /// Number of positions covered by the window
    pub fn length(&self) -> usize {
        (self.end - self.start + 1) as usize
    }

    pub fn location(&self) -> String {
        format!("{}:{}-{}", self.chromosome, self.start, self.end)
    }

    /// Set the payload, checking that sequence/numeric data covers the window exactly
    pub fn set_payload(&mut self, payload: SegmentData) -> Result<(), String> {
        let covered = match &payload {
            SegmentData::Sequence(s) => Some(s.len()),
            SegmentData::Numeric(v) => Some(v.len()),
            SegmentData::Regions(_) => None,
        };
        if let Some(covered) = covered
            && covered != self.length()
        {
            return Err(format!(
                "{} payload covers {} positions but segment {} has {}",
                payload.data_type(),
                covered,
                self.location(),
                self.length()
            ));
        }
        self.payload = Some(payload);
        Ok(())
    }

    pub fn payload(&self) -> Option<&SegmentData> {
        self.payload.as_ref()
    }

    pub fn take_payload(&mut self) -> Option<SegmentData> {
        self.payload.take()
    }

    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    pub fn sequence(&self) -> Option<&str> {
        match &self.payload {
            Some(SegmentData::Sequence(s)) => Some(s),
            _ => None,
        }
    }

    pub fn numeric(&self) -> Option<&[f64]> {
        match &self.payload {
            Some(SegmentData::Numeric(v)) => Some(v),
            _ => None,
        }
    }

    pub fn regions(&self) -> Option<&[Region]> {
        match &self.payload {
            Some(SegmentData::Regions(r)) => Some(r),
            _ => None,
        }
    }

    /// Empty window on the same chromosome, `offset` positions into this one
    pub fn sub_segment(&self, offset: i64, length: i64) -> Result<Self, String> {
        let start = self.start + offset;
        let end = (start + length - 1).min(self.end);
        DataSegment::new(self.chromosome.clone(), start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orientation_tokens() {
        assert_eq!(Orientation::from_token("+"), Orientation::Direct);
        assert_eq!(Orientation::from_token("+1"), Orientation::Direct);
        assert_eq!(Orientation::from_token("1"), Orientation::Direct);
        assert_eq!(Orientation::from_token("direct"), Orientation::Direct);
        assert_eq!(Orientation::from_token("-"), Orientation::Reverse);
        assert_eq!(Orientation::from_token("-1"), Orientation::Reverse);
        assert_eq!(Orientation::from_token("REVERSE"), Orientation::Reverse);
        assert_eq!(Orientation::from_token("."), Orientation::Indeterminate);
        assert_eq!(Orientation::from_token("0"), Orientation::Indeterminate);
    }

    #[test]
    fn test_segment_rejects_bad_windows() {
        assert!(DataSegment::new("chr1", 0, 10).is_err());
        assert!(DataSegment::new("chr1", 10, 9).is_err());
        assert!(DataSegment::new("", 1, 9).is_err());
        assert!(DataSegment::new("chr1", 5, 5).is_ok());
    }

    #[test]
    fn test_payload_must_cover_window() {
        let mut segment = DataSegment::new("chr2", 11, 15).unwrap();
        assert!(
            segment
                .set_payload(SegmentData::Numeric(vec![0.0; 4]))
                .is_err()
        );
        assert!(!segment.has_payload());
        segment
            .set_payload(SegmentData::Numeric(vec![1.0; 5]))
            .unwrap();
        assert_eq!(segment.numeric().map(|v| v.len()), Some(5));
        // Regions may extend beyond the window
        segment
            .set_payload(SegmentData::Regions(vec![Region::new(-3, 20, "gene")]))
            .unwrap();
        assert_eq!(segment.regions().unwrap().len(), 1);
    }

    #[test]
    fn test_value_type_parsing() {
        assert_eq!("int".parse::<ValueType>().unwrap(), ValueType::Integer);
        assert_eq!(
            ValueType::Integer.parse_value(" 42 ").unwrap(),
            FieldValue::Integer(42)
        );
        assert!(ValueType::Integer.parse_value("4.2").is_err());
        assert_eq!(
            ValueType::Boolean.parse_value("yes").unwrap(),
            FieldValue::Boolean(true)
        );
    }

    #[test]
    fn test_sub_segment_clamps_to_parent() {
        let segment = DataSegment::new("chr1", 100, 249).unwrap();
        let sub = segment.sub_segment(100, 100).unwrap();
        assert_eq!((sub.start, sub.end), (200, 249));
    }
}
