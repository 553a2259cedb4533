//! UCSC-style JSON REST source
//!
//! The API uses 0-based, half-open coordinates. Outbound requests send
//! `start - 1` and `end` unchanged; inbound coordinates are converted back to the
//! 1-based closed convention of [`DataSegment`].
//!
//! Responses are deserialized as a stream: only the field holding the data is
//! visited, record by record, so large tracks are never held as a JSON tree.

use super::{DataSource, LoadContext, LoadTask, SegmentLoader, SourceError};
use crate::models::{DataSegment, DataType, FieldValue, Orientation, Region, SegmentData};
use serde::de::{self, DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;

pub const PROTOCOL: &str = "UCSC";
pub const SUPPORTED: &[DataType] = &[DataType::Sequence, DataType::Numeric, DataType::Region];

pub const DEFAULT_SERVER: &str = "https://api.genome.ucsc.edu";

/// Track served by a UCSC-style REST API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UcscSource {
    /// API base URL
    pub server: String,
    pub track: String,
    /// Genome name on the server; the source's genome build when unset
    pub genome: Option<String>,
    pub start_field: String,
    pub end_field: String,
    pub type_field: String,
    pub strand_field: String,
    pub score_field: String,
    /// Region property name to record field name
    pub extra_fields: BTreeMap<String, String>,
    /// Keep soft-masked (lower-case) bases as returned
    pub keep_case: bool,
}

impl Default for UcscSource {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            track: String::new(),
            genome: None,
            start_field: "chromStart".to_string(),
            end_field: "chromEnd".to_string(),
            type_field: "name".to_string(),
            strand_field: "strand".to_string(),
            score_field: "score".to_string(),
            extra_fields: BTreeMap::new(),
            keep_case: false,
        }
    }
}

impl UcscSource {
    pub fn new(track: impl Into<String>) -> Self {
        Self {
            track: track.into(),
            ..Default::default()
        }
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = server.into();
        self
    }

    pub fn with_genome(mut self, genome: impl Into<String>) -> Self {
        self.genome = Some(genome.into());
        self
    }

    pub fn with_extra_field(mut self, property: impl Into<String>, field: impl Into<String>) -> Self {
        self.extra_fields.insert(property.into(), field.into());
        self
    }

    pub fn with_keep_case(mut self, keep_case: bool) -> Self {
        self.keep_case = keep_case;
        self
    }

    /// URL for `segment` of `data_type` on `genome`
    #[cfg(feature = "api-backend")]
    pub fn build_url(
        &self,
        data_type: DataType,
        genome: &str,
        segment: &DataSegment,
    ) -> Result<String, SourceError> {
        let server = self.server.trim_end_matches('/');
        let genome = urlencoding::encode(genome);
        let chrom = urlencoding::encode(&segment.chromosome);
        let start = segment.start - 1;
        let end = segment.end;
        if data_type != DataType::Sequence && self.track.trim().is_empty() {
            return Err(SourceError::Configuration(
                "UCSC source has no track name".to_string(),
            ));
        }
        let track = urlencoding::encode(self.track.trim());
        Ok(match data_type {
            DataType::Sequence => format!(
                "{server}/getData/sequence?genome={genome};chrom={chrom};start={start};end={end}"
            ),
            DataType::Region => format!(
                "{server}/getData/track?genome={genome};track={track};chrom={chrom};start={start};end={end}"
            ),
            DataType::Numeric => format!(
                "{server}/getData/track?genome={genome};track={track};chrom={chrom};start={start};end={end};jsonOutputArrays=1"
            ),
        })
    }

    fn region_from_record(
        &self,
        record: &Map<String, Value>,
        segment_start: i64,
    ) -> Result<Region, SourceError> {
        let start = integer_field(record, &self.start_field)?;
        let end = integer_field(record, &self.end_field)?;
        let region_type = record
            .get(&self.type_field)
            .filter(|v| !v.is_null())
            .map(json_text);
        let (Some(start), Some(end), Some(region_type)) = (start, end, region_type) else {
            return Err(SourceError::DataContract(format!(
                "UCSC record lacks '{}', '{}' or '{}'",
                self.start_field, self.end_field, self.type_field
            )));
        };

        let score = record
            .get(&self.score_field)
            .and_then(|v| match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .unwrap_or(0.0);
        let orientation = record
            .get(&self.strand_field)
            .map(|v| Orientation::from_token(&json_text(v)))
            .unwrap_or_default();

        let mut region = Region::new(start + 1 - segment_start, end - segment_start, region_type)
            .with_score(score)
            .with_orientation(orientation);
        for (property, field) in &self.extra_fields {
            if let Some(value) = record.get(field)
                && !value.is_null()
            {
                region.set_property(property.clone(), field_value(value));
            }
        }
        Ok(region)
    }

    /// Parse a track response into regions relative to `segment_start`
    pub fn parse_region_response<R: Read>(
        &self,
        input: R,
        segment_start: i64,
        task: &dyn LoadTask,
        check_interval: usize,
    ) -> Result<Vec<Region>, SourceError> {
        let mut regions = Vec::new();
        let mut state = StreamState::new(task, check_interval);
        let found = run_stream(
            input,
            &self.track,
            Sink::Regions {
                mapping: self,
                regions: &mut regions,
                segment_start,
            },
            &mut state,
        )?;
        if !found {
            tracing::debug!("UCSC response has no '{}' records", self.track);
        }
        task.report_progress(state.processed);
        Ok(regions)
    }
}

fn json_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn field_value(value: &Value) -> FieldValue {
    match value {
        Value::Null => FieldValue::Null,
        Value::Bool(b) => FieldValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => FieldValue::Integer(i),
            None => FieldValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => FieldValue::Text(s.clone()),
        other => FieldValue::Text(other.to_string()),
    }
}

fn integer_field(record: &Map<String, Value>, name: &str) -> Result<Option<i64>, SourceError> {
    match record.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_i64().map(Some).ok_or_else(|| {
            SourceError::DataContract(format!("UCSC field '{}' is not an integer: {}", name, n))
        }),
        Some(Value::String(s)) => s.trim().parse::<i64>().map(Some).map_err(|_| {
            SourceError::DataContract(format!("UCSC field '{}' is not an integer: {}", name, s))
        }),
        Some(other) => Err(SourceError::DataContract(format!(
            "UCSC field '{}' is not an integer: {}",
            name, other
        ))),
    }
}

/// Fill `values[start - genomic_start ..= end - genomic_start]` with `value`.
///
/// `start` and `end` are inclusive and in the same coordinate system as
/// `genomic_start`, the position of `values[0]`. Ranges outside the window fail.
pub fn broadcast_value(
    values: &mut [f64],
    genomic_start: i64,
    start: i64,
    end: i64,
    value: f64,
) -> Result<(), String> {
    let length = values.len() as i64;
    if start > end || start < genomic_start || end >= genomic_start + length {
        return Err(format!(
            "Value for {}-{} lies outside the requested window {}-{}",
            start,
            end,
            genomic_start,
            genomic_start + length - 1
        ));
    }
    let from = (start - genomic_start) as usize;
    let to = (end - genomic_start) as usize;
    values[from..=to].fill(value);
    Ok(())
}

/// Progress, cancellation and the first failure of one streamed response
struct StreamState<'t> {
    task: &'t dyn LoadTask,
    check_interval: u64,
    processed: u64,
    outcome: Option<SourceError>,
}

impl<'t> StreamState<'t> {
    fn new(task: &'t dyn LoadTask, check_interval: usize) -> Self {
        Self {
            task,
            check_interval: check_interval.max(1) as u64,
            processed: 0,
            outcome: None,
        }
    }

    fn record<E: de::Error>(&mut self) -> Result<(), E> {
        self.processed += 1;
        if self.processed % self.check_interval == 0 {
            self.task.report_progress(self.processed);
            if self.task.is_cancelled() {
                tracing::info!("UCSC stream cancelled after {} records", self.processed);
                return Err(self.fail(SourceError::Interrupted));
            }
        }
        Ok(())
    }

    /// Keep `err` as the outcome and abort deserialization
    fn fail<E: de::Error>(&mut self, err: SourceError) -> E {
        let message = err.to_string();
        self.outcome = Some(err);
        E::custom(message)
    }
}

/// Where the visited data field goes
enum Sink<'s> {
    Sequence(&'s mut Option<String>),
    Numeric {
        values: &'s mut [f64],
        genomic_start: i64,
    },
    Regions {
        mapping: &'s UcscSource,
        regions: &'s mut Vec<Region>,
        segment_start: i64,
    },
}

/// Top-level response object; yields whether the data field was present
struct ResponseSeed<'s, 't> {
    target: &'s str,
    sink: Sink<'s>,
    state: &'s mut StreamState<'t>,
}

impl<'de> DeserializeSeed<'de> for ResponseSeed<'_, '_> {
    type Value = bool;

    fn deserialize<D>(self, deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for ResponseSeed<'_, '_> {
    type Value = bool;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a UCSC API response object")
    }

    fn visit_map<A>(mut self, mut map: A) -> Result<bool, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut found = false;
        while let Some(key) = map.next_key::<String>()? {
            if key == "error" {
                let message: Value = map.next_value()?;
                return Err(self.state.fail(SourceError::Transport(format!(
                    "UCSC server error: {}",
                    json_text(&message)
                ))));
            }
            if key != self.target || found {
                map.next_value::<IgnoredAny>()?;
                continue;
            }
            found = true;
            match &mut self.sink {
                Sink::Sequence(slot) => **slot = Some(map.next_value::<String>()?),
                Sink::Numeric {
                    values,
                    genomic_start,
                } => map.next_value_seed(TripleSeed {
                    values: &mut **values,
                    genomic_start: *genomic_start,
                    state: &mut *self.state,
                })?,
                Sink::Regions {
                    mapping,
                    regions,
                    segment_start,
                } => map.next_value_seed(RecordSeed {
                    mapping: *mapping,
                    regions: &mut **regions,
                    segment_start: *segment_start,
                    state: &mut *self.state,
                })?,
            }
        }
        Ok(found)
    }
}

/// `[[start, end, value], ...]` with 0-based half-open ranges
struct TripleSeed<'s, 't> {
    values: &'s mut [f64],
    genomic_start: i64,
    state: &'s mut StreamState<'t>,
}

impl<'de> DeserializeSeed<'de> for TripleSeed<'_, '_> {
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> Result<(), D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for TripleSeed<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array of [start, end, value] triples")
    }

    fn visit_seq<A>(mut self, mut seq: A) -> Result<(), A::Error>
    where
        A: SeqAccess<'de>,
    {
        while let Some((start, end, value)) = seq.next_element::<(i64, i64, f64)>()? {
            // Zero-width triples cover the single position at `start`
            let end = if end == start { start + 1 } else { end };
            if let Err(reason) =
                broadcast_value(&mut *self.values, self.genomic_start, start + 1, end, value)
            {
                return Err(self.state.fail(SourceError::DataContract(reason)));
            }
            self.state.record::<A::Error>()?;
        }
        Ok(())
    }
}

/// `[{...}, ...]` region records
struct RecordSeed<'s, 't> {
    mapping: &'s UcscSource,
    regions: &'s mut Vec<Region>,
    segment_start: i64,
    state: &'s mut StreamState<'t>,
}

impl<'de> DeserializeSeed<'de> for RecordSeed<'_, '_> {
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> Result<(), D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for RecordSeed<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array of region records")
    }

    fn visit_seq<A>(mut self, mut seq: A) -> Result<(), A::Error>
    where
        A: SeqAccess<'de>,
    {
        while let Some(record) = seq.next_element::<Map<String, Value>>()? {
            match self.mapping.region_from_record(&record, self.segment_start) {
                Ok(region) => self.regions.push(region),
                Err(err) => return Err(self.state.fail(err)),
            }
            self.state.record::<A::Error>()?;
        }
        Ok(())
    }
}

fn run_stream<R: Read>(
    input: R,
    target: &str,
    sink: Sink<'_>,
    state: &mut StreamState<'_>,
) -> Result<bool, SourceError> {
    let mut deserializer = serde_json::Deserializer::from_reader(input);
    let seed = ResponseSeed {
        target,
        sink,
        state: &mut *state,
    };
    let found = match seed.deserialize(&mut deserializer) {
        Ok(found) => found,
        Err(e) => {
            return Err(state.outcome.take().unwrap_or_else(|| {
                SourceError::Transport(format!("Malformed UCSC response: {}", e))
            }));
        }
    };
    deserializer
        .end()
        .map_err(|e| SourceError::Transport(format!("Malformed UCSC response: {}", e)))?;
    Ok(found)
}

/// Parse a sequence response, checking it covers `expected_length` bases
pub fn parse_sequence_response<R: Read>(
    input: R,
    expected_length: usize,
    keep_case: bool,
    task: &dyn LoadTask,
) -> Result<String, SourceError> {
    let mut dna = None;
    let mut state = StreamState::new(task, 1);
    run_stream(input, "dna", Sink::Sequence(&mut dna), &mut state)?;
    let Some(dna) = dna else {
        return Err(SourceError::DataContract(
            "UCSC response has no 'dna' field".to_string(),
        ));
    };
    let dna = if keep_case {
        dna
    } else {
        dna.to_ascii_uppercase()
    };
    if dna.len() != expected_length {
        return Err(SourceError::DataContract(format!(
            "UCSC returned {} bases, {} requested",
            dna.len(),
            expected_length
        )));
    }
    Ok(dna)
}

/// Parse a numeric track response (array output) for `chromosome`.
///
/// Positions without a triple stay 0.
pub fn parse_numeric_response<R: Read>(
    input: R,
    chromosome: &str,
    segment_start: i64,
    length: usize,
    task: &dyn LoadTask,
    check_interval: usize,
) -> Result<Vec<f64>, SourceError> {
    let mut values = vec![0.0; length];
    let mut state = StreamState::new(task, check_interval);
    let found = run_stream(
        input,
        chromosome,
        Sink::Numeric {
            values: &mut values,
            genomic_start: segment_start,
        },
        &mut state,
    )?;
    if !found {
        tracing::debug!("UCSC response has no values for {}", chromosome);
    }
    task.report_progress(state.processed);
    Ok(values)
}

impl SegmentLoader for UcscSource {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    fn supported_data(&self) -> &'static [DataType] {
        SUPPORTED
    }

    fn use_cache(&self) -> bool {
        true
    }

    #[cfg(feature = "api-backend")]
    fn server_address(&self) -> Option<String> {
        super::http::host_of(&self.server)
    }

    #[cfg(not(feature = "api-backend"))]
    fn server_address(&self) -> Option<String> {
        None
    }

    #[cfg(feature = "api-backend")]
    fn set_server_address(&mut self, address: &str) -> Result<(), SourceError> {
        self.server = super::http::replace_host(&self.server, address)?;
        Ok(())
    }

    #[cfg(not(feature = "api-backend"))]
    fn set_server_address(&mut self, _address: &str) -> Result<(), SourceError> {
        Err(SourceError::Configuration(
            "UCSC sources require the 'api-backend' feature".to_string(),
        ))
    }

    #[cfg(feature = "api-backend")]
    fn load(
        &self,
        source: &DataSource,
        segment: &mut DataSegment,
        ctx: &LoadContext<'_>,
    ) -> Result<(), SourceError> {
        let genome = self
            .genome
            .as_deref()
            .filter(|g| !g.is_empty())
            .unwrap_or(&source.genome_build);
        let url = self.build_url(source.data_type, genome, segment)?;
        if let Some(server) = self.server_address() {
            ctx.throttle(&server, source.delay_ms);
        }
        let response = super::http::open_stream(&url, ctx.settings)?;
        let input = std::io::BufReader::new(response);
        let interval = ctx.settings.cancel_check_interval;

        let payload = match source.data_type {
            DataType::Sequence => SegmentData::Sequence(parse_sequence_response(
                input,
                segment.length(),
                self.keep_case,
                ctx.task,
            )?),
            DataType::Numeric => SegmentData::Numeric(parse_numeric_response(
                input,
                &segment.chromosome,
                segment.start,
                segment.length(),
                ctx.task,
                interval,
            )?),
            DataType::Region => SegmentData::Regions(self.parse_region_response(
                input,
                segment.start,
                ctx.task,
                interval,
            )?),
        };
        segment
            .set_payload(payload)
            .map_err(SourceError::DataContract)
    }

    #[cfg(not(feature = "api-backend"))]
    fn load(
        &self,
        _source: &DataSource,
        _segment: &mut DataSegment,
        _ctx: &LoadContext<'_>,
    ) -> Result<(), SourceError> {
        Err(SourceError::Configuration(
            "UCSC sources require the 'api-backend' feature".to_string(),
        ))
    }
}
