//! DAS-style XML annotation source
//!
//! Sequence comes from `{base}/dna?segment=chr:start,stop`, features from
//! `{base}/features?segment=chr:start,stop[;type=...]`. Coordinates on the wire are
//! 1-based and inclusive, like [`DataSegment`].

use super::{DataSource, LoadContext, LoadTask, SegmentLoader, SourceError};
use crate::models::{DataSegment, DataType, FieldValue, Orientation, Region, SegmentData};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::io::{BufRead, Read};

pub const PROTOCOL: &str = "DAS";
pub const SUPPORTED: &[DataType] = &[DataType::Sequence, DataType::Region];

/// DOCTYPE declarations referencing DTDs that are no longer served
const OBSOLETE_DOCTYPES: &[&[u8]] = &[
    b"<!DOCTYPE DASDNA SYSTEM \"http://www.biodas.org/dtd/dasdna.dtd\">",
    b"<!DOCTYPE DASGFF SYSTEM \"http://www.biodas.org/dtd/dasgff.dtd\">",
];

/// DAS server endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DasSource {
    /// Data source URL, e.g. `http://host/das/hg19`
    pub base_url: String,
    /// Restrict features to one type
    pub feature_type: Option<String>,
}

impl DasSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            feature_type: None,
        }
    }

    pub fn with_feature_type(mut self, feature_type: impl Into<String>) -> Self {
        self.feature_type = Some(feature_type.into());
        self
    }

    #[cfg(feature = "api-backend")]
    fn segment_parameter(segment: &DataSegment) -> String {
        format!(
            "{}:{},{}",
            urlencoding::encode(&segment.chromosome),
            segment.start,
            segment.end
        )
    }

    #[cfg(feature = "api-backend")]
    pub fn dna_url(&self, segment: &DataSegment) -> String {
        format!(
            "{}/dna?segment={}",
            self.base_url.trim_end_matches('/'),
            Self::segment_parameter(segment)
        )
    }

    #[cfg(feature = "api-backend")]
    pub fn features_url(&self, segment: &DataSegment) -> String {
        let mut url = format!(
            "{}/features?segment={}",
            self.base_url.trim_end_matches('/'),
            Self::segment_parameter(segment)
        );
        if let Some(feature_type) = self.feature_type.as_deref().filter(|t| !t.is_empty()) {
            url.push_str(";type=");
            url.push_str(&urlencoding::encode(feature_type));
        }
        url
    }
}

/// Reader that drops obsolete DOCTYPE declarations and passes every other byte through
pub struct DoctypeFilter<R> {
    inner: R,
    line: Vec<u8>,
    pos: usize,
}

impl<R: BufRead> DoctypeFilter<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: Vec::new(),
            pos: 0,
        }
    }

    fn strip_doctypes(line: &mut Vec<u8>) {
        for doctype in OBSOLETE_DOCTYPES {
            while let Some(index) = line
                .windows(doctype.len())
                .position(|window| window == *doctype)
            {
                line.drain(index..index + doctype.len());
            }
        }
    }
}

impl<R: BufRead> Read for DoctypeFilter<R> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        while self.pos >= self.line.len() {
            self.line.clear();
            self.pos = 0;
            if self.inner.read_until(b'\n', &mut self.line)? == 0 {
                return Ok(0);
            }
            Self::strip_doctypes(&mut self.line);
        }
        let n = out.len().min(self.line.len() - self.pos);
        out[..n].copy_from_slice(&self.line[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn xml_error(err: impl std::fmt::Display) -> SourceError {
    SourceError::Transport(format!("Malformed DAS response: {}", err))
}

fn attribute(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|attr| {
            String::from_utf8_lossy(attr.key.local_name().as_ref()).eq_ignore_ascii_case(name)
        })
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.trim().to_string()))
}

fn parse_coordinate(raw: Option<String>, what: &str) -> Result<Option<i64>, SourceError> {
    match raw.filter(|v| !v.is_empty()) {
        Some(value) => value.parse::<i64>().map(Some).map_err(|_| {
            SourceError::DataContract(format!("Invalid {} '{}' in DAS response", what, value))
        }),
        None => Ok(None),
    }
}

/// Parse a DAS DNA document into an upper-case sequence without whitespace.
///
/// Text is taken from the `DNA` element, or from `SEQUENCE` when the document has
/// no `DNA` element. The result must match the declared length (`DNA@length`, else
/// `SEQUENCE@stop - SEQUENCE@start + 1`).
pub fn parse_dna_response<R: BufRead>(input: R) -> Result<String, SourceError> {
    let mut reader = Reader::from_reader(std::io::BufReader::new(DoctypeFilter::new(input)));
    let mut buf = Vec::new();

    let mut sequence_text = String::new();
    let mut dna_text = String::new();
    let mut in_sequence = false;
    let mut in_dna = false;
    let mut seen_sequence = false;
    let mut seen_dna = false;
    let mut span_length: Option<i64> = None;
    let mut declared_length: Option<i64> = None;

    loop {
        match reader.read_event_into(&mut buf).map_err(xml_error)? {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"SEQUENCE" if !seen_sequence => {
                    in_sequence = true;
                    seen_sequence = true;
                    let start = parse_coordinate(attribute(e, "start"), "start")?;
                    let stop = parse_coordinate(attribute(e, "stop"), "stop")?;
                    if let (Some(start), Some(stop)) = (start, stop) {
                        span_length = Some(stop - start + 1);
                    }
                }
                b"DNA" if in_sequence || !seen_dna => {
                    in_dna = true;
                    seen_dna = true;
                    declared_length = parse_coordinate(attribute(e, "length"), "length")?;
                }
                _ => {}
            },
            Event::Text(ref t) => {
                if in_dna || in_sequence {
                    let text = t.unescape().map_err(xml_error)?;
                    let target = if in_dna {
                        &mut dna_text
                    } else {
                        &mut sequence_text
                    };
                    target.extend(text.chars().map(|c| c.to_ascii_uppercase()));
                }
            }
            Event::End(ref e) => match e.local_name().as_ref() {
                b"DNA" => in_dna = false,
                b"SEQUENCE" => in_sequence = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !seen_sequence && !seen_dna {
        return Err(SourceError::DataContract(
            "DAS response contains no sequence".to_string(),
        ));
    }
    let raw = if seen_dna { dna_text } else { sequence_text };
    let sequence: String = raw.chars().filter(|c| !c.is_whitespace()).collect();

    if let Some(expected) = declared_length.or(span_length)
        && sequence.len() as i64 != expected
    {
        return Err(SourceError::DataContract(format!(
            "DAS sequence has {} bases but declares {}",
            sequence.len(),
            expected
        )));
    }
    Ok(sequence)
}

/// Fields collected for the feature currently being parsed
#[derive(Default)]
struct FeatureScratch {
    id: Option<String>,
    label: Option<String>,
    type_id: Option<String>,
    type_text: String,
    method: String,
    start: String,
    end: String,
    score: String,
    orientation: String,
    phase: String,
    note: String,
}

impl FeatureScratch {
    fn text_slot(&mut self, element: &[u8]) -> Option<&mut String> {
        match element {
            b"TYPE" => Some(&mut self.type_text),
            b"METHOD" => Some(&mut self.method),
            b"START" => Some(&mut self.start),
            b"END" => Some(&mut self.end),
            b"SCORE" => Some(&mut self.score),
            b"ORIENTATION" => Some(&mut self.orientation),
            b"PHASE" => Some(&mut self.phase),
            b"NOTE" => Some(&mut self.note),
            _ => None,
        }
    }

    fn into_region(self, segment_start: i64) -> Result<Region, SourceError> {
        let start = parse_coordinate(Some(self.start.trim().to_string()), "feature start")?;
        let end = parse_coordinate(Some(self.end.trim().to_string()), "feature end")?;
        let (Some(start), Some(end)) = (start, end) else {
            return Err(SourceError::DataContract(format!(
                "DAS feature {} has no START/END",
                self.id.as_deref().unwrap_or("<unnamed>")
            )));
        };

        let score = match self.score.trim() {
            "" | "-" => 0.0,
            raw => raw.parse::<f64>().map_err(|_| {
                SourceError::DataContract(format!("Invalid DAS feature score '{}'", raw))
            })?,
        };
        let orientation = match self.orientation.trim() {
            "+" => Orientation::Direct,
            "-" => Orientation::Reverse,
            _ => Orientation::Indeterminate,
        };
        let region_type = match self.type_text.trim() {
            "" => self.type_id.unwrap_or_else(|| "unknown".to_string()),
            text => text.to_string(),
        };

        let mut region = Region::new(start - segment_start, end - segment_start, region_type)
            .with_score(score)
            .with_orientation(orientation);
        let extras = [
            ("id", self.id.unwrap_or_default()),
            ("label", self.label.unwrap_or_default()),
            ("method", self.method.trim().to_string()),
            ("phase", self.phase.trim().to_string()),
            ("note", self.note.trim().to_string()),
        ];
        for (name, value) in extras {
            if !value.is_empty() && value != "-" {
                region.set_property(name, FieldValue::Text(value));
            }
        }
        Ok(region)
    }
}

/// Parse a DAS features document into regions relative to `segment_start`.
///
/// Cancellation is checked every `check_interval` features.
pub fn parse_feature_response<R: BufRead>(
    input: R,
    segment_start: i64,
    task: &dyn LoadTask,
    check_interval: usize,
) -> Result<Vec<Region>, SourceError> {
    let mut reader = Reader::from_reader(std::io::BufReader::new(DoctypeFilter::new(input)));
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut regions = Vec::new();
    let mut feature: Option<FeatureScratch> = None;
    let mut current_child: Option<Vec<u8>> = None;

    loop {
        match reader.read_event_into(&mut buf).map_err(xml_error)? {
            Event::Start(ref e) => {
                let name = e.local_name().as_ref().to_vec();
                if name == b"FEATURE" {
                    feature = Some(FeatureScratch {
                        id: attribute(e, "id"),
                        label: attribute(e, "label"),
                        ..Default::default()
                    });
                } else if let Some(scratch) = feature.as_mut() {
                    if name == b"TYPE" {
                        scratch.type_id = attribute(e, "id");
                    } else if name == b"METHOD"
                        && let Some(id) = attribute(e, "id")
                    {
                        scratch.method = id;
                    }
                    current_child = Some(name);
                }
            }
            Event::Empty(ref e) => {
                if let Some(scratch) = feature.as_mut()
                    && e.local_name().as_ref() == b"TYPE"
                {
                    scratch.type_id = attribute(e, "id");
                }
            }
            Event::Text(ref t) => {
                if let (Some(scratch), Some(child)) = (feature.as_mut(), current_child.as_deref())
                    && let Some(slot) = scratch.text_slot(child)
                {
                    if child == b"METHOD" {
                        slot.clear();
                    }
                    slot.push_str(&t.unescape().map_err(xml_error)?);
                }
            }
            Event::End(ref e) => {
                if e.local_name().as_ref() == b"FEATURE" {
                    if let Some(scratch) = feature.take() {
                        regions.push(scratch.into_region(segment_start)?);
                        if regions.len() % check_interval.max(1) == 0 && task.is_cancelled() {
                            tracing::info!("DAS feature parsing cancelled");
                            return Err(SourceError::Interrupted);
                        }
                    }
                } else {
                    current_child = None;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    task.report_progress(regions.len() as u64);
    Ok(regions)
}

impl SegmentLoader for DasSource {
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
        super::http::host_of(&self.base_url)
    }

    #[cfg(not(feature = "api-backend"))]
    fn server_address(&self) -> Option<String> {
        None
    }

    #[cfg(feature = "api-backend")]
    fn set_server_address(&mut self, address: &str) -> Result<(), SourceError> {
        self.base_url = super::http::replace_host(&self.base_url, address)?;
        Ok(())
    }

    #[cfg(not(feature = "api-backend"))]
    fn set_server_address(&mut self, _address: &str) -> Result<(), SourceError> {
        Err(SourceError::Configuration(
            "DAS sources require the 'api-backend' feature".to_string(),
        ))
    }

    #[cfg(feature = "api-backend")]
    fn load(
        &self,
        source: &DataSource,
        segment: &mut DataSegment,
        ctx: &LoadContext<'_>,
    ) -> Result<(), SourceError> {
        let url = match source.data_type {
            DataType::Sequence => self.dna_url(segment),
            DataType::Region => self.features_url(segment),
            DataType::Numeric => {
                return Err(SourceError::Configuration(
                    "DAS sources cannot provide numeric data".to_string(),
                ));
            }
        };
        if let Some(server) = self.server_address() {
            ctx.throttle(&server, source.delay_ms);
        }
        let response = super::http::open_stream(&url, ctx.settings)?;
        let input = std::io::BufReader::new(response);

        let payload = match source.data_type {
            DataType::Sequence => {
                let sequence = parse_dna_response(input)?;
                if sequence.len() != segment.length() {
                    return Err(SourceError::DataContract(format!(
                        "DAS server returned {} bases for {} ({} requested)",
                        sequence.len(),
                        segment.location(),
                        segment.length()
                    )));
                }
                SegmentData::Sequence(sequence)
            }
            _ => SegmentData::Regions(parse_feature_response(
                input,
                segment.start,
                ctx.task,
                ctx.settings.cancel_check_interval,
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
            "DAS sources require the 'api-backend' feature".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::TaskHandle;

    const DNA_DOC: &str = r#"<?xml version="1.0" standalone="no"?>
<!DOCTYPE DASDNA SYSTEM "http://www.biodas.org/dtd/dasdna.dtd">
<DASDNA>
  <SEQUENCE id="chr1" start="100" stop="109" version="1.0">
    <DNA length="10">
      acgta
      cgtac
    </DNA>
  </SEQUENCE>
</DASDNA>
"#;

    #[test]
    fn test_dna_is_uppercased_without_whitespace() {
        assert_eq!(parse_dna_response(DNA_DOC.as_bytes()).unwrap(), "ACGTACGTAC");
    }

    #[test]
    fn test_dna_length_mismatch_fails() {
        let doc = r#"<DASDNA><SEQUENCE id="chr1" start="100" stop="109"><DNA>acgtacgta</DNA></SEQUENCE></DASDNA>"#;
        assert!(matches!(
            parse_dna_response(doc.as_bytes()),
            Err(SourceError::DataContract(_))
        ));
    }

    #[test]
    fn test_dna_inline_in_sequence_element() {
        let doc = r#"<DASSEQUENCE><SEQUENCE id="2" start="1" stop="8">ggcc
aatt</SEQUENCE></DASSEQUENCE>"#;
        assert_eq!(parse_dna_response(doc.as_bytes()).unwrap(), "GGCCAATT");
    }

    #[test]
    fn test_doctype_filter_only_drops_declaration() {
        let input = "<?xml version=\"1.0\"?>\r\n<!DOCTYPE DASGFF SYSTEM \"http://www.biodas.org/dtd/dasgff.dtd\"><DASGFF>\n  <x a='1'/>\n</DASGFF>";
        let mut filtered = String::new();
        DoctypeFilter::new(input.as_bytes())
            .read_to_string(&mut filtered)
            .unwrap();
        assert_eq!(
            filtered,
            "<?xml version=\"1.0\"?>\r\n<DASGFF>\n  <x a='1'/>\n</DASGFF>"
        );
    }

    #[test]
    fn test_features_become_regions() {
        let doc = r#"<?xml version="1.0" standalone="yes"?>
<!DOCTYPE DASGFF SYSTEM "http://www.biodas.org/dtd/dasgff.dtd">
<DASGFF><GFF version="1.0"><SEGMENT id="1" start="1000" stop="2000">
  <FEATURE id="ENSE01" label="exon 1">
    <TYPE id="exon" category="transcription">exon</TYPE>
    <METHOD id="ensembl">Ensembl</METHOD>
    <START>1100</START><END>1200</END>
    <SCORE>-</SCORE><ORIENTATION>-</ORIENTATION><PHASE>0</PHASE>
    <NOTE>first &amp; only</NOTE>
  </FEATURE>
  <FEATURE id="rep1">
    <TYPE id="repeat"/>
    <START>1500</START><END>1550</END>
    <SCORE>12.5</SCORE><ORIENTATION>0</ORIENTATION>
  </FEATURE>
</SEGMENT></GFF></DASGFF>"#;
        let task = TaskHandle::new();
        let regions = parse_feature_response(doc.as_bytes(), 1000, &task, 1000).unwrap();
        assert_eq!(regions.len(), 2);

        let exon = &regions[0];
        assert_eq!((exon.relative_start, exon.relative_end), (100, 200));
        assert_eq!(exon.region_type, "exon");
        assert_eq!(exon.score, 0.0);
        assert_eq!(exon.orientation, Orientation::Reverse);
        assert_eq!(
            exon.extra_properties.get("method"),
            Some(&FieldValue::Text("Ensembl".into()))
        );
        assert_eq!(
            exon.extra_properties.get("note"),
            Some(&FieldValue::Text("first & only".into()))
        );

        let repeat = &regions[1];
        assert_eq!(repeat.region_type, "repeat");
        assert_eq!(repeat.score, 12.5);
        assert_eq!(repeat.orientation, Orientation::Indeterminate);
        assert_eq!(task.processed(), 2);
    }

    #[test]
    fn test_feature_without_coordinates_fails() {
        let doc = r#"<DASGFF><FEATURE id="x"><TYPE>exon</TYPE><START>5</START></FEATURE></DASGFF>"#;
        let task = TaskHandle::new();
        assert!(matches!(
            parse_feature_response(doc.as_bytes(), 1, &task, 10),
            Err(SourceError::DataContract(_))
        ));
    }

    #[test]
    fn test_feature_parsing_honours_cancellation() {
        let doc = r#"<DASGFF><FEATURE><TYPE>a</TYPE><START>1</START><END>2</END></FEATURE></DASGFF>"#;
        let task = TaskHandle::new();
        task.cancel();
        assert!(matches!(
            parse_feature_response(doc.as_bytes(), 1, &task, 1),
            Err(SourceError::Interrupted)
        ));
    }

    #[cfg(feature = "api-backend")]
    #[test]
    fn test_urls() {
        let source = DasSource::new("http://das.example.org/das/hg19/").with_feature_type("exon");
        let segment = DataSegment::new("chr1", 100, 200).unwrap();
        assert_eq!(
            source.dna_url(&segment),
            "http://das.example.org/das/hg19/dna?segment=chr1:100,200"
        );
        assert_eq!(
            source.features_url(&segment),
            "http://das.example.org/das/hg19/features?segment=chr1:100,200;type=exon"
        );
    }
}
