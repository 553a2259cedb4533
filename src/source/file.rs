//! Local file source
//!
//! A path is either one whole-genome file parsed by a format codec, or (when the
//! segment size is positive) a directory with one subdirectory per chromosome, each
//! holding chunk files named by their 0-based start offset:
//!
//! ```text
//! conservation/
//!   chr1/0
//!   chr1/100000
//!   chr1/200000
//!   chr2/0
//! ```
//!
//! Chunk contents depend on the data type:
//! - Sequence: FASTA-like text, header lines (`>`) ignored, any line width
//! - Numeric: one `value` or `value<TAB>count` per line (run-length encoded)
//! - Region: `start<TAB>end<TAB>type<TAB>score<TAB>strand[<TAB>key=value;...]`,
//!   0-based inclusive; a region is listed in every chunk it overlaps

use super::{DataSource, LoadContext, SegmentLoader, SourceError};
use crate::models::{DataSegment, DataType, FieldValue, Orientation, Region, SegmentData};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

pub const PROTOCOL: &str = "FILE";
pub const SUPPORTED: &[DataType] = &[DataType::Sequence, DataType::Numeric, DataType::Region];

/// Local file or segmented directory layout
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSource {
    pub path: PathBuf,
    /// Positions per chunk file; 0 means `path` is a single file
    pub segment_size: u64,
}

/// Window of one chunk file to read, in file-local 0-based coordinates
#[derive(Debug, Clone, Copy)]
struct ChunkWindow {
    index: u64,
    from: u64,
    to: u64,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            segment_size: 0,
        }
    }

    pub fn with_segment_size(mut self, segment_size: u64) -> Self {
        self.segment_size = segment_size;
        self
    }

    pub fn is_segmented(&self) -> bool {
        self.segment_size > 0
    }

    /// Path of chunk `index` of `chromosome`
    pub fn chunk_path(&self, chromosome: &str, index: u64) -> PathBuf {
        self.path
            .join(chromosome)
            .join((index * self.segment_size).to_string())
    }

    /// Chunk windows covering the 0-based inclusive range `start..=end`
    fn chunk_windows(&self, start: u64, end: u64) -> Vec<ChunkWindow> {
        let size = self.segment_size;
        let first = start / size;
        let last = end / size;
        (first..=last)
            .map(|index| ChunkWindow {
                index,
                from: if index == first { start - index * size } else { 0 },
                to: if index == last {
                    end - index * size
                } else {
                    size - 1
                },
            })
            .collect()
    }

    fn load_from_format(
        &self,
        source: &DataSource,
        segment: &mut DataSegment,
        ctx: &LoadContext<'_>,
    ) -> Result<(), SourceError> {
        let name = source.data_format.as_deref().ok_or_else(|| {
            SourceError::Configuration(format!(
                "FILE source {} has no segment size and no data format",
                self.path.display()
            ))
        })?;
        let format = ctx.formats.require(name)?;
        if !self.path.exists() {
            return Err(SourceError::MissingResource(self.path.clone()));
        }
        tracing::debug!("Parsing {} as {}", self.path.display(), format.name());
        format.parse_input(&self.path, segment, &source.format_settings, ctx.task)?;
        Ok(())
    }

    fn read_sequence(&self, chromosome: &str, start: u64, end: u64) -> Result<String, SourceError> {
        let expected = (end - start + 1) as usize;
        let mut sequence = String::with_capacity(expected);

        for window in self.chunk_windows(start, end) {
            let path = self.chunk_path(chromosome, window.index);
            let file = open_required(&path)?;
            tracing::debug!(
                "Reading sequence {}..={} from {}",
                window.from,
                window.to,
                path.display()
            );
            let before = sequence.len();
            let mut offset: u64 = 0;
            for (line_no, line) in BufReader::new(file).lines().enumerate() {
                let line = line?;
                let line = line.trim_end();
                if line.starts_with('>') || line.is_empty() {
                    continue;
                }
                // Offsets count bytes, one per base
                if !line.is_ascii() {
                    return Err(SourceError::DataContract(format!(
                        "Non-ASCII sequence data at {}:{}",
                        path.display(),
                        line_no + 1
                    )));
                }
                let line_start = offset;
                let line_end = offset + line.len() as u64;
                offset = line_end;
                if line_end <= window.from {
                    continue;
                }
                let skip = window.from.saturating_sub(line_start) as usize;
                let take = (window.to + 1).min(line_end) - (line_start + skip as u64);
                sequence.push_str(&line[skip..skip + take as usize]);
                if line_end > window.to {
                    break;
                }
            }
            let wanted = (window.to - window.from + 1) as usize;
            if sequence.len() - before != wanted {
                return Err(SourceError::DataContract(format!(
                    "{} holds {} of the {} positions requested",
                    path.display(),
                    sequence.len() - before,
                    wanted
                )));
            }
        }

        Ok(sequence)
    }

    fn read_numeric(&self, chromosome: &str, start: u64, end: u64) -> Result<Vec<f64>, SourceError> {
        let mut values = vec![0.0; (end - start + 1) as usize];

        for window in self.chunk_windows(start, end) {
            let path = self.chunk_path(chromosome, window.index);
            let file = match File::open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!("No numeric chunk {}, treating as zero", path.display());
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            tracing::debug!(
                "Reading values {}..={} from {}",
                window.from,
                window.to,
                path.display()
            );

            let chunk_start = window.index * self.segment_size;
            let mut position: u64 = 0;
            for (line_no, line) in BufReader::new(file).lines().enumerate() {
                let line = line?;
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let (value, count) = parse_run(line).ok_or_else(|| {
                    SourceError::DataContract(format!(
                        "Invalid numeric entry '{}' at {}:{}",
                        line,
                        path.display(),
                        line_no + 1
                    ))
                })?;
                let run_end = position.checked_add(count).ok_or_else(|| {
                    SourceError::DataContract(format!(
                        "Run length {} overflows at {}:{}",
                        count,
                        path.display(),
                        line_no + 1
                    ))
                })?;
                let from = position.max(window.from);
                let to = run_end.min(window.to + 1);
                for local in from..to {
                    values[(chunk_start + local - start) as usize] = value;
                }
                position = run_end;
                if position > window.to {
                    break;
                }
            }
        }

        Ok(values)
    }

    fn read_regions(&self, chromosome: &str, start: u64, end: u64) -> Result<Vec<Region>, SourceError> {
        let windows = self.chunk_windows(start, end);
        let first = windows.first().map(|w| w.index).unwrap_or_default();
        let mut regions = Vec::new();

        for window in windows {
            let path = self.chunk_path(chromosome, window.index);
            let file = open_required(&path)?;
            let chunk_start = (window.index * self.segment_size) as i64;
            tracing::debug!("Reading regions from {}", path.display());

            for (line_no, line) in BufReader::new(file).lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() || line.starts_with('#') {
                    continue;
                }
                let row = parse_region_row(&line).map_err(|reason| {
                    SourceError::DataContract(format!(
                        "{} at {}:{}",
                        reason,
                        path.display(),
                        line_no + 1
                    ))
                })?;
                // Already emitted from the previous chunk
                if window.index > first && row.start < chunk_start {
                    continue;
                }
                if row.end < start as i64 || row.start > end as i64 {
                    continue;
                }
                let mut region = Region::new(
                    row.start - start as i64,
                    row.end - start as i64,
                    row.region_type,
                )
                .with_score(row.score)
                .with_orientation(row.orientation);
                region.extra_properties = row.extra;
                regions.push(region);
            }
        }

        Ok(regions)
    }
}

fn open_required(path: &Path) -> Result<File, SourceError> {
    File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => SourceError::MissingResource(path.to_path_buf()),
        _ => SourceError::Io(e),
    })
}

/// `value` or `value<TAB>count`
fn parse_run(line: &str) -> Option<(f64, u64)> {
    let mut parts = line.split('\t');
    let value = parts.next()?.trim().parse::<f64>().ok()?;
    let count = match parts.next() {
        Some(count) => count.trim().parse::<u64>().ok()?,
        None => 1,
    };
    Some((value, count))
}

struct RegionRow {
    start: i64,
    end: i64,
    region_type: String,
    score: f64,
    orientation: Orientation,
    extra: std::collections::BTreeMap<String, FieldValue>,
}

fn parse_region_row(line: &str) -> Result<RegionRow, String> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 5 {
        return Err(format!(
            "Region row has {} columns, expected at least 5",
            fields.len()
        ));
    }
    let start = fields[0]
        .trim()
        .parse::<i64>()
        .map_err(|_| format!("Invalid region start '{}'", fields[0]))?;
    let end = fields[1]
        .trim()
        .parse::<i64>()
        .map_err(|_| format!("Invalid region end '{}'", fields[1]))?;
    let score = match fields[3].trim() {
        "" | "-" | "." => 0.0,
        raw => raw
            .parse::<f64>()
            .map_err(|_| format!("Invalid region score '{}'", raw))?,
    };

    let mut extra = std::collections::BTreeMap::new();
    if let Some(properties) = fields.get(5) {
        for pair in properties.split(';') {
            if let Some((key, value)) = pair.split_once('=')
                && !key.trim().is_empty()
            {
                extra.insert(
                    key.trim().to_string(),
                    FieldValue::Text(value.trim().to_string()),
                );
            }
        }
    }

    Ok(RegionRow {
        start,
        end,
        region_type: fields[2].trim().to_string(),
        score,
        orientation: Orientation::from_token(fields[4]),
        extra,
    })
}

impl SegmentLoader for FileSource {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    fn supported_data(&self) -> &'static [DataType] {
        SUPPORTED
    }

    fn use_cache(&self) -> bool {
        false
    }

    fn server_address(&self) -> Option<String> {
        None
    }

    fn set_server_address(&mut self, _address: &str) -> Result<(), SourceError> {
        Err(SourceError::Configuration(
            "FILE sources have no server address".to_string(),
        ))
    }

    fn load(
        &self,
        source: &DataSource,
        segment: &mut DataSegment,
        ctx: &LoadContext<'_>,
    ) -> Result<(), SourceError> {
        let direct_only = source
            .data_format
            .as_deref()
            .and_then(|name| ctx.formats.get(name))
            .is_some_and(|format| format.can_only_parse_directly_from_local_file());
        if !self.is_segmented() || direct_only {
            return self.load_from_format(source, segment, ctx);
        }

        // On-disk chunks are 0-based
        let start = (segment.start - 1) as u64;
        let end = (segment.end - 1) as u64;
        let chromosome = segment.chromosome.clone();

        let payload = match source.data_type {
            DataType::Sequence => {
                SegmentData::Sequence(self.read_sequence(&chromosome, start, end)?)
            }
            DataType::Numeric => SegmentData::Numeric(self.read_numeric(&chromosome, start, end)?),
            DataType::Region => SegmentData::Regions(self.read_regions(&chromosome, start, end)?),
        };
        segment
            .set_payload(payload)
            .map_err(SourceError::DataContract)
    }
}
