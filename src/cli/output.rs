//! Output formatting for CLI

use genomic_data_sdk::source::SourceProtocol;
use genomic_data_sdk::{DataSegment, DataTrack, SegmentData};

const SEQUENCE_LINE_WIDTH: usize = 60;

/// Format a loaded segment as plain text
///
/// Sequences are printed FASTA-style, numeric values one position per line and
/// regions as tab-separated rows with absolute coordinates.
pub fn format_segment(segment: &DataSegment) -> String {
    let mut output = String::new();
    match segment.payload() {
        Some(SegmentData::Sequence(sequence)) => {
            output.push_str(&format!(">{}\n", segment.location()));
            for line in sequence.as_bytes().chunks(SEQUENCE_LINE_WIDTH) {
                output.push_str(&String::from_utf8_lossy(line));
                output.push('\n');
            }
        }
        Some(SegmentData::Numeric(values)) => {
            for (offset, value) in values.iter().enumerate() {
                output.push_str(&format!(
                    "{}\t{}\t{}\n",
                    segment.chromosome,
                    segment.start + offset as i64,
                    value
                ));
            }
        }
        Some(SegmentData::Regions(regions)) => {
            for region in regions {
                let extras: Vec<String> = region
                    .extra_properties
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect();
                output.push_str(&format!(
                    "{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
                    segment.chromosome,
                    segment.start + region.relative_start,
                    segment.start + region.relative_end,
                    region.region_type,
                    region.score,
                    region.orientation.as_char(),
                    extras.join(";")
                ));
            }
        }
        None => output.push_str("No data\n"),
    }
    output
}

/// Format a track and its sources for the list command
pub fn format_track(track: &DataTrack) -> String {
    let mut output = format!("{} ({})", track.name, track.data_type);
    if !track.description.is_empty() {
        output.push_str(&format!(" - {}", track.description));
    }
    output.push('\n');

    for organism in track.organisms() {
        for build in track.genome_builds(organism) {
            for (index, source) in track.sources_for(organism, &build).iter().enumerate() {
                let role = if index == 0 { "primary" } else { "mirror" };
                let target = match &source.protocol {
                    SourceProtocol::File(file) => file.path.display().to_string(),
                    SourceProtocol::Sql(sql) => format!("{}:{}", sql.database, sql.table()),
                    SourceProtocol::Das(das) => das.base_url.clone(),
                    SourceProtocol::Ucsc(ucsc) => format!("{} {}", ucsc.server, ucsc.track),
                };
                output.push_str(&format!(
                    "  {} {} {:<4} {:<7} {}\n",
                    organism,
                    build,
                    source.protocol_name(),
                    role,
                    target
                ));
            }
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use genomic_data_sdk::Region;

    #[test]
    fn test_format_regions_uses_absolute_coordinates() {
        let mut segment = DataSegment::new("chr2", 100, 199).unwrap();
        segment
            .set_payload(SegmentData::Regions(vec![Region::new(0, 9, "exon").with_score(5.0)]))
            .unwrap();
        assert_eq!(format_segment(&segment), "chr2\t100\t109\texon\t5\t.\t\n");
    }

    #[test]
    fn test_format_sequence_wraps_lines() {
        let mut segment = DataSegment::new("chr1", 1, 70).unwrap();
        segment
            .set_payload(SegmentData::Sequence("A".repeat(70)))
            .unwrap();
        let text = format_segment(&segment);
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        assert_eq!(lines, vec![">chr1:1-70".to_string(), "A".repeat(60), "A".repeat(10)]);
    }
}
