//! Loader tests against local servers, databases and file layouts

mod common;

use genomic_data_sdk::source::file::FileSource;
use genomic_data_sdk::{
    DataFormat, DataLoader, DataSegment, DataSource, DataTrack, DataType, FormatError, LoadTask,
    SegmentData, SourceError, SourceProtocol, TaskHandle, TrackError,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Reads `chromosome<TAB>position<TAB>value` rows from a whole file
struct PositionalFormat;

impl DataFormat for PositionalFormat {
    fn name(&self) -> &str {
        "positional"
    }

    fn parse_input(
        &self,
        input: &Path,
        segment: &mut DataSegment,
        _settings: &BTreeMap<String, String>,
        _task: &dyn LoadTask,
    ) -> Result<(), FormatError> {
        let text = fs::read_to_string(input)?;
        let mut values = vec![0.0; segment.length()];
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let parts: Vec<&str> = line.split('\t').collect();
            let [chromosome, position, value] = parts[..] else {
                return Err(FormatError::Parse(format!("Bad row '{}'", line)));
            };
            if chromosome != segment.chromosome {
                continue;
            }
            let position: i64 = position
                .parse()
                .map_err(|_| FormatError::Parse(format!("Bad position '{}'", position)))?;
            if position < segment.start || position > segment.end {
                continue;
            }
            values[(position - segment.start) as usize] = value
                .parse()
                .map_err(|_| FormatError::Parse(format!("Bad value '{}'", value)))?;
        }
        segment
            .set_payload(SegmentData::Numeric(values))
            .map_err(FormatError::Parse)
    }
}

mod file_tests {
    use super::*;

    fn signal(position: u64) -> f64 {
        position as f64 / 2.0
    }

    #[test]
    fn test_segmented_and_whole_file_layouts_agree() {
        let dir = TempDir::new().unwrap();

        // Segmented layout: chunks of 10 positions, one value per line
        let chunks = dir.path().join("segmented");
        fs::create_dir_all(chunks.join("chr1")).unwrap();
        for chunk_start in [0u64, 10, 20] {
            let lines: Vec<String> = (chunk_start..chunk_start + 10)
                .map(|p| signal(p + 1).to_string())
                .collect();
            fs::write(
                chunks.join("chr1").join(chunk_start.to_string()),
                lines.join("\n"),
            )
            .unwrap();
        }

        // Whole file read through a format codec
        let whole = dir.path().join("signal.tsv");
        let rows: Vec<String> = (1..=30u64)
            .map(|p| format!("chr1\t{}\t{}", p, signal(p)))
            .collect();
        fs::write(&whole, rows.join("\n")).unwrap();

        let segmented = DataSource::new(
            DataType::Numeric,
            9606,
            "hg38",
            SourceProtocol::File(FileSource::new(&chunks).with_segment_size(10)),
        );
        let direct = DataSource::new(
            DataType::Numeric,
            9606,
            "hg38",
            SourceProtocol::File(FileSource::new(&whole)),
        )
        .with_data_format("positional");

        let mut loader = DataLoader::default();
        loader.formats_mut().register(Arc::new(PositionalFormat));
        let task = TaskHandle::new();
        let ctx = loader.context(&task);

        let mut from_chunks = DataSegment::new("chr1", 5, 22).unwrap();
        segmented.load_data_segment(&mut from_chunks, &ctx).unwrap();
        let mut from_file = DataSegment::new("chr1", 5, 22).unwrap();
        direct.load_data_segment(&mut from_file, &ctx).unwrap();

        assert_eq!(from_chunks.numeric(), from_file.numeric());
        let values = from_chunks.numeric().unwrap();
        assert_eq!(values.len(), 18);
        assert_eq!(values[0], 2.5);
        assert_eq!(values[17], 11.0);
    }

    #[test]
    fn test_unknown_format_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("signal.bw");
        fs::write(&path, "").unwrap();
        let source = DataSource::new(
            DataType::Numeric,
            9606,
            "hg38",
            SourceProtocol::File(FileSource::new(&path)),
        )
        .with_data_format("bigwig");

        let loader = DataLoader::default();
        let task = TaskHandle::new();
        let mut segment = DataSegment::new("chr1", 1, 10).unwrap();
        let err = source
            .load_data_segment(&mut segment, &loader.context(&task))
            .unwrap_err();
        assert!(matches!(err, SourceError::Format(FormatError::UnknownFormat(_))));
    }

    #[test]
    fn test_max_span_splits_regions_without_duplicates() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("chr1")).unwrap();
        // 0-based coordinates; the second region straddles position 10
        fs::write(
            dir.path().join("chr1/0"),
            "2\t4\texon\t1\t+\n8\t14\trepeat\t0\t-\n",
        )
        .unwrap();
        fs::write(dir.path().join("chr1/100"), "").unwrap();

        let source = DataSource::new(
            DataType::Region,
            9606,
            "hg38",
            SourceProtocol::File(FileSource::new(dir.path()).with_segment_size(100)),
        )
        .with_max_span(10);

        let loader = DataLoader::default();
        let task = TaskHandle::new();
        let mut segment = DataSegment::new("chr1", 1, 20).unwrap();
        source
            .load_data_segment(&mut segment, &loader.context(&task))
            .unwrap();
        let regions = segment.regions().unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!((regions[0].relative_start, regions[0].relative_end), (2, 4));
        assert_eq!(regions[1].region_type, "repeat");
        assert_eq!((regions[1].relative_start, regions[1].relative_end), (8, 14));
    }
}

#[cfg(feature = "api-backend")]
mod das_tests {
    use super::common::{Reply, TestServer};
    use super::*;
    use genomic_data_sdk::source::das::DasSource;

    const DNA: &str = r#"<?xml version="1.0" standalone="no"?>
<!DOCTYPE DASDNA SYSTEM "http://www.biodas.org/dtd/dasdna.dtd">
<DASDNA><SEQUENCE id="chr1" start="1" stop="10" version="1.0">
<DNA length="10">
acgtac
gtac
</DNA></SEQUENCE></DASDNA>"#;

    fn das_source(base_url: String) -> DataSource {
        DataSource::new(
            DataType::Sequence,
            9606,
            "hg38",
            SourceProtocol::Das(DasSource::new(base_url)),
        )
    }

    #[test]
    fn test_dna_follows_redirect() {
        let server = TestServer::start(|target| {
            if target.starts_with("/das/hg38/") {
                Reply::redirect(target.replacen("/das/", "/moved/", 1))
            } else if target.starts_with("/moved/hg38/dna?segment=chr1:1,10") {
                Reply::ok(DNA)
            } else {
                Reply::status(404)
            }
        });

        let loader = DataLoader::default();
        let task = TaskHandle::new();
        let mut segment = DataSegment::new("chr1", 1, 10).unwrap();
        das_source(server.url("/das/hg38"))
            .load_data_segment(&mut segment, &loader.context(&task))
            .unwrap();
        assert_eq!(segment.sequence(), Some("ACGTACGTAC"));
        assert_eq!(server.hits(), 2);
    }

    #[test]
    fn test_length_mismatch_is_contract_violation() {
        let server = TestServer::start(|_| Reply::ok(DNA));
        let loader = DataLoader::default();
        let task = TaskHandle::new();
        let mut segment = DataSegment::new("chr1", 1, 12).unwrap();
        let err = das_source(server.url("/das/hg38"))
            .load_data_segment(&mut segment, &loader.context(&task))
            .unwrap_err();
        assert!(err.is_data_contract());
        assert!(!segment.has_payload());
    }

    #[test]
    fn test_mirror_fallback_after_server_error() {
        let broken = TestServer::start(|_| Reply::status(503));
        let mirror = TestServer::start(|_| Reply::ok(DNA));

        let mut track = DataTrack::new("dna", DataType::Sequence);
        track.add_source(das_source(broken.url("/das/hg38"))).unwrap();
        track.add_source(das_source(mirror.url("/das/hg38"))).unwrap();

        let loader = DataLoader::default();
        let task = TaskHandle::new();
        let mut segment = DataSegment::new("chr1", 1, 10).unwrap();
        track
            .load_segment(9606, "hg38", &mut segment, &loader.context(&task))
            .unwrap();
        assert_eq!(segment.sequence(), Some("ACGTACGTAC"));
        assert_eq!(broken.hits(), 1);
        assert_eq!(mirror.hits(), 1);
    }

    #[test]
    fn test_every_mirror_failing_reports_last_error() {
        let first = TestServer::start(|_| Reply::status(503));
        let second = TestServer::start(|_| Reply::status(404));

        let mut track = DataTrack::new("dna", DataType::Sequence);
        track.add_source(das_source(first.url("/das/hg38"))).unwrap();
        track.add_source(das_source(second.url("/das/hg38"))).unwrap();

        let loader = DataLoader::default();
        let task = TaskHandle::new();
        let mut segment = DataSegment::new("chr1", 1, 10).unwrap();
        match track.load_segment(9606, "hg38", &mut segment, &loader.context(&task)) {
            Err(TrackError::AllSourcesFailed { attempts, last, .. }) => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, SourceError::HttpStatus { status: 404, .. }));
            }
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_cancelled_task_issues_no_request() {
        let server = TestServer::start(|_| Reply::ok(DNA));
        let mut track = DataTrack::new("dna", DataType::Sequence);
        track.add_source(das_source(server.url("/das/hg38"))).unwrap();

        let loader = DataLoader::default();
        let task = TaskHandle::new();
        task.cancel();
        let mut segment = DataSegment::new("chr1", 1, 10).unwrap();
        let err = track
            .load_segment(9606, "hg38", &mut segment, &loader.context(&task))
            .unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(server.hits(), 0);
    }

    #[test]
    fn test_mirrored_source_targets_new_server() {
        let server = TestServer::start(|_| Reply::ok(DNA));
        let source = das_source("http://das.invalid/das/hg38".to_string());
        let mirror = source.mirrored(&server.address).unwrap();
        assert_eq!(mirror.server_address(), Some(server.address.clone()));

        let loader = DataLoader::default();
        let task = TaskHandle::new();
        let mut segment = DataSegment::new("chr1", 1, 10).unwrap();
        mirror
            .load_data_segment(&mut segment, &loader.context(&task))
            .unwrap();
        assert_eq!(server.requests()[0], "/das/hg38/dna?segment=chr1:1,10");
    }
}

#[cfg(feature = "api-backend")]
mod ucsc_tests {
    use super::common::{Reply, TestServer};
    use super::*;
    use genomic_data_sdk::config::LoaderSettings;
    use genomic_data_sdk::source::ucsc::UcscSource;

    const REFERENCE: &str = "GATCACAGGTCTATCACCCTATTAACCACT";

    /// Value of `name` in a `;`-separated query string
    fn query_value(target: &str, name: &str) -> Option<i64> {
        let query = target.split_once('?')?.1;
        query
            .split(';')
            .find_map(|pair| pair.strip_prefix(&format!("{}=", name)))
            .and_then(|v| v.parse().ok())
    }

    #[test]
    fn test_numeric_track_over_http() {
        let server = TestServer::start(|_| {
            Reply::ok(r#"{"track":"phyloP","chr1":[[0,5,1.5],[5,10,2.5]],"itemsReturned":2}"#)
        });
        let source = DataSource::new(
            DataType::Numeric,
            9606,
            "hg38",
            SourceProtocol::Ucsc(UcscSource::new("phyloP").with_server(server.url(""))),
        );

        let loader = DataLoader::default();
        let task = TaskHandle::new();
        let mut segment = DataSegment::new("chr1", 1, 12).unwrap();
        source
            .load_data_segment(&mut segment, &loader.context(&task))
            .unwrap();
        let values = segment.numeric().unwrap();
        assert_eq!(&values[..5], &[1.5; 5]);
        assert_eq!(&values[5..10], &[2.5; 5]);
        assert_eq!(&values[10..], &[0.0, 0.0]);

        let request = &server.requests()[0];
        assert!(request.starts_with("/getData/track?genome=hg38;track=phyloP;chrom=chr1"));
        assert!(request.contains("start=0;end=12"));
        assert!(request.contains("jsonOutputArrays=1"));
    }

    #[test]
    fn test_sequence_split_by_max_span() {
        let server = TestServer::start(|target| {
            let (Some(start), Some(end)) = (query_value(target, "start"), query_value(target, "end"))
            else {
                return Reply::status(404);
            };
            let dna = &REFERENCE[start as usize..end as usize];
            Reply::ok(format!(r#"{{"genome":"hg38","chrom":"chrM","dna":"{}"}}"#, dna))
        });
        let source = DataSource::new(
            DataType::Sequence,
            9606,
            "hg38",
            SourceProtocol::Ucsc(
                UcscSource::new("")
                    .with_server(server.url(""))
                    .with_genome("hg38"),
            ),
        )
        .with_max_span(8)
        .with_delay(5);

        let loader = DataLoader::new(LoaderSettings::default().with_timeout(5));
        let task = TaskHandle::new();
        let mut segment = DataSegment::new("chrM", 3, 22).unwrap();
        source
            .load_data_segment(&mut segment, &loader.context(&task))
            .unwrap();
        assert_eq!(segment.sequence(), Some(&REFERENCE[2..22]));
        assert_eq!(server.hits(), 3);
    }

    #[test]
    fn test_server_error_message_is_transport_error() {
        let server = TestServer::start(|_| {
            Reply::ok(r#"{"error":"can not find track nope","statusCode":400}"#)
        });
        let source = DataSource::new(
            DataType::Region,
            9606,
            "hg38",
            SourceProtocol::Ucsc(UcscSource::new("nope").with_server(server.url(""))),
        );
        let loader = DataLoader::default();
        let task = TaskHandle::new();
        let mut segment = DataSegment::new("chr1", 1, 100).unwrap();
        let err = source
            .load_data_segment(&mut segment, &loader.context(&task))
            .unwrap_err();
        assert!(matches!(&err, SourceError::Transport(msg) if msg.contains("can not find track")));
        assert!(err.is_recoverable());
    }
}

#[cfg(feature = "duckdb-backend")]
mod sql_tests {
    use super::*;
    use genomic_data_sdk::source::sql::{SqlDriver, SqlSource};
    use genomic_data_sdk::{FieldSpec, FieldTransform, FieldValue, Orientation, ValueType};

    fn create_database(dir: &TempDir) -> String {
        let path = dir.path().join("genes.duckdb");
        let conn = duckdb::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE genes (chrom VARCHAR, txStart BIGINT, txEnd BIGINT, name VARCHAR, score DOUBLE, strand VARCHAR);
             INSERT INTO genes VALUES
               ('chr1', 100, 200, 'BRCA2', 5.0, '+'),
               ('chr1', 5000, 6000, 'TP53', 1.0, '-'),
               ('chr2', 100, 200, 'EGFR', 2.0, '+');",
        )
        .unwrap();
        drop(conn);
        path.display().to_string()
    }

    fn genes_source(database: String) -> DataSource {
        let sql = SqlSource::new(SqlDriver::DuckDb, database, "genes")
            .with_field(FieldSpec::from_source("chromosome", ValueType::Text, "chrom").unwrap())
            .with_field(
                FieldSpec::from_source("start", ValueType::Integer, "txStart")
                    .unwrap()
                    .with_transform(FieldTransform::Offset(1)),
            )
            .with_field(
                FieldSpec::from_source("end", ValueType::Integer, "txEnd")
                    .unwrap()
                    .with_transform(FieldTransform::Offset(1)),
            )
            .with_field(
                FieldSpec::explicit("type", ValueType::Text, FieldValue::Text("gene".into()))
                    .unwrap(),
            )
            .with_field(FieldSpec::from_source("name", ValueType::Text, "name").unwrap())
            .with_field(FieldSpec::from_source("score", ValueType::Real, "score").unwrap())
            .with_field(FieldSpec::from_source("strand", ValueType::Text, "strand").unwrap());
        DataSource::new(DataType::Region, 9606, "hg38", SourceProtocol::Sql(sql))
    }

    #[test]
    fn test_regions_from_duckdb() {
        let dir = TempDir::new().unwrap();
        let source = genes_source(create_database(&dir));

        let loader = DataLoader::default();
        let task = TaskHandle::new();
        let mut segment = DataSegment::new("chr1", 1, 1000).unwrap();
        source
            .load_data_segment(&mut segment, &loader.context(&task))
            .unwrap();

        let regions = segment.regions().unwrap();
        assert_eq!(regions.len(), 1);
        let gene = &regions[0];
        assert_eq!(segment.start + gene.relative_start, 101);
        assert_eq!(segment.start + gene.relative_end, 201);
        assert_eq!(gene.region_type, "gene");
        assert_eq!(gene.score, 5.0);
        assert_eq!(gene.orientation, Orientation::Direct);
        assert_eq!(
            gene.extra_properties.get("name"),
            Some(&FieldValue::Text("BRCA2".into()))
        );
    }

    #[test]
    fn test_date_column_is_read_as_text() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dated.duckdb");
        let conn = duckdb::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE genes (chrom VARCHAR, txStart BIGINT, txEnd BIGINT, added DATE);
             INSERT INTO genes VALUES ('chr1', 100, 200, DATE '2024-01-02');",
        )
        .unwrap();
        drop(conn);

        let sql = SqlSource::new(SqlDriver::DuckDb, path.display().to_string(), "genes")
            .with_field(FieldSpec::from_source("chromosome", ValueType::Text, "chrom").unwrap())
            .with_field(FieldSpec::from_source("start", ValueType::Integer, "txStart").unwrap())
            .with_field(FieldSpec::from_source("end", ValueType::Integer, "txEnd").unwrap())
            .with_field(
                FieldSpec::explicit("type", ValueType::Text, FieldValue::Text("gene".into()))
                    .unwrap(),
            )
            .with_field(FieldSpec::from_source("added", ValueType::Text, "added").unwrap());
        let source = DataSource::new(DataType::Region, 9606, "hg38", SourceProtocol::Sql(sql));

        let loader = DataLoader::default();
        let task = TaskHandle::new();
        let mut segment = DataSegment::new("chr1", 1, 1000).unwrap();
        source
            .load_data_segment(&mut segment, &loader.context(&task))
            .unwrap();

        let regions = segment.regions().unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(
            regions[0].extra_properties.get("added"),
            Some(&FieldValue::Text("2024-01-02".into()))
        );
    }

    #[test]
    fn test_missing_table_is_database_error() {
        let dir = TempDir::new().unwrap();
        let database = create_database(&dir);
        let mut source = genes_source(database);
        if let SourceProtocol::Sql(sql) = &mut source.protocol {
            sql.set_table("transcripts");
        }

        let loader = DataLoader::default();
        let task = TaskHandle::new();
        let mut segment = DataSegment::new("chr1", 1, 1000).unwrap();
        let err = source
            .load_data_segment(&mut segment, &loader.context(&task))
            .unwrap_err();
        assert!(matches!(err, SourceError::Database(_)));
    }
}
