//! Fetch command implementation

use crate::output;
use anyhow::{Context, anyhow, bail};
use genomic_data_sdk::config::read_tracks_file;
use genomic_data_sdk::{DataLoader, DataSegment, LoaderSettings, TaskHandle, TrackRegistry};
use std::path::PathBuf;

pub struct FetchArgs {
    pub config: PathBuf,
    pub settings: Option<PathBuf>,
    pub track: String,
    pub organism: i32,
    pub build: String,
    pub location: String,
    pub json: bool,
}

/// Parse `chromosome:start-end`; thousands separators are ignored
fn parse_location(location: &str) -> anyhow::Result<DataSegment> {
    let Some((chromosome, range)) = location.rsplit_once(':') else {
        bail!("Invalid location '{}'. Expected chromosome:start-end", location);
    };
    let range = range.replace(',', "");
    let Some((start, end)) = range.split_once('-') else {
        bail!("Invalid range '{}'. Expected start-end", range);
    };
    let start: i64 = start
        .trim()
        .parse()
        .with_context(|| format!("Invalid start '{}'", start))?;
    let end: i64 = end
        .trim()
        .parse()
        .with_context(|| format!("Invalid end '{}'", end))?;
    DataSegment::new(chromosome, start, end).map_err(|e| anyhow!(e))
}

/// Handle the fetch command
pub fn handle_fetch(args: FetchArgs) -> anyhow::Result<()> {
    let mut segment = parse_location(&args.location)?;

    let settings = match &args.settings {
        Some(path) => LoaderSettings::from_toml_file(path)
            .with_context(|| format!("Failed to read settings {}", path.display()))?,
        None => LoaderSettings::default(),
    };
    let registry: TrackRegistry = read_tracks_file(&args.config)
        .with_context(|| format!("Failed to read track configuration {}", args.config.display()))?
        .into_iter()
        .collect();

    let loader = DataLoader::new(settings);
    let task = TaskHandle::new();
    registry
        .load_segment(
            &args.track,
            args.organism,
            &args.build,
            &mut segment,
            &loader.context(&task),
        )
        .map_err(|e| anyhow!(e.user_message()))?;

    let rendered = if args.json {
        serde_json::to_string_pretty(&segment)?
    } else {
        output::format_segment(&segment)
    };
    println!("{}", rendered);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_location() {
        let segment = parse_location("chr1:11,000-12,000").unwrap();
        assert_eq!(segment.chromosome, "chr1");
        assert_eq!(segment.start, 11_000);
        assert_eq!(segment.end, 12_000);
        assert!(parse_location("chr1").is_err());
        assert!(parse_location("chr1:200-100").is_err());
    }
}
