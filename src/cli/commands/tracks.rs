//! List and protocols command implementations

use crate::output;
use anyhow::Context;
use genomic_data_sdk::config::read_tracks_file;
use genomic_data_sdk::source::{protocol_kind, protocol_names};
use std::path::Path;

/// Handle the list command
pub fn handle_list(config: &Path) -> anyhow::Result<()> {
    let tracks = read_tracks_file(config)
        .with_context(|| format!("Failed to read track configuration {}", config.display()))?;
    if tracks.is_empty() {
        println!("No tracks configured");
        return Ok(());
    }
    for track in &tracks {
        print!("{}", output::format_track(track));
    }
    Ok(())
}

/// Handle the protocols command
pub fn handle_protocols() {
    for name in protocol_names() {
        let Some(kind) = protocol_kind(name) else {
            continue;
        };
        let supported: Vec<&str> = kind.supported.iter().map(|t| t.as_str()).collect();
        println!(
            "{:<6} {} [{}]",
            kind.name,
            kind.description,
            supported.join(", ")
        );
    }
}
