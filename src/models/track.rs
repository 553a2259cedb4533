//! Data tracks and the track registry
//!
//! A [`DataTrack`] owns an ordered list of [`DataSource`]s. Order is preference:
//! for a given organism and genome build the first matching source is tried first
//! and later ones serve as mirrors.

use super::{DataSegment, DataType};
use crate::source::{DataSource, LoadContext, SourceError};
use std::collections::{BTreeMap, BTreeSet};

/// Error type for track operations
#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    #[error("Track '{track}' holds {expected} data but the source provides {found}")]
    DataTypeMismatch {
        track: String,
        expected: DataType,
        found: DataType,
    },
    #[error("{protocol} sources cannot provide {data_type} data")]
    UnsupportedDataType {
        protocol: String,
        data_type: DataType,
    },
    #[error("Track '{track}' has no source for organism {organism}, build {build}")]
    NoSource {
        track: String,
        organism: i32,
        build: String,
    },
    #[error("Unknown track: {0}")]
    UnknownTrack(String),
    #[error("Source index {index} out of range (track has {len} sources)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("All {attempts} sources of track '{track}' failed; last error: {last}")]
    AllSourcesFailed {
        track: String,
        attempts: usize,
        last: Box<SourceError>,
    },
    #[error(transparent)]
    Load(#[from] SourceError),
}

impl TrackError {
    /// Whether the load stopped because the task was cancelled
    pub fn is_interrupted(&self) -> bool {
        matches!(self, TrackError::Load(e) if e.is_interrupted())
    }

    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            TrackError::AllSourcesFailed { track, last, .. } => format!(
                "Could not load track '{}'.\n\n{}",
                track,
                last.user_message()
            ),
            TrackError::Load(e) => e.user_message(),
            _ => self.to_string(),
        }
    }
}

/// A named track of one data type with its ordered sources
#[derive(Debug, Clone, PartialEq)]
pub struct DataTrack {
    pub name: String,
    pub data_type: DataType,
    pub description: String,
    /// Label of the site the data originates from
    pub source_site: String,
    pub display_directives: Option<String>,
    sources: Vec<DataSource>,
}

impl DataTrack {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            description: String::new(),
            source_site: String::new(),
            display_directives: None,
            sources: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_source_site(mut self, site: impl Into<String>) -> Self {
        self.source_site = site.into();
        self
    }

    pub fn with_display_directives(mut self, directives: impl Into<String>) -> Self {
        self.display_directives = Some(directives.into());
        self
    }

    pub fn sources(&self) -> &[DataSource] {
        &self.sources
    }

    /// Adopt `source` into this track after checking its data type
    fn adopt(&self, mut source: DataSource) -> Result<DataSource, TrackError> {
        if source.data_type != self.data_type {
            return Err(TrackError::DataTypeMismatch {
                track: self.name.clone(),
                expected: self.data_type,
                found: source.data_type,
            });
        }
        if !source.supports(self.data_type) {
            return Err(TrackError::UnsupportedDataType {
                protocol: source.protocol_name().to_string(),
                data_type: self.data_type,
            });
        }
        source.track_name = self.name.clone();
        Ok(source)
    }

    /// Append `source`, dropping any equal source already present
    pub fn add_source(&mut self, source: DataSource) -> Result<(), TrackError> {
        let source = self.adopt(source)?;
        self.sources.retain(|s| *s != source);
        self.sources.push(source);
        Ok(())
    }

    /// Insert `source` ahead of every other source for its organism and build
    pub fn add_preferred_source(&mut self, source: DataSource) -> Result<(), TrackError> {
        let source = self.adopt(source)?;
        self.sources.retain(|s| *s != source);
        let index = self
            .sources
            .iter()
            .position(|s| s.serves(source.organism, &source.genome_build))
            .unwrap_or(self.sources.len());
        self.sources.insert(index, source);
        Ok(())
    }

    /// Replace the first source equal to `old` with `new`. Returns false when `old`
    /// is not part of this track.
    pub fn replace_source(&mut self, old: &DataSource, new: DataSource) -> Result<bool, TrackError> {
        let new = self.adopt(new)?;
        let Some(index) = self.sources.iter().position(|s| s == old) else {
            return Ok(false);
        };
        self.sources[index] = new.clone();
        let mut seen = false;
        self.sources.retain(|s| {
            if *s != new {
                return true;
            }
            !std::mem::replace(&mut seen, true)
        });
        Ok(true)
    }

    /// Replace all sources, keeping the first of any equal sources
    pub fn replace_sources(&mut self, sources: Vec<DataSource>) -> Result<(), TrackError> {
        let mut adopted: Vec<DataSource> = Vec::with_capacity(sources.len());
        for source in sources {
            let source = self.adopt(source)?;
            if !adopted.contains(&source) {
                adopted.push(source);
            }
        }
        self.sources = adopted;
        Ok(())
    }

    /// Remove every source equal to `source`
    pub fn remove_source(&mut self, source: &DataSource) -> bool {
        let before = self.sources.len();
        self.sources.retain(|s| s != source);
        self.sources.len() != before
    }

    /// Move the source at `from` to position `to`
    pub fn move_source(&mut self, from: usize, to: usize) -> Result<(), TrackError> {
        let len = self.sources.len();
        for index in [from, to] {
            if index >= len {
                return Err(TrackError::IndexOutOfRange { index, len });
            }
        }
        let source = self.sources.remove(from);
        self.sources.insert(to, source);
        Ok(())
    }

    /// Sources for `organism` and `genome_build`, in preference order
    pub fn sources_for(&self, organism: i32, genome_build: &str) -> Vec<&DataSource> {
        self.sources
            .iter()
            .filter(|s| s.serves(organism, genome_build))
            .collect()
    }

    pub fn sources_for_organism(&self, organism: i32) -> Vec<&DataSource> {
        self.sources
            .iter()
            .filter(|s| s.organism == organism)
            .collect()
    }

    /// Organisms with at least one source, ascending
    pub fn organisms(&self) -> Vec<i32> {
        self.sources
            .iter()
            .map(|s| s.organism)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Genome builds available for `organism`, sorted
    pub fn genome_builds(&self, organism: i32) -> Vec<String> {
        self.sources
            .iter()
            .filter(|s| s.organism == organism)
            .map(|s| s.genome_build.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn is_supported(&self, organism: i32, genome_build: &str) -> bool {
        self.sources.iter().any(|s| s.serves(organism, genome_build))
    }

    /// Append the sources of `other` this track does not have yet
    pub fn merge_from(&mut self, other: &DataTrack) -> Result<usize, TrackError> {
        let mut added = 0;
        for source in &other.sources {
            let source = self.adopt(source.clone())?;
            if !self.sources.contains(&source) {
                self.sources.push(source);
                added += 1;
            }
        }
        Ok(added)
    }

    /// Fill `segment` from the first source for `organism`/`genome_build` that
    /// succeeds, falling back to mirrors on recoverable failures.
    pub fn load_segment(
        &self,
        organism: i32,
        genome_build: &str,
        segment: &mut DataSegment,
        ctx: &LoadContext<'_>,
    ) -> Result<(), TrackError> {
        let candidates = self.sources_for(organism, genome_build);
        if candidates.is_empty() {
            return Err(TrackError::NoSource {
                track: self.name.clone(),
                organism,
                build: genome_build.to_string(),
            });
        }

        let mut last = None;
        for (attempt, source) in candidates.iter().enumerate() {
            match source.load_data_segment(segment, ctx) {
                Ok(()) => {
                    if attempt > 0 {
                        tracing::info!(
                            "Loaded {} for track '{}' from mirror #{} ({})",
                            segment.location(),
                            self.name,
                            attempt + 1,
                            source.protocol_name()
                        );
                    }
                    return Ok(());
                }
                Err(e) if e.is_interrupted() => {
                    tracing::info!("Loading track '{}' was cancelled", self.name);
                    return Err(TrackError::Load(e));
                }
                Err(e) if !e.is_recoverable() => return Err(TrackError::Load(e)),
                Err(e) => {
                    tracing::warn!(
                        "Source #{} ({}) of track '{}' failed: {}",
                        attempt + 1,
                        source.protocol_name(),
                        self.name,
                        e
                    );
                    segment.take_payload();
                    last = Some(e);
                }
            }
        }

        let attempts = candidates.len();
        let last = last.unwrap_or_else(|| SourceError::Transport("no source attempted".to_string()));
        tracing::error!(
            "All {} sources of track '{}' failed for {}",
            attempts,
            self.name,
            segment.location()
        );
        Err(TrackError::AllSourcesFailed {
            track: self.name.clone(),
            attempts,
            last: Box::new(last),
        })
    }
}

/// Tracks keyed by name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackRegistry {
    tracks: BTreeMap<String, DataTrack>,
}

impl TrackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a track, returning the track it replaces
    pub fn add_track(&mut self, track: DataTrack) -> Option<DataTrack> {
        self.tracks.insert(track.name.clone(), track)
    }

    pub fn get(&self, name: &str) -> Option<&DataTrack> {
        self.tracks.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut DataTrack> {
        self.tracks.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<DataTrack> {
        self.tracks.remove(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tracks.keys().map(String::as_str).collect()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &DataTrack> {
        self.tracks.values()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Merge re-imported tracks: new tracks are added, existing ones gain the
    /// sources they lack
    pub fn merge(&mut self, tracks: Vec<DataTrack>) -> Result<(), TrackError> {
        for track in tracks {
            match self.tracks.get_mut(&track.name) {
                Some(existing) => {
                    existing.merge_from(&track)?;
                }
                None => {
                    self.add_track(track);
                }
            }
        }
        Ok(())
    }

    pub fn load_segment(
        &self,
        track: &str,
        organism: i32,
        genome_build: &str,
        segment: &mut DataSegment,
        ctx: &LoadContext<'_>,
    ) -> Result<(), TrackError> {
        self.get(track)
            .ok_or_else(|| TrackError::UnknownTrack(track.to_string()))?
            .load_segment(organism, genome_build, segment, ctx)
    }
}

impl FromIterator<DataTrack> for TrackRegistry {
    fn from_iter<I: IntoIterator<Item = DataTrack>>(iter: I) -> Self {
        let mut registry = TrackRegistry::new();
        for track in iter {
            registry.add_track(track);
        }
        registry
    }
}
