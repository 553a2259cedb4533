//! Persisted track configuration
//!
//! Tracks are stored as one `<DataTrack>` element per track with nested
//! `<DataSource>` elements, one per source, tagged by protocol:
//!
//! ```xml
//! <DataTracks>
//!   <DataTrack name="genes" type="Region" description="" source="UCSC">
//!     <DataSource type="SQL" organism="9606" build="hg38" maxspan="1000000">
//!       <Database>/data/genes.duckdb</Database>
//!       <Table>refGene</Table>
//!       <Fields>
//!         <Field property="start" type="Integer" DBfield="txStart" transform="offset:+1"/>
//!       </Fields>
//!     </DataSource>
//!   </DataTrack>
//! </DataTracks>
//! ```
//!
//! Configuration errors are reported while reading, never during a load.

use super::ConfigError;
use super::xml::{XmlElement, parse_document, write_document};
use crate::auth::{decrypt_credential, encrypt_credential};
use crate::models::{DataTrack, DataType, FieldSpec, FieldTransform, ValueType};
use crate::source::das::DasSource;
use crate::source::file::FileSource;
use crate::source::sql::{SqlDriver, SqlSource};
use crate::source::ucsc::UcscSource;
use crate::source::{DataSource, SourceProtocol, protocol_kind};
use std::path::Path;
use std::str::FromStr;

const ROOT: &str = "DataTracks";
const TRACK: &str = "DataTrack";
const SOURCE: &str = "DataSource";
const FORMAT_SETTING: &str = "FormatSetting";

/// Parse a required attribute with `FromStr`
fn required<T>(element: &XmlElement, name: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    element
        .parse_attribute::<T>(name)?
        .ok_or_else(|| ConfigError::MissingAttribute {
            element: element.name.clone(),
            attribute: name.to_string(),
        })
}

/// Parse an optional child element's text with `FromStr`
fn child_value<T>(element: &XmlElement, child: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    match element.child_text(child) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::invalid(format!("{}/{}", element.name, child), raw, e)),
        None => Ok(None),
    }
}

/// Read tracks from an XML document
pub fn read_tracks(text: &str) -> Result<Vec<DataTrack>, ConfigError> {
    let root = parse_document(text)?;
    if !root.name.eq_ignore_ascii_case(ROOT) {
        return Err(ConfigError::Xml(format!(
            "Expected <{}> root element, found <{}>",
            ROOT, root.name
        )));
    }
    let tracks = root
        .children_named(TRACK)
        .map(parse_track)
        .collect::<Result<Vec<_>, _>>()?;
    tracing::debug!("Read {} track definitions", tracks.len());
    Ok(tracks)
}

pub fn read_tracks_file(path: impl AsRef<Path>) -> Result<Vec<DataTrack>, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    read_tracks(&text).inspect_err(|e| {
        tracing::warn!("Failed to read track configuration {}: {}", path.display(), e)
    })
}

/// Serialize tracks into an XML document
pub fn write_tracks(tracks: &[DataTrack]) -> Result<String, ConfigError> {
    let mut root = XmlElement::new(ROOT);
    for track in tracks {
        root.push_child(track_element(track));
    }
    write_document(&root)
}

pub fn write_tracks_file(path: impl AsRef<Path>, tracks: &[DataTrack]) -> Result<(), ConfigError> {
    std::fs::write(path, write_tracks(tracks)?)?;
    Ok(())
}

fn parse_track(element: &XmlElement) -> Result<DataTrack, ConfigError> {
    let name = element.require_attribute("name")?.trim();
    if name.is_empty() {
        return Err(ConfigError::InvalidTrack(
            "Track name cannot be empty".to_string(),
        ));
    }
    let data_type: DataType = required(element, "type")?;

    let mut track = DataTrack::new(name, data_type);
    track.description = element.attribute("description").unwrap_or_default().to_string();
    track.source_site = element.attribute("source").unwrap_or_default().to_string();
    track.display_directives = element
        .attribute("display")
        .filter(|d| !d.trim().is_empty())
        .map(str::to_string);

    for child in element.children_named(SOURCE) {
        let source = parse_source(child, data_type)?;
        track
            .add_source(source)
            .map_err(|e| ConfigError::InvalidTrack(format!("{}: {}", name, e)))?;
    }
    Ok(track)
}

fn parse_source(element: &XmlElement, data_type: DataType) -> Result<DataSource, ConfigError> {
    let protocol_name = element.require_attribute("type")?;
    let kind = protocol_kind(protocol_name)
        .ok_or_else(|| ConfigError::UnknownProtocol(protocol_name.to_string()))?;
    let protocol = (kind.parse)(element)?;

    let organism: i32 = required(element, "organism")?;
    let build = element.require_attribute("build")?.trim();
    if build.is_empty() {
        return Err(ConfigError::invalid("DataSource@build", build, "cannot be empty"));
    }

    let mut source = DataSource::new(data_type, organism, build, protocol);
    if let Some(span) = element.parse_attribute::<usize>("maxspan")? {
        source.max_sequence_span = span;
    }
    if let Some(delay) = element.parse_attribute::<u64>("delay")? {
        source.delay_ms = delay;
    }
    source.data_format = element
        .attribute("dataformat")
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string);
    for setting in element.children_named(FORMAT_SETTING) {
        let name = setting.require_attribute("name")?;
        let value = setting.attribute("value").unwrap_or_default();
        source
            .format_settings
            .insert(name.to_string(), value.to_string());
    }
    Ok(source)
}

/// Parse the sub-tree of a `FILE` source
pub fn parse_file_protocol(element: &XmlElement) -> Result<SourceProtocol, ConfigError> {
    let path = element.require_child_text("Filepath")?;
    let segment_size = child_value::<u64>(element, "SegmentSize")?.unwrap_or(0);
    Ok(SourceProtocol::File(
        FileSource::new(path).with_segment_size(segment_size),
    ))
}

/// Parse the sub-tree of a `SQL` source, decrypting the stored password
pub fn parse_sql_protocol(element: &XmlElement) -> Result<SourceProtocol, ConfigError> {
    let driver = child_value::<SqlDriver>(element, "Driver")?.unwrap_or_default();
    let database = element.require_child_text("Database")?;
    let table = element.require_child_text("Table")?;

    let mut sql = SqlSource::new(driver, database, table).with_server(
        element.child_text("Server").unwrap_or_default(),
        child_value::<u16>(element, "Port")?,
    );
    sql.username = element
        .child_text("Username")
        .unwrap_or_default()
        .to_string();
    if let Some(password) = element.child("Password") {
        let text = password.text.trim();
        let encrypted = password
            .attribute("encrypted")
            .is_some_and(|flag| flag.trim().eq_ignore_ascii_case("true"));
        sql.password = if encrypted {
            decrypt_credential(text)
                .map_err(|e| ConfigError::invalid("SQL Password", "(encrypted)", e))?
        } else {
            text.to_string()
        };
    }

    let fields = match element.child("Fields") {
        Some(fields) => fields
            .children_named("Field")
            .map(parse_field)
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };
    sql.set_fields(fields);
    sql.validate()
        .map_err(|e| ConfigError::InvalidTrack(e.to_string()))?;
    Ok(SourceProtocol::Sql(sql))
}

fn parse_field(element: &XmlElement) -> Result<FieldSpec, ConfigError> {
    let property = element.require_attribute("property")?;
    let value_type: ValueType = required(element, "type")?;
    let literal = element.attribute("value").filter(|v| !v.is_empty());
    let spec = FieldSpec::from_parts(property, value_type, element.attribute("DBfield"), literal)
        .map_err(|e| ConfigError::InvalidTrack(e.to_string()))?;
    match element.parse_attribute::<FieldTransform>("transform")? {
        Some(transform) => Ok(spec.with_transform(transform)),
        None => Ok(spec),
    }
}

/// Parse the sub-tree of a `DAS` source
pub fn parse_das_protocol(element: &XmlElement) -> Result<SourceProtocol, ConfigError> {
    let mut das = DasSource::new(element.require_child_text("BaseURL")?);
    das.feature_type = element.child_text("FeatureType").map(str::to_string);
    Ok(SourceProtocol::Das(das))
}

/// Parse the sub-tree of a `UCSC` source
pub fn parse_ucsc_protocol(element: &XmlElement) -> Result<SourceProtocol, ConfigError> {
    let mut ucsc = UcscSource::new(element.child_text("Track").unwrap_or_default());
    if let Some(server) = element.child_text("Server") {
        ucsc.server = server.to_string();
    }
    ucsc.genome = element.child_text("Genome").map(str::to_string);
    for (child, target) in [
        ("StartField", &mut ucsc.start_field),
        ("EndField", &mut ucsc.end_field),
        ("TypeField", &mut ucsc.type_field),
        ("StrandField", &mut ucsc.strand_field),
        ("ScoreField", &mut ucsc.score_field),
    ] {
        if let Some(name) = element.child_text(child) {
            *target = name.to_string();
        }
    }
    if let Some(extra) = element.child("ExtraFields") {
        for field in extra.children_named("Field") {
            ucsc.extra_fields.insert(
                field.require_attribute("property")?.to_string(),
                field.require_attribute("name")?.to_string(),
            );
        }
    }
    ucsc.keep_case = child_value::<bool>(element, "KeepCase")?.unwrap_or(false);
    Ok(SourceProtocol::Ucsc(ucsc))
}

fn track_element(track: &DataTrack) -> XmlElement {
    let mut element = XmlElement::new(TRACK)
        .with_attribute("name", &track.name)
        .with_attribute("type", track.data_type)
        .with_attribute("description", &track.description)
        .with_attribute("source", &track.source_site);
    if let Some(display) = &track.display_directives {
        element.set_attribute("display", display);
    }
    for source in track.sources() {
        element.push_child(source_element(source));
    }
    element
}

fn source_element(source: &DataSource) -> XmlElement {
    let mut element = XmlElement::new(SOURCE)
        .with_attribute("type", source.protocol_name())
        .with_attribute("organism", source.organism)
        .with_attribute("build", &source.genome_build);
    if source.max_sequence_span > 0 {
        element.set_attribute("maxspan", source.max_sequence_span);
    }
    if source.delay_ms > 0 {
        element.set_attribute("delay", source.delay_ms);
    }
    if let Some(format) = &source.data_format {
        element.set_attribute("dataformat", format);
    }

    match &source.protocol {
        SourceProtocol::File(file) => write_file_protocol(file, &mut element),
        SourceProtocol::Sql(sql) => write_sql_protocol(sql, &mut element),
        SourceProtocol::Das(das) => write_das_protocol(das, &mut element),
        SourceProtocol::Ucsc(ucsc) => write_ucsc_protocol(ucsc, &mut element),
    }

    for (name, value) in &source.format_settings {
        element.push_child(
            XmlElement::new(FORMAT_SETTING)
                .with_attribute("name", name)
                .with_attribute("value", value),
        );
    }
    element
}

fn write_file_protocol(file: &FileSource, element: &mut XmlElement) {
    element.push_text_child("Filepath", file.path.display());
    if file.segment_size > 0 {
        element.push_text_child("SegmentSize", file.segment_size);
    }
}

fn write_sql_protocol(sql: &SqlSource, element: &mut XmlElement) {
    element.push_text_child("Driver", sql.driver);
    if !sql.server.is_empty() {
        element.push_text_child("Server", &sql.server);
    }
    if let Some(port) = sql.port {
        element.push_text_child("Port", port);
    }
    element.push_text_child("Database", &sql.database);
    element.push_text_child("Table", sql.table());
    if !sql.username.is_empty() {
        element.push_text_child("Username", &sql.username);
    }
    if !sql.password.is_empty() {
        element.push_child(
            XmlElement::new("Password")
                .with_attribute("encrypted", true)
                .with_text(encrypt_credential(&sql.password)),
        );
    }

    let mut fields = XmlElement::new("Fields");
    for spec in sql.fields() {
        let mut field = XmlElement::new("Field")
            .with_attribute("property", spec.property_name())
            .with_attribute("type", spec.value_type());
        if let Some(column) = spec.source_field() {
            field.set_attribute("DBfield", column);
        }
        if let Some(value) = spec.explicit_value() {
            field.set_attribute("value", value);
        }
        if let Some(transform) = spec.transform_as_string() {
            field.set_attribute("transform", transform);
        }
        fields.push_child(field);
    }
    element.push_child(fields);
}

fn write_das_protocol(das: &DasSource, element: &mut XmlElement) {
    element.push_text_child("BaseURL", &das.base_url);
    if let Some(feature_type) = &das.feature_type {
        element.push_text_child("FeatureType", feature_type);
    }
}

fn write_ucsc_protocol(ucsc: &UcscSource, element: &mut XmlElement) {
    element.push_text_child("Server", &ucsc.server);
    if !ucsc.track.is_empty() {
        element.push_text_child("Track", &ucsc.track);
    }
    if let Some(genome) = &ucsc.genome {
        element.push_text_child("Genome", genome);
    }
    element.push_text_child("StartField", &ucsc.start_field);
    element.push_text_child("EndField", &ucsc.end_field);
    element.push_text_child("TypeField", &ucsc.type_field);
    element.push_text_child("StrandField", &ucsc.strand_field);
    element.push_text_child("ScoreField", &ucsc.score_field);
    if !ucsc.extra_fields.is_empty() {
        let mut extra = XmlElement::new("ExtraFields");
        for (property, name) in &ucsc.extra_fields {
            extra.push_child(
                XmlElement::new("Field")
                    .with_attribute("property", property)
                    .with_attribute("name", name),
            );
        }
        element.push_child(extra);
    }
    if ucsc.keep_case {
        element.push_text_child("KeepCase", true);
    }
}
