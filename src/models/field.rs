//! Field specifications
//!
//! A [`FieldSpec`] maps one semantic region attribute (start, end, chromosome,
//! strand, score, type, ...) onto a field of an external source, or pins it to an
//! explicit value. Values read through a spec pass through its [`FieldTransform`].

use super::{FieldValue, Orientation, ValueType};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const PROPERTY_CHROMOSOME: &str = "chromosome";
pub const PROPERTY_START: &str = "start";
pub const PROPERTY_END: &str = "end";
pub const PROPERTY_TYPE: &str = "type";
pub const PROPERTY_SCORE: &str = "score";
pub const PROPERTY_STRAND: &str = "strand";
pub const PROPERTY_ORIENTATION: &str = "orientation";

/// Errors raised by field specifications. These are configuration errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FieldSpecError {
    #[error("Field '{0}' needs either a source field name or an explicit value")]
    MissingSource(String),
    #[error("Field '{property}' expects an integer value, got '{value}'")]
    NotInteger { property: String, value: String },
    #[error("Field '{0}' is bound to a source field and cannot hold an explicit value")]
    InconsistentExplicitValue(String),
    #[error("Invalid explicit value for '{property}': {reason}")]
    InvalidExplicitValue { property: String, reason: String },
}

/// Direction in which a key/value map is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapDirection {
    /// Property space to source space (building queries)
    ToSource,
    /// Source space to property space (reading results)
    FromSource,
}

/// Transform applied to a value read through a field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum FieldTransform {
    #[default]
    None,
    /// Integer offset added to start/end coordinates
    Offset(i64),
    /// Prefix chromosome names with "chr"
    ChrPrefix(bool),
    /// Ordered (property value, source value) pairs
    KeyValueMap(Vec<(String, String)>),
}

impl FieldTransform {
    /// Parse a serialized `key=value,key=value` list.
    ///
    /// Malformed pairs map to themselves (key=key) instead of failing the parse.
    pub fn parse_map(text: &str) -> Self {
        let mut pairs = Vec::new();
        for token in text.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let parts: Vec<&str> = token.split('=').collect();
            match parts.as_slice() {
                [key, value] if !key.trim().is_empty() && !value.trim().is_empty() => {
                    pairs.push((key.trim().to_string(), value.trim().to_string()));
                }
                _ => {
                    tracing::warn!("Malformed key=value pair '{}', mapping it to itself", token);
                    pairs.push((token.to_string(), token.to_string()));
                }
            }
        }
        FieldTransform::KeyValueMap(pairs)
    }

    /// Render a key/value map back into its serialized form.
    ///
    /// Identity pairs are written as the bare key, which parses back to the same pair.
    pub fn map_to_string(&self) -> Option<String> {
        match self {
            FieldTransform::KeyValueMap(pairs) => Some(
                pairs
                    .iter()
                    .map(|(k, v)| if k == v { k.clone() } else { format!("{}={}", k, v) })
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            _ => None,
        }
    }

    fn remap(&self, value: &str, direction: MapDirection) -> Option<String> {
        let FieldTransform::KeyValueMap(pairs) = self else {
            return None;
        };
        pairs
            .iter()
            .find(|(key, mapped)| match direction {
                MapDirection::ToSource => key == value,
                MapDirection::FromSource => mapped == value,
            })
            .map(|(key, mapped)| match direction {
                MapDirection::ToSource => mapped.clone(),
                MapDirection::FromSource => key.clone(),
            })
    }
}

impl fmt::Display for FieldTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldTransform::None => Ok(()),
            FieldTransform::Offset(n) => write!(f, "offset:{:+}", n),
            FieldTransform::ChrPrefix(b) => write!(f, "chrprefix:{}", b),
            FieldTransform::KeyValueMap(_) => {
                write!(f, "map:{}", self.map_to_string().unwrap_or_default())
            }
        }
    }
}

impl std::str::FromStr for FieldTransform {
    type Err = String;

    /// Parse `offset:+1`, `chrprefix:true` or `map:a=b,c=d`; empty text is no transform
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(FieldTransform::None);
        }
        let Some((kind, value)) = s.split_once(':') else {
            return Err(format!(
                "Invalid transform '{}'. Expected offset:N, chrprefix:BOOL or map:K=V,...",
                s
            ));
        };
        match kind.trim().to_lowercase().as_str() {
            "offset" => value
                .trim()
                .trim_start_matches('+')
                .parse::<i64>()
                .map(FieldTransform::Offset)
                .map_err(|_| format!("Invalid offset '{}'", value)),
            "chrprefix" => match value.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(FieldTransform::ChrPrefix(true)),
                "false" | "no" | "0" => Ok(FieldTransform::ChrPrefix(false)),
                _ => Err(format!("Invalid chrprefix flag '{}'", value)),
            },
            "map" => Ok(FieldTransform::parse_map(value)),
            other => Err(format!("Unknown transform kind '{}'", other)),
        }
    }
}

/// How one region property maps onto a field of an external source.
///
/// Exactly one of `source_field` and `explicit_value` is set.
///
/// # Example
///
/// ```rust
/// use genomic_data_sdk::models::{FieldSpec, FieldTransform, FieldValue, ValueType};
/// use genomic_data_sdk::models::field::MapDirection;
///
/// let start = FieldSpec::from_source("start", ValueType::Integer, "txStart")
///     .unwrap()
///     .with_transform(FieldTransform::Offset(1));
/// let value = start
///     .transformed_value(&FieldValue::Integer(100), MapDirection::FromSource)
///     .unwrap();
/// assert_eq!(value, FieldValue::Integer(101));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    property_name: String,
    value_type: ValueType,
    source_field: Option<String>,
    explicit_value: Option<FieldValue>,
    transform: FieldTransform,
}

impl FieldSpec {
    /// Spec reading `property` from the source field `field_name`
    pub fn from_source(
        property: impl Into<String>,
        value_type: ValueType,
        field_name: impl Into<String>,
    ) -> Result<Self, FieldSpecError> {
        let property = property.into();
        let field_name = field_name.into();
        if field_name.trim().is_empty() {
            return Err(FieldSpecError::MissingSource(property));
        }
        Ok(Self {
            property_name: property,
            value_type,
            source_field: Some(field_name),
            explicit_value: None,
            transform: FieldTransform::None,
        })
    }

    /// Spec that always yields `value` for `property`
    pub fn explicit(
        property: impl Into<String>,
        value_type: ValueType,
        value: FieldValue,
    ) -> Result<Self, FieldSpecError> {
        let property = property.into();
        if value.is_null() {
            return Err(FieldSpecError::MissingSource(property));
        }
        Ok(Self {
            property_name: property,
            value_type,
            source_field: None,
            explicit_value: Some(value),
            transform: FieldTransform::None,
        })
    }

    /// Build from persisted attributes. Exactly one of a non-empty field name and an
    /// explicit literal (parsed according to `value_type`) must be given.
    pub fn from_parts(
        property: impl Into<String>,
        value_type: ValueType,
        field_name: Option<&str>,
        explicit_literal: Option<&str>,
    ) -> Result<Self, FieldSpecError> {
        let property = property.into();
        match (field_name.filter(|f| !f.trim().is_empty()), explicit_literal) {
            (Some(field), None) => Self::from_source(property, value_type, field),
            (None, Some(literal)) => {
                let value = value_type.parse_value(literal).map_err(|reason| {
                    FieldSpecError::InvalidExplicitValue {
                        property: property.clone(),
                        reason,
                    }
                })?;
                Self::explicit(property, value_type, value)
            }
            (Some(_), Some(_)) => Err(FieldSpecError::InconsistentExplicitValue(property)),
            (None, None) => Err(FieldSpecError::MissingSource(property)),
        }
    }

    pub fn with_transform(mut self, transform: FieldTransform) -> Self {
        self.transform = transform;
        self
    }

    pub fn property_name(&self) -> &str {
        &self.property_name
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Source field name, `None` when the spec carries an explicit value
    pub fn source_field(&self) -> Option<&str> {
        self.source_field.as_deref().filter(|f| !f.is_empty())
    }

    pub fn explicit_value(&self) -> Option<&FieldValue> {
        self.explicit_value.as_ref()
    }

    pub fn has_explicit_value(&self) -> bool {
        self.source_field().is_none()
    }

    pub fn transform(&self) -> &FieldTransform {
        &self.transform
    }

    pub fn set_transform(&mut self, transform: FieldTransform) {
        self.transform = transform;
    }

    /// Transform in its persisted attribute form, `None` when there is no transform
    pub fn transform_as_string(&self) -> Option<String> {
        match self.transform {
            FieldTransform::None => None,
            _ => Some(self.transform.to_string()),
        }
    }

    /// Replace the explicit value of an explicit-valued spec
    pub fn set_explicit_value(&mut self, value: FieldValue) -> Result<(), FieldSpecError> {
        if !self.has_explicit_value() {
            return Err(FieldSpecError::InconsistentExplicitValue(
                self.property_name.clone(),
            ));
        }
        if value.is_null() {
            return Err(FieldSpecError::MissingSource(self.property_name.clone()));
        }
        self.explicit_value = Some(value);
        Ok(())
    }

    fn is_coordinate(&self) -> bool {
        self.property_name.eq_ignore_ascii_case(PROPERTY_START)
            || self.property_name.eq_ignore_ascii_case(PROPERTY_END)
    }

    fn is_strand(&self) -> bool {
        self.property_name.eq_ignore_ascii_case(PROPERTY_STRAND)
            || self.property_name.eq_ignore_ascii_case(PROPERTY_ORIENTATION)
    }

    fn is_chromosome(&self) -> bool {
        self.property_name.eq_ignore_ascii_case(PROPERTY_CHROMOSOME)
    }

    /// Apply this spec's transform to `original`.
    ///
    /// Start/end must be integers; strand tokens are classified into
    /// `DIRECT`/`REVERSE`/`INDETERMINATE`; key/value maps are applied in `direction`.
    pub fn transformed_value(
        &self,
        original: &FieldValue,
        direction: MapDirection,
    ) -> Result<FieldValue, FieldSpecError> {
        if self.is_coordinate() {
            let Some(n) = original.as_i64() else {
                return Err(FieldSpecError::NotInteger {
                    property: self.property_name.clone(),
                    value: original.to_string(),
                });
            };
            return Ok(match self.transform {
                FieldTransform::Offset(offset) => FieldValue::Integer(n + offset),
                _ => FieldValue::Integer(n),
            });
        }

        if self.is_strand() {
            let orientation = self.orientation_of(original);
            let name = match orientation {
                Orientation::Direct => "DIRECT",
                Orientation::Reverse => "REVERSE",
                Orientation::Indeterminate => "INDETERMINATE",
            };
            return Ok(FieldValue::Text(name.to_string()));
        }

        if self.is_chromosome() {
            if let FieldTransform::ChrPrefix(true) = self.transform {
                let name = original.to_string();
                if name.to_lowercase().starts_with("chr") {
                    return Ok(FieldValue::Text(name));
                }
                return Ok(FieldValue::Text(format!("chr{}", name)));
            }
        }

        if let FieldValue::Text(text) = original
            && let Some(mapped) = self.transform.remap(text, direction)
        {
            return Ok(FieldValue::Text(mapped));
        }
        Ok(original.clone())
    }

    /// Classify a raw strand value. A key/value map is reverse-looked-up first
    /// (external token to canonical key).
    pub fn orientation_of(&self, raw: &FieldValue) -> Orientation {
        let token = raw.to_string();
        let token = self
            .transform
            .remap(&token, MapDirection::FromSource)
            .unwrap_or(token);
        Orientation::from_token(&token)
    }

    /// Resolve the value of this field for one record: the explicit value, or the
    /// supplied source value, with the inbound transform applied
    pub fn resolve(&self, source_value: Option<&FieldValue>) -> Result<FieldValue, FieldSpecError> {
        let original = match (&self.explicit_value, source_value) {
            (Some(explicit), _) if self.has_explicit_value() => explicit.clone(),
            (_, Some(value)) => value.clone(),
            _ => FieldValue::Null,
        };
        if original.is_null() {
            return Ok(FieldValue::Null);
        }
        self.transformed_value(&original, MapDirection::FromSource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_applies_to_coordinates() {
        let start = FieldSpec::from_source("start", ValueType::Integer, "txStart")
            .unwrap()
            .with_transform(FieldTransform::Offset(1));
        let end = FieldSpec::from_source("end", ValueType::Integer, "txEnd")
            .unwrap()
            .with_transform(FieldTransform::Offset(1));
        assert_eq!(
            start.resolve(Some(&FieldValue::Integer(100))).unwrap(),
            FieldValue::Integer(101)
        );
        assert_eq!(
            end.resolve(Some(&FieldValue::Integer(200))).unwrap(),
            FieldValue::Integer(201)
        );
    }

    #[test]
    fn test_coordinate_requires_integer() {
        let start = FieldSpec::from_source("start", ValueType::Integer, "txStart").unwrap();
        let err = start
            .transformed_value(&FieldValue::Text("12a".into()), MapDirection::FromSource)
            .unwrap_err();
        assert!(matches!(err, FieldSpecError::NotInteger { .. }));
    }

    #[test]
    fn test_strand_remap_then_classify() {
        let strand = FieldSpec::from_source("strand", ValueType::Text, "ori")
            .unwrap()
            .with_transform(FieldTransform::parse_map("DIRECT=forward,REVERSE=backward"));
        let value = strand
            .resolve(Some(&FieldValue::Text("backward".into())))
            .unwrap();
        assert_eq!(value, FieldValue::Text("REVERSE".into()));
        let value = strand.resolve(Some(&FieldValue::Integer(1))).unwrap();
        assert_eq!(value, FieldValue::Text("DIRECT".into()));
        let value = strand.resolve(Some(&FieldValue::Text("?".into()))).unwrap();
        assert_eq!(value, FieldValue::Text("INDETERMINATE".into()));
    }

    #[test]
    fn test_chr_prefix() {
        let chrom = FieldSpec::from_source("chromosome", ValueType::Text, "chrom")
            .unwrap()
            .with_transform(FieldTransform::ChrPrefix(true));
        assert_eq!(
            chrom
                .transformed_value(&FieldValue::Text("7".into()), MapDirection::FromSource)
                .unwrap(),
            FieldValue::Text("chr7".into())
        );
        assert_eq!(
            chrom
                .transformed_value(&FieldValue::Text("chrX".into()), MapDirection::ToSource)
                .unwrap(),
            FieldValue::Text("chrX".into())
        );
    }

    #[test]
    fn test_chromosome_map_direction() {
        let chrom = FieldSpec::from_source("chromosome", ValueType::Text, "chrom")
            .unwrap()
            .with_transform(FieldTransform::parse_map("chr1=1,chr2=2"));
        assert_eq!(
            chrom
                .transformed_value(&FieldValue::Text("chr2".into()), MapDirection::ToSource)
                .unwrap(),
            FieldValue::Text("2".into())
        );
        assert_eq!(
            chrom
                .transformed_value(&FieldValue::Text("1".into()), MapDirection::FromSource)
                .unwrap(),
            FieldValue::Text("chr1".into())
        );
        assert_eq!(
            chrom
                .transformed_value(&FieldValue::Text("chrM".into()), MapDirection::ToSource)
                .unwrap(),
            FieldValue::Text("chrM".into())
        );
    }

    #[test]
    fn test_lenient_map_parsing() {
        let transform = FieldTransform::parse_map("a=b, broken ,x=y=z,,c=d");
        let FieldTransform::KeyValueMap(pairs) = &transform else {
            panic!("Expected a key/value map");
        };
        assert_eq!(
            pairs,
            &vec![
                ("a".to_string(), "b".to_string()),
                ("broken".to_string(), "broken".to_string()),
                ("x=y=z".to_string(), "x=y=z".to_string()),
                ("c".to_string(), "d".to_string()),
            ]
        );
        let text = transform.map_to_string().unwrap();
        assert_eq!(text, "a=b,broken,x=y=z,c=d");
        assert_eq!(FieldTransform::parse_map(&text), transform);
    }

    #[test]
    fn test_explicit_value_invariant_survives_clone() {
        let explicit =
            FieldSpec::explicit("type", ValueType::Text, FieldValue::Text("gene".into())).unwrap();
        let sourced = FieldSpec::from_source("type", ValueType::Text, "name").unwrap();
        for spec in [explicit, sourced] {
            let copy = spec.clone();
            assert_eq!(copy.has_explicit_value(), copy.source_field().is_none());
            assert_eq!(copy.has_explicit_value(), copy.explicit_value().is_some());
            assert_eq!(copy, spec);
        }
    }

    #[test]
    fn test_from_parts_rejects_inconsistent_state() {
        assert!(matches!(
            FieldSpec::from_parts("score", ValueType::Real, Some("s"), Some("1.0")),
            Err(FieldSpecError::InconsistentExplicitValue(_))
        ));
        assert!(matches!(
            FieldSpec::from_parts("score", ValueType::Real, Some(""), None),
            Err(FieldSpecError::MissingSource(_))
        ));
        let spec = FieldSpec::from_parts("score", ValueType::Real, None, Some("2.5")).unwrap();
        assert_eq!(spec.explicit_value(), Some(&FieldValue::Real(2.5)));
    }

    #[test]
    fn test_set_explicit_value_on_sourced_spec_fails() {
        let mut spec = FieldSpec::from_source("type", ValueType::Text, "name").unwrap();
        assert!(
            spec.set_explicit_value(FieldValue::Text("x".into()))
                .is_err()
        );
    }

    #[test]
    fn test_transform_text_roundtrip() {
        for text in ["offset:+1", "offset:-3", "chrprefix:true", "map:a=b,c=d"] {
            let transform: FieldTransform = text.parse().unwrap();
            assert_eq!(transform.to_string(), text);
        }
        assert_eq!("".parse::<FieldTransform>().unwrap(), FieldTransform::None);
        assert!("scale:2".parse::<FieldTransform>().is_err());
        assert!("offset:one".parse::<FieldTransform>().is_err());
    }

    #[test]
    fn test_cloned_map_is_independent() {
        let spec = FieldSpec::from_source("type", ValueType::Text, "name")
            .unwrap()
            .with_transform(FieldTransform::parse_map("gene=g"));
        let mut copy = spec.clone();
        copy.set_transform(FieldTransform::parse_map("gene=x"));
        assert_eq!(spec.transform().map_to_string().unwrap(), "gene=g");
    }
}
