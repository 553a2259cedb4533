//! Minimal XML element tree used for persisted configuration

use super::ConfigError;
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

/// An XML element with attributes, child elements and text content
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.set_attribute(name, value);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(child);
        self
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl ToString) {
        let name = name.into();
        let value = value.to_string();
        match self.attributes.iter_mut().find(|(k, _)| *k == name) {
            Some(existing) => existing.1 = value,
            None => self.attributes.push((name, value)),
        }
    }

    pub fn push_child(&mut self, child: XmlElement) {
        self.children.push(child);
    }

    /// Append `<name>text</name>`
    pub fn push_text_child(&mut self, name: impl Into<String>, text: impl ToString) {
        self.children
            .push(XmlElement::new(name).with_text(text.to_string()));
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn require_attribute(&self, name: &str) -> Result<&str, ConfigError> {
        self.attribute(name)
            .ok_or_else(|| ConfigError::MissingAttribute {
                element: self.name.clone(),
                attribute: name.to_string(),
            })
    }

    /// Parse an optional attribute with `FromStr`
    pub fn parse_attribute<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: ToString,
    {
        match self.attribute(name).map(str::trim).filter(|v| !v.is_empty()) {
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::invalid(format!("{}@{}", self.name, name), raw, e)),
            None => Ok(None),
        }
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children
            .iter()
            .filter(move |c| c.name.eq_ignore_ascii_case(name))
    }

    /// Trimmed text of a child element; empty text counts as absent
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name)
            .map(|c| c.text.trim())
            .filter(|t| !t.is_empty())
    }

    pub fn require_child_text(&self, name: &str) -> Result<&str, ConfigError> {
        self.child_text(name)
            .ok_or_else(|| ConfigError::MissingElement {
                element: self.name.clone(),
                child: name.to_string(),
            })
    }
}

fn start_element(e: &BytesStart<'_>) -> Result<XmlElement, ConfigError> {
    let mut element = XmlElement::new(String::from_utf8_lossy(e.name().as_ref()).to_string());
    for attr in e.attributes() {
        let attr = attr.map_err(|err| ConfigError::Xml(err.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|err| ConfigError::Xml(err.to_string()))?
            .to_string();
        element.attributes.push((key, value));
    }
    Ok(element)
}

/// Parse a document into its root element
pub fn parse_document(text: &str) -> Result<XmlElement, ConfigError> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => stack.push(start_element(e)?),
            Ok(Event::Empty(ref e)) => {
                let element = start_element(e)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Ok(Event::Text(ref t)) => {
                if let Some(current) = stack.last_mut() {
                    let text = t.unescape().map_err(|e| ConfigError::Xml(e.to_string()))?;
                    current.text.push_str(&text);
                }
            }
            Ok(Event::CData(ref c)) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(c.as_ref()));
                }
            }
            Ok(Event::End(_)) => {
                let Some(element) = stack.pop() else {
                    return Err(ConfigError::Xml("Unbalanced closing tag".to_string()));
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ConfigError::Xml(format!(
                    "Parse error at position {}: {}",
                    reader.error_position(),
                    e
                )));
            }
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(ConfigError::Xml(format!(
            "Unclosed element <{}>",
            stack.last().map(|e| e.name.as_str()).unwrap_or_default()
        )));
    }
    root.ok_or_else(|| ConfigError::Xml("Document has no root element".to_string()))
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &XmlElement) -> Result<(), ConfigError> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if element.children.is_empty() && element.text.is_empty() {
        writer
            .write_event(Event::Empty(start))
            .map_err(|e| ConfigError::Xml(e.to_string()))?;
        return Ok(());
    }

    writer
        .write_event(Event::Start(start))
        .map_err(|e| ConfigError::Xml(e.to_string()))?;
    if !element.text.is_empty() {
        writer
            .write_event(Event::Text(BytesText::new(&element.text)))
            .map_err(|e| ConfigError::Xml(e.to_string()))?;
    }
    for child in &element.children {
        write_element(writer, child)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(element.name.as_str())))
        .map_err(|e| ConfigError::Xml(e.to_string()))?;
    Ok(())
}

/// Serialize `root` as an indented document with an XML declaration
pub fn write_document(root: &XmlElement) -> Result<String, ConfigError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(|e| ConfigError::Xml(e.to_string()))?;
    write_element(&mut writer, root)?;
    String::from_utf8(writer.into_inner()).map_err(|e| ConfigError::Xml(e.to_string()))
}
