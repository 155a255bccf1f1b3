//! Minimal element tree built on top of the `quick-xml` event reader.
//!
//! The configuration documents are small, so they are read fully into an
//! [`Element`] tree and interpreted from there.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::debug;

use crate::error::{ReaderError, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// First child with the given local name (case-insensitive).
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children
            .iter()
            .filter(move |c| c.name.eq_ignore_ascii_case(name))
    }

    /// Trimmed text of a child element, `None` when the child is missing or empty.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name)
            .map(|c| c.text.trim())
            .filter(|t| !t.is_empty())
    }
}

fn local_name(bs: &BytesStart) -> String {
    String::from_utf8_lossy(bs.local_name().as_ref()).into_owned()
}

fn start_element(bs: &BytesStart) -> Result<Element> {
    let mut element = Element {
        name: local_name(bs),
        ..Element::default()
    };
    for attr in bs.attributes() {
        let attr = attr.map_err(|e| ReaderError::Configuration(format!("Bad attribute: {}", e)))?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

/// Parses a whole document and returns its root element.
pub fn parse_document(content: &str) -> Result<Element> {
    // Text stays raw across CDATA and comments; readers trim the joined text.
    let mut reader = Reader::from_str(content);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event()? {
            Event::Start(bs) => stack.push(start_element(&bs)?),
            Event::Empty(bs) => {
                let element = start_element(&bs)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Event::Text(t) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&t.unescape()?);
                }
            }
            Event::CData(c) => {
                if let Some(current) = stack.last_mut() {
                    current
                        .text
                        .push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::End(_) => {
                let element = stack.pop().ok_or_else(|| {
                    ReaderError::Configuration("Unbalanced closing tag".to_string())
                })?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Event::Eof => break,
            _ => (),
        }
    }

    if !stack.is_empty() {
        return Err(ReaderError::Configuration(
            "Unexpected EOF: unclosed elements in document".to_string(),
        ));
    }
    let root = root.ok_or_else(|| ReaderError::Configuration("Empty XML document".to_string()))?;
    debug!("Parsed XML document with root <{}>", root.name);
    Ok(root)
}
