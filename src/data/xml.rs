//! XML to JSON conversion for yr.no forecast documents
//!
//! The conversion follows the conventions the forecast consumers were written
//! against: attributes merge into the element object, repeated children become
//! arrays while a single child stays a scalar, and text-only elements collapse
//! to strings.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};
use thiserror::Error;

/// Key holding element text when the element also has attributes or children
pub const TEXT_KEY: &str = "_";

/// Errors that can occur while converting an XML document
#[derive(Debug, Error)]
pub enum XmlError {
    /// The underlying reader rejected the input
    #[error("XML syntax error: {0}")]
    Syntax(#[from] quick_xml::Error),

    /// An element or attribute name was not valid UTF-8
    #[error("Invalid UTF-8 in XML name: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    /// The document has no root element
    #[error("XML document has no root element")]
    NoRoot,

    /// The document ended while an element was still open
    #[error("XML element <{0}> is never closed")]
    Unclosed(String),

    /// Structural problem outside the reader's own checks
    #[error("Malformed XML: {0}")]
    Malformed(String),
}

/// An element that has been opened but not yet closed
#[derive(Debug)]
struct Frame {
    name: String,
    fields: Map<String, Value>,
    text: String,
    cdata: bool,
}

impl Frame {
    fn open(start: &BytesStart<'_>) -> Result<Self, XmlError> {
        let name = std::str::from_utf8(start.name().as_ref())?.to_string();
        let mut fields = Map::new();

        for attr in start.attributes() {
            let attr = attr.map_err(quick_xml::Error::from)?;
            let key = std::str::from_utf8(attr.key.as_ref())?.to_string();
            let value = attr.unescape_value()?.into_owned();
            assign_or_push(&mut fields, key, Value::String(value));
        }

        Ok(Self {
            name,
            fields,
            text: String::new(),
            cdata: false,
        })
    }

    fn close(self) -> (String, Value) {
        let Frame {
            name,
            mut fields,
            text,
            cdata,
        } = self;

        if fields.is_empty() {
            return (name, Value::String(text));
        }

        // Whitespace between child elements is formatting, not content
        if cdata || !text.trim().is_empty() {
            fields.insert(TEXT_KEY.to_string(), Value::String(text));
        }

        (name, Value::Object(fields))
    }
}

/// Insert `value` under `key`, turning the slot into an array on repeats
fn assign_or_push(fields: &mut Map<String, Value>, key: String, value: Value) {
    match fields.get_mut(&key) {
        None => {
            fields.insert(key, value);
        }
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
    }
}

/// Attach a closed element to its parent, or make it the document root
fn attach(
    stack: &mut [Frame],
    root: &mut Option<(String, Value)>,
    name: String,
    value: Value,
) -> Result<(), XmlError> {
    match stack.last_mut() {
        Some(parent) => {
            assign_or_push(&mut parent.fields, name, value);
            Ok(())
        }
        None if root.is_some() => Err(XmlError::Malformed(format!(
            "second root element <{}>",
            name
        ))),
        None => {
            *root = Some((name, value));
            Ok(())
        }
    }
}

/// Parse an XML document into a JSON value of the form `{ "<root>": ... }`
///
/// # Returns
/// * `Ok(Value)` - An object with a single key, the root element's name
/// * `Err(XmlError)` - If the input is not a well-formed single-root document
pub fn parse_document(xml: &str) -> Result<Value, XmlError> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Frame> = Vec::new();
    let mut root: Option<(String, Value)> = None;

    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                if stack.is_empty() && root.is_some() {
                    return Err(XmlError::Malformed("content after root element".to_string()));
                }
                stack.push(Frame::open(&start)?);
            }
            Event::Empty(start) => {
                let (name, value) = Frame::open(&start)?.close();
                attach(&mut stack, &mut root, name, value)?;
            }
            Event::End(_) => {
                let frame = stack
                    .pop()
                    .ok_or_else(|| XmlError::Malformed("unexpected closing tag".to_string()))?;
                let (name, value) = frame.close();
                attach(&mut stack, &mut root, name, value)?;
            }
            Event::Text(text) => {
                let text = text.unescape()?;
                match stack.last_mut() {
                    Some(frame) => frame.text.push_str(&text),
                    None if text.trim().is_empty() => {}
                    None => {
                        return Err(XmlError::Malformed(
                            "text outside of root element".to_string(),
                        ))
                    }
                }
            }
            Event::CData(cdata) => {
                let frame = stack.last_mut().ok_or_else(|| {
                    XmlError::Malformed("CDATA outside of root element".to_string())
                })?;
                frame.text.push_str(&String::from_utf8_lossy(&cdata));
                frame.cdata = true;
            }
            Event::Eof => break,
            // Declarations, comments, processing instructions and doctypes carry no data
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(XmlError::Unclosed(open.name.clone()));
    }

    let (name, value) = root.ok_or(XmlError::NoRoot)?;
    let mut document = Map::new();
    document.insert(name, value);
    Ok(Value::Object(document))
}
