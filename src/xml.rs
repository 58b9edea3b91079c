//! Minimal element tree over `quick-xml`.
//!
//! Configuration files read by discovery (`*.config`, `applicationHost.config`)
//! are small enough to load whole. Lookups return `Option` so absent nested
//! elements and attributes are an ordinary branch for callers.

use anyhow::{bail, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

#[derive(Debug, Clone, Default)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// First direct child with the given local name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// All descendants (not including `self`) with the given local name,
    /// in document order.
    pub fn descendants(&self, name: &str) -> Vec<&Element> {
        let mut out = Vec::new();
        collect_descendants(self, name, &mut out);
        out
    }
}

fn collect_descendants<'a>(el: &'a Element, name: &str, out: &mut Vec<&'a Element>) {
    for child in &el.children {
        if child.name == name {
            out.push(child);
        }
        collect_descendants(child, name, out);
    }
}

fn open_element(e: &BytesStart) -> Element {
    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
    let attributes = e
        .attributes()
        .flatten()
        .filter_map(|a| {
            let key = String::from_utf8_lossy(a.key.local_name().as_ref()).into_owned();
            a.unescape_value().ok().map(|v| (key, v.into_owned()))
        })
        .collect();
    Element {
        name,
        attributes,
        children: Vec::new(),
    }
}

/// Parse a document and return a synthetic root whose children are the
/// document's top-level elements.
pub fn parse_document(xml: &str) -> Result<Element> {
    let mut reader = Reader::from_str(xml.trim_start_matches('\u{feff}'));
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = vec![Element::default()];
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => stack.push(open_element(&e)),
            Ok(Event::Empty(e)) => {
                let el = open_element(&e);
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(el);
                }
            }
            Ok(Event::End(_)) => {
                if stack.len() < 2 {
                    bail!("unbalanced end tag at byte {}", reader.buffer_position());
                }
                if let Some(el) = stack.pop() {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(el);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => bail!("XML error at byte {}: {}", reader.buffer_position(), e),
            _ => {}
        }
    }

    if stack.len() != 1 {
        bail!("unexpected end of document: {} unclosed element(s)", stack.len() - 1);
    }
    Ok(stack.pop().unwrap_or_default())
}
