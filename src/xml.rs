//! Minimal element tree over quick-xml
//!
//! Instrument XML is small and flat but uses data-dependent tag names
//! (one tag per well), so it is read into a generic tree rather than
//! deserialized into fixed structs.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlNode {
    pub tag: String,
    pub attributes: Vec<(String, String)>,
    /// Concatenated, trimmed character data
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    /// First direct child with this tag.
    pub fn child(&self, tag: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.tag == tag)
    }

    /// All direct children with this tag.
    pub fn children_named<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |c| c.tag == tag)
    }

    /// Text of the first direct child, `None` if absent or blank.
    pub fn child_text(&self, tag: &str) -> Option<&str> {
        self.child(tag)
            .map(|c| c.text.as_str())
            .filter(|t| !t.is_empty())
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Depth-first search for every element with this tag, self included.
    pub fn descendants_named<'a>(&'a self, tag: &str) -> Vec<&'a XmlNode> {
        let mut found = Vec::new();
        self.collect_named(tag, &mut found);
        found
    }

    fn collect_named<'a>(&'a self, tag: &str, found: &mut Vec<&'a XmlNode>) {
        if self.tag == tag {
            found.push(self);
        }
        for child in &self.children {
            child.collect_named(tag, found);
        }
    }

    /// Text of the first descendant with this tag, following a `/` path.
    pub fn path_text(&self, path: &str) -> Option<&str> {
        let mut node = self;
        for step in path.split('/') {
            node = node.child(step)?;
        }
        Some(node.text.as_str()).filter(|t| !t.is_empty())
    }
}

/// Parse a whole document and return its root element.
pub fn parse_document(bytes: &[u8]) -> Result<XmlNode, String> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => stack.push(open_element(&e)?),
            Ok(Event::Empty(e)) => {
                let node = open_element(&e)?;
                attach(&mut stack, &mut root, node)?;
            }
            Ok(Event::End(_)) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| "closing tag without an open element".to_string())?;
                attach(&mut stack, &mut root, node)?;
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| format!("bad character data: {e}"))?;
                append_text(&mut stack, &text);
            }
            Ok(Event::CData(c)) => {
                let raw = c.into_inner();
                append_text(&mut stack, &String::from_utf8_lossy(&raw));
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(format!(
                    "XML error at byte {}: {e}",
                    reader.buffer_position()
                ))
            }
        }
        buf.clear();
    }

    if let Some(open) = stack.last() {
        return Err(format!("unclosed element <{}>", open.tag));
    }
    root.ok_or_else(|| "document has no root element".to_string())
}

fn open_element(e: &BytesStart<'_>) -> Result<XmlNode, String> {
    let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| format!("bad attribute on <{tag}>: {err}"))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| format!("bad attribute value on <{tag}>: {err}"))?
            .into_owned();
        attributes.push((key, value));
    }
    Ok(XmlNode {
        tag,
        attributes,
        ..XmlNode::default()
    })
}

fn attach(stack: &mut [XmlNode], root: &mut Option<XmlNode>, node: XmlNode) -> Result<(), String> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => {
            if root.is_some() {
                return Err("more than one root element".to_string());
            }
            *root = Some(node);
        }
    }
    Ok(())
}

fn append_text(stack: &mut [XmlNode], text: &str) {
    if let Some(current) = stack.last_mut() {
        current.text.push_str(text.trim());
    }
}

/// Split a bracketed list such as `[1.0, -2.5]` or `[VIC, FAM, ROX]`.
pub fn bracket_items(text: &str) -> Vec<&str> {
    let inner = text.trim();
    let inner = inner.strip_prefix('[').unwrap_or(inner);
    let inner = inner.strip_suffix(']').unwrap_or(inner);
    if inner.trim().is_empty() {
        return Vec::new();
    }
    inner.split(',').map(str::trim).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flat_rows() {
        let xml = b"\xEF\xBB\xBF<FAM><Row><Cycle>1</Cycle><A01>-80.06</A01></Row><Row><Cycle>2</Cycle><A01>12.5</A01></Row></FAM>";
        let root = parse_document(xml).unwrap();
        assert_eq!(root.tag, "FAM");
        let rows: Vec<&XmlNode> = root.children_named("Row").collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].child_text("A01"), Some("-80.06"));
        assert_eq!(rows[1].child_text("Cycle"), Some("2"));
    }

    #[test]
    fn test_attributes_empty_elements_and_paths() {
        let xml = br#"<Root><DyeData WellIndex="3"><DyeList>[VIC, FAM]</DyeList></DyeData><Empty/><A><B><C>x &amp; y</C></B></A></Root>"#;
        let root = parse_document(xml).unwrap();
        let dye = root.descendants_named("DyeData");
        assert_eq!(dye.len(), 1);
        assert_eq!(dye[0].attr("WellIndex"), Some("3"));
        assert!(root.child("Empty").is_some());
        assert_eq!(root.child_text("Empty"), None);
        assert_eq!(root.path_text("A/B/C"), Some("x & y"));
    }

    #[test]
    fn test_rejects_broken_documents() {
        assert!(parse_document(b"").is_err());
        assert!(parse_document(b"<a><b></a>").is_err());
        assert!(parse_document(b"<a>").is_err());
    }

    #[test]
    fn test_bracket_items() {
        assert_eq!(bracket_items("[VIC, FAM, ROX]"), vec!["VIC", "FAM", "ROX"]);
        assert_eq!(bracket_items(" [1.5,-2] "), vec!["1.5", "-2"]);
        assert!(bracket_items("[]").is_empty());
    }
}
