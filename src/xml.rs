// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! XML response processing (C4): parse with an encoding-repair fallback,
//! detect OAI-PMH `<error>` elements, and provide the structural helpers the
//! harvest driver (C6) needs to walk an OAI-PMH payload safely — OAI reuses
//! element names (`identifier`, `header`, …) at multiple nesting depths, so
//! only immediate-children and first-descendant lookups are safe.

use std::path::PathBuf;

use anyhow::Context;
use quick_xml::{
    Reader, Writer,
    events::{BytesEnd, BytesStart, BytesText, Event},
};
use tracing::warn;

use crate::error::HarvestError;

/// One XML element, built into a small in-memory tree by [`parse`]. Text
/// nodes are preserved as siblings so mixed content round-trips; attributes
/// never include `xmlns`/`xmlns:*` declarations, which are tracked
/// separately in `namespaces`.
#[derive(Debug, Clone)]
pub struct XmlElement {
    pub name: String,
    pub local_name: String,
    pub attrs: Vec<(String, String)>,
    /// Namespace declarations made directly on this element.
    pub namespaces: Vec<(Option<String>, String)>,
    /// Every namespace binding visible at this element: the union of every
    /// ancestor's declarations and this element's own, inner declarations
    /// winning on prefix collision.
    pub in_scope: Vec<(Option<String>, String)>,
    pub children: Vec<XmlNode>,
}

#[derive(Debug, Clone)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
}

impl XmlElement {
    /// First element anywhere below this one (not including itself) whose
    /// local name matches, depth-first.
    pub fn first_descendant(&self, local_name: &str) -> Option<&XmlElement> {
        for child in &self.children {
            if let XmlNode::Element(el) = child {
                if el.local_name == local_name {
                    return Some(el);
                }
                if let Some(found) = el.first_descendant(local_name) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Immediate children (non-recursive) whose local name matches.
    pub fn children_by_tag(&self, local_name: &str) -> Vec<&XmlElement> {
        self.children
            .iter()
            .filter_map(|c| match c {
                XmlNode::Element(el) if el.local_name == local_name => Some(el),
                _ => None,
            })
            .collect()
    }

    /// First element child, recursion-free, order-preserving.
    pub fn first_child_element(&self) -> Option<&XmlElement> {
        self.children.iter().find_map(|c| match c {
            XmlNode::Element(el) => Some(el),
            _ => None,
        })
    }

    /// Looks up an attribute by local name, ignoring any namespace prefix on
    /// the attribute's own qualified name.
    pub fn attr(&self, local_name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == local_name || k.rsplit(':').next() == Some(local_name))
            .map(|(_, v)| v.as_str())
    }

    /// Concatenation of this element's direct text children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|c| match c {
                XmlNode::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .concat()
    }

    /// Copies every in-scope namespace binding onto this element as an
    /// `xmlns`/`xmlns:prefix` attribute, skipping the reserved `xml` prefix
    /// and any binding already declared here. Required because a serialized
    /// fragment, unlike a full document, carries no ancestor context for a
    /// consumer to resolve qualified names against.
    pub fn inherit_namespaces(&mut self) {
        for (prefix, uri) in self.in_scope.clone() {
            if prefix.as_deref() == Some("xml") {
                continue;
            }
            let already = self.namespaces.iter().any(|(p, _)| *p == prefix);
            if !already {
                self.namespaces.push((prefix, uri));
            }
        }
    }
}

/// Parses a byte slice into its root element. Mirrors libxml2's permissive,
/// huge-document-friendly defaults: no external entity resolution is
/// attempted (quick-xml never performs it), and comments/processing
/// instructions are skipped rather than rejected.
pub fn parse(bytes: &[u8]) -> anyhow::Result<XmlElement> {
    let mut reader = Reader::from_reader(bytes);

    let mut stack: Vec<(XmlElement, Vec<(Option<String>, String)>)> = Vec::new();
    let mut root: Option<XmlElement> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).context("XML tokenizer error")? {
            Event::Start(e) => {
                let parent_scope = stack.last().map(|(_, s)| s.clone()).unwrap_or_default();
                let (el, scope) = build_element(&e, &parent_scope);
                stack.push((el, scope));
            },
            Event::Empty(e) => {
                let parent_scope = stack.last().map(|(_, s)| s.clone()).unwrap_or_default();
                let (el, _scope) = build_element(&e, &parent_scope);
                place(&mut stack, &mut root, XmlNode::Element(el));
            },
            Event::End(_) => {
                let (el, _scope) =
                    stack.pop().context("closing tag without a matching open tag")?;
                place(&mut stack, &mut root, XmlNode::Element(el));
            },
            Event::Text(t) => {
                let text = t.unescape().context("invalid character data")?.into_owned();
                if let Some((top, _)) = stack.last_mut() {
                    top.children.push(XmlNode::Text(text));
                }
            },
            Event::CData(t) => {
                let text = String::from_utf8_lossy(&t.into_inner()).into_owned();
                if let Some((top, _)) = stack.last_mut() {
                    top.children.push(XmlNode::Text(text));
                }
            },
            Event::Eof => break,
            _ => {},
        }
        buf.clear();
    }

    root.context("document has no root element")
}

fn place(
    stack: &mut [(XmlElement, Vec<(Option<String>, String)>)],
    root: &mut Option<XmlElement>,
    node: XmlNode,
) {
    if let Some((parent, _)) = stack.last_mut() {
        parent.children.push(node);
    } else if let XmlNode::Element(el) = node {
        *root = Some(el);
    }
}

fn build_element(
    start: &BytesStart<'_>,
    parent_scope: &[(Option<String>, String)],
) -> (XmlElement, Vec<(Option<String>, String)>) {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let local_name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();

    let mut attrs = Vec::new();
    let mut own_namespaces = Vec::new();

    for attr in start.attributes().filter_map(Result::ok) {
        let key = attr.key;
        let value = String::from_utf8_lossy(&attr.value).into_owned();
        let key_str = String::from_utf8_lossy(key.as_ref()).into_owned();

        if key_str == "xmlns" {
            own_namespaces.push((None, value));
            continue;
        }
        if let Some(prefix) = key.prefix()
            && prefix.as_ref() == b"xmlns"
        {
            let local = String::from_utf8_lossy(key.local_name().as_ref()).into_owned();
            own_namespaces.push((Some(local), value));
            continue;
        }
        attrs.push((key_str, value));
    }

    let in_scope = merge_scope(parent_scope, &own_namespaces);

    (
        XmlElement {
            name,
            local_name,
            attrs,
            namespaces: own_namespaces,
            in_scope: in_scope.clone(),
            children: Vec::new(),
        },
        in_scope,
    )
}

fn merge_scope(
    parent: &[(Option<String>, String)],
    own: &[(Option<String>, String)],
) -> Vec<(Option<String>, String)> {
    let mut merged = parent.to_vec();
    for (prefix, uri) in own {
        if let Some(existing) = merged.iter_mut().find(|(p, _)| p == prefix) {
            existing.1 = uri.clone();
        } else {
            merged.push((prefix.clone(), uri.clone()));
        }
    }
    merged
}

/// Serializes one element (and its subtree) back to an XML fragment.
pub fn serialize(el: &XmlElement) -> String {
    let mut buf = Vec::new();
    {
        let mut writer = Writer::new(&mut buf);
        write_element(&mut writer, el).expect("writing to an in-memory buffer cannot fail");
    }
    String::from_utf8(buf).expect("writer only emits valid UTF-8")
}

fn write_element<W: std::io::Write>(
    writer: &mut Writer<W>,
    el: &XmlElement,
) -> std::io::Result<()> {
    let mut start = BytesStart::new(el.name.clone());
    for (prefix, uri) in &el.namespaces {
        match prefix {
            Some(p) => start.push_attribute((format!("xmlns:{p}").as_str(), uri.as_str())),
            None => start.push_attribute(("xmlns", uri.as_str())),
        }
    }
    for (k, v) in &el.attrs {
        start.push_attribute((k.as_str(), v.as_str()));
    }

    if el.children.is_empty() {
        writer
            .write_event(Event::Empty(start))
            .map_err(std::io::Error::other)?;
        return Ok(());
    }

    writer
        .write_event(Event::Start(start))
        .map_err(std::io::Error::other)?;
    for child in &el.children {
        match child {
            XmlNode::Element(c) => write_element(writer, c)?,
            XmlNode::Text(t) => {
                writer
                    .write_event(Event::Text(BytesText::new(t)))
                    .map_err(std::io::Error::other)?;
            },
        }
    }
    writer
        .write_event(Event::End(BytesEnd::new(el.name.clone())))
        .map_err(std::io::Error::other)?;
    Ok(())
}

/// A preconfigured XSL transform applied to a response before record
/// extraction (§4.4 step 4, `oaipmhTransformation`). No XSLT engine exists
/// in this crate's dependency stack (none of the reference repos this crate
/// is built from pull one in), so this is a narrow hook in the same spirit
/// as the record-driver and enricher interfaces: a real deployment wires in
/// whatever transform engine it has; the default is a pass-through.
pub trait XsltTransform: Send + Sync {
    fn transform(&self, input: &[u8]) -> anyhow::Result<Vec<u8>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopXslt;

impl XsltTransform for NoopXslt {
    fn transform(&self, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(input.to_vec())
    }
}

/// Parses a raw OAI-PMH response, repairing encoding-mislabeled bodies by
/// round-tripping through UTF-8 lossy normalization, applying an optional
/// XSL transform, and checking for a fatal `<error>`.
pub async fn process_response(
    bytes: &[u8],
    source_id: &str,
    is_resumption_request: bool,
    ignore_no_records_match: bool,
    xslt: Option<&dyn XsltTransform>,
) -> Result<XmlElement, HarvestError> {
    let transformed = match xslt {
        Some(t) => t.transform(bytes).map_err(HarvestError::Other)?,
        None => bytes.to_vec(),
    };

    let root = match parse(&transformed) {
        Ok(root) => root,
        Err(first_err) => {
            warn!(source_id, error = %first_err, "XML parse failed, retrying after encoding repair");
            let repaired = String::from_utf8_lossy(&transformed).into_owned();
            match parse(repaired.as_bytes()) {
                Ok(root) => root,
                Err(second_err) => {
                    let path = save_malformed_response(source_id, &transformed).await;
                    return Err(HarvestError::MalformedResponse {
                        errors: format!("{first_err}; after repair: {second_err}"),
                        path: path.display().to_string(),
                    });
                },
            }
        },
    };

    check_oai_error(&root, is_resumption_request, ignore_no_records_match)?;
    Ok(root)
}

async fn save_malformed_response(source_id: &str, bytes: &[u8]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("oai-harvest-pool-malformed-{source_id}.xml"));
    if let Err(e) = tokio::fs::write(&path, bytes).await {
        warn!(source_id, error = %e, path = ?path, "failed to save malformed response to disk");
    }
    path
}

/// Scans for an OAI `<error>` element and decides whether it is fatal.
/// `noRecordsMatch` is tolerated when this was not a resumption-token
/// request, or when the source explicitly opts in via
/// `ignoreNoRecordsMatch`.
fn check_oai_error(
    root: &XmlElement,
    is_resumption_request: bool,
    ignore_no_records_match: bool,
) -> Result<(), HarvestError> {
    let Some(error_el) = root.first_descendant("error") else { return Ok(()) };
    let code = error_el.attr("code").unwrap_or("unknown").to_string();
    let text = error_el.text();

    if code == "noRecordsMatch" && (!is_resumption_request || ignore_no_records_match) {
        return Ok(());
    }
    Err(HarvestError::OaiError { code, text })
}

/// Extracts the `resumptionToken` element's text, if present and non-empty.
pub fn extract_resumption_token(root: &XmlElement) -> Option<String> {
    root.first_descendant("resumptionToken").map(|el| el.text()).filter(|s| !s.is_empty())
}

/// Extracts `<responseDate>`, present on every OAI-PMH response.
pub fn extract_response_date(root: &XmlElement) -> Option<String> {
    root.first_descendant("responseDate").map(|el| el.text())
}

/// Extracts `<granularity>` from an `Identify` response.
pub fn extract_granularity(root: &XmlElement) -> Option<String> {
    root.first_descendant("granularity").map(|el| el.text())
}

/// Immediate `<record>` children of `<ListRecords>`/`<ListIdentifiers>`.
pub fn extract_records<'a>(root: &'a XmlElement, list_tag: &str) -> Vec<&'a XmlElement> {
    let Some(list) = root.first_descendant(list_tag) else { return Vec::new() };
    list.children_by_tag("record")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/" xmlns:dc="http://purl.org/dc/elements/1.1/">
  <responseDate>2024-03-05T10:20:30Z</responseDate>
  <ListRecords>
    <record>
      <header><identifier>oai:foo.org:abc123</identifier><datestamp>2024-03-01</datestamp></header>
      <metadata><dc:dc><dc:title>Hello</dc:title></dc:dc></metadata>
    </record>
    <resumptionToken>t1</resumptionToken>
  </ListRecords>
</OAI-PMH>"#;

    #[test]
    fn parses_and_extracts_records_and_token() {
        let root = parse(SAMPLE.as_bytes()).unwrap();
        let records = extract_records(&root, "ListRecords");
        assert_eq!(records.len(), 1);
        assert_eq!(extract_resumption_token(&root), Some("t1".to_string()));
        assert_eq!(extract_response_date(&root), Some("2024-03-05T10:20:30Z".to_string()));
    }

    #[test]
    fn first_descendant_is_depth_first_and_skips_self() {
        let root = parse(SAMPLE.as_bytes()).unwrap();
        let record = root.first_descendant("record").unwrap();
        let header = record.first_descendant("header").unwrap();
        assert_eq!(header.first_descendant("identifier").unwrap().text(), "oai:foo.org:abc123");
    }

    #[test]
    fn metadata_root_inherits_ancestor_namespace_as_attribute() {
        let root = parse(SAMPLE.as_bytes()).unwrap();
        let record = root.first_descendant("record").unwrap();
        let metadata = record.first_descendant("metadata").unwrap();
        let mut payload_root = metadata.first_child_element().unwrap().clone();
        payload_root.inherit_namespaces();

        let serialized = serialize(&payload_root);
        assert!(serialized.contains("xmlns=\"http://www.openarchives.org/OAI/2.0/\""));
        assert!(serialized.contains("xmlns:dc=\"http://purl.org/dc/elements/1.1/\""));
    }

    #[test]
    fn reserved_xml_namespace_is_never_copied() {
        let xml = r#"<root xml:lang="en"><child/></root>"#;
        let root = parse(xml.as_bytes()).unwrap();
        let mut child = root.first_child_element().unwrap().clone();
        child.inherit_namespaces();
        assert!(child.namespaces.is_empty());
    }

    #[test]
    fn no_records_match_is_tolerated_on_non_resumption_request() {
        let xml = r#"<OAI-PMH><error code="noRecordsMatch">nope</error></OAI-PMH>"#;
        let root = parse(xml.as_bytes()).unwrap();
        assert!(check_oai_error(&root, false, false).is_ok());
    }

    #[test]
    fn no_records_match_is_fatal_on_resumption_request_unless_ignored() {
        let xml = r#"<OAI-PMH><error code="noRecordsMatch">nope</error></OAI-PMH>"#;
        let root = parse(xml.as_bytes()).unwrap();
        assert!(check_oai_error(&root, true, false).is_err());
        assert!(check_oai_error(&root, true, true).is_ok());
    }

    #[test]
    fn other_oai_errors_are_always_fatal() {
        let xml = r#"<OAI-PMH><error code="badArgument">nope</error></OAI-PMH>"#;
        let root = parse(xml.as_bytes()).unwrap();
        let err = check_oai_error(&root, false, true).unwrap_err();
        assert!(matches!(err, HarvestError::OaiError { code, .. } if code == "badArgument"));
    }

    #[tokio::test]
    async fn malformed_input_is_saved_to_a_deterministic_path() {
        let err = process_response(b"<not valid", "source-x", false, false, None).await.unwrap_err();
        match err {
            HarvestError::MalformedResponse { path, .. } => {
                assert!(path.contains("oai-harvest-pool-malformed-source-x.xml"));
            },
            other => panic!("expected MalformedResponse, got {other:?}"),
        }
    }
}
