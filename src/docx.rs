use quick_xml::NsReader;
use quick_xml::Writer;
use quick_xml::events::{BytesText, Event};
use quick_xml::name::{Namespace, ResolveResult};

use crate::error::Error;

pub const WML_NS: &str = "http://schemas.openxmlformats.org/wordprocessingml/2006/main";

/// EMU (English Metric Units) per CSS pixel at 96 dpi.
pub const EMU_PER_PIXEL: u64 = 9525;
/// EMU per twip (1/20 point).
pub const EMU_PER_TWIP: u64 = 635;

/// Page width and horizontal margins from the section properties, in twips.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageGeometry {
    pub page_width_twips: u32,
    pub margin_left_twips: u32,
    pub margin_right_twips: u32,
}

impl PageGeometry {
    pub fn available_width_twips(&self) -> u32 {
        self.page_width_twips
            .saturating_sub(self.margin_left_twips + self.margin_right_twips)
    }

    pub fn available_width_emu(&self) -> u64 {
        self.available_width_twips() as u64 * EMU_PER_TWIP
    }
}

fn wml<'a>(node: roxmltree::Node<'a, 'a>, name: &str) -> Option<roxmltree::Node<'a, 'a>> {
    node.children()
        .find(|n| n.tag_name().name() == name && n.tag_name().namespace() == Some(WML_NS))
}

fn twips(node: roxmltree::Node, attr: &str) -> Option<u32> {
    node.attribute((WML_NS, attr))
        .and_then(|v| v.parse::<u32>().ok())
}

/// Reads page size and margins from `sectPr`. Minimal documents may omit
/// either element; that is expected and yields `None`, not an error.
pub fn read_page_geometry(document_xml: &str) -> Option<PageGeometry> {
    let xml = roxmltree::Document::parse(document_xml).ok()?;
    let sect = xml
        .descendants()
        .find(|n| n.tag_name().name() == "sectPr" && n.tag_name().namespace() == Some(WML_NS))?;

    let (Some(pg_sz), Some(pg_mar)) = (wml(sect, "pgSz"), wml(sect, "pgMar")) else {
        log::warn!("sectPr lacks pgSz or pgMar; image sizing falls back to default width");
        return None;
    };

    Some(PageGeometry {
        page_width_twips: twips(pg_sz, "w")?,
        margin_left_twips: twips(pg_mar, "left")?,
        margin_right_twips: twips(pg_mar, "right")?,
    })
}

fn is_wml(ns: &ResolveResult, local: &[u8], want: &[u8]) -> bool {
    local == want && matches!(ns, ResolveResult::Bound(Namespace(n)) if *n == WML_NS.as_bytes())
}

fn into_string(out: Vec<u8>) -> Result<String, Error> {
    String::from_utf8(out).map_err(|_| Error::Xml("rewritten part is not UTF-8".into()))
}

/// Replaces every occurrence of `token` inside `w:t` text content with
/// `value`, leaving all markup untouched. Returns the rewritten XML and the
/// number of occurrences replaced (zero is a silent no-op).
pub fn replace_token_text(
    document_xml: &str,
    token: &str,
    value: &str,
) -> Result<(String, usize), Error> {
    let mut reader = NsReader::from_str(document_xml);
    let mut writer = Writer::new(Vec::with_capacity(document_xml.len()));
    let mut in_text = false;
    let mut count = 0usize;

    loop {
        let (ns, event) = reader.read_resolved_event()?;
        match event {
            Event::Eof => break,
            Event::Start(ref e) => {
                if is_wml(&ns, e.local_name().as_ref(), b"t") {
                    in_text = true;
                }
                writer
                    .write_event(event)
                    .map_err(|e| Error::Xml(e.to_string()))?;
            }
            Event::End(ref e) => {
                if is_wml(&ns, e.local_name().as_ref(), b"t") {
                    in_text = false;
                }
                writer
                    .write_event(event)
                    .map_err(|e| Error::Xml(e.to_string()))?;
            }
            Event::Text(ref t) if in_text => {
                let text = t.xml_content().map_err(|e| Error::Xml(e.to_string()))?;
                if text.contains(token) {
                    count += text.matches(token).count();
                    let replaced = text.replace(token, value);
                    writer
                        .write_event(Event::Text(BytesText::new(&replaced)))
                        .map_err(|e| Error::Xml(e.to_string()))?;
                } else {
                    writer
                        .write_event(event)
                        .map_err(|e| Error::Xml(e.to_string()))?;
                }
            }
            other => {
                writer
                    .write_event(other)
                    .map_err(|e| Error::Xml(e.to_string()))?;
            }
        }
    }

    Ok((into_string(writer.into_inner())?, count))
}

/// Replaces every `w:r` run whose visible text contains `token` with the raw
/// `replacement` fragment (a complete run, e.g. a drawing run). Matching is
/// scoped to a single run: tokens split across runs by formatting boundaries
/// are not detected.
pub fn replace_token_run(
    document_xml: &str,
    token: &str,
    replacement: &str,
) -> Result<(String, usize), Error> {
    let mut reader = NsReader::from_str(document_xml);
    let mut writer = Writer::new(Vec::with_capacity(document_xml.len()));

    // Events of the run currently being buffered, plus its accumulated text.
    let mut run_events: Vec<Event> = Vec::new();
    let mut run_text = String::new();
    let mut buffering = false;
    let mut in_text = false;
    let mut count = 0usize;

    loop {
        let (ns, event) = reader.read_resolved_event()?;
        match event {
            Event::Eof => break,
            Event::Start(ref e) => {
                let local = e.local_name();
                if !buffering && is_wml(&ns, local.as_ref(), b"r") {
                    buffering = true;
                    run_text.clear();
                    run_events.push(event);
                } else if buffering {
                    if is_wml(&ns, local.as_ref(), b"t") {
                        in_text = true;
                    }
                    run_events.push(event);
                } else {
                    writer
                        .write_event(event)
                        .map_err(|e| Error::Xml(e.to_string()))?;
                }
            }
            Event::End(ref e) => {
                let local = e.local_name();
                if buffering && is_wml(&ns, local.as_ref(), b"r") {
                    run_events.push(event);
                    if run_text.contains(token) {
                        count += 1;
                        writer.get_mut().extend_from_slice(replacement.as_bytes());
                    } else {
                        for ev in run_events.drain(..) {
                            writer
                                .write_event(ev)
                                .map_err(|e| Error::Xml(e.to_string()))?;
                        }
                    }
                    run_events.clear();
                    buffering = false;
                    in_text = false;
                } else if buffering {
                    if is_wml(&ns, local.as_ref(), b"t") {
                        in_text = false;
                    }
                    run_events.push(event);
                } else {
                    writer
                        .write_event(event)
                        .map_err(|e| Error::Xml(e.to_string()))?;
                }
            }
            Event::Text(ref t) if buffering => {
                if in_text {
                    let text = t.xml_content().map_err(|e| Error::Xml(e.to_string()))?;
                    run_text.push_str(&text);
                }
                run_events.push(event);
            }
            other if buffering => run_events.push(other),
            other => {
                writer
                    .write_event(other)
                    .map_err(|e| Error::Xml(e.to_string()))?;
            }
        }
    }

    // A run left open at EOF means the body was malformed; emit what we have
    // rather than dropping it.
    for ev in run_events {
        writer
            .write_event(ev)
            .map_err(|e| Error::Xml(e.to_string()))?;
    }

    Ok((into_string(writer.into_inner())?, count))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(inner: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><w:document xmlns:w="{WML_NS}"><w:body>{inner}</w:body></w:document>"#
        )
    }

    #[test]
    fn geometry_from_sect_pr() {
        let xml = body(
            r#"<w:sectPr><w:pgSz w:w="12240" w:h="15840"/><w:pgMar w:top="1440" w:left="1440" w:right="1440"/></w:sectPr>"#,
        );
        let geo = read_page_geometry(&xml).unwrap();
        assert_eq!(geo.page_width_twips, 12240);
        assert_eq!(geo.available_width_twips(), 12240 - 2880);
        assert_eq!(geo.available_width_emu(), (12240 - 2880) * 635);
    }

    #[test]
    fn geometry_missing_is_none() {
        let xml = body(r#"<w:p><w:r><w:t>hi</w:t></w:r></w:p>"#);
        assert!(read_page_geometry(&xml).is_none());

        let partial = body(r#"<w:sectPr><w:pgSz w:w="12240"/></w:sectPr>"#);
        assert!(read_page_geometry(&partial).is_none());
    }

    #[test]
    fn text_replacement_hits_every_occurrence() {
        let xml = body(
            r#"<w:p><w:r><w:t>Hello {{first_name}}</w:t></w:r><w:r><w:t>bye {{first_name}}</w:t></w:r></w:p>"#,
        );
        let (out, n) = replace_token_text(&xml, "{{first_name}}", "John").unwrap();
        assert_eq!(n, 2);
        assert!(out.contains("<w:t>Hello John</w:t>"));
        assert!(out.contains("<w:t>bye John</w:t>"));
        assert!(!out.contains("{{first_name}}"));
    }

    #[test]
    fn text_replacement_escapes_markup_characters() {
        let xml = body(r#"<w:p><w:r><w:t>{{v}}</w:t></w:r></w:p>"#);
        let (out, n) = replace_token_text(&xml, "{{v}}", "a < b & c").unwrap();
        assert_eq!(n, 1);
        assert!(out.contains("<w:t>a &lt; b &amp; c</w:t>"));
        roxmltree::Document::parse(&out).expect("output stays well-formed");
    }

    #[test]
    fn text_replacement_leaves_attributes_alone() {
        let xml = body(r#"<w:p><w:r><w:t xml:space="preserve"> {{x}} </w:t></w:r></w:p>"#);
        let (out, n) = replace_token_text(&xml, "{{x}}", "y").unwrap();
        assert_eq!(n, 1);
        assert!(out.contains(r#"<w:t xml:space="preserve"> y </w:t>"#));
    }

    #[test]
    fn absent_token_is_a_no_op() {
        let xml = body(r#"<w:p><w:r><w:t>nothing here</w:t></w:r></w:p>"#);
        let (out, n) = replace_token_text(&xml, "{{missing}}", "x").unwrap();
        assert_eq!(n, 0);
        assert!(out.contains("<w:t>nothing here</w:t>"));
    }

    #[test]
    fn token_outside_wml_text_is_not_replaced() {
        let xml = format!(
            r#"<w:document xmlns:w="{WML_NS}" xmlns:x="urn:other"><w:body><x:t>{{{{k}}}}</x:t><w:p><w:r><w:t>{{{{k}}}}</w:t></w:r></w:p></w:body></w:document>"#
        );
        let (out, n) = replace_token_text(&xml, "{{k}}", "v").unwrap();
        assert_eq!(n, 1);
        assert!(out.contains("<x:t>{{k}}</x:t>"));
        assert!(out.contains("<w:t>v</w:t>"));
    }

    #[test]
    fn run_replacement_swaps_whole_run() {
        let xml = body(
            r#"<w:p><w:r><w:rPr><w:b/></w:rPr><w:t>{{photo}}</w:t></w:r><w:r><w:t>kept</w:t></w:r></w:p>"#,
        );
        let (out, n) = replace_token_run(&xml, "{{photo}}", "<w:r><w:t>IMG</w:t></w:r>").unwrap();
        assert_eq!(n, 1);
        assert!(!out.contains("{{photo}}"));
        assert!(!out.contains("<w:b/>"));
        assert!(out.contains("<w:r><w:t>IMG</w:t></w:r>"));
        assert!(out.contains("<w:t>kept</w:t>"));
        roxmltree::Document::parse(&out).expect("output stays well-formed");
    }

    #[test]
    fn run_replacement_without_match_changes_nothing_textual() {
        let xml = body(r#"<w:p><w:r><w:t>plain</w:t></w:r></w:p>"#);
        let (out, n) = replace_token_run(&xml, "{{photo}}", "<w:r/>").unwrap();
        assert_eq!(n, 0);
        assert!(out.contains("<w:t>plain</w:t>"));
    }

    #[test]
    fn run_replacement_matches_token_split_inside_one_run() {
        // Two w:t children of the same run still form one visible text.
        let xml = body(r#"<w:p><w:r><w:t>{{ph</w:t><w:t>oto}}</w:t></w:r></w:p>"#);
        let (out, n) = replace_token_run(&xml, "{{photo}}", "<w:r><w:t>IMG</w:t></w:r>").unwrap();
        assert_eq!(n, 1);
        assert!(out.contains("IMG"));
    }
}
