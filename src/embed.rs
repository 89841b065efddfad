use std::collections::HashSet;
use std::io::Cursor;

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, Event};

use crate::docx::{self, EMU_PER_PIXEL, PageGeometry};
use crate::error::Error;

const IMAGE_REL_TYPE: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/image";

/// Available content width of a US Letter page with 1" margins, in EMU.
/// Used when the document declares no usable section geometry.
const DEFAULT_AVAILABLE_WIDTH_EMU: u64 = (12240 - 2 * 1440) * 635;

/// Image bytes resolved by the collaborator that owns retrieval policy
/// (network fetch, disk read, inline data). `subtype` is the MIME subtype,
/// e.g. "png".
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub subtype: String,
}

/// Resolves an `img_url` field value to raw image bytes. Retry and timeout
/// policy live entirely in implementations of this trait.
pub trait ImageFetcher {
    fn fetch(&self, reference: &str) -> Result<FetchedImage, String>;
}

/// A newly inserted image part: filename (relative to the media directory)
/// and raw bytes, owned until final serialization.
#[derive(Debug)]
pub struct MediaRecord {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Result of embedding one image into the document body.
pub struct Embedded {
    pub document_xml: String,
    pub rels_xml: String,
    pub media: MediaRecord,
    pub rel_id: String,
}

/// Issues relationship ids and media filenames unique for one fill
/// operation: seeded with everything already present in the relationships
/// part, candidates are retried on collision rather than assumed unique.
pub struct IdAllocator {
    used_ids: HashSet<String>,
    used_filenames: HashSet<String>,
    next: u32,
}

impl IdAllocator {
    pub fn from_rels(rels_xml: &str) -> Result<Self, Error> {
        let xml = roxmltree::Document::parse(rels_xml)?;
        let mut used_ids = HashSet::new();
        let mut used_filenames = HashSet::new();
        for node in xml.root_element().children() {
            if node.tag_name().name() != "Relationship" {
                continue;
            }
            if let Some(id) = node.attribute("Id") {
                used_ids.insert(id.to_string());
            }
            if let Some(target) = node.attribute("Target")
                && let Some(name) = target.rsplit('/').next()
            {
                used_filenames.insert(name.to_string());
            }
        }
        Ok(IdAllocator {
            used_ids,
            used_filenames,
            next: 1,
        })
    }

    /// Marks a filename as taken. Covers media parts that exist in the
    /// package without any relationship entry pointing at them.
    pub fn reserve_filename(&mut self, name: &str) {
        self.used_filenames.insert(name.to_string());
    }

    /// Next unused (relationship id, media filename) pair.
    pub fn allocate(&mut self, extension: &str) -> (String, String) {
        loop {
            let id = format!("rId{}", self.next);
            let filename = format!("image{}.{extension}", self.next);
            self.next += 1;
            if self.used_ids.contains(&id) || self.used_filenames.contains(&filename) {
                continue;
            }
            self.used_ids.insert(id.clone());
            self.used_filenames.insert(filename.clone());
            return (id, filename);
        }
    }
}

/// Appends one `<Relationship/>` entry before the root close tag, leaving
/// every existing entry unchanged.
pub fn append_relationship(rels_xml: &str, id: &str, target: &str) -> Result<String, Error> {
    let mut reader = Reader::from_str(rels_xml);
    let mut writer = Writer::new(Vec::with_capacity(rels_xml.len() + 128));
    let mut appended = false;

    let entry = |id: &str, target: &str| {
        let mut rel = BytesStart::new("Relationship");
        rel.push_attribute(("Id", id));
        rel.push_attribute(("Type", IMAGE_REL_TYPE));
        rel.push_attribute(("Target", target));
        rel
    };

    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::End(e) if e.local_name().as_ref() == b"Relationships" => {
                writer
                    .write_event(Event::Empty(entry(id, target)))
                    .map_err(|e| Error::Xml(e.to_string()))?;
                writer
                    .write_event(Event::End(e))
                    .map_err(|e| Error::Xml(e.to_string()))?;
                appended = true;
            }
            // A template with no relationships at all may carry a
            // self-closing root.
            Event::Empty(e) if e.local_name().as_ref() == b"Relationships" => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                writer
                    .write_event(Event::Start(e))
                    .map_err(|e| Error::Xml(e.to_string()))?;
                writer
                    .write_event(Event::Empty(entry(id, target)))
                    .map_err(|e| Error::Xml(e.to_string()))?;
                writer
                    .write_event(Event::End(BytesEnd::new(name)))
                    .map_err(|e| Error::Xml(e.to_string()))?;
                appended = true;
            }
            other => {
                writer
                    .write_event(other)
                    .map_err(|e| Error::Xml(e.to_string()))?;
            }
        }
    }

    if !appended {
        return Err(Error::InvalidRelationships(
            "no Relationships root element to append to".into(),
        ));
    }
    String::from_utf8(writer.into_inner()).map_err(|_| Error::Xml("rels not UTF-8".into()))
}

/// Ensures `[Content_Types].xml` declares a `<Default>` for the extension.
/// Returns the (possibly unchanged) part and whether a declaration was added.
pub fn ensure_content_type(
    content_types_xml: &str,
    extension: &str,
    mime: &str,
) -> Result<(String, bool), Error> {
    let xml = roxmltree::Document::parse(content_types_xml)?;
    let already = xml.root_element().children().any(|n| {
        n.tag_name().name() == "Default"
            && n.attribute("Extension")
                .is_some_and(|e| e.eq_ignore_ascii_case(extension))
    });
    if already {
        return Ok((content_types_xml.to_string(), false));
    }

    let mut reader = Reader::from_str(content_types_xml);
    let mut writer = Writer::new(Vec::with_capacity(content_types_xml.len() + 64));
    let mut appended = false;

    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::End(e) if e.local_name().as_ref() == b"Types" => {
                let mut default = BytesStart::new("Default");
                default.push_attribute(("Extension", extension));
                default.push_attribute(("ContentType", mime));
                writer
                    .write_event(Event::Empty(default))
                    .map_err(|e| Error::Xml(e.to_string()))?;
                writer
                    .write_event(Event::End(e))
                    .map_err(|e| Error::Xml(e.to_string()))?;
                appended = true;
            }
            other => {
                writer
                    .write_event(other)
                    .map_err(|e| Error::Xml(e.to_string()))?;
            }
        }
    }

    if !appended {
        return Err(Error::Xml(
            "content types part has no Types root element".into(),
        ));
    }
    let out = String::from_utf8(writer.into_inner())
        .map_err(|_| Error::Xml("content types not UTF-8".into()))?;
    Ok((out, true))
}

fn probe_dimensions(bytes: &[u8]) -> Result<(u32, u32), Error> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| Error::UnsupportedImage(e.to_string()))?
        .into_dimensions()
        .map_err(|e| Error::UnsupportedImage(e.to_string()))
}

/// Sniffs the MIME subtype of raw image bytes, for inline image values that
/// arrive without one.
pub fn sniff_subtype(bytes: &[u8]) -> Result<String, Error> {
    let format =
        image::guess_format(bytes).map_err(|e| Error::UnsupportedImage(e.to_string()))?;
    match format {
        image::ImageFormat::Png => Ok("png".to_string()),
        image::ImageFormat::Jpeg => Ok("jpeg".to_string()),
        image::ImageFormat::Gif => Ok("gif".to_string()),
        other => Err(Error::UnsupportedImage(format!(
            "unsupported image format {other:?}"
        ))),
    }
}

/// Scales native pixel dimensions to EMU, shrinking (aspect preserved) to fit
/// the available content width.
fn fit_extent(pixel_width: u32, pixel_height: u32, max_width_emu: u64) -> (u64, u64) {
    let cx = pixel_width as u64 * EMU_PER_PIXEL;
    let cy = pixel_height as u64 * EMU_PER_PIXEL;
    if cx <= max_width_emu || cx == 0 {
        return (cx, cy);
    }
    // Header-declared dimensions can approach 2^31; the intermediate product
    // needs 128 bits. The quotient is below cy, so it fits back into u64.
    let scaled_cy = (cy as u128 * max_width_emu as u128 / cx as u128) as u64;
    (max_width_emu, scaled_cy)
}

/// Inline drawing run referencing an image relationship, sized in EMU.
fn drawing_run_xml(rel_id: &str, filename: &str, cx: u64, cy: u64) -> String {
    format!(
        r#"<w:r><w:drawing><wp:inline distT="0" distB="0" distL="0" distR="0" xmlns:wp="http://schemas.openxmlformats.org/drawingml/2006/wordprocessingDrawing"><wp:extent cx="{cx}" cy="{cy}"/><wp:effectExtent l="0" t="0" r="0" b="0"/><wp:docPr id="1" name="{filename}"/><wp:cNvGraphicFramePr><a:graphicFrameLocks xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main" noChangeAspect="1"/></wp:cNvGraphicFramePr><a:graphic xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main"><a:graphicData uri="http://schemas.openxmlformats.org/drawingml/2006/picture"><pic:pic xmlns:pic="http://schemas.openxmlformats.org/drawingml/2006/picture"><pic:nvPicPr><pic:cNvPr id="1" name="{filename}"/><pic:cNvPicPr/></pic:nvPicPr><pic:blipFill><a:blip r:embed="{rel_id}" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"/><a:stretch><a:fillRect/></a:stretch></pic:blipFill><pic:spPr><a:xfrm><a:off x="0" y="0"/><a:ext cx="{cx}" cy="{cy}"/></a:xfrm><a:prstGeom prst="rect"><a:avLst/></a:prstGeom></pic:spPr></pic:pic></a:graphicData></a:graphic></wp:inline></w:drawing></w:r>"#
    )
}

/// Converts image bytes into package media: allocates an id and filename,
/// swaps the token's run for a drawing fragment and appends the relationship
/// entry. Shared across all image fields of one fill operation so id
/// uniqueness holds for its whole lifetime.
pub struct ImageEmbedder {
    ids: IdAllocator,
    max_width_emu: u64,
}

impl ImageEmbedder {
    pub fn new(
        rels_xml: &str,
        existing_media: &[String],
        geometry: Option<PageGeometry>,
    ) -> Result<Self, Error> {
        let max_width_emu = geometry
            .map(|g| g.available_width_emu())
            .unwrap_or(DEFAULT_AVAILABLE_WIDTH_EMU);
        let mut ids = IdAllocator::from_rels(rels_xml)?;
        for name in existing_media {
            ids.reserve_filename(name);
        }
        Ok(ImageEmbedder { ids, max_width_emu })
    }

    /// Embeds one image. Returns `Ok(None)` when the token never occurs in
    /// the body; in that case nothing is registered at all (no relationship,
    /// no media, no content type).
    pub fn embed(
        &mut self,
        document_xml: &str,
        rels_xml: &str,
        token: &str,
        image: FetchedImage,
    ) -> Result<Option<Embedded>, Error> {
        let (pixel_width, pixel_height) = probe_dimensions(&image.bytes)?;
        let (cx, cy) = fit_extent(pixel_width, pixel_height, self.max_width_emu);

        let (rel_id, filename) = self.ids.allocate(&image.subtype);
        let drawing = drawing_run_xml(&rel_id, &filename, cx, cy);

        let (new_document, replaced) = docx::replace_token_run(document_xml, token, &drawing)?;
        if replaced == 0 {
            log::warn!("token {token} not found in document body; image not registered");
            return Ok(None);
        }

        let new_rels = append_relationship(rels_xml, &rel_id, &format!("media/{filename}"))?;
        log::info!(
            "embedded {filename} as {rel_id} ({pixel_width}x{pixel_height} px, {cx}x{cy} EMU, {} bytes)",
            image.bytes.len()
        );

        Ok(Some(Embedded {
            document_xml: new_document,
            rels_xml: new_rels,
            media: MediaRecord {
                filename,
                bytes: image.bytes,
            },
            rel_id,
        }))
    }
}

#[cfg(test)]
pub(crate) fn tiny_png() -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(4, 2, image::Rgba([10, 20, 30, 255]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
    buf.into_inner()
}
