use std::collections::HashMap;

use crate::docx::{self, PageGeometry};
use crate::embed::{self, FetchedImage, ImageEmbedder, ImageFetcher, MediaRecord};
use crate::error::Error;

/// Key prefix marking a field as a literal text substitution.
pub const TEXT_PREFIX: &str = "txt";
/// Key prefix marking a field's value as an image reference for the fetcher.
pub const IMAGE_URL_PREFIX: &str = "img_url";

/// Caller-supplied value for one template field.
#[derive(Debug)]
pub enum FieldValue {
    Text(String),
    /// Inline, already-encoded image bytes. `subtype` may be omitted; it is
    /// then sniffed from the bytes.
    Image {
        bytes: Vec<u8>,
        subtype: Option<String>,
    },
}

/// What to do when the image collaborator fails for one field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageErrorPolicy {
    /// Fail the whole fill; the original archive stays untouched.
    Abort,
    /// Leave that placeholder unresolved and continue with the next field.
    Skip,
}

/// One parsed `<prefix>__<name>` entry from the input mapping. Constructed
/// per entry and consumed once during a single fill pass.
#[derive(Debug)]
pub struct TemplateField {
    pub key: String,
    pub prefix: Option<String>,
    pub name: String,
    pub value: FieldValue,
}

impl TemplateField {
    pub fn parse(key: String, value: FieldValue) -> Self {
        // A key without the separator is a bare placeholder name.
        let (prefix, name) = match key.split_once("__") {
            Some((prefix, name)) => (Some(prefix.to_string()), name.to_string()),
            None => (None, key.clone()),
        };
        TemplateField {
            key,
            prefix,
            name,
            value,
        }
    }

    /// Parses every entry up front so conflicting prefixes fail before any
    /// substitution begins.
    pub fn parse_all(entries: Vec<(String, FieldValue)>) -> Result<Vec<TemplateField>, Error> {
        let mut prefixes: HashMap<String, Option<String>> = HashMap::new();
        let mut fields = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let field = TemplateField::parse(key, value);
            match prefixes.get(&field.name) {
                Some(seen) if *seen != field.prefix => {
                    return Err(Error::AmbiguousField(field.name));
                }
                _ => {
                    prefixes.insert(field.name.clone(), field.prefix.clone());
                }
            }
            fields.push(field);
        }
        Ok(fields)
    }

    pub fn token(&self) -> String {
        format!("{{{{{}}}}}", self.name)
    }

    fn is_image_url(&self) -> bool {
        self.prefix.as_deref() == Some(IMAGE_URL_PREFIX)
    }
}

/// The evolving (document body, relationships, content types, media) state,
/// threaded explicitly through each field so the single-writer discipline and
/// the abort-before-serialization guarantee fall out of the structure.
#[derive(Debug)]
pub struct FillResult {
    pub document_xml: String,
    pub rels_xml: String,
    pub content_types_xml: String,
    pub media: Vec<MediaRecord>,
}

/// Walks all fields in caller order, applying either a plain substitution or
/// an image embedding to the accumulator. Substitutions are independent and
/// idempotent when tokens are unique.
pub fn fill_fields(
    document_xml: String,
    rels_xml: String,
    content_types_xml: String,
    existing_media: &[String],
    fields: Vec<TemplateField>,
    fetcher: &dyn ImageFetcher,
    geometry: Option<PageGeometry>,
    image_errors: ImageErrorPolicy,
) -> Result<FillResult, Error> {
    let mut embedder = ImageEmbedder::new(&rels_xml, existing_media, geometry)?;
    let mut state = FillResult {
        document_xml,
        rels_xml,
        content_types_xml,
        media: Vec::new(),
    };

    for field in fields {
        let token = field.token();
        let wants_fetch = field.is_image_url();
        let image = match field.value {
            FieldValue::Image { bytes, subtype } => {
                let subtype = match subtype {
                    Some(s) => s,
                    None => embed::sniff_subtype(&bytes)?,
                };
                Some(FetchedImage { bytes, subtype })
            }
            FieldValue::Text(url) if wants_fetch => match fetcher.fetch(&url) {
                Ok(image) => Some(image),
                Err(reason) => match image_errors {
                    ImageErrorPolicy::Abort => {
                        return Err(Error::ImageFetch {
                            field: field.key,
                            reason,
                        });
                    }
                    ImageErrorPolicy::Skip => {
                        log::warn!("skipping field {}: {reason}", field.key);
                        None
                    }
                },
            },
            // txt and any unrecognized prefix: literal stringification.
            FieldValue::Text(text) => {
                let (document, n) =
                    docx::replace_token_text(&state.document_xml, &token, &text)?;
                log::debug!("replaced {n} occurrence(s) of {token}");
                state.document_xml = document;
                None
            }
        };

        if let Some(image) = image {
            let extension = image.subtype.clone();
            let mime = format!("image/{extension}");
            if let Some(embedded) =
                embedder.embed(&state.document_xml, &state.rels_xml, &token, image)?
            {
                state.document_xml = embedded.document_xml;
                state.rels_xml = embedded.rels_xml;
                let (content_types, _) =
                    embed::ensure_content_type(&state.content_types_xml, &extension, &mime)?;
                state.content_types_xml = content_types;
                state.media.push(embedded.media);
            }
        }
    }

    Ok(state)
}
