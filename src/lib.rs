mod docx;
mod embed;
mod error;
mod fields;
mod package;

pub use docx::{PageGeometry, read_page_geometry};
pub use embed::{FetchedImage, ImageFetcher, MediaRecord};
pub use error::Error;
pub use fields::{FieldValue, ImageErrorPolicy, TemplateField};
pub use package::{CONTENT_TYPES_PART, DOCUMENT_PART, MEDIA_DIR, Package, RELS_PART};

use std::path::Path;
use std::time::Instant;

/// An `ImageFetcher` for text-only templates: any `img_url` field whose value
/// needs fetching is reported as unresolvable.
pub struct NoFetcher;

impl ImageFetcher for NoFetcher {
    fn fetch(&self, reference: &str) -> Result<FetchedImage, String> {
        Err(format!("no image fetcher configured for '{reference}'"))
    }
}

pub fn fill_template(
    input: &Path,
    output: &Path,
    fields: Vec<(String, FieldValue)>,
    fetcher: &dyn ImageFetcher,
) -> Result<(), Error> {
    let t0 = Instant::now();

    let input_bytes = std::fs::read(input).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => Error::Io(
            std::io::Error::new(e.kind(), format!("{}: {}", e, input.display())),
        ),
        _ => Error::Io(e),
    })?;
    let t_read = t0.elapsed();

    let bytes = fill_template_bytes(&input_bytes, fields, fetcher)?;
    let t_fill = t0.elapsed();

    std::fs::write(output, &bytes).map_err(Error::Io)?;
    let t_total = t0.elapsed();

    log::info!(
        "Timing: read={:.1}ms, fill={:.1}ms, write={:.1}ms, total={:.1}ms (output {} bytes)",
        t_read.as_secs_f64() * 1000.0,
        (t_fill - t_read).as_secs_f64() * 1000.0,
        (t_total - t_fill).as_secs_f64() * 1000.0,
        t_total.as_secs_f64() * 1000.0,
        bytes.len(),
    );

    Ok(())
}

pub fn fill_template_bytes(
    input: &[u8],
    fields: Vec<(String, FieldValue)>,
    fetcher: &dyn ImageFetcher,
) -> Result<Vec<u8>, Error> {
    fill_template_bytes_with_progress(input, fields, fetcher, ImageErrorPolicy::Abort, &mut |_| {})
}

/// Fills a template, reporting coarse progress percentages at fixed
/// milestones: 20 archive opened, 30 parts read, 80 substitution complete,
/// 90 archive serialized. Purely observational.
pub fn fill_template_bytes_with_progress(
    input: &[u8],
    fields: Vec<(String, FieldValue)>,
    fetcher: &dyn ImageFetcher,
    image_errors: ImageErrorPolicy,
    progress: &mut dyn FnMut(u8),
) -> Result<Vec<u8>, Error> {
    let fields = TemplateField::parse_all(fields)?;

    let mut package = Package::open(input)?;
    progress(20);

    let document_xml = package.read_part_text(DOCUMENT_PART)?;
    let rels_xml = package.read_part_text(RELS_PART)?;
    let content_types_xml = package.read_part_text(CONTENT_TYPES_PART)?;
    progress(30);

    let geometry = docx::read_page_geometry(&document_xml);
    if let Some(geo) = geometry {
        log::debug!(
            "page geometry: width={} twips, available={} twips",
            geo.page_width_twips,
            geo.available_width_twips()
        );
    }

    let media_filenames = package.media_filenames();
    let result = fields::fill_fields(
        document_xml,
        rels_xml,
        content_types_xml,
        &media_filenames,
        fields,
        fetcher,
        geometry,
        image_errors,
    )?;
    progress(80);

    package.write_part(DOCUMENT_PART, result.document_xml)?;
    package.write_part(RELS_PART, result.rels_xml)?;
    package.write_part(CONTENT_TYPES_PART, result.content_types_xml)?;
    for media in result.media {
        package.add_media(&media.filename, media.bytes);
    }

    let bytes = package.serialize()?;
    progress(90);

    Ok(bytes)
}
