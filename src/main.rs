use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;

use docx_fill::{Error, FetchedImage, FieldValue, ImageErrorPolicy, ImageFetcher};

/// Fill {{placeholder}} tokens in a DOCX template with text and images.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Template DOCX file
    input: PathBuf,

    /// Output DOCX file
    output: PathBuf,

    /// Text field, e.g. --set txt__first_name=John (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_pair)]
    set: Vec<(String, String)>,

    /// Image field whose value is a local file, e.g.
    /// --image img_url__photo=photo.png (repeatable)
    #[arg(long = "image", value_name = "KEY=PATH", value_parser = parse_pair)]
    image: Vec<(String, String)>,

    /// Leave placeholders of unreadable images unresolved instead of failing
    #[arg(long)]
    skip_failed_images: bool,
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))
}

/// Resolves image references as local file paths; the MIME subtype is
/// sniffed from the bytes by the engine.
struct FileFetcher;

impl ImageFetcher for FileFetcher {
    fn fetch(&self, reference: &str) -> Result<FetchedImage, String> {
        let bytes = std::fs::read(Path::new(reference))
            .map_err(|e| format!("{}: {e}", reference))?;
        let subtype = image::guess_format(&bytes)
            .map_err(|e| e.to_string())
            .and_then(|f| match f {
                image::ImageFormat::Png => Ok("png".to_string()),
                image::ImageFormat::Jpeg => Ok("jpeg".to_string()),
                image::ImageFormat::Gif => Ok("gif".to_string()),
                other => Err(format!("unsupported image format {other:?}")),
            })?;
        Ok(FetchedImage { bytes, subtype })
    }
}

fn run(args: Args) -> Result<(), Error> {
    let mut fields: Vec<(String, FieldValue)> = Vec::new();
    for (key, value) in args.set {
        fields.push((key, FieldValue::Text(value)));
    }
    for (key, path) in args.image {
        fields.push((key, FieldValue::Text(path)));
    }

    let policy = if args.skip_failed_images {
        ImageErrorPolicy::Skip
    } else {
        ImageErrorPolicy::Abort
    };

    let input = std::fs::read(&args.input)?;
    let output = docx_fill::fill_template_bytes_with_progress(
        &input,
        fields,
        &FileFetcher,
        policy,
        &mut |pct| log::debug!("progress: {pct}%"),
    )?;
    std::fs::write(&args.output, output)?;
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
