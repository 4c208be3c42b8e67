use anyhow::{Context, Result};
use clap::Parser;
use image::DynamicImage;
use serde_json::Value;
use std::path::{Path, PathBuf};

use xmp_save::config;
use xmp_save::metadata::{self, WorkflowContext};
use xmp_save::pipeline::{self, ImageType, SaveRequest};
use xmp_save::xmp::{MetadataField, MetadataValue, XmpFields};

#[derive(Parser, Debug)]
#[command(
    name = "xmp-save",
    version,
    about = "Save images as JPEG, PNG or WebP with embedded XMP metadata"
)]
struct Cli {
    /// Image files or directories to save as one batch
    #[arg(value_name = "PATH")]
    paths: Vec<PathBuf>,

    /// Path to config file (default: config.json next to binary)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Initialize a default config.json and exit
    #[arg(long)]
    init: bool,

    /// Output type: jpeg, png, png_with_workflow, lossless_webp, webp
    #[arg(short = 't', long = "type", value_name = "TYPE")]
    image_type: Option<ImageType>,

    /// Filename prefix, may include subfolders, %width%, %height% and %batch_num%
    #[arg(short, long)]
    prefix: Option<String>,

    /// Output root directory
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// dc:creator (repeat for one value per image)
    #[arg(long)]
    creator: Vec<String>,

    /// dc:rights
    #[arg(long)]
    rights: Vec<String>,

    /// dc:title
    #[arg(long)]
    title: Vec<String>,

    /// dc:description
    #[arg(long)]
    description: Vec<String>,

    /// dc:subject, comma-separated keywords
    #[arg(long)]
    subject: Vec<String>,

    /// photoshop:Instructions
    #[arg(long)]
    instructions: Vec<String>,

    /// exif:UserComment
    #[arg(long)]
    comment: Vec<String>,

    /// Iptc4xmpCore:AltTextAccessibility
    #[arg(long)]
    alt_text: Vec<String>,

    /// Iptc4xmpCore:ExtDescrAccessibility
    #[arg(long)]
    ext_description: Vec<String>,

    /// Embed this XMP packet verbatim instead of building one from fields
    #[arg(long, value_name = "XML")]
    xml_string: Option<String>,

    /// JSON file with the prompt graph (png_with_workflow only)
    #[arg(long, value_name = "FILE")]
    prompt: Option<PathBuf>,

    /// JSON object file with extra PNG info (png_with_workflow only)
    #[arg(long, value_name = "FILE")]
    extra_pnginfo: Option<PathBuf>,

    /// Print the embedded XMP packet of each image and exit
    #[arg(long = "show-xmp")]
    show_xmp: bool,

    /// Output save records as JSON
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Metadata given on the command line; one value is shared by the batch.
    fn fields(&self) -> XmpFields {
        let mut fields = XmpFields::default();
        for field in MetadataField::ALL {
            let values = match field {
                MetadataField::Creator => &self.creator,
                MetadataField::Rights => &self.rights,
                MetadataField::Title => &self.title,
                MetadataField::Description => &self.description,
                MetadataField::Subject => &self.subject,
                MetadataField::Instructions => &self.instructions,
                MetadataField::Comment => &self.comment,
                MetadataField::AltText => &self.alt_text,
                MetadataField::ExtDescription => &self.ext_description,
            };
            let value = match values.as_slice() {
                [] => None,
                [single] => Some(MetadataValue::Scalar(single.clone())),
                many => Some(MetadataValue::PerBatch(many.to_vec())),
            };
            fields.set(field, value);
        }
        fields
    }

    fn workflow(&self) -> Result<Option<WorkflowContext>> {
        if self.prompt.is_none() && self.extra_pnginfo.is_none() {
            return Ok(None);
        }

        let prompt = self.prompt.as_deref().map(read_json).transpose()?;
        let extra_pnginfo = match self.extra_pnginfo.as_deref().map(read_json).transpose()? {
            Some(Value::Object(map)) => Some(map),
            Some(_) => anyhow::bail!("--extra-pnginfo must contain a JSON object"),
            None => None,
        };
        Ok(Some(WorkflowContext {
            prompt,
            extra_pnginfo,
        }))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Handle --init
    if cli.init {
        let config = config::Config::default();
        let path = cli.config.as_deref();
        config.save(path)?;
        let save_path = match path {
            Some(p) => p.to_path_buf(),
            None => config::Config::config_path()?,
        };
        println!("Default config written to {}", save_path.display());
        return Ok(());
    }

    if cli.paths.is_empty() {
        anyhow::bail!("No input files or directories specified. Use --help for usage.");
    }

    let inputs = pipeline::collect_images(&cli.paths);
    if inputs.is_empty() {
        anyhow::bail!("No supported image files found in the specified paths.");
    }

    // Handle --show-xmp
    if cli.show_xmp {
        for path in &inputs {
            print_xmp(path)?;
        }
        return Ok(());
    }

    let mut config = config::Config::load(cli.config.as_deref())?;
    if let Some(ref output) = cli.output {
        config.output.directory = output.clone();
    }

    let image_type = cli.image_type.unwrap_or(config.defaults.image_type);
    let mut request = SaveRequest::new(image_type);
    request.filename_prefix = cli
        .prefix
        .clone()
        .unwrap_or_else(|| config.defaults.filename_prefix.clone());
    request.fields = cli.fields().with_defaults(&config.defaults.metadata);
    request.xml_string = cli.xml_string.clone();
    request.workflow = cli.workflow()?;

    if request.workflow.is_some() && !image_type.embeds_workflow() {
        log::warn!("--prompt/--extra-pnginfo are only embedded by png_with_workflow; ignoring");
    }

    log::info!("Found {} image(s) to save as {image_type}", inputs.len());
    let mut images = Vec::with_capacity(inputs.len());
    for path in &inputs {
        let image = image::open(path)
            .with_context(|| format!("Failed to decode {}", path.display()))?;
        images.push(prepare_pixels(image, image_type));
    }

    let outcome = pipeline::save_images(&config.output_folder(), &images, &request)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        for record in outcome.records() {
            let location = Path::new(&record.subfolder).join(&record.filename);
            log::info!("  Saved: {}", location.display());
        }
    }

    log::info!(
        "Done: {} image(s) written to {}",
        outcome.records().len(),
        config.output.directory.display()
    );
    Ok(())
}

/// Convert decoded pixels into a layout the target encoder accepts.
fn prepare_pixels(image: DynamicImage, image_type: ImageType) -> DynamicImage {
    match image_type {
        ImageType::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()),
        ImageType::LosslessWebp | ImageType::Webp => {
            if image.color().has_alpha() {
                DynamicImage::ImageRgba8(image.to_rgba8())
            } else {
                DynamicImage::ImageRgb8(image.to_rgb8())
            }
        }
        ImageType::Png | ImageType::PngWithWorkflow => match image {
            DynamicImage::ImageRgb32F(_) => DynamicImage::ImageRgb16(image.to_rgb16()),
            DynamicImage::ImageRgba32F(_) => DynamicImage::ImageRgba16(image.to_rgba16()),
            other => other,
        },
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}

// ANSI color codes
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";

/// Print the XMP packet and, for PNG, the other text chunks of a file.
fn print_xmp(path: &Path) -> Result<()> {
    println!();
    println!("{BOLD}File:{RESET} {}", path.display());
    println!("{DIM}{}{RESET}", "═".repeat(72));

    match metadata::read_xmp(path)? {
        Some(xmp) => println!("{xmp}"),
        None => println!("  {DIM}(no XMP metadata found){RESET}"),
    }

    let is_png = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("png"));
    if is_png {
        let mut text = metadata::read_png_text(path)?;
        text.remove(metadata::XMP_KEYWORD);
        if !text.is_empty() {
            println!("{DIM}{}{RESET}", "─".repeat(72));
            println!("  {BOLD}PNG text{RESET}");
            for (key, value) in &text {
                println!("  {key:<22} : {value}");
            }
        }
    }

    println!();
    Ok(())
}
