use anyhow::{Context, Result};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use walkdir::WalkDir;

use crate::error::SaveError;
use crate::metadata::{WorkflowContext, save_image};
use crate::xmp::{XmpFields, build_xmp};

/// Filename prefix used when the caller does not supply one.
pub const DEFAULT_FILENAME_PREFIX: &str = "ComfyUI";

/// Extensions accepted as CLI input images.
const INPUT_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// The output format of a save request.
///
/// Each variant maps to exactly one file extension and one container codec.
/// [`ImageType::Png`] and [`ImageType::PngWithWorkflow`] share the PNG codec;
/// only the latter embeds the generating workflow.
///
/// # Example
///
/// ```rust
/// use xmp_save::pipeline::ImageType;
///
/// assert_eq!(ImageType::PngWithWorkflow.extension(), "png");
/// assert_eq!(ImageType::LosslessWebp.codec(), "webp");
/// assert_eq!("lossless_webp".parse::<ImageType>().unwrap(), ImageType::LosslessWebp);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageType {
    /// JPEG, XMP in an APP1 segment
    #[default]
    Jpeg,
    /// PNG, XMP in a compressed iTXt chunk
    Png,
    /// PNG with the prompt graph and extra info as additional text chunks
    PngWithWorkflow,
    /// Lossless WebP, XMP in the `XMP ` RIFF chunk
    LosslessWebp,
    /// Lossy WebP, XMP in the `XMP ` RIFF chunk
    Webp,
}

impl ImageType {
    pub const ALL: [ImageType; 5] = [
        ImageType::Jpeg,
        ImageType::Png,
        ImageType::PngWithWorkflow,
        ImageType::LosslessWebp,
        ImageType::Webp,
    ];

    /// File extension of saved images, without the dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png | Self::PngWithWorkflow => "png",
            Self::LosslessWebp | Self::Webp => "webp",
        }
    }

    /// Container codec used to write this type.
    pub fn codec(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png | Self::PngWithWorkflow => "png",
            Self::LosslessWebp | Self::Webp => "webp",
        }
    }

    /// Whether a workflow context is embedded alongside the XMP packet.
    pub fn embeds_workflow(&self) -> bool {
        matches!(self, Self::PngWithWorkflow)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::PngWithWorkflow => "png_with_workflow",
            Self::LosslessWebp => "lossless_webp",
            Self::Webp => "webp",
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ImageType {
    type Err = SaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            "png_with_workflow" => Ok(Self::PngWithWorkflow),
            "lossless_webp" => Ok(Self::LosslessWebp),
            "webp" => Ok(Self::Webp),
            _ => Err(SaveError::UnknownImageType(s.to_string())),
        }
    }
}

/// File extension for an image type. Total over [`ImageType`].
pub fn extension_for_type(image_type: ImageType) -> &'static str {
    image_type.extension()
}

/// Which host folder a saved image landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    #[default]
    Output,
    Temp,
    Input,
}

/// One saved image, as reported to the host UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveRecord {
    pub filename: String,
    pub subfolder: String,
    #[serde(rename = "type")]
    pub kind: OutputKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiOutput {
    pub images: Vec<SaveRecord>,
}

/// Result of [`save_images`]: serializes to `{"ui": {"images": [...]}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveOutcome {
    pub ui: UiOutput,
}

impl SaveOutcome {
    pub fn records(&self) -> &[SaveRecord] {
        &self.ui.images
    }
}

/// Everything a batch save needs besides the images themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveRequest {
    pub image_type: ImageType,
    pub filename_prefix: String,
    pub fields: XmpFields,
    /// Raw XMP packet used verbatim instead of `fields` when non-empty.
    pub xml_string: Option<String>,
    /// Only embedded for [`ImageType::PngWithWorkflow`].
    pub workflow: Option<WorkflowContext>,
}

impl SaveRequest {
    pub fn new(image_type: ImageType) -> Self {
        Self {
            image_type,
            ..Default::default()
        }
    }
}

impl Default for SaveRequest {
    fn default() -> Self {
        Self {
            image_type: ImageType::default(),
            filename_prefix: DEFAULT_FILENAME_PREFIX.to_string(),
            fields: XmpFields::default(),
            xml_string: None,
            workflow: None,
        }
    }
}

/// Where a batch goes on disk, as decided by a [`PathPlanner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavePlan {
    pub full_output_folder: PathBuf,
    /// Filename stem; `%batch_num%` is replaced by the batch index.
    pub filename: String,
    /// Counter of the first image; incremented per image.
    pub counter: u32,
    pub subfolder: String,
    pub filename_prefix: String,
}

/// Resolves destination folders and counters for a batch.
///
/// Implement this to plug in a host's own output-path service;
/// [`OutputFolder`] is the filesystem-backed default.
pub trait PathPlanner {
    fn plan(&self, filename_prefix: &str, width: u32, height: u32) -> Result<SavePlan>;
    fn kind(&self) -> OutputKind;
}

/// Save a batch of images with embedded XMP metadata.
///
/// The batch is planned once (from the first image's dimensions), then each
/// image is written as `{filename}_{counter:05}_.{ext}` with the metadata
/// resolved for its batch index. Images are saved in order; if one fails,
/// the files already written stay on disk and the error is returned as is.
///
/// # Errors
///
/// - [`SaveError::NoImages`] for an empty batch, before any planning or I/O
/// - [`SaveError::BatchIndexOutOfRange`] when a per-batch field list is
///   shorter than the batch
/// - [`SaveError::CounterExhausted`] when the batch would run the counter
///   past `u32::MAX`, before any file is written
/// - encoding and I/O failures from [`save_image`]
///
/// # Example
///
/// ```rust,no_run
/// use xmp_save::pipeline::{ImageType, OutputFolder, OutputKind, SaveRequest, save_images};
///
/// # fn example() -> anyhow::Result<()> {
/// let image = image::open("render.png")?;
/// let planner = OutputFolder::new("output", OutputKind::Output);
///
/// let mut request = SaveRequest::new(ImageType::Png);
/// request.fields.creator = Some("Jane Doe".into());
/// request.fields.title = Some("Harbor at dawn".into());
///
/// let outcome = save_images(&planner, &[image], &request)?;
/// println!("{}", serde_json::to_string(&outcome)?);
/// # Ok(())
/// # }
/// ```
pub fn save_images<P: PathPlanner + ?Sized>(
    planner: &P,
    images: &[DynamicImage],
    request: &SaveRequest,
) -> Result<SaveOutcome> {
    let first = images.first().ok_or(SaveError::NoImages)?;

    let plan = planner.plan(&request.filename_prefix, first.width(), first.height())?;
    let extension = request.image_type.extension();
    let workflow = if request.image_type.embeds_workflow() {
        request.workflow.as_ref()
    } else {
        None
    };

    let last_offset = u32::try_from(images.len() - 1).ok();
    if last_offset.and_then(|n| plan.counter.checked_add(n)).is_none() {
        return Err(SaveError::CounterExhausted {
            folder: plan.full_output_folder.clone(),
            filename: plan.filename.clone(),
        }
        .into());
    }

    let mut records = Vec::with_capacity(images.len());

    for (batch_index, image) in images.iter().enumerate() {
        let counter = plan.counter + batch_index as u32;
        let stem = plan.filename.replace("%batch_num%", &batch_index.to_string());
        let filename = format!("{stem}_{counter:05}_.{extension}");
        let path = plan.full_output_folder.join(&filename);

        let xmp = build_xmp(&request.fields, request.xml_string.as_deref(), batch_index)?;
        save_image(image, request.image_type, &path, &xmp, workflow)?;

        log::debug!(
            "[{}/{}] Saved {}",
            batch_index + 1,
            images.len(),
            path.display()
        );

        records.push(SaveRecord {
            filename,
            subfolder: plan.subfolder.clone(),
            kind: planner.kind(),
        });
    }

    log::info!(
        "Saved {} image(s) as {} to {}",
        records.len(),
        request.image_type,
        plan.full_output_folder.display()
    );

    Ok(SaveOutcome {
        ui: UiOutput { images: records },
    })
}

/// Filesystem [`PathPlanner`] rooted at an output directory.
///
/// The filename prefix may name a subfolder (`portraits/img`) and may use
/// `%width%` / `%height%`. Counters continue after the highest
/// `{filename}_NNNNN_` file already in the folder.
#[derive(Debug, Clone)]
pub struct OutputFolder {
    root: PathBuf,
    kind: OutputKind,
}

impl OutputFolder {
    pub fn new(root: impl Into<PathBuf>, kind: OutputKind) -> Self {
        Self {
            root: root.into(),
            kind,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl PathPlanner for OutputFolder {
    fn plan(&self, filename_prefix: &str, width: u32, height: u32) -> Result<SavePlan> {
        let prefix = filename_prefix
            .replace("%width%", &width.to_string())
            .replace("%height%", &height.to_string());
        let prefix_path = Path::new(&prefix);

        if prefix_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(SaveError::OutsideOutputFolder {
                path: self.root.join(prefix_path),
            }
            .into());
        }

        let subfolder = prefix_path.parent().unwrap_or_else(|| Path::new(""));
        let filename = prefix_path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();

        let full_output_folder = self.root.join(subfolder);
        std::fs::create_dir_all(&full_output_folder).with_context(|| {
            format!(
                "Failed to create output folder {}",
                full_output_folder.display()
            )
        })?;

        let counter = next_counter(&full_output_folder, &filename)?;

        Ok(SavePlan {
            full_output_folder,
            filename,
            counter,
            subfolder: subfolder.to_string_lossy().into_owned(),
            filename_prefix: prefix,
        })
    }

    fn kind(&self) -> OutputKind {
        self.kind
    }
}

/// One past the highest `{filename}_NNNNN_` counter in `folder`, or 1.
///
/// `%batch_num%` in `filename` matches any batch index, so files from
/// earlier batches of the same prefix are counted.
fn next_counter(folder: &Path, filename: &str) -> Result<u32> {
    let mut highest: Option<u32> = None;

    let entries = std::fs::read_dir(folder)
        .with_context(|| format!("Failed to list output folder {}", folder.display()))?;
    for entry in entries {
        let entry = entry.context("Failed to read an output folder entry")?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(counter) = parse_counter(name, filename) {
            highest = highest.max(Some(counter));
        }
    }

    match highest {
        None => Ok(1),
        Some(n) => n.checked_add(1).ok_or_else(|| {
            SaveError::CounterExhausted {
                folder: folder.to_path_buf(),
                filename: filename.to_string(),
            }
            .into()
        }),
    }
}

/// Counter of a saved `{stem}_NNNNN_.{ext}` file whose stem matches `filename`.
fn parse_counter(name: &str, filename: &str) -> Option<u32> {
    let (base, _ext) = name.rsplit_once('.')?;
    let (stem, digits) = base.strip_suffix('_')?.rsplit_once('_')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !stem_matches(stem, filename) {
        return None;
    }
    digits.parse().ok()
}

fn stem_matches(stem: &str, pattern: &str) -> bool {
    match pattern.split_once("%batch_num%") {
        None => stem == pattern,
        Some((before, rest)) => {
            let Some(tail) = stem.strip_prefix(before) else {
                return false;
            };
            let digits = tail.bytes().take_while(u8::is_ascii_digit).count();
            (1..=digits).any(|n| stem_matches(&tail[n..], rest))
        }
    }
}

/// Gather input images for one batch, sorted by path.
///
/// Directories are walked recursively. Files that are not JPEG, PNG or
/// WebP are left out, and a warning names each one given explicitly.
pub fn collect_images(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut images = Vec::new();

    for root in paths {
        if !root.exists() {
            log::warn!("Input path not found: {}", root.display());
            continue;
        }

        let explicit = root.is_file();
        for entry in WalkDir::new(root)
            .follow_links(true)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            if is_supported_image(entry.path()) {
                images.push(entry.into_path());
            } else if explicit {
                log::warn!("Not a JPEG, PNG or WebP input, skipping {}", root.display());
            }
        }
    }

    images.sort();
    images.dedup();
    images
}

fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| INPUT_EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{read_png_text, read_xmp};
    use image::{Rgb, RgbImage};
    use serde_json::json;
    use std::cell::Cell;
    use std::fs;
    use tempfile::TempDir;

    /// Planner returning a fixed plan, counting how often it is asked.
    struct FixedPlanner {
        folder: PathBuf,
        calls: Cell<usize>,
    }

    impl FixedPlanner {
        fn new(folder: &Path) -> Self {
            Self {
                folder: folder.to_path_buf(),
                calls: Cell::new(0),
            }
        }
    }

    impl PathPlanner for FixedPlanner {
        fn plan(&self, filename_prefix: &str, _width: u32, _height: u32) -> Result<SavePlan> {
            self.calls.set(self.calls.get() + 1);
            Ok(SavePlan {
                full_output_folder: self.folder.clone(),
                filename: "mock_filename".to_string(),
                counter: 0,
                subfolder: "mock_subfolder".to_string(),
                filename_prefix: filename_prefix.to_string(),
            })
        }

        fn kind(&self) -> OutputKind {
            OutputKind::Output
        }
    }

    fn sample_image() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(16, 12, |x, y| {
            Rgb([(x * 15) as u8, (y * 20) as u8, 90])
        }))
    }

    // ── ImageType ────────────────────────────────────────────────────

    #[test]
    fn extension_for_each_type() {
        assert_eq!(extension_for_type(ImageType::Jpeg), "jpg");
        assert_eq!(extension_for_type(ImageType::Png), "png");
        assert_eq!(extension_for_type(ImageType::PngWithWorkflow), "png");
        assert_eq!(extension_for_type(ImageType::LosslessWebp), "webp");
        assert_eq!(extension_for_type(ImageType::Webp), "webp");
    }

    #[test]
    fn extension_matches_codec() {
        for image_type in ImageType::ALL {
            assert!(["jpg", "png", "webp"].contains(&image_type.extension()));
            assert_eq!(image_type.extension(), image_type.codec());
        }
    }

    #[test]
    fn only_png_with_workflow_embeds_workflow() {
        let embedding: Vec<ImageType> = ImageType::ALL
            .into_iter()
            .filter(|t| t.embeds_workflow())
            .collect();
        assert_eq!(embedding, [ImageType::PngWithWorkflow]);
    }

    #[test]
    fn image_type_parse_and_display() {
        for image_type in ImageType::ALL {
            let parsed: ImageType = image_type.to_string().parse().unwrap();
            assert_eq!(parsed, image_type);
        }
        assert_eq!("JPG".parse::<ImageType>().unwrap(), ImageType::Jpeg);
        assert_eq!("Lossless-WebP".parse::<ImageType>().unwrap(), ImageType::LosslessWebp);
        assert_eq!(
            "gif".parse::<ImageType>().unwrap_err(),
            SaveError::UnknownImageType("gif".to_string())
        );
    }

    #[test]
    fn image_type_serde_names() {
        assert_eq!(
            serde_json::to_string(&ImageType::PngWithWorkflow).unwrap(),
            "\"png_with_workflow\""
        );
        let parsed: ImageType = serde_json::from_str("\"lossless_webp\"").unwrap();
        assert_eq!(parsed, ImageType::LosslessWebp);
    }

    // ── save_images ──────────────────────────────────────────────────

    #[test]
    fn save_images_no_images() {
        let dir = TempDir::new().unwrap();
        let planner = FixedPlanner::new(dir.path());

        for image_type in ImageType::ALL {
            let err = save_images(&planner, &[], &SaveRequest::new(image_type)).unwrap_err();
            assert_eq!(err.downcast_ref::<SaveError>(), Some(&SaveError::NoImages));
            assert_eq!(err.to_string(), "No images to save.");
        }
        assert_eq!(planner.calls.get(), 0);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn save_images_jpeg() {
        let dir = TempDir::new().unwrap();
        let planner = FixedPlanner::new(dir.path());

        let outcome =
            save_images(&planner, &[sample_image()], &SaveRequest::new(ImageType::Jpeg)).unwrap();

        assert_eq!(outcome.records().len(), 1);
        let record = &outcome.records()[0];
        assert_eq!(record.filename, "mock_filename_00000_.jpg");
        assert_eq!(record.subfolder, "mock_subfolder");
        assert_eq!(record.kind, OutputKind::Output);
        assert!(dir.path().join(&record.filename).exists());
        assert_eq!(planner.calls.get(), 1);
    }

    #[test]
    fn save_images_extension_matches_type() {
        for image_type in ImageType::ALL {
            let dir = TempDir::new().unwrap();
            let planner = FixedPlanner::new(dir.path());
            let outcome =
                save_images(&planner, &[sample_image()], &SaveRequest::new(image_type)).unwrap();
            assert_eq!(outcome.records().len(), 1);
            assert!(
                outcome.records()[0]
                    .filename
                    .ends_with(&format!(".{}", image_type.extension())),
                "wrong extension for {image_type}"
            );
        }
    }

    #[test]
    fn save_images_png_with_workflow() {
        let dir = TempDir::new().unwrap();
        let planner = FixedPlanner::new(dir.path());

        let mut request = SaveRequest::new(ImageType::PngWithWorkflow);
        let mut extra = serde_json::Map::new();
        extra.insert("workflow".to_string(), json!({"nodes": []}));
        request.workflow = Some(WorkflowContext {
            prompt: Some(json!({"3": {"class_type": "KSampler"}})),
            extra_pnginfo: Some(extra),
        });

        let outcome = save_images(&planner, &[sample_image()], &request).unwrap();
        let path = dir.path().join(&outcome.records()[0].filename);
        assert!(outcome.records()[0].filename.ends_with(".png"));

        let text = read_png_text(&path).unwrap();
        assert!(text.contains_key("prompt"));
        assert!(text.contains_key("workflow"));
    }

    #[test]
    fn save_images_plain_png_drops_workflow() {
        let dir = TempDir::new().unwrap();
        let planner = FixedPlanner::new(dir.path());

        let mut request = SaveRequest::new(ImageType::Png);
        request.workflow = Some(WorkflowContext {
            prompt: Some(json!("Test Prompt")),
            extra_pnginfo: None,
        });

        let outcome = save_images(&planner, &[sample_image()], &request).unwrap();
        let path = dir.path().join(&outcome.records()[0].filename);
        let text = read_png_text(&path).unwrap();
        assert!(!text.contains_key("prompt"));
    }

    #[test]
    fn save_images_with_metadata() {
        let dir = TempDir::new().unwrap();
        let planner = FixedPlanner::new(dir.path());

        let mut request = SaveRequest::new(ImageType::Png);
        request.fields.creator = Some("Test Creator".into());
        request.fields.title = Some("Test Title".into());
        request.fields.description = Some("Test Description".into());

        let outcome = save_images(&planner, &[sample_image()], &request).unwrap();
        assert_eq!(outcome.records().len(), 1);

        let path = dir.path().join(&outcome.records()[0].filename);
        let xmp = read_xmp(&path).unwrap().unwrap();
        assert!(xmp.contains("Test Creator"));
        assert!(xmp.contains("Test Title"));
        assert!(xmp.contains("Test Description"));
    }

    #[test]
    fn save_images_batch_resolves_per_item() {
        let dir = TempDir::new().unwrap();
        let planner = FixedPlanner::new(dir.path());

        let mut request = SaveRequest::new(ImageType::Jpeg);
        request.fields.title = Some(vec!["First", "Second", "Third"].into());
        request.fields.rights = Some("CC0".into());

        let images = vec![sample_image(), sample_image(), sample_image()];
        let outcome = save_images(&planner, &images, &request).unwrap();

        let names: Vec<&str> = outcome.records().iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(
            names,
            [
                "mock_filename_00000_.jpg",
                "mock_filename_00001_.jpg",
                "mock_filename_00002_.jpg"
            ]
        );

        for (record, title) in outcome.records().iter().zip(["First", "Second", "Third"]) {
            let xmp = read_xmp(&dir.path().join(&record.filename)).unwrap().unwrap();
            assert!(xmp.contains(title));
            assert!(xmp.contains("CC0"));
        }
        assert_eq!(planner.calls.get(), 1);
    }

    #[test]
    fn save_images_xml_string_override() {
        let dir = TempDir::new().unwrap();
        let planner = FixedPlanner::new(dir.path());

        let mut request = SaveRequest::new(ImageType::LosslessWebp);
        request.fields.title = Some("ignored".into());
        request.xml_string = Some("<x:xmpmeta>raw</x:xmpmeta>".to_string());

        let outcome = save_images(&planner, &[sample_image()], &request).unwrap();
        let xmp = read_xmp(&dir.path().join(&outcome.records()[0].filename))
            .unwrap()
            .unwrap();
        assert_eq!(xmp, "<x:xmpmeta>raw</x:xmpmeta>");
    }

    #[test]
    fn save_images_batch_num_placeholder() {
        struct BatchPlanner(PathBuf);
        impl PathPlanner for BatchPlanner {
            fn plan(&self, prefix: &str, _: u32, _: u32) -> Result<SavePlan> {
                Ok(SavePlan {
                    full_output_folder: self.0.clone(),
                    filename: "img_%batch_num%".to_string(),
                    counter: 7,
                    subfolder: String::new(),
                    filename_prefix: prefix.to_string(),
                })
            }
            fn kind(&self) -> OutputKind {
                OutputKind::Temp
            }
        }

        let dir = TempDir::new().unwrap();
        let planner = BatchPlanner(dir.path().to_path_buf());
        let outcome = save_images(
            &planner,
            &[sample_image(), sample_image()],
            &SaveRequest::new(ImageType::Png),
        )
        .unwrap();

        assert_eq!(outcome.records()[0].filename, "img_0_00007_.png");
        assert_eq!(outcome.records()[1].filename, "img_1_00008_.png");
        assert_eq!(outcome.records()[1].kind, OutputKind::Temp);
    }

    #[test]
    fn save_images_short_list_keeps_earlier_files() {
        let dir = TempDir::new().unwrap();
        let planner = FixedPlanner::new(dir.path());

        let mut request = SaveRequest::new(ImageType::Png);
        request.fields.title = Some(vec!["Only one"].into());

        let err = save_images(&planner, &[sample_image(), sample_image()], &request).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SaveError>(),
            Some(SaveError::BatchIndexOutOfRange { index: 1, len: 1, .. })
        ));

        // No rollback: the first image stays on disk
        assert!(dir.path().join("mock_filename_00000_.png").exists());
        assert!(!dir.path().join("mock_filename_00001_.png").exists());
    }

    #[test]
    fn save_images_counter_exhausted_writes_nothing() {
        struct LastCounterPlanner(PathBuf);
        impl PathPlanner for LastCounterPlanner {
            fn plan(&self, prefix: &str, _: u32, _: u32) -> Result<SavePlan> {
                Ok(SavePlan {
                    full_output_folder: self.0.clone(),
                    filename: "last".to_string(),
                    counter: u32::MAX,
                    subfolder: String::new(),
                    filename_prefix: prefix.to_string(),
                })
            }
            fn kind(&self) -> OutputKind {
                OutputKind::Output
            }
        }

        let dir = TempDir::new().unwrap();
        let planner = LastCounterPlanner(dir.path().to_path_buf());
        let request = SaveRequest::new(ImageType::Png);

        let err = save_images(&planner, &[sample_image(), sample_image()], &request).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SaveError>(),
            Some(SaveError::CounterExhausted { .. })
        ));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);

        let outcome = save_images(&planner, &[sample_image()], &request).unwrap();
        assert_eq!(outcome.records()[0].filename, "last_4294967295_.png");
    }

    #[test]
    fn save_outcome_json_shape() {
        let outcome = SaveOutcome {
            ui: UiOutput {
                images: vec![SaveRecord {
                    filename: "a_00001_.png".to_string(),
                    subfolder: "sub".to_string(),
                    kind: OutputKind::Output,
                }],
            },
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(
            value,
            json!({
                "ui": {
                    "images": [{"filename": "a_00001_.png", "subfolder": "sub", "type": "output"}]
                }
            })
        );
    }

    // ── OutputFolder ─────────────────────────────────────────────────

    #[test]
    fn output_folder_first_counter() {
        let dir = TempDir::new().unwrap();
        let planner = OutputFolder::new(dir.path(), OutputKind::Output);
        let plan = planner.plan("ComfyUI", 64, 64).unwrap();
        assert_eq!(plan.counter, 1);
        assert_eq!(plan.filename, "ComfyUI");
        assert_eq!(plan.subfolder, "");
        assert_eq!(plan.full_output_folder, dir.path());
    }

    #[test]
    fn output_folder_continues_counter() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("ComfyUI_00004_.png"), b"x").unwrap();
        fs::write(dir.path().join("ComfyUI_00012_.jpg"), b"x").unwrap();
        fs::write(dir.path().join("Other_00099_.png"), b"x").unwrap();

        let planner = OutputFolder::new(dir.path(), OutputKind::Output);
        let plan = planner.plan("ComfyUI", 64, 64).unwrap();
        assert_eq!(plan.counter, 13);
    }

    #[test]
    fn output_folder_subfolder_and_dimensions() {
        let dir = TempDir::new().unwrap();
        let planner = OutputFolder::new(dir.path(), OutputKind::Output);
        let plan = planner.plan("portraits/img_%width%x%height%", 512, 768).unwrap();

        assert_eq!(plan.subfolder, "portraits");
        assert_eq!(plan.filename, "img_512x768");
        assert_eq!(plan.full_output_folder, dir.path().join("portraits"));
        assert!(plan.full_output_folder.is_dir());
    }

    #[test]
    fn output_folder_rejects_escape() {
        let dir = TempDir::new().unwrap();
        let planner = OutputFolder::new(dir.path(), OutputKind::Output);
        let err = planner.plan("../outside/img", 8, 8).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SaveError>(),
            Some(SaveError::OutsideOutputFolder { .. })
        ));
    }

    #[test]
    fn output_folder_end_to_end() {
        let dir = TempDir::new().unwrap();
        let planner = OutputFolder::new(dir.path(), OutputKind::Output);
        let request = SaveRequest::new(ImageType::Webp);

        let first = save_images(&planner, &[sample_image()], &request).unwrap();
        let second = save_images(&planner, &[sample_image()], &request).unwrap();

        assert_eq!(first.records()[0].filename, "ComfyUI_00001_.webp");
        assert_eq!(second.records()[0].filename, "ComfyUI_00002_.webp");
    }

    #[test]
    fn output_folder_batch_num_prefix_keeps_earlier_batches() {
        let dir = TempDir::new().unwrap();
        let planner = OutputFolder::new(dir.path(), OutputKind::Output);
        let mut request = SaveRequest::new(ImageType::Png);
        request.filename_prefix = "img_%batch_num%".to_string();

        let first = save_images(&planner, &[sample_image(), sample_image()], &request).unwrap();
        let second = save_images(&planner, &[sample_image()], &request).unwrap();

        let names: Vec<&str> = first
            .records()
            .iter()
            .chain(second.records())
            .map(|r| r.filename.as_str())
            .collect();
        assert_eq!(names, ["img_0_00001_.png", "img_1_00002_.png", "img_0_00003_.png"]);
        for name in names {
            assert!(dir.path().join(name).exists(), "{name} missing");
        }
    }

    #[test]
    fn output_folder_counter_exhausted() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("ComfyUI_4294967295_.png"), b"x").unwrap();

        let planner = OutputFolder::new(dir.path(), OutputKind::Output);
        let err = planner.plan("ComfyUI", 4, 4).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SaveError>(),
            Some(SaveError::CounterExhausted { .. })
        ));
    }

    #[test]
    fn counter_parsing() {
        assert_eq!(parse_counter("ComfyUI_00007_.png", "ComfyUI"), Some(7));
        assert_eq!(parse_counter("img_3_00042_.webp", "img_%batch_num%"), Some(42));
        assert_eq!(parse_counter("img_x_00042_.webp", "img_%batch_num%"), None);
        assert_eq!(parse_counter("img__00042_.webp", "img_%batch_num%"), None);
        assert_eq!(parse_counter("ComfyUI_extra_00003_.png", "ComfyUI"), None);
        assert_eq!(parse_counter("ComfyUI_00003.png", "ComfyUI"), None);
        assert_eq!(parse_counter("ComfyUI_99999999999_.png", "ComfyUI"), None);
        assert_eq!(parse_counter("notes.txt", "ComfyUI"), None);
    }

    // ── collect_images ───────────────────────────────────────────────

    #[test]
    fn collect_images_directory_recursive() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();

        fs::write(dir.path().join("a.jpg"), b"fake").unwrap();
        fs::write(sub.join("b.png"), b"fake").unwrap();
        fs::write(sub.join("c.WEBP"), b"fake").unwrap();
        fs::write(sub.join("d.txt"), b"fake").unwrap();

        let images = collect_images(&[dir.path().to_path_buf()]);
        assert_eq!(images.len(), 3);
    }

    #[test]
    fn collect_images_skips_unsupported_and_missing() {
        let dir = TempDir::new().unwrap();
        let txt = dir.path().join("readme.txt");
        fs::write(&txt, b"hello").unwrap();

        let images = collect_images(&[txt, PathBuf::from("/nonexistent/path")]);
        assert!(images.is_empty());
    }

    #[test]
    fn collect_images_overlapping_paths_once() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.png");
        fs::write(&file, b"fake").unwrap();

        let images = collect_images(&[dir.path().to_path_buf(), file.clone()]);
        assert_eq!(images, [file]);
    }
}
