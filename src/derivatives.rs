//! Renders the fixed set of resized variants for a source image.
//!
//! Each variant is content-addressed: its file name is the SHA-256 of the
//! encoded bytes, so re-rendering identical input lands on the same path and
//! overwrites it harmlessly.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::fetch::SourceFetcher;
use crate::models::{Derivative, Resolution};

#[derive(Debug)]
pub struct Rendered {
  pub bytes: Vec<u8>,
  pub width: u32,
  pub height: u32,
}

/// Largest size no wider than `max_width` with the same aspect ratio. Never upscales.
pub fn fit_within(width: u32, height: u32, max_width: u32) -> (u32, u32) {
  if width <= max_width {
    return (width, height);
  }
  let scaled = (u64::from(height) * u64::from(max_width) + u64::from(width) / 2) / u64::from(width);
  (max_width, scaled.max(1) as u32)
}

pub fn content_hash(bytes: &[u8]) -> String {
  Sha256::digest(bytes).iter().map(|b| format!("{:02x}", b)).collect()
}

/// `<output>/<source name>/<resolution>/<hash><extension>`
pub fn storage_path(output_dir: &Path, name: &str, resolution: Resolution, hash: &str, extension: &str) -> PathBuf {
  output_dir
    .join(name)
    .join(resolution.as_str())
    .join(format!("{}{}", hash, extension))
}

/// Keeps the source's extension when it names `format`, otherwise uses the
/// format's canonical one.
pub fn output_extension(source_extension: &str, format: ImageFormat) -> String {
  let declared = source_extension.trim_start_matches('.');
  let known = format.extensions_str();
  if !declared.is_empty() && known.iter().any(|ext| *ext == declared) {
    return source_extension.to_string();
  }
  known.first().map(|ext| format!(".{}", ext)).unwrap_or_default()
}

fn decode(bytes: &[u8]) -> Result<(DynamicImage, ImageFormat)> {
  let (width, height) = ImageReader::new(Cursor::new(bytes))
    .with_guessed_format()?
    .into_dimensions()
    .map_err(|e| Error::InvalidImage(format!("unable to read dimensions: {}", e)))?;
  if width == 0 || height == 0 {
    return Err(Error::InvalidImage(format!("unusable dimensions {}x{}", width, height)));
  }

  let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
  let format = reader
    .format()
    .ok_or_else(|| Error::InvalidImage("unrecognised image format".into()))?;
  let image = reader
    .decode()
    .map_err(|e| Error::InvalidImage(format!("failed to decode: {}", e)))?;
  Ok((image, format))
}

pub fn render(image: &DynamicImage, format: ImageFormat, max_width: u32) -> Result<Rendered> {
  let (width, height) = fit_within(image.width(), image.height(), max_width);
  let resized = if (width, height) == (image.width(), image.height()) {
    image.clone()
  } else {
    image.resize_exact(width, height, FilterType::Lanczos3)
  };

  // JPEG has no alpha channel and no 16-bit support.
  let resized = match (format, resized) {
    (ImageFormat::Jpeg, img @ (DynamicImage::ImageRgb8(_) | DynamicImage::ImageLuma8(_))) => img,
    (ImageFormat::Jpeg, img) => DynamicImage::ImageRgb8(img.to_rgb8()),
    (_, img) => img,
  };

  let mut bytes = Vec::new();
  resized
    .write_to(&mut Cursor::new(&mut bytes), format)
    .map_err(|e| Error::InvalidImage(format!("failed to encode {}x{} {:?}: {}", width, height, format, e)))?;
  Ok(Rendered { bytes, width, height })
}

fn join_error(err: tokio::task::JoinError) -> Error {
  Error::Io(std::io::Error::other(err))
}

#[derive(Debug, Clone)]
pub struct DerivativeGenerator {
  fetcher: SourceFetcher,
  output_dir: PathBuf,
}

impl DerivativeGenerator {
  pub fn new(fetcher: SourceFetcher, output_dir: impl Into<PathBuf>) -> Self {
    Self {
      fetcher,
      output_dir: output_dir.into(),
    }
  }

  pub fn output_dir(&self) -> &Path {
    &self.output_dir
  }

  /// Writes every variant to file storage and returns the records describing
  /// them. Nothing is persisted here.
  pub async fn generate(&self, task_id: Uuid, source_reference: &str) -> Result<Vec<Derivative>> {
    let source = self.fetcher.resolve(source_reference).await?;
    let bytes = tokio::fs::read(&source.path).await?;
    let decoded = tokio::task::spawn_blocking(move || decode(&bytes))
      .await
      .map_err(join_error)??;
    let decoded = Arc::new(decoded);
    let format = decoded.1;
    info!(
      "Task {}: decoded {} ({}x{}, {:?})",
      task_id,
      source.path.display(),
      decoded.0.width(),
      decoded.0.height(),
      format
    );

    let extension = output_extension(&source.extension, format);

    let mut produced = Vec::with_capacity(Resolution::ALL.len());
    for resolution in Resolution::ALL {
      let image = Arc::clone(&decoded);
      let rendered = tokio::task::spawn_blocking(move || render(&image.0, format, resolution.width()))
        .await
        .map_err(join_error)??;

      let hash = content_hash(&rendered.bytes);
      let path = storage_path(&self.output_dir, &source.name, resolution, &hash, &extension);
      if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
      }
      tokio::fs::write(&path, &rendered.bytes).await?;

      let derivative = Derivative {
        id: Uuid::new_v4(),
        task_id,
        resolution,
        width: rendered.width,
        height: rendered.height,
        content_hash: hash,
        storage_path: path.to_string_lossy().replace('\\', "/"),
        created_at: Utc::now(),
      };
      debug!(
        "Task {}: stored {} variant {}x{} at {}",
        task_id, resolution, derivative.width, derivative.height, derivative.storage_path
      );
      produced.push(derivative);
    }
    Ok(produced)
  }
}
