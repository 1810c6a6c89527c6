use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use civitmeta_contracts::error::{ConvertError, ConvertResult};
use image::ImageFormat;
use little_exif::exif_tag::ExifTag;
use little_exif::filetype::FileExtension;
use little_exif::metadata::Metadata;
use tracing::{debug, info};

use crate::mapper::TargetComment;
use crate::recovery::RawComment;

/// Low-level access to the EXIF UserComment of an in-memory JPEG.
pub trait MetadataCodec {
    fn read_user_comment(&self, jpeg: &[u8]) -> Result<Option<Vec<u8>>>;
    /// Returns the full JPEG with the UserComment replaced and every other tag kept.
    fn write_user_comment(&self, jpeg: &[u8], comment: &[u8]) -> Result<Vec<u8>>;
}

/// `little_exif` backed codec. UserComment is written with the UNDEFINED
/// type, so the encoded bytes are stored verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExifCodec;

impl MetadataCodec for ExifCodec {
    fn read_user_comment(&self, jpeg: &[u8]) -> Result<Option<Vec<u8>>> {
        let metadata = Metadata::new_from_vec(&jpeg.to_vec(), FileExtension::JPEG)
            .context("failed loading EXIF data")?;
        let comment = metadata
            .get_tag(&ExifTag::UserComment(Vec::new()))
            .find_map(|tag| match tag {
                ExifTag::UserComment(bytes) => Some(bytes.clone()),
                _ => None,
            });
        Ok(comment)
    }

    fn write_user_comment(&self, jpeg: &[u8], comment: &[u8]) -> Result<Vec<u8>> {
        let mut buffer = jpeg.to_vec();
        let mut metadata = Metadata::new_from_vec(&buffer, FileExtension::JPEG)
            .context("failed loading EXIF data")?;
        metadata.set_tag(ExifTag::UserComment(comment.to_vec()));
        metadata
            .write_to_vec(&mut buffer, FileExtension::JPEG)
            .context("failed serializing EXIF data")?;
        Ok(buffer)
    }
}

/// Reads the source comment from an image file and writes the converted copy.
pub struct ImageContainer {
    codec: Box<dyn MetadataCodec>,
}

impl ImageContainer {
    pub fn new(codec: impl MetadataCodec + 'static) -> Self {
        Self {
            codec: Box::new(codec),
        }
    }

    pub fn read(&self, path: &Path) -> ConvertResult<RawComment> {
        let jpeg = read_jpeg(path)?;
        let raw = self
            .codec
            .read_user_comment(&jpeg)
            .map_err(|err| ConvertError::Container(format!("{err:#}")))?
            .map(RawComment::new)
            .filter(|raw| !raw.is_empty())
            .ok_or_else(|| ConvertError::Recovery("no UserComment found in EXIF data".to_string()))?;
        info!(bytes = raw.len(), "Raw UserComment found");
        Ok(raw)
    }

    /// Writes `path` re-encoded with `comment` to `output_path`. The output
    /// file only appears once the complete image has been written.
    pub fn write(&self, path: &Path, output_path: &Path, comment: &TargetComment) -> ConvertResult<()> {
        if same_file(path, output_path) {
            return Err(ConvertError::Container(format!(
                "refusing to overwrite input {}",
                path.display()
            )));
        }
        let jpeg = read_jpeg(path)?;
        let encoded = comment.to_user_comment();
        debug!(
            bytes = encoded.len(),
            head = %hex_preview(&encoded, 16),
            "constructed UserComment"
        );
        let updated = self
            .codec
            .write_user_comment(&jpeg, &encoded)
            .map_err(|err| ConvertError::Container(format!("{err:#}")))?;
        persist_atomically(output_path, &updated)
            .map_err(|err| ConvertError::file_system(output_path, err))?;
        info!(output = %output_path.display(), bytes = updated.len(), "wrote converted image");
        Ok(())
    }
}

impl std::fmt::Debug for ImageContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageContainer").finish_non_exhaustive()
    }
}

fn read_jpeg(path: &Path) -> ConvertResult<Vec<u8>> {
    let bytes = std::fs::read(path).map_err(|err| ConvertError::file_system(path, err))?;
    match image::guess_format(&bytes) {
        Ok(ImageFormat::Jpeg) => Ok(bytes),
        Ok(other) => Err(ConvertError::Container(format!(
            "{} is {:?}, not a JPEG image",
            path.display(),
            other
        ))),
        Err(_) => Err(ConvertError::Container(format!(
            "{} is not a recognizable image",
            path.display()
        ))),
    }
}

fn persist_atomically(output_path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = output_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    staged.write_all(bytes)?;
    staged.flush()?;
    staged.persist(output_path).map_err(|err| err.error)?;
    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn hex_preview(bytes: &[u8], limit: usize) -> String {
    bytes
        .iter()
        .take(limit)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}
