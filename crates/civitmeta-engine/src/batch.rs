use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use civitmeta_contracts::error::{ConvertError, ConvertResult};
use civitmeta_contracts::metadata::SourceMetadata;
use tracing::{error, info, warn};

use crate::container::ImageContainer;
use crate::mapper::map_metadata;
use crate::recovery::recover_json;
use crate::resolver::HashResolver;

/// Subdirectory created inside a folder input.
pub const OUTPUT_DIR_NAME: &str = "civitmeta";
/// Inserted before the extension for a single-file input.
pub const OUTPUT_FILE_SUFFIX: &str = "-civitmeta";
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg"];

#[derive(Debug)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: ConvertError,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub total: usize,
    pub converted: Vec<PathBuf>,
    pub failures: Vec<FileFailure>,
}

impl BatchReport {
    pub fn processed(&self) -> usize {
        self.converted.len()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    fn rejected(path: &Path, error: ConvertError) -> Self {
        Self {
            failures: vec![FileFailure {
                path: path.to_path_buf(),
                error,
            }],
            ..Self::default()
        }
    }
}

/// Sequential per-file pipeline: container read, comment recovery, schema parse,
/// mapping, container write. One file failing never stops the others.
#[derive(Debug)]
pub struct Converter {
    container: ImageContainer,
    resolver: HashResolver,
}

impl Converter {
    pub fn new(container: ImageContainer, resolver: HashResolver) -> Self {
        Self {
            container,
            resolver,
        }
    }

    pub fn resolver(&self) -> &HashResolver {
        &self.resolver
    }

    pub fn flush_cache(&mut self) -> Result<()> {
        self.resolver.flush_cache()
    }

    pub fn convert_file(&mut self, input: &Path, output: &Path) -> ConvertResult<()> {
        info!(input = %input.display(), output = %output.display(), "Processing");
        let raw = self.container.read(input)?;
        let json = recover_json(&raw)?;
        let meta = SourceMetadata::from_json(&json)?;
        info!("Successfully parsed metadata JSON");
        let comment = map_metadata(&meta, &mut self.resolver);
        self.container.write(input, output, &comment)?;
        info!(output = %output.display(), "Successfully processed image");
        Ok(())
    }

    /// Converts a single JPEG or every JPEG directly inside a folder. Only
    /// setup problems (such as the output folder not being creatable) are
    /// returned as errors; everything per file lands in the report.
    pub fn run(&mut self, path: &Path) -> Result<BatchReport> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) => {
                let err = ConvertError::file_system(path, err);
                if err.is_not_found() {
                    error!(path = %path.display(), "File or directory not found");
                } else {
                    error!(path = %path.display(), "{err}");
                }
                return Ok(BatchReport::rejected(path, err));
            }
        };

        if metadata.is_dir() {
            return self.run_directory(path);
        }
        if metadata.is_file() && has_image_extension(path) {
            return Ok(self.run_single(path));
        }
        error!(
            path = %path.display(),
            "Please provide a valid JPEG file or a folder containing JPEG files."
        );
        Ok(BatchReport::rejected(
            path,
            ConvertError::Unsupported {
                path: path.to_path_buf(),
            },
        ))
    }

    fn run_single(&mut self, path: &Path) -> BatchReport {
        let output = single_output_path(path);
        let mut report = BatchReport {
            total: 1,
            ..BatchReport::default()
        };
        match self.convert_file(path, &output) {
            Ok(()) => {
                info!(input = %path.display(), output = %output.display(), "Successfully processed");
                self.flush_after_success();
                report.converted.push(output);
            }
            Err(err) => {
                error!(input = %path.display(), kind = err.kind(), "Failed to process: {err}");
                report.failures.push(FileFailure {
                    path: path.to_path_buf(),
                    error: err,
                });
            }
        }
        report
    }

    fn run_directory(&mut self, dir: &Path) -> Result<BatchReport> {
        let files = match list_images(dir) {
            Ok(files) => files,
            Err(err) => {
                error!(path = %dir.display(), "{err}");
                return Ok(BatchReport::rejected(dir, err));
            }
        };

        let output_dir = dir.join(OUTPUT_DIR_NAME);
        if !output_dir.is_dir() {
            fs::create_dir_all(&output_dir)
                .with_context(|| format!("failed creating {}", output_dir.display()))?;
            info!(path = %output_dir.display(), "Created output directory");
        }

        let mut report = BatchReport {
            total: files.len(),
            ..BatchReport::default()
        };
        if files.is_empty() {
            info!(path = %dir.display(), "No JPEG files found");
            return Ok(report);
        }
        info!(count = files.len(), "Found JPEG files to process");

        for input in files {
            let Some(name) = input.file_name() else {
                continue;
            };
            let output = output_dir.join(name);
            match self.convert_file(&input, &output) {
                Ok(()) => {
                    self.flush_after_success();
                    report.converted.push(output);
                }
                Err(err) => {
                    error!(input = %input.display(), kind = err.kind(), "Failed to process: {err}");
                    report.failures.push(FileFailure {
                        path: input,
                        error: err,
                    });
                }
            }
        }

        info!(
            "Processed {} of {} files successfully",
            report.processed(),
            report.total
        );
        Ok(report)
    }

    fn flush_after_success(&mut self) {
        if let Err(err) = self.resolver.flush_cache() {
            warn!("Error saving cache: {err:#}");
        }
    }
}

pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

/// `photo.JPG` -> `photo-civitmeta.JPG`, beside the input.
pub fn single_output_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    let file_name = match path.extension() {
        Some(ext) => format!("{stem}{OUTPUT_FILE_SUFFIX}.{}", ext.to_string_lossy()),
        None => format!("{stem}{OUTPUT_FILE_SUFFIX}"),
    };
    path.with_file_name(file_name)
}

fn list_images(dir: &Path) -> ConvertResult<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|err| ConvertError::file_system(dir, err))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| ConvertError::file_system(dir, err))?;
        let path = entry.path();
        if path.is_file() && has_image_extension(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
