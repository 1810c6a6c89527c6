//! SwarmUI to CivitAI metadata conversion.
//!
//! A JPEG's EXIF UserComment holds SwarmUI's JSON generation parameters. The
//! pipeline recovers that JSON, maps it to the A1111-style text CivitAI reads,
//! resolves the main model's hash to its AutoV2 id, and writes a copy of the
//! image with the new comment.

pub mod batch;
pub mod config;
pub mod container;
pub mod mapper;
pub mod recovery;
pub mod resolver;

pub use batch::{BatchReport, Converter, FileFailure};
pub use config::ConverterConfig;
pub use container::{ExifCodec, ImageContainer, MetadataCodec};
pub use mapper::{map_metadata, render_target_comment, TargetComment};
pub use recovery::{recover_json, RawComment};
pub use resolver::{CivitaiLookup, HashLookup, HashResolver, LookupOutcome, Resolution};
