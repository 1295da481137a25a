use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::feed::{ArchivedFeed, Feed};

pub fn write_feed(feed: &Feed, output_path: &Path) -> Result<()> {
    log::info!("Serializing {}", feed.summary());
    let buffer = rkyv::to_bytes::<rkyv::rancor::Error>(feed)?;
    log::info!("Writing {} bytes to {:?}", buffer.len(), output_path);
    let mut file = std::fs::File::create(output_path)
        .with_context(|| format!("Failed to create {:?}", output_path))?;
    file.write_all(&buffer)?;
    Ok(())
}

pub fn write_feed_json(feed: &Feed, output_path: &Path) -> Result<()> {
    log::info!("Writing JSON to {:?}", output_path);
    let file = std::fs::File::create(output_path)
        .with_context(|| format!("Failed to create {:?}", output_path))?;
    let mut writer = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, feed)?;
    writer.flush()?;
    Ok(())
}

/// A consolidated feed written by `write_feed`, accessed in place.
pub struct MappedFeed {
    mmap: memmap2::Mmap,
}

impl MappedFeed {
    /// Maps the file and validates the archive once.
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            std::fs::File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        // Safety: This is safe for as long as the underlying file is not modified.
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        rkyv::access::<ArchivedFeed, rkyv::rancor::Error>(&mmap)
            .with_context(|| format!("{:?} does not contain a valid feed archive", path))?;
        Ok(MappedFeed { mmap })
    }

    pub fn archived(&self) -> &ArchivedFeed {
        // Safety: The buffer was validated in `open` and the map is read-only.
        unsafe { rkyv::access_unchecked::<ArchivedFeed>(&self.mmap) }
    }

    pub fn to_feed(&self) -> Result<Feed> {
        Ok(rkyv::deserialize::<Feed, rkyv::rancor::Error>(self.archived())?)
    }
}
