use std::io;
use std::path::{Path, PathBuf};
use log::debug;

use crate::utils::FileMetadata;
use crate::CHUNK_SIZE;

/// Split a file into the chunks sent over the data channel.
///
/// Every chunk is `CHUNK_SIZE` bytes except possibly the last one. An empty
/// file produces no chunks at all; the receiver still gets the completion
/// marker and ends up with an empty artifact.
pub fn split_chunks(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.chunks(CHUNK_SIZE)
}

/// Number of chunks `split_chunks` yields for a file of `size` bytes.
pub fn chunk_count(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE as u64)
}

/// Receiving half of the chunked transfer.
///
/// Chunks are kept in arrival order. There is no sequence number, so loss
/// or reordering below us would go unnoticed and corrupt the artifact.
#[derive(Debug, Default)]
pub struct Reassembler {
    chunks: Vec<Vec<u8>>,
    received: u64,
    metadata: Option<FileMetadata>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_metadata(&mut self, metadata: FileMetadata) {
        self.metadata = Some(metadata);
    }

    pub fn metadata(&self) -> Option<&FileMetadata> {
        self.metadata.as_ref()
    }

    /// Append a chunk, returning the running byte count.
    pub fn push(&mut self, chunk: &[u8]) -> u64 {
        self.chunks.push(chunk.to_vec());
        self.received += chunk.len() as u64;
        debug!("Buffered chunk {}: {} bytes (total: {})", self.chunks.len(), chunk.len(), self.received);
        self.received
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Concatenate everything received so far into the final artifact and
    /// reset for the next transfer.
    pub fn finish(&mut self) -> Vec<u8> {
        let artifact = self.chunks.concat();
        self.clear();
        artifact
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.received = 0;
        self.metadata = None;
    }
}

/// Generate FileMetadata for a file about to be sent.
pub fn generate_metadata(path: &Path, size: u64) -> FileMetadata {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());

    FileMetadata { name, size }
}

/// Read a whole file into memory, along with the metadata announced for it.
pub async fn read_file(path: &Path) -> io::Result<(FileMetadata, Vec<u8>)> {
    let data = tokio::fs::read(path).await?;
    let metadata = generate_metadata(path, data.len() as u64);
    debug!("Read {} bytes from {:?}", data.len(), path);
    Ok((metadata, data))
}

/// Write an artifact as `<dir>/<prefix><name>`. Only the final path
/// component of `name` is used, so a remote peer cannot pick the directory.
pub async fn write_artifact(dir: &Path, prefix: &str, name: &str, data: &[u8]) -> io::Result<PathBuf> {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());

    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{}{}", prefix, base));
    tokio::fs::write(&path, data).await?;
    debug!("Wrote {} bytes to {:?}", data.len(), path);
    Ok(path)
}
