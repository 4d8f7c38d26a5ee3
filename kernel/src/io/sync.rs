//! Chunked file transfer between a remote client and the project directory.
//!
//! Chunks travel as base64 text. A chunk either replaces the whole file or
//! lands at `index * chunk_size`, so chunks may arrive in any order.

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

pub const DEFAULT_CHUNK_SIZE: usize = 1_048_576;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkWrite {
    /// Replace the file with this single chunk.
    Full,
    At { index: usize, chunk_size: usize },
}

/// Decode `encoded` and write it to `path` according to `mode`.
pub fn write_file_chunk(path: &Path, encoded: &str, mode: ChunkWrite) -> Result<()> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .with_context(|| format!("decode chunk for {}", path.display()))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    match mode {
        ChunkWrite::Full => {
            fs::write(path, &bytes).with_context(|| format!("write {}", path.display()))?;
        }
        ChunkWrite::At { index, chunk_size } => {
            anyhow::ensure!(chunk_size > 0, "chunk size must be > 0");
            let offset = index
                .checked_mul(chunk_size)
                .context("chunk offset overflows")?;
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(path)
                .with_context(|| format!("open {}", path.display()))?;
            file.seek(SeekFrom::Start(offset as u64))
                .with_context(|| format!("seek {}", path.display()))?;
            file.write_all(&bytes)
                .with_context(|| format!("write {}", path.display()))?;
        }
    }
    debug!(path = %path.display(), bytes = bytes.len(), ?mode, "chunk written");
    Ok(())
}

/// Read `path` as base64 chunks of at most `chunk_size` decoded bytes. An
/// empty file yields a single empty chunk.
pub fn read_file_chunks(path: &Path, chunk_size: usize) -> Result<Vec<String>> {
    anyhow::ensure!(chunk_size > 0, "chunk size must be > 0");
    let mut file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)
        .with_context(|| format!("read {}", path.display()))?;
    if contents.is_empty() {
        return Ok(vec![String::new()]);
    }
    Ok(contents
        .chunks(chunk_size)
        .map(|chunk| STANDARD.encode(chunk))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_chunks_land_at_their_offsets() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/data.bin");
        let chunks = ["abcd", "efgh", "ij"];

        for index in [2, 0, 1] {
            let encoded = STANDARD.encode(chunks[index]);
            write_file_chunk(&path, &encoded, ChunkWrite::At { index, chunk_size: 4 })
                .expect("chunk");
        }
        assert_eq!(fs::read_to_string(&path).expect("read"), "abcdefghij");
    }

    #[test]
    fn full_write_replaces_existing_content() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("step.py");
        fs::write(&path, "a much longer original body").expect("seed");
        write_file_chunk(&path, &STANDARD.encode("short"), ChunkWrite::Full).expect("write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "short");
    }

    #[test]
    fn read_chunks_splits_by_decoded_size() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("data.txt");
        fs::write(&path, "abcdefghij").expect("seed");
        let chunks = read_file_chunks(&path, 4).expect("read");
        let decoded: Vec<Vec<u8>> = chunks
            .iter()
            .map(|c| STANDARD.decode(c).expect("decode"))
            .collect();
        assert_eq!(decoded, vec![b"abcd".to_vec(), b"efgh".to_vec(), b"ij".to_vec()]);
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = write_file_chunk(&temp.path().join("x"), "!!!", ChunkWrite::Full).unwrap_err();
        assert!(format!("{err:#}").contains("decode chunk"));
    }
}
