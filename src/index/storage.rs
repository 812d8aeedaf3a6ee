use std::fs;
use std::io::Write;
use std::path::Path;

use memmap2::Mmap;
use usearch::Index;

use crate::error::{Error, Result};
use crate::index::types::CollectionMetadata;

/// Magic bytes identifying an mmdex collection file.
pub const MAGIC: &[u8; 6] = b"MMDEX\x00";

/// Current collection format version.
pub const VERSION: u32 = 1;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 64;

/// Create a new KNN index for the given dimensionality.
///
/// Cosine metric over unit-normalized vectors; L2 and dot-product scores
/// are derived from the cosine distance at query time.
pub fn create_knn(dimensions: usize) -> Result<Index> {
    let opts = usearch::IndexOptions {
        dimensions,
        metric: usearch::MetricKind::Cos,
        quantization: usearch::ScalarKind::F32,
        connectivity: 16,
        expansion_add: 128,
        expansion_search: 64,
        multi: false,
    };
    Index::new(&opts).map_err(|e| Error::Serialization(format!("failed to create KNN index: {e}")))
}

/// Write a collection file atomically: serialize to `.tmp`, fsync, then rename.
pub fn write_collection(path: &Path, metadata: &CollectionMetadata, knn: &Index) -> Result<()> {
    let meta_bytes = rkyv::to_bytes::<rkyv::rancor::Error>(metadata)
        .map_err(|e| Error::Serialization(e.to_string()))?;

    let knn_len = knn.serialized_length();
    let mut knn_bytes = vec![0u8; knn_len];
    knn.save_to_buffer(&mut knn_bytes)
        .map_err(|e| Error::Serialization(format!("usearch save_to_buffer: {e}")))?;

    let meta_offset: u64 = HEADER_SIZE as u64;
    let meta_size: u64 = meta_bytes.len() as u64;
    let knn_offset: u64 = meta_offset + meta_size;
    let knn_size: u64 = knn_bytes.len() as u64;

    let mut header = [0u8; HEADER_SIZE];
    header[..6].copy_from_slice(MAGIC);
    header[6..10].copy_from_slice(&VERSION.to_le_bytes());
    header[10..18].copy_from_slice(&meta_offset.to_le_bytes());
    header[18..26].copy_from_slice(&meta_size.to_le_bytes());
    header[26..34].copy_from_slice(&knn_offset.to_le_bytes());
    header[34..42].copy_from_slice(&knn_size.to_le_bytes());
    // bytes 42..64 reserved

    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(&header)?;
    file.write_all(&meta_bytes)?;
    file.write_all(&knn_bytes)?;
    file.sync_all()?;

    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Load a collection file via memory-mapping.
pub fn load_collection(path: &Path) -> Result<(CollectionMetadata, Index)> {
    if !path.exists() {
        return Err(Error::CollectionNotFound(path.display().to_string()));
    }

    let file = fs::File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };

    if mmap.len() < HEADER_SIZE {
        return Err(Error::CollectionCorrupted("file too small for header".into()));
    }

    if &mmap[..6] != MAGIC {
        return Err(Error::CollectionCorrupted("invalid magic bytes".into()));
    }

    let version = u32::from_le_bytes(mmap[6..10].try_into().unwrap());
    if version != VERSION {
        return Err(Error::CollectionCorrupted(format!(
            "unsupported version: {version}"
        )));
    }

    let meta_offset = u64::from_le_bytes(mmap[10..18].try_into().unwrap()) as usize;
    let meta_size = u64::from_le_bytes(mmap[18..26].try_into().unwrap()) as usize;
    let knn_offset = u64::from_le_bytes(mmap[26..34].try_into().unwrap()) as usize;
    let knn_size = u64::from_le_bytes(mmap[34..42].try_into().unwrap()) as usize;

    if meta_offset + meta_size > mmap.len() || knn_offset + knn_size > mmap.len() {
        return Err(Error::CollectionCorrupted("truncated file".into()));
    }

    let meta_bytes = &mmap[meta_offset..meta_offset + meta_size];
    let metadata: CollectionMetadata =
        rkyv::from_bytes::<CollectionMetadata, rkyv::rancor::Error>(meta_bytes)
            .map_err(|e| Error::Serialization(format!("rkyv deserialize: {e}")))?;

    let knn_bytes = &mmap[knn_offset..knn_offset + knn_size];
    let knn = create_knn(metadata.dimensions)?;
    knn.load_from_buffer(knn_bytes)
        .map_err(|e| Error::Serialization(format!("usearch load: {e}")))?;

    Ok((metadata, knn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_metadata() -> CollectionMetadata {
        let mut meta = CollectionMetadata::empty(128);
        meta.last_updated = 1234567890;
        meta
    }

    #[test]
    fn create_knn_returns_index() {
        let idx = create_knn(128).unwrap();
        assert_eq!(idx.dimensions(), 128);
    }

    #[test]
    fn roundtrip_write_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("w1.collection");
        let meta = test_metadata();
        let knn = create_knn(128).unwrap();
        knn.reserve(10).unwrap();

        write_collection(&path, &meta, &knn).unwrap();
        assert!(path.exists());

        let (loaded_meta, loaded_knn) = load_collection(&path).unwrap();
        assert_eq!(loaded_meta.last_updated, 1234567890);
        assert_eq!(loaded_meta.dimensions, 128);
        assert_eq!(loaded_knn.dimensions(), 128);
    }

    #[test]
    fn load_missing_file() {
        let result = load_collection(Path::new("/nonexistent/w.collection"));
        assert!(matches!(result, Err(Error::CollectionNotFound(_))));
    }

    #[test]
    fn load_corrupted_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.collection");
        fs::write(&path, [0u8; 64]).unwrap();
        let result = load_collection(&path);
        assert!(matches!(result, Err(Error::CollectionCorrupted(_))));
    }

    #[test]
    fn load_too_small() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tiny.collection");
        fs::write(&path, [0u8; 10]).unwrap();
        let result = load_collection(&path);
        assert!(matches!(result, Err(Error::CollectionCorrupted(_))));
    }
}
