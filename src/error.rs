use std::path::PathBuf;

/// All errors that can occur in mmdex.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid image {}: {reason}", path.display())]
    InvalidImage { path: PathBuf, reason: String },

    #[error("decoder failure for {}: {message}", path.display())]
    DecoderFailure { path: PathBuf, message: String },

    #[error("invalid chunk at index {index}: {reason}")]
    InvalidChunk { index: usize, reason: String },

    #[error("embedder returned a zero-magnitude vector")]
    ZeroEmbedding,

    #[error("dimension mismatch: query vector has {actual} dimensions but collection '{namespace}' was created with {expected}; recreate the collection to change embedders")]
    DimensionMismatch {
        namespace: String,
        expected: usize,
        actual: usize,
    },

    #[error("collection schema conflict in '{namespace}': {message}")]
    SchemaConflict { namespace: String, message: String },

    #[error("backend unavailable ({backend}): {message}")]
    BackendUnavailable { backend: String, message: String },

    #[error("a session is already active for workspace '{workspace}'")]
    SessionConflict { workspace: String },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("collection corrupted: {0}")]
    CollectionCorrupted(String),

    #[error("document not found: {}", path.display())]
    DocumentNotFound { path: PathBuf },

    #[error("document parse error in {}: {message}", path.display())]
    DocumentParse { path: PathBuf, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("watch error: {0}")]
    Watch(String),

    #[error("logging initialization failed: {0}")]
    Logging(String),
}

impl Error {
    /// Machine-readable kind tag, surfaced to API consumers alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::InvalidPath(_) => "invalid_path",
            Error::InvalidImage { .. } => "invalid_image",
            Error::DecoderFailure { .. } => "decoder_failure",
            Error::InvalidChunk { .. } => "invalid_chunk",
            Error::ZeroEmbedding => "zero_embedding",
            Error::DimensionMismatch { .. } => "dimension_mismatch",
            Error::SchemaConflict { .. } => "schema_conflict",
            Error::BackendUnavailable { .. } => "backend_unavailable",
            Error::SessionConflict { .. } => "session_conflict",
            Error::SessionNotFound(_) => "session_not_found",
            Error::CollectionNotFound(_) => "collection_not_found",
            Error::CollectionCorrupted(_) => "collection_corrupted",
            Error::DocumentNotFound { .. } => "document_not_found",
            Error::DocumentParse { .. } => "document_parse",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::Watch(_) => "watch",
            Error::Logging(_) => "logging",
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn config_variant_formats() {
        let err = Error::Config("bad key".into());
        assert_eq!(err.to_string(), "configuration error: bad key");
    }

    #[test]
    fn invalid_path_variant_formats() {
        let err = Error::InvalidPath("../escape".into());
        assert_eq!(err.to_string(), "invalid path: ../escape");
    }

    #[test]
    fn invalid_image_variant_formats() {
        let err = Error::InvalidImage {
            path: PathBuf::from("photo.png"),
            reason: "zero dimensions".into(),
        };
        let s = err.to_string();
        assert!(s.contains("photo.png"));
        assert!(s.contains("zero dimensions"));
    }

    #[test]
    fn decoder_failure_variant_formats() {
        let err = Error::DecoderFailure {
            path: PathBuf::from("shot.nef"),
            message: "exit status 1".into(),
        };
        assert!(err.to_string().contains("shot.nef"));
    }

    #[test]
    fn invalid_chunk_variant_formats() {
        let err = Error::InvalidChunk {
            index: 3,
            reason: "not a string".into(),
        };
        assert!(err.to_string().contains("index 3"));
    }

    #[test]
    fn dimension_mismatch_names_both_dimensions() {
        let err = Error::DimensionMismatch {
            namespace: "w1".into(),
            expected: 1024,
            actual: 2048,
        };
        let s = err.to_string();
        assert!(s.contains("1024"));
        assert!(s.contains("2048"));
        assert!(s.contains("recreate"));
    }

    #[test]
    fn schema_conflict_variant_formats() {
        let err = Error::SchemaConflict {
            namespace: "w1".into(),
            message: "empty string field".into(),
        };
        assert!(err.to_string().contains("w1"));
    }

    #[test]
    fn backend_unavailable_variant_formats() {
        let err = Error::BackendUnavailable {
            backend: "redis".into(),
            message: "connection refused".into(),
        };
        assert!(err.to_string().contains("redis"));
    }

    #[test]
    fn session_conflict_variant_formats() {
        let err = Error::SessionConflict {
            workspace: "alpha".into(),
        };
        assert!(err.to_string().contains("alpha"));
    }

    #[test]
    fn io_from_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "gone");
        let err: Error = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(Error::ZeroEmbedding.kind(), "zero_embedding");
        assert_eq!(
            Error::SessionConflict {
                workspace: "w".into()
            }
            .kind(),
            "session_conflict"
        );
        assert_eq!(Error::InvalidPath("x".into()).kind(), "invalid_path");
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}
