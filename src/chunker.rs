use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

use crate::document::Document;

/// Global cached tokenizer for token counting.
static TOKENIZER: OnceLock<CoreBPE> = OnceLock::new();

fn get_tokenizer() -> &'static CoreBPE {
    TOKENIZER
        .get_or_init(|| tiktoken_rs::cl100k_base().expect("failed to load cl100k_base tokenizer"))
}

/// Count the number of tokens in the given text using the cl100k_base tokenizer.
pub fn count_tokens(text: &str) -> usize {
    get_tokenizer().encode_ordinary(text).len()
}

/// Split text into token-bounded chunks with overlap.
///
/// Windows advance by `max_tokens - overlap_tokens`; each window is decoded
/// back to text. Overlap must be strictly smaller than the window (enforced
/// by config validation).
pub fn chunk_text(text: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    let bpe = get_tokenizer();
    let tokens = bpe.encode_ordinary(text);
    if tokens.len() <= max_tokens {
        return vec![text.to_string()];
    }

    let stride = max_tokens.saturating_sub(overlap_tokens).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < tokens.len() {
        let end = (start + max_tokens).min(tokens.len());
        let window = &tokens[start..end];
        match bpe.decode(window.to_vec()) {
            Ok(s) => chunks.push(s),
            // A window boundary can land mid-codepoint; widen by one token
            // until the decode succeeds.
            Err(_) => {
                let mut widened = end;
                loop {
                    widened = (widened + 1).min(tokens.len());
                    if let Ok(s) = bpe.decode(tokens[start..widened].to_vec()) {
                        chunks.push(s);
                        break;
                    }
                    if widened == tokens.len() {
                        chunks.push(String::from_utf8_lossy(text.as_bytes()).into_owned());
                        break;
                    }
                }
            }
        }
        if end == tokens.len() {
            break;
        }
        start += stride;
    }
    chunks
}

/// Build the metadata header prepended to each text chunk before embedding,
/// so retrieved chunks carry their provenance.
pub fn chunk_header(doc: &Document) -> String {
    format!(
        "<document_metadata>\nsourceDocument: {}\npublished: {}\n</document_metadata>\n\n",
        doc.title, doc.published
    )
}

/// Assemble the final embeddable texts for a document: optional prefix,
/// header metadata, then each content chunk.
pub fn chunks_for_document(
    doc: &Document,
    max_tokens: usize,
    overlap_tokens: usize,
    prefix: Option<&str>,
) -> Vec<String> {
    let header = chunk_header(doc);
    chunk_text(&doc.page_content, max_tokens, overlap_tokens)
        .into_iter()
        .map(|chunk| match prefix {
            Some(p) if !p.is_empty() => format!("{p}{header}{chunk}"),
            _ => format!("{header}{chunk}"),
        })
        .collect()
}
