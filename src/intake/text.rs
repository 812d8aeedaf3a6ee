use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};

/// Extract plain text from a supported text-type file.
pub fn extract_text(path: &Path, extension: &str) -> Result<String> {
    match extension.to_lowercase().as_str() {
        "md" | "markdown" => {
            let raw = std::fs::read_to_string(path)?;
            Ok(strip_markdown(&raw))
        }
        "pdf" => {
            let text = pdf_extract::extract_text(path).map_err(|e| Error::DocumentParse {
                path: path.to_path_buf(),
                message: format!("pdf extraction: {e}"),
            })?;
            debug!(path = %path.display(), chars = text.len(), "extracted pdf text");
            Ok(text)
        }
        // txt and everything else routed here is read verbatim.
        _ => Ok(std::fs::read_to_string(path)?),
    }
}

/// Strip markdown formatting from content, returning plain text.
///
/// Uses `pulldown-cmark` to parse and extract only text and code events.
pub fn strip_markdown(content: &str) -> String {
    use pulldown_cmark::{Event, Parser};

    let parser = Parser::new(content);
    let mut text = String::new();
    for event in parser {
        match event {
            Event::Text(t) => text.push_str(&t),
            Event::Code(c) => text.push_str(&c),
            Event::SoftBreak | Event::HardBreak => text.push(' '),
            _ => {}
        }
    }
    text
}

/// Whitespace-delimited word count used for the picker metadata.
pub fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}
