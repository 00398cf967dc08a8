//! MIME type lookup by file extension.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Extension table: entries loaded from a `mime.types` file take precedence
/// over the built-in guesses.
#[derive(Debug, Clone, Default)]
pub struct MimeTypes {
    overrides: HashMap<String, String>,
}

impl MimeTypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a `mime.types` file: one `type ext1 ext2 ...` per line.
    pub fn load(&mut self, path: &Path) -> io::Result<usize> {
        let content = fs::read_to_string(path)?;
        Ok(self.parse(&content))
    }

    /// Parses `mime.types` content and returns how many extensions were added.
    pub fn parse(&mut self, content: &str) -> usize {
        let mut added = 0;
        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("");
            let mut fields = line.split_whitespace();
            let Some(mime) = fields.next() else { continue };
            for ext in fields {
                self.overrides.insert(ext.to_ascii_lowercase(), mime.to_string());
                added += 1;
            }
        }
        added
    }

    /// Content type for `extension` (without the dot), ignoring case.
    pub fn lookup(&self, extension: &[u8]) -> &str {
        let Ok(ext) = std::str::from_utf8(extension) else {
            return DEFAULT_MIME_TYPE;
        };
        let ext = ext.to_ascii_lowercase();
        if let Some(mime) = self.overrides.get(&ext) {
            return mime;
        }
        mime_guess::from_ext(&ext).first_raw().unwrap_or(DEFAULT_MIME_TYPE)
    }

    pub fn lookup_path(&self, extension: Option<&[u8]>) -> &str {
        extension.map_or(DEFAULT_MIME_TYPE, |ext| self.lookup(ext))
    }
}
