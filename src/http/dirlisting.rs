//! HTML directory listings.

use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

use crate::http::buffer::Buffer;

struct Entry {
    name: String,
    is_dir: bool,
    size: u64,
    modified: Option<SystemTime>,
}

/// Renders the listing of `dir`, shown to clients as `url_path`.
///
/// Directories come first, then files, each group sorted by name.
pub fn build(dir: &Path, url_path: &str, out: &mut Buffer) -> io::Result<()> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        entries.push(Entry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: metadata.is_dir(),
            size: metadata.len(),
            modified: metadata.modified().ok(),
        });
    }
    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));

    let title = escape(url_path);
    out.format(format_args!(
        "<!DOCTYPE HTML PUBLIC \"-//W3C//DTD HTML 3.2 Final//EN\">\
         <html><head><title>Index of {title}</title></head>\
         <body><h1>Index of {title}</h1><table>\
         <tr><th>Name</th><th>Size</th><th>Last modified</th></tr>"
    ));

    if url_path != "/" {
        out.append(b"<tr><td><a href=\"../\">Parent directory</a></td><td>-</td><td>-</td></tr>");
    }

    for entry in &entries {
        let suffix = if entry.is_dir { "/" } else { "" };
        let name = escape(&entry.name);
        let size = if entry.is_dir {
            "-".to_string()
        } else {
            entry.size.to_string()
        };
        let date = entry
            .modified
            .map(httpdate::fmt_http_date)
            .unwrap_or_else(|| "-".to_string());
        out.format(format_args!(
            "<tr><td><a href=\"{name}{suffix}\">{name}{suffix}</a></td>\
             <td>{size}</td><td>{date}</td></tr>"
        ));
    }

    out.append(b"</table></body></html>");
    Ok(())
}

fn escape(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
