pub mod process;
pub mod sql;

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use url::Url;

/// Reports whether `path` exists. Errors other than "not found" (for example
/// a permission problem on a parent directory) are returned to the caller.
pub fn file_exists(path: &Path) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Appends `content` to `destination`, inserting a newline first when the
/// existing file doesn't end with one. The destination must already exist.
pub fn append_string_to_file(destination: &Path, content: &str) -> io::Result<()> {
    append_bytes_to_file(destination, content.as_bytes())
}

/// Byte-level variant of [`append_string_to_file`]: configuration files are
/// not required to be UTF-8.
pub fn append_bytes_to_file(destination: &Path, content: &[u8]) -> io::Result<()> {
    let existing = fs::read(destination)?;
    let needs_separator = !existing.is_empty() && !existing.ends_with(b"\n");

    let mut file = OpenOptions::new().append(true).open(destination)?;
    if needs_separator {
        file.write_all(b"\n")?;
    }
    file.write_all(content)?;
    if !content.ends_with(b"\n") {
        file.write_all(b"\n")?;
    }
    file.sync_all()
}

/// Appends the whole content of `source` to `destination`, byte for byte.
pub fn append_file(destination: &Path, source: &Path) -> io::Result<()> {
    let content = fs::read(source)?;
    append_bytes_to_file(destination, &content)
}

/// Reads a secret from a mounted file, dropping the trailing line break
/// editors and secret generators tend to leave behind.
pub fn read_secret_file(path: &Path) -> io::Result<String> {
    let content = fs::read_to_string(path)?;
    Ok(content.trim_end_matches(['\n', '\r']).to_string())
}

/// Reports whether a directory exists and has no entries.
pub fn is_empty_directory(path: &Path) -> io::Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

/// Appends path segments to `base`, percent-encoding each one. Unlike
/// `Url::join`, a base path without trailing slash is kept intact.
pub fn url_with_segments(base: &str, segments: &[&str]) -> Result<Url, String> {
    let mut url = Url::parse(base).map_err(|e| format!("invalid URL {:?}: {}", base, e))?;
    url.path_segments_mut()
        .map_err(|_| format!("URL {:?} cannot carry a path", base))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
