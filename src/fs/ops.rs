use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;

use util::PathEncodingError;

use super::Error;

const TMP_SUFFIX: &str = ".tmp";

/// Write `text` to a sibling temp file, then rename it over `path`,
/// so readers never see a partially-written file.
pub fn write_atomic(path: &Path, text: &str) -> Result<()> {
    let tmp = tmp_path(path)?;
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(text.as_bytes())?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Append one line to `path`, creating the file if needed.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    debug_assert!(!line.contains('\n'));
    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    // one write call per line, so concurrent appenders don't interleave:
    let mut buf = String::with_capacity(line.len() + 1);
    buf.push_str(line);
    buf.push('\n');
    f.write_all(buf.as_bytes())?;
    Ok(())
}

fn tmp_path(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| Error::NotAFile(path.to_str().unwrap_or_default().to_owned()))?
        .to_str()
        .ok_or(PathEncodingError)?;
    Ok(path.with_file_name(format!("{name}{TMP_SUFFIX}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn test_write_atomic_replaces() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("task.json");
        write_atomic(&path, "first")?;
        write_atomic(&path, "second")?;
        assert_eq!(fs::read_to_string(&path)?, "second");
        assert!(!dir.path().join("task.json.tmp").exists());
        Ok(())
    }

    #[test]
    fn test_append_line() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("log.jsonl");
        append_line(&path, "{\"a\":1}")?;
        append_line(&path, "{\"a\":2}")?;
        let text = fs::read_to_string(&path)?;
        assert_eq!(text.lines().collect::<Vec<_>>(), vec!["{\"a\":1}", "{\"a\":2}"]);
        Ok(())
    }
}
