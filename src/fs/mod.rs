use std::path::{Path, PathBuf};
use std::{fs, io};

use anyhow::{Context, Result};

use util::PathEncodingError;

/// Atomic writes and line appends
mod ops;

/// Where each request, task and log file lives under the output directory
mod paths;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Path does not name a file: {0}")]
    NotAFile(String),
    #[error("Output directory \"{0}\" exists but is not a directory")]
    NotDirectory(String),
    #[error("Refusing to write \"{0}\": outside the output directory, or dry run")]
    NotWhitelisted(String),
}

/// Every file the store touches goes through this struct.
///
/// Writes are only allowed below the output directory, and never during a
/// dry run. Reads are unrestricted, since datasets and fixtures live elsewhere.
#[derive(Debug)]
pub struct Fs {
    output_prefix: PathBuf,
    dry_run: bool,
}

impl Fs {
    pub fn new(output_prefix: &Path, dry_run: bool) -> Self {
        Self {
            output_prefix: output_prefix.to_path_buf(),
            dry_run,
        }
    }

    pub fn output_prefix(&self) -> &Path {
        &self.output_prefix
    }

    /// Create the output dir if it's missing, then pin it to its canonical
    /// path so the write whitelist can't be dodged with `..`.
    pub fn ensure_output_dir_exists(&mut self, verbose: bool) -> Result<()> {
        if self.output_prefix.is_dir() {
            log::debug!("Using existing output directory {:?}", self.output_prefix);
        } else if self.output_prefix.exists() {
            let path = self.output_prefix.to_str().ok_or(PathEncodingError)?;
            return Err(Error::NotDirectory(path.to_owned()).into());
        } else if self.dry_run {
            eprintln!("Dry run. Not creating output directory {:?}", self.output_prefix);
            return Ok(());
        } else {
            if verbose {
                eprintln!("Creating output directory {:?}", self.output_prefix);
            }
            fs::create_dir_all(&self.output_prefix).context("creating output directory")?;
        }

        self.output_prefix = self.output_prefix.canonicalize()?;
        Ok(())
    }

    pub fn exists<T: AsRef<Path>>(&self, path: T) -> bool {
        path.as_ref().exists()
    }

    /// Create the directory `path` will be written into.
    pub fn create_parent_dir<T: AsRef<Path>>(&self, path: T) -> Result<()> {
        let path = path.as_ref();
        let parent = path
            .parent()
            .ok_or_else(|| Error::NotAFile(path.to_str().unwrap_or_default().to_owned()))?;
        self.check_whitelist(parent)?;
        fs::create_dir_all(parent).with_context(|| format!("creating dir {parent:?}"))?;
        Ok(())
    }

    /// Replace the contents of a file in one step.
    pub fn write_atomic<T: AsRef<Path>>(&self, path: T, text: &str) -> Result<()> {
        let path = path.as_ref();
        self.check_whitelist(path)?;
        ops::write_atomic(path, text).with_context(|| format!("writing file {path:?}"))?;
        Ok(())
    }

    /// Append one line to a file, e.g. a jsonl log.
    pub fn append_line<T: AsRef<Path>>(&self, path: T, line: &str) -> Result<()> {
        let path = path.as_ref();
        self.check_whitelist(path)?;
        ops::append_line(path, line).with_context(|| format!("appending to file {path:?}"))?;
        Ok(())
    }

    /// Read a whole file into `strbuf`, replacing what was there.
    pub fn read_to_buf<T: AsRef<Path>>(&self, path: T, strbuf: &mut String) -> Result<()> {
        use std::io::Read;
        strbuf.clear();
        let mut f = fs::File::open(path.as_ref())?;
        f.read_to_string(strbuf)?;
        Ok(())
    }

    pub fn read_dir<T: AsRef<Path>>(&self, path: T) -> Result<fs::ReadDir, io::Error> {
        fs::read_dir(path)
    }

    fn check_whitelist(&self, path: &Path) -> Result<()> {
        if self.dry_run || !path.starts_with(&self.output_prefix) {
            let path = path.to_str().ok_or(PathEncodingError)?;
            Err(Error::NotWhitelisted(path.to_owned()).into())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_writes_stay_in_output_dir() -> Result<()> {
        let dir = tempdir()?;
        let mut fs = Fs::new(&dir.path().join("out"), false);
        fs.ensure_output_dir_exists(false)?;
        let inside = fs.output_prefix().join("requests").join("a.json");
        fs.create_parent_dir(&inside)?;
        fs.write_atomic(&inside, "{}")?;
        assert!(fs.exists(&inside));
        assert!(fs.write_atomic(dir.path().join("b.json"), "{}").is_err());

        let mut buf = String::new();
        fs.read_to_buf(&inside, &mut buf)?;
        assert_eq!(buf, "{}");
        Ok(())
    }

    #[test]
    fn test_dry_run_refuses_writes() -> Result<()> {
        let dir = tempdir()?;
        let mut fs = Fs::new(&dir.path().join("out"), true);
        fs.ensure_output_dir_exists(false)?;
        assert!(!dir.path().join("out").exists());
        assert!(fs.append_line(dir.path().join("out/log.jsonl"), "{}").is_err());
        Ok(())
    }
}
