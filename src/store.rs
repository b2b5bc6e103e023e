use std::fs;
use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::RefineryError;

/// Local cache of raw annotation files, one directory per organism.
#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn organism_dir(&self, organism_name: &str) -> Utf8PathBuf {
        self.root.join(organism_name)
    }

    pub fn organism_file(&self, organism_name: &str, file_name: &str) -> Utf8PathBuf {
        self.organism_dir(organism_name).join(file_name)
    }

    pub fn ensure_organism_dir(&self, organism_name: &str) -> Result<Utf8PathBuf, RefineryError> {
        let dir = self.organism_dir(organism_name);
        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| RefineryError::Filesystem(format!("create {dir}: {err}")))?;
        Ok(dir)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), RefineryError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_str().is_empty()) {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| RefineryError::Filesystem(err.to_string()))?;
        }
        let tmp_path = path.with_extension("tmp");
        fs::write(tmp_path.as_std_path(), content)
            .map_err(|err| RefineryError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| RefineryError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// Removes `path`; a file that is already gone is not an error.
    pub fn remove_if_present(path: &Utf8Path) -> Result<(), RefineryError> {
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(RefineryError::Filesystem(format!("remove {path}: {err}"))),
        }
    }

    pub fn copy_file_atomic(src: &Utf8Path, dest: &Utf8Path) -> Result<(), RefineryError> {
        let content = fs::read(src.as_std_path())
            .map_err(|err| RefineryError::Filesystem(format!("read {src}: {err}")))?;
        Self::write_bytes_atomic(dest, &content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn organism_layout() {
        let store = Store::new("/data/refinery");
        assert_eq!(
            store.organism_file("human", "go.obo"),
            Utf8PathBuf::from("/data/refinery/human/go.obo")
        );
    }

    #[test]
    fn atomic_write_creates_parents() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let path = root.join("nested").join("out.json");
        Store::write_bytes_atomic(&path, b"[]").unwrap();
        assert_eq!(std::fs::read(path.as_std_path()).unwrap(), b"[]");
        assert!(!root.join("nested").join("out.tmp").as_std_path().exists());
    }
}
