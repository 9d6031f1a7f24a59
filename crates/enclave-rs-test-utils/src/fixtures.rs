use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Temporary host project plus a sibling state directory for drivers.
pub struct ProjectTree {
    temp: TempDir,
}

impl ProjectTree {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("project")).expect("project dir");
        fs::create_dir_all(temp.path().join("state")).expect("state dir");
        Self { temp }
    }

    /// Seed the project with `(relative path, contents)` pairs.
    pub fn with_files(self, files: &[(&str, &str)]) -> Self {
        for (path, contents) in files {
            write_file(&self.root(), path, contents);
        }
        self
    }

    /// Canonical project root.
    pub fn root(&self) -> PathBuf {
        self.temp
            .path()
            .join("project")
            .canonicalize()
            .expect("canonical project root")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.temp.path().join("state")
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }
}

impl Default for ProjectTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Write a file, creating parent directories.
pub fn write_file(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("parent dirs");
    }
    fs::write(path, contents).expect("write file");
}

/// Read a file as UTF-8, `None` when it does not exist.
pub fn read_file(root: &Path, relative: &str) -> Option<String> {
    fs::read_to_string(root.join(relative)).ok()
}
