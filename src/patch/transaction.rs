//! File-level transaction used by the patch engine.
//!
//! Every path is backed up (or recorded as absent) the first time it is
//! touched. Rolling back restores those bytes, deletes files that did not
//! exist before, and removes directories the transaction created. A
//! transaction dropped without `commit` rolls itself back.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct Transaction {
    /// `None` marks a path that did not exist before the transaction.
    backups: BTreeMap<PathBuf, Option<Vec<u8>>>,
    created_dirs: Vec<PathBuf>,
    finished: bool,
}

impl Transaction {
    pub fn begin() -> Self {
        Self {
            backups: BTreeMap::new(),
            created_dirs: Vec::new(),
            finished: false,
        }
    }

    fn backup(&mut self, path: &Path) -> io::Result<()> {
        if self.backups.contains_key(path) {
            return Ok(());
        }
        let previous = match fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(err),
        };
        self.backups.insert(path.to_path_buf(), previous);
        Ok(())
    }

    fn ensure_parent(&mut self, path: &Path) -> io::Result<()> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        let mut missing = Vec::new();
        let mut current = parent;
        while !current.exists() {
            missing.push(current.to_path_buf());
            match current.parent() {
                Some(p) => current = p,
                None => break,
            }
        }
        // Outermost first, so rollback can remove them innermost first.
        for dir in missing.into_iter().rev() {
            fs::create_dir(&dir)?;
            self.created_dirs.push(dir);
        }
        Ok(())
    }

    pub fn write(&mut self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        self.backup(path)?;
        self.ensure_parent(path)?;
        fs::write(path, bytes)
    }

    pub fn remove(&mut self, path: &Path) -> io::Result<()> {
        self.backup(path)?;
        match fs::remove_file(path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    /// Keep every change and return the sorted list of touched paths.
    pub fn commit(mut self) -> Vec<PathBuf> {
        self.finished = true;
        std::mem::take(&mut self.backups).into_keys().collect()
    }

    pub fn rollback(mut self) -> io::Result<()> {
        self.finished = true;
        self.restore()
    }

    /// Best effort: keeps restoring after a failure and reports the first error.
    fn restore(&mut self) -> io::Result<()> {
        let mut first_err = None;
        for (path, previous) in std::mem::take(&mut self.backups) {
            let result = match previous {
                Some(bytes) => fs::write(&path, bytes),
                None => match fs::remove_file(&path) {
                    Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
                    _ => Ok(()),
                },
            };
            if let Err(err) = result {
                tracing::warn!("Failed to restore {}: {}", path.display(), err);
                first_err.get_or_insert(err);
            }
        }
        for dir in std::mem::take(&mut self.created_dirs).into_iter().rev() {
            // Left in place if something else now lives there.
            let _ = fs::remove_dir(&dir);
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.restore();
        }
    }
}
