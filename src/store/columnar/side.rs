use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::table::Table;
use crate::error::{Result, StoreError};
use crate::lock;

/// Producer-private tables folded into the shared table later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideKind {
    /// Written by flushes in incremental mode, folded by consolidation.
    Incremental,
    /// Written when a flush fails, folded at the next open.
    Recovery,
}

impl SideKind {
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Incremental => "incremental",
            Self::Recovery => "recovery",
        }
    }
}

/// Writes `table` as `<dir>/<prefix>_<pid>_<micros>.json`. No lock is needed: the name is
/// unique to this process and the write is atomic.
pub fn write(dir: &Path, kind: SideKind, table: &Table) -> Result<PathBuf> {
    let name = format!(
        "{}_{}_{}.json",
        kind.prefix(),
        std::process::id(),
        lock::unique_timestamp_micros()
    );
    let path = dir.join(name);
    lock::write_json_atomic(&path, table)?;
    Ok(path)
}

/// Lists side files of `kind`, oldest name first. In-progress temp files are never listed.
pub fn list(dir: &Path, kind: SideKind) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };

    let prefix = format!("{}_", kind.prefix());
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with(&prefix) && name.ends_with(".json") {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_list() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = write(dir.path(), SideKind::Incremental, &Table::new()).expect("write a");
        let b = write(dir.path(), SideKind::Incremental, &Table::new()).expect("write b");
        write(dir.path(), SideKind::Recovery, &Table::new()).expect("write recovery");
        fs::write(dir.path().join(".tmp-incremental_1_1.json"), b"{").expect("temp");

        assert_ne!(a, b);
        let listed = list(dir.path(), SideKind::Incremental).expect("list");
        assert_eq!(listed.len(), 2);
        assert!(file_name(&listed[0]).starts_with(&format!("incremental_{}_", std::process::id())));
        assert_eq!(list(dir.path(), SideKind::Recovery).expect("list").len(), 1);
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let listed = list(&dir.path().join("absent"), SideKind::Recovery).expect("list");
        assert!(listed.is_empty());
    }
}
