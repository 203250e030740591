use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::PipelineError;

/// True when `path` is a non-empty file or a directory holding one, at any depth.
pub fn is_populated(path: &Utf8Path) -> bool {
    let std_path = path.as_std_path();
    if std_path.is_file() {
        return fs::metadata(std_path)
            .map(|meta| meta.len() > 0)
            .unwrap_or(false);
    }
    let Ok(entries) = fs::read_dir(std_path) else {
        return false;
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| Utf8PathBuf::from_path_buf(entry.path()).ok())
        .any(|entry| is_populated(&entry))
}

pub fn list_files(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, PipelineError> {
    list_entries(dir, false)
}

pub fn list_dirs(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, PipelineError> {
    list_entries(dir, true)
}

pub fn files_with_suffix(dir: &Utf8Path, suffix: &str) -> Result<Vec<Utf8PathBuf>, PipelineError> {
    Ok(list_files(dir)?
        .into_iter()
        .filter(|path| path.file_name().is_some_and(|name| name.ends_with(suffix)))
        .collect())
}

pub fn files_with_ext(dir: &Utf8Path, ext: &str) -> Result<Vec<Utf8PathBuf>, PipelineError> {
    Ok(list_files(dir)?
        .into_iter()
        .filter(|path| {
            path.extension()
                .map(|value| value.eq_ignore_ascii_case(ext))
                .unwrap_or(false)
        })
        .collect())
}

fn list_entries(dir: &Utf8Path, dirs: bool) -> Result<Vec<Utf8PathBuf>, PipelineError> {
    let entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| PipelineError::Filesystem(format!("read {dir}: {err}")))?;
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        let path = Utf8PathBuf::from_path_buf(entry.path())
            .map_err(|path| PipelineError::Filesystem(format!("non-utf8 path {}", path.display())))?;
        let is_dir = path.as_std_path().is_dir();
        if is_dir == dirs {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn populated_and_listing() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        assert!(!is_populated(&root));
        assert!(!is_populated(&root.join("missing")));

        fs::write(root.join("b_states.sto"), "x").unwrap();
        fs::write(root.join("a.mot"), "x").unwrap();
        fs::write(root.join("empty.mot"), "").unwrap();
        fs::create_dir(root.join("run1")).unwrap();

        assert!(is_populated(&root));
        assert!(!is_populated(&root.join("empty.mot")));
        assert_eq!(list_dirs(&root).unwrap(), vec![root.join("run1")]);
        assert_eq!(list_files(&root).unwrap().len(), 3);
        assert_eq!(
            files_with_ext(&root, "MOT").unwrap(),
            vec![root.join("a.mot"), root.join("empty.mot")]
        );
        assert_eq!(
            files_with_suffix(&root, "_states.sto").unwrap(),
            vec![root.join("b_states.sto")]
        );
    }

    #[test]
    fn folders_of_empty_entries_are_not_populated() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("ID/trial")).unwrap();
        fs::write(root.join("ID/second.sto"), "").unwrap();
        assert!(!is_populated(&root.join("ID")));

        fs::write(root.join("ID/trial/inverse_dynamics.sto"), "t").unwrap();
        assert!(is_populated(&root.join("ID")));
    }
}
