use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::Context as _;

use crate::error::PipelineError;

pub fn list_files_recursively_sorted(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        let mut entries = fs::read_dir(&current)
            .map_err(|err| PipelineError::io(&current, err))?
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("list dir: {}", current.display()))?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let file_type = entry.file_type().context("read entry type")?;
            if file_type.is_dir() {
                stack.push(path);
                continue;
            }
            if file_type.is_file() {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Like [`list_files_recursively_sorted`], but relative to `dir` and empty
/// when `dir` does not exist.
pub fn relative_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    list_files_recursively_sorted(dir)?
        .into_iter()
        .map(|path| {
            path.strip_prefix(dir)
                .map(Path::to_path_buf)
                .with_context(|| format!("strip prefix {}: {}", dir.display(), path.display()))
        })
        .collect()
}

pub fn list_dirs(dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir).map_err(|err| PipelineError::io(dir, err))? {
        let entry = entry.with_context(|| format!("list dir: {}", dir.display()))?;
        if entry.file_type().context("read entry type")?.is_dir() {
            dirs.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    dirs.sort();
    Ok(dirs)
}

pub fn list_file_names(dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(|err| PipelineError::io(dir, err))? {
        let entry = entry.with_context(|| format!("list dir: {}", dir.display()))?;
        if entry.file_type().context("read entry type")?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

pub fn write_file(path: &Path, contents: impl AsRef<[u8]>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|err| PipelineError::io(parent, err))?;
    }
    fs::write(path, contents).map_err(|err| PipelineError::io(path, err))?;
    Ok(())
}

pub fn copy_file(from: &Path, to: &Path) -> anyhow::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|err| PipelineError::io(parent, err))?;
    }
    fs::copy(from, to)
        .map_err(|err| PipelineError::io(from, err))
        .with_context(|| format!("copy to {}", to.display()))?;
    Ok(())
}

pub fn copy_tree(from: &Path, to: &Path) -> anyhow::Result<usize> {
    let files = relative_files(from)?;
    for rel in &files {
        copy_file(&from.join(rel), &to.join(rel))?;
    }
    Ok(files.len())
}

/// Copy files into `to` by file name only, dropping their directories.
pub fn flatten_into(files: &[PathBuf], to: &Path) -> anyhow::Result<()> {
    for file in files {
        let name = file
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("path has no file name: {}", file.display()))?;
        copy_file(file, &to.join(name))?;
    }
    Ok(())
}

pub fn remove_dir_if_exists(dir: &Path) -> anyhow::Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(PipelineError::io(dir, err).into()),
    }
}

pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|e| ext.eq_ignore_ascii_case(e)))
}

/// Apply literal replacements, in order, to every file below `root` with one
/// of `extensions`. Returns how many files changed.
pub fn replace_in_files(
    root: &Path,
    extensions: &[&str],
    replacements: &[(&str, &str)],
) -> anyhow::Result<usize> {
    let mut changed = 0_usize;
    for path in list_files_recursively_sorted(root)? {
        if !has_extension(&path, extensions) {
            continue;
        }
        // Bytes, not text: vendor bundles are not always UTF-8.
        let contents = fs::read(&path).map_err(|err| PipelineError::io(&path, err))?;
        let rewritten = replacements.iter().fold(contents.clone(), |acc, (from, to)| {
            replace_bytes(&acc, from.as_bytes(), to.as_bytes())
        });
        if rewritten != contents {
            fs::write(&path, rewritten).map_err(|err| PipelineError::io(&path, err))?;
            changed += 1;
        }
    }
    Ok(changed)
}

pub fn apply_replacements(contents: &str, replacements: &[(&str, &str)]) -> String {
    replacements
        .iter()
        .fold(contents.to_owned(), |acc, (from, to)| acc.replace(from, to))
}

fn replace_bytes(haystack: &[u8], from: &[u8], to: &[u8]) -> Vec<u8> {
    if from.is_empty() {
        return haystack.to_vec();
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(pos) = rest.windows(from.len()).position(|window| window == from) {
        out.extend_from_slice(&rest[..pos]);
        out.extend_from_slice(to);
        rest = &rest[pos + from.len()..];
    }
    out.extend_from_slice(rest);
    out
}

/// Resolves `.` and `..` without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Path with `/` separators, the way glob patterns and zip entries want it.
pub fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
