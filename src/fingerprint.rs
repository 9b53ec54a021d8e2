// src/fingerprint.rs

//! Turning a task's declared inputs into a staleness fingerprint.
//!
//! A fingerprint is a blake3 digest over:
//! - the task's command spec (`cmd`, `cwd`, `env`), so editing a command
//!   counts as an input change, followed by
//! - each entry of `fingerprint_inputs`, in declaration order.
//!
//! Each piece is tagged and length-prefixed, so `["ab", "c"]` and
//! `["a", "bc"]` never collide. Identical inputs always produce the same
//! fingerprint.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use blake3::Hasher;
use globset::Glob;
use tracing::debug;

use crate::dag::definition::{FingerprintInput, TaskDefinition};
use crate::fs::{FileSystem, RealFileSystem};

/// Where `env` inputs are read from.
#[derive(Debug, Clone)]
enum EnvSource {
    Process,
    Fixed(BTreeMap<String, String>),
}

/// Resolves fingerprint inputs relative to a project root.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    fs: Arc<dyn FileSystem>,
    root: PathBuf,
    env: EnvSource,
    excluded: Vec<PathBuf>,
}

impl Fingerprinter {
    /// Fingerprinter over the real filesystem and process environment.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            fs: Arc::new(RealFileSystem),
            root: root.into(),
            env: EnvSource::Process,
            excluded: Vec::new(),
        }
    }

    /// Use a custom filesystem (e.g. [`crate::fs::mock::MockFileSystem`]).
    pub fn with_fs(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    /// Read `env` inputs from a fixed map instead of the process environment.
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = EnvSource::Fixed(env);
        self
    }

    /// Never descend into (or match) these paths when expanding globs.
    ///
    /// Paths compare as given, so pass them joined onto the same root.
    pub fn with_excluded<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.excluded.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compute the fingerprint of a task from its current inputs.
    pub fn fingerprint(&self, def: &TaskDefinition) -> Result<String> {
        let mut hasher = Hasher::new();

        update_field(&mut hasher, "cmd", def.command.cmd.as_bytes());
        if let Some(cwd) = &def.command.cwd {
            update_field(&mut hasher, "cwd", cwd.to_string_lossy().as_bytes());
        }
        for (key, value) in &def.command.env {
            update_field(&mut hasher, "cmd-env", format!("{key}={value}").as_bytes());
        }

        for input in &def.fingerprint_inputs {
            match input {
                FingerprintInput::Value(value) => {
                    update_field(&mut hasher, "value", value.as_bytes());
                }
                FingerprintInput::Env(name) => {
                    let value = self.env_var(name);
                    let entry = match value {
                        Some(v) => format!("{name}={v}"),
                        None => format!("{name} unset"),
                    };
                    update_field(&mut hasher, "env", entry.as_bytes());
                }
                FingerprintInput::File(path) => {
                    let full = self.root.join(path);
                    let digest = if self.fs.is_file(&full) {
                        compute_file_hash(self.fs.as_ref(), &full)?
                    } else {
                        "missing".to_string()
                    };
                    let entry = format!("{}={}", path.to_string_lossy(), digest);
                    update_field(&mut hasher, "file", entry.as_bytes());
                }
                FingerprintInput::Glob(pattern) => {
                    let files = collect_matching_files(self.fs.as_ref(), &self.root, pattern, &self.excluded)
                        .with_context(|| format!("expanding glob input '{pattern}'"))?;
                    let digest = compute_hash_for_paths(self.fs.as_ref(), &self.root, files)?;
                    let entry = format!("{pattern}={digest}");
                    update_field(&mut hasher, "glob", entry.as_bytes());
                }
            }
        }

        let fingerprint = hasher.finalize().to_hex().to_string();
        debug!(task = %def.name, fingerprint = %fingerprint, "computed task fingerprint");
        Ok(fingerprint)
    }

    fn env_var(&self, name: &str) -> Option<String> {
        match &self.env {
            EnvSource::Process => std::env::var(name).ok(),
            EnvSource::Fixed(map) => map.get(name).cloned(),
        }
    }
}

fn update_field(hasher: &mut Hasher, tag: &str, bytes: &[u8]) {
    hasher.update(tag.as_bytes());
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Compute the hash of a single file.
pub fn compute_file_hash(fs: &dyn FileSystem, path: &Path) -> Result<String> {
    let mut hasher = Hasher::new();
    let mut file = fs
        .open_read(path)
        .with_context(|| format!("opening file for hashing: {:?}", path))?;
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Compute a deterministic hash over the contents of the given files.
///
/// Order of `paths` does not matter; they are sorted before hashing. Paths
/// are mixed in relative to `root`, so renaming a file changes the hash.
pub fn compute_hash_for_paths<I, P>(fs: &dyn FileSystem, root: &Path, paths: I) -> Result<String>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut hasher = Hasher::new();

    let mut paths_vec: Vec<PathBuf> = paths
        .into_iter()
        .map(|p| p.as_ref().to_path_buf())
        .collect();
    paths_vec.sort();

    for path in paths_vec {
        if fs.is_file(&path) {
            let rel = path.strip_prefix(root).unwrap_or(&path);
            let file_hash = compute_file_hash(fs, &path)?;
            update_field(&mut hasher, "path", rel.to_string_lossy().as_bytes());
            hasher.update(file_hash.as_bytes());
        }
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// Collect all files under `root` whose root-relative path matches `pattern`,
/// skipping anything in `excluded`.
pub fn collect_matching_files(
    fs: &dyn FileSystem,
    root: &Path,
    pattern: &str,
    excluded: &[PathBuf],
) -> Result<Vec<PathBuf>> {
    let matcher = Glob::new(pattern)
        .with_context(|| format!("invalid glob pattern: {pattern}"))?
        .compile_matcher();

    let mut files = Vec::new();
    if !fs.is_dir(root) {
        return Ok(files);
    }
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for path in fs.read_dir(&dir)? {
            if excluded.contains(&path) {
                continue;
            }
            if fs.is_dir(&path) {
                stack.push(path);
            } else if fs.is_file(&path) {
                if let Ok(rel) = path.strip_prefix(root) {
                    let rel_str = rel.to_string_lossy().replace('\\', "/");
                    if matcher.is_match(&rel_str) {
                        files.push(path);
                    }
                }
            }
        }
    }

    Ok(files)
}
