use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{error::RenderError, eventually::Eventually};

/// Extension appended to module paths by [`DirResolver`].
pub const DEFAULT_FRAGMENT_EXTENSION: &str = "blx";

/// Supplies template source for `import` and `include`.
pub trait FragmentResolver {
    /// Returns the source text of the fragment named by `module_path`.
    fn resolve(&self, module_path: &str) -> Eventually<String>;
}

pub fn unresolved(module_path: &str) -> RenderError {
    RenderError::unlocated(format!("Could not resolve fragment \"{}\"", module_path))
}

/// Fragments held in memory, keyed by module path.
#[derive(Debug, Clone, Default)]
pub struct MapResolver {
    fragments: HashMap<String, String>,
}

impl MapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<K: Into<String>, V: Into<String>>(&mut self, module_path: K, source: V) {
        self.fragments.insert(module_path.into(), source.into());
    }

    #[must_use]
    pub fn with<K: Into<String>, V: Into<String>>(mut self, module_path: K, source: V) -> Self {
        self.insert(module_path, source);
        self
    }
}

impl FragmentResolver for MapResolver {
    fn resolve(&self, module_path: &str) -> Eventually<String> {
        match self.fragments.get(module_path) {
            Some(source) => Eventually::ready(source.clone()),
            None => Eventually::failed(unresolved(module_path)),
        }
    }
}

/// Reads fragments from a directory; the dotted module path `a.b` names the
/// file `<directory>/a/b.<extension>`.
#[derive(Debug, Clone)]
pub struct DirResolver {
    directory: PathBuf,
    extension: String,
}

impl DirResolver {
    pub fn new<P: Into<PathBuf>>(directory: P) -> Self {
        Self {
            directory: directory.into(),
            extension: DEFAULT_FRAGMENT_EXTENSION.to_string(),
        }
    }

    #[must_use]
    pub fn with_extension<S: Into<String>>(mut self, extension: S) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// The file a module path maps to, or `None` if a segment is empty or
    /// would escape the directory.
    pub fn path_for(&self, module_path: &str) -> Option<PathBuf> {
        let stem = module_path
            .strip_suffix(&format!(".{}", self.extension))
            .unwrap_or(module_path);
        let mut path = self.directory.clone();
        for segment in stem.split('.') {
            if segment.is_empty() || Path::new(segment).has_root() {
                return None;
            }
            path.push(segment);
        }
        path.set_extension(&self.extension);
        Some(path)
    }
}

impl FragmentResolver for DirResolver {
    fn resolve(&self, module_path: &str) -> Eventually<String> {
        let Some(path) = self.path_for(module_path) else {
            return Eventually::failed(unresolved(module_path));
        };
        match std::fs::read_to_string(&path) {
            Ok(source) => {
                debug!(module_path, path = %path.display(), "resolved fragment");
                Eventually::ready(source)
            }
            Err(error) => {
                debug!(module_path, path = %path.display(), %error, "could not read fragment");
                Eventually::failed(unresolved(module_path))
            }
        }
    }
}
