use std::collections::BTreeSet;
use std::path::Path;

use regex::Regex;

use crate::error::Result;
use crate::utils::config::{compile_anchored, FolderConfig};

/// Include/exclude rules of one folder, applied to base names.
///
/// Exclusions always win. A name is admitted when an include regex matches
/// it or it is one of the literal names.
#[derive(Debug, Clone)]
pub struct PathFilter {
    names: BTreeSet<String>,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl PathFilter {
    pub fn new<N, I, E>(names: N, include: I, exclude: E) -> Result<Self>
    where
        N: IntoIterator,
        N::Item: Into<String>,
        I: IntoIterator,
        I::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        Ok(Self {
            names: names.into_iter().map(Into::into).collect(),
            include: include
                .into_iter()
                .map(|p| compile_anchored(p.as_ref()))
                .collect::<Result<_>>()?,
            exclude: exclude
                .into_iter()
                .map(|p| compile_anchored(p.as_ref()))
                .collect::<Result<_>>()?,
        })
    }

    pub fn from_config(config: &FolderConfig) -> Result<Self> {
        Self::new(
            config.whitelist.iter().cloned(),
            &config.whitelist_regex,
            &config.blacklist_regex,
        )
    }

    pub fn admits_name(&self, name: &str) -> bool {
        if self.exclude.iter().any(|re| re.is_match(name)) {
            return false;
        }
        self.include.iter().any(|re| re.is_match(name)) || self.names.contains(name)
    }

    pub fn admits(&self, path: &Path) -> bool {
        path.file_name()
            .map(|name| self.admits_name(&name.to_string_lossy()))
            .unwrap_or(false)
    }

    /// Literal names, in order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}
