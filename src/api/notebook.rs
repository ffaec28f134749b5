use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::api::error::StorageError;

/// Workspace notebook export format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotebookFormat {
    Source,
    Html,
    Jupyter,
    Dbc,
}

impl NotebookFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            NotebookFormat::Source => "SOURCE",
            NotebookFormat::Html => "HTML",
            NotebookFormat::Jupyter => "JUPYTER",
            NotebookFormat::Dbc => "DBC",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            NotebookFormat::Source => "source",
            NotebookFormat::Html => "html",
            NotebookFormat::Jupyter => "ipynb",
            NotebookFormat::Dbc => "dbc",
        }
    }

    /// Parses a comma-delimited list such as `"SOURCE,dbc"`.
    pub fn parse_list(s: &str) -> Result<Vec<NotebookFormat>, UnknownNotebookFormat> {
        let mut formats = Vec::new();
        for part in s.split(',').map(str::trim).filter(|part| !part.is_empty()) {
            let format = part.parse()?;
            if !formats.contains(&format) {
                formats.push(format);
            }
        }
        Ok(formats)
    }
}

impl fmt::Display for NotebookFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown notebook format '{0}'")]
pub struct UnknownNotebookFormat(pub String);

impl FromStr for NotebookFormat {
    type Err = UnknownNotebookFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SOURCE" => Ok(NotebookFormat::Source),
            "HTML" => Ok(NotebookFormat::Html),
            "JUPYTER" => Ok(NotebookFormat::Jupyter),
            "DBC" => Ok(NotebookFormat::Dbc),
            _ => Err(UnknownNotebookFormat(s.to_owned())),
        }
    }
}

/// Side channel delivering a notebook's bytes in a requested format.
///
/// `Ok(None)` means the notebook is not available in that format, which is not an error.
pub trait NotebookSource {
    fn export_notebook(&self, path: &str, format: NotebookFormat) -> Result<Option<Vec<u8>>, StorageError>;
}

/// Notebook source for servers without a workspace.
pub struct NoNotebooks;

impl NotebookSource for NoNotebooks {
    fn export_notebook(&self, _path: &str, _format: NotebookFormat) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_comma_delimited_formats() {
        let formats = NotebookFormat::parse_list("SOURCE, dbc,,SOURCE").unwrap();
        assert_eq!(formats, vec![NotebookFormat::Source, NotebookFormat::Dbc]);
        assert!(NotebookFormat::parse_list("SOURCE,PDF").is_err());
        assert!(NotebookFormat::parse_list("").unwrap().is_empty());
    }
}
