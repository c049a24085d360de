//! Read-only page catalog.
//!
//! The catalog is produced by the page discovery step (markdown parsing and
//! image builds happen elsewhere) and handed over as JSON. It is loaded once
//! at startup and shared immutably afterwards.

use crate::ids::{self, IdError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("read catalog {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("decode catalog: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid page URL: {0}")]
    Url(#[from] IdError),
    #[error("duplicate page URL {0}")]
    Duplicate(String),
}

/// A widget as declared on a page. Its identity is its position in the
/// page's widget list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Widget {
    Markdown {
        content: String,
    },
    Text {
        file: String,
    },
    Image {
        file: String,
    },
    Button {
        label: String,
        command: String,
    },
    Editor {
        file: String,
    },
    #[serde(rename_all = "camelCase")]
    Terminal {
        working_directory: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetKind {
    Markdown,
    Text,
    Image,
    Button,
    Editor,
    Terminal,
}

impl fmt::Display for WidgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WidgetKind::Markdown => "markdown",
            WidgetKind::Text => "text",
            WidgetKind::Image => "image",
            WidgetKind::Button => "button",
            WidgetKind::Editor => "editor",
            WidgetKind::Terminal => "terminal",
        };
        f.write_str(name)
    }
}

impl Widget {
    pub fn kind(&self) -> WidgetKind {
        match self {
            Widget::Markdown { .. } => WidgetKind::Markdown,
            Widget::Text { .. } => WidgetKind::Text,
            Widget::Image { .. } => WidgetKind::Image,
            Widget::Button { .. } => WidgetKind::Button,
            Widget::Editor { .. } => WidgetKind::Editor,
            Widget::Terminal { .. } => WidgetKind::Terminal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub url: String,
    #[serde(default)]
    pub title: String,
    pub widgets: Vec<Widget>,
    #[serde(default)]
    pub is_interactive: bool,
}

impl Page {
    pub fn widget(&self, index: usize) -> Option<&Widget> {
        self.widgets.get(index)
    }
}

#[derive(Deserialize)]
struct CatalogFile {
    pages: Vec<Page>,
}

#[derive(Debug, Default)]
pub struct Catalog {
    pages: HashMap<String, Arc<Page>>,
    // Longest URL first, so prefix matching finds the most specific page.
    order: Vec<String>,
}

impl Catalog {
    pub fn new(pages: impl IntoIterator<Item = Page>) -> Result<Self, CatalogError> {
        let mut map = HashMap::new();
        for mut page in pages {
            page.url = ids::canonical_url(&page.url)?;
            let url = page.url.clone();
            if map.insert(url.clone(), Arc::new(page)).is_some() {
                return Err(CatalogError::Duplicate(url));
            }
        }
        let mut order: Vec<String> = map.keys().cloned().collect();
        order.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        Ok(Self { pages: map, order })
    }

    pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(raw)?;
        Self::new(file.pages)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn get_page(&self, url: &str) -> Option<Arc<Page>> {
        self.pages.get(url).cloned()
    }

    /// Page URLs, longest first.
    pub fn list_pages(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Finds the most specific page whose URL is a segment-aligned prefix of
    /// `path` and returns it with the remainder of the path (without the
    /// separating slash).
    pub fn match_prefix<'p>(&self, path: &'p str) -> Option<(Arc<Page>, &'p str)> {
        self.order.iter().find_map(|url| {
            let rest = if url == "/" {
                path.strip_prefix('/')?
            } else {
                path.strip_prefix(url.as_str())?.strip_prefix('/')?
            };
            self.get_page(url).map(|page| (page, rest))
        })
    }
}
