//! Identifiers for pages, sessions and widgets.
//!
//! A [`PageId`] is the page URL followed by the session UUID (`/run/<uuid>`,
//! or `/<uuid>` for the root page) and a [`WidgetId`] appends the widget
//! index (`/run/<uuid>/2`). Both parse back into exactly the components they
//! were built from. Names handed to the container runtime are derived by
//! hashing these strings, see [`resource_name`].

use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::{Uuid, Variant};

/// Length of a hyphenated UUID (8-4-4-4-12).
const UUID_LEN: usize = 36;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("malformed page URL {0:?}: {1}")]
    MalformedUrl(String, &'static str),
    #[error("malformed session ID {0:?}: not a UUIDv4")]
    MalformedSessionId(String),
    #[error("malformed widget index {0:?}: not a non-negative integer")]
    MalformedWidgetIndex(String),
    #[error("malformed page ID {0:?}")]
    MalformedPageId(String),
    #[error("malformed widget ID {0:?}")]
    MalformedWidgetId(String),
}

/// Validates a page URL and returns its canonical form (trailing slash
/// removed unless the URL is the root).
pub fn canonical_url(url: &str) -> Result<String, IdError> {
    if url.is_empty() {
        return Err(IdError::MalformedUrl(url.to_string(), "empty"));
    }
    if !url.starts_with('/') {
        return Err(IdError::MalformedUrl(
            url.to_string(),
            "first character is not \"/\"",
        ));
    }
    if url == "/" {
        return Ok(url.to_string());
    }
    let trimmed = url.strip_suffix('/').unwrap_or(url);
    if trimmed[1..].split('/').any(str::is_empty) {
        return Err(IdError::MalformedUrl(
            url.to_string(),
            "multiple slashes after each other",
        ));
    }
    Ok(trimmed.to_string())
}

/// Parses a widget index as it appears in a route or an identifier.
pub fn parse_widget_index(raw: &str) -> Result<usize, IdError> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(IdError::MalformedWidgetIndex(raw.to_string()));
    }
    raw.parse()
        .map_err(|_| IdError::MalformedWidgetIndex(raw.to_string()))
}

/// Client-held session key. Kept verbatim (case included) so identifiers
/// built from it round-trip exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        let malformed = || IdError::MalformedSessionId(raw.to_string());
        if raw.len() != UUID_LEN {
            return Err(malformed());
        }
        let uuid = Uuid::try_parse(raw).map_err(|_| malformed())?;
        if uuid.get_version_num() != 4 || uuid.get_variant() != Variant::RFC4122 {
            return Err(malformed());
        }
        Ok(Self(raw.to_string()))
    }

    /// Fresh random session, used by tests and tooling.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// The unit of sandbox lifetime: one page viewed by one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId {
    url: String,
    session: SessionId,
}

impl PageId {
    pub fn new(url: &str, session: SessionId) -> Result<Self, IdError> {
        Ok(Self {
            url: canonical_url(url)?,
            session,
        })
    }

    /// Builds a page id from raw route components.
    pub fn from_parts(url: &str, session: &str) -> Result<Self, IdError> {
        Self::new(url, SessionId::parse(session)?)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn widget(&self, index: usize) -> WidgetId {
        WidgetId {
            page: self.clone(),
            index,
        }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.url == "/" { "" } else { self.url.as_str() };
        write!(f, "{}/{}", prefix, self.session)
    }
}

impl FromStr for PageId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, session) = s
            .rsplit_once('/')
            .ok_or_else(|| IdError::MalformedPageId(s.to_string()))?;
        let url = if prefix.is_empty() { "/" } else { prefix };
        // Only canonical encodings decode; anything else would not round-trip.
        if prefix == "/" || canonical_url(url)? != url {
            return Err(IdError::MalformedPageId(s.to_string()));
        }
        Self::from_parts(url, session)
    }
}

/// Addresses one widget of one page instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WidgetId {
    page: PageId,
    index: usize,
}

impl WidgetId {
    pub fn new(url: &str, session: SessionId, index: usize) -> Result<Self, IdError> {
        Ok(PageId::new(url, session)?.widget(index))
    }

    pub fn page(&self) -> &PageId {
        &self.page
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for WidgetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.page, self.index)
    }
}

impl FromStr for WidgetId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (page, index) = s
            .rsplit_once('/')
            .ok_or_else(|| IdError::MalformedWidgetId(s.to_string()))?;
        let index = parse_widget_index(index)?;
        Ok(page.parse::<PageId>()?.widget(index))
    }
}

/// Collision-resistant name for a runtime resource (volume, container)
/// derived from an identifier.
pub fn resource_name(prefix: &str, id: &impl fmt::Display) -> String {
    let digest = Sha256::digest(id.to_string().as_bytes());
    format!("{}-{}", prefix, hex::encode(digest))
}

/// Image name of a page. Page images are built once per URL, so a reversible
/// hex encoding is enough here.
pub fn image_name(prefix: &str, url: &str) -> String {
    format!("{}-{}", prefix, hex::encode(url.as_bytes()))
}
