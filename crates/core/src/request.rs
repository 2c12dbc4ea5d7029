//! Intercepted request model.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::Error;

/// Destination class of an outgoing request, as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Document,
    Image,
    Font,
    Script,
    Style,
    #[serde(other)]
    Other,
}

impl Destination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Document => "document",
            Destination::Image => "image",
            Destination::Font => "font",
            Destination::Script => "script",
            Destination::Style => "style",
            Destination::Other => "other",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Destination {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "document" => Ok(Destination::Document),
            "image" => Ok(Destination::Image),
            "font" => Ok(Destination::Font),
            "script" => Ok(Destination::Script),
            "style" => Ok(Destination::Style),
            "other" | "" => Ok(Destination::Other),
            other => Err(Error::InvalidInput(format!("unknown destination: {other}"))),
        }
    }
}

/// A resource request arriving at the interception point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub url: Url,
    pub method: String,
    pub destination: Destination,
    /// Set when the request is a full-document page navigation.
    pub navigate: bool,
}

impl Request {
    /// A plain GET for a subresource.
    pub fn get(url: Url, destination: Destination) -> Self {
        Self { url, method: "GET".into(), destination, navigate: false }
    }

    /// A page navigation.
    pub fn navigation(url: Url) -> Self {
        Self { url, method: "GET".into(), destination: Destination::Document, navigate: true }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into().to_ascii_uppercase();
        self
    }

    /// Only whole-resource GETs are ever answered from the store.
    pub fn is_cacheable_method(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }
}
