//! Fetch routing policy.
//!
//! The hosted application is a client-routed single-page app: the server
//! has nothing to render for `/anything?with=query`. So any same-origin URL
//! carrying a query string is answered with the application shell, either
//! by redirecting top-level navigations to `/` or by serving the cached
//! root document for everything else. Query-free requests are cache-first.

use url::Url;

/// Path of the application shell document.
pub const SHELL_PATH: &str = "/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    Navigate,
    SameOrigin,
    NoCors,
    Cors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Document,
    Script,
    Style,
    Image,
    Font,
    Manifest,
    Empty,
    Other,
}

impl Destination {
    pub fn parse(s: &str) -> Self {
        match s {
            "document" => Destination::Document,
            "script" => Destination::Script,
            "style" => Destination::Style,
            "image" => Destination::Image,
            "font" => Destination::Font,
            "manifest" => Destination::Manifest,
            "" | "empty" => Destination::Empty,
            _ => Destination::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: Url,
    pub method: String,
    pub mode: RequestMode,
    pub destination: Destination,
}

impl FetchRequest {
    /// A top-level document load, as from the address bar.
    pub fn navigate(url: Url) -> Self {
        Self {
            url,
            method: "GET".to_string(),
            mode: RequestMode::Navigate,
            destination: Destination::Document,
        }
    }

    /// A programmatic fetch or subresource load.
    pub fn subresource(url: Url, destination: Destination) -> Self {
        Self {
            url,
            method: "GET".to_string(),
            mode: RequestMode::Cors,
            destination,
        }
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_ascii_uppercase();
        self
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate || self.destination == Destination::Document
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Not ours; the browser handles it.
    Ignore,
    /// 302 to the shell.
    RedirectToRoot,
    /// Cached shell document, else shell from network.
    ServeShell,
    /// Cached entry under `key`, else the network.
    CacheFirst { key: String },
    /// Straight to the network. The cache only answers GETs.
    Passthrough,
}

/// Origin-relative cache key: path plus query, fragment dropped.
pub fn cache_key(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

pub fn route(request: &FetchRequest, origin: &Url) -> Route {
    if request.url.origin() != origin.origin() {
        return Route::Ignore;
    }

    // A bare trailing `?` carries no parameters
    let has_query = request.url.query().is_some_and(|q| !q.is_empty());
    if has_query {
        return if request.is_navigation() {
            Route::RedirectToRoot
        } else {
            Route::ServeShell
        };
    }

    if request.method != "GET" {
        return Route::Passthrough;
    }

    Route::CacheFirst {
        key: cache_key(&request.url),
    }
}
