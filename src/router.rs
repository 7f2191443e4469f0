//! Longest-prefix route resolution
//!
//! The table is built once from the validated descriptor list and never
//! mutated afterwards, so request handlers read it without locking.

use crate::config::RouteDescriptor;

/// Read-only routing view: specific prefixes sorted longest-first, plus
/// an optional default/catch-all descriptor.
#[derive(Debug)]
pub struct RouteTable {
    specific: Vec<RouteDescriptor>,
    default: Option<RouteDescriptor>,
}

impl RouteTable {
    /// Build the table from resolved descriptors. Expects prefixes to be
    /// normalized and validated (unique, at most one root).
    pub fn new(routers: &[RouteDescriptor]) -> Self {
        let mut specific: Vec<RouteDescriptor> = routers
            .iter()
            .filter(|r| !r.prefix.as_deref().unwrap_or("").is_empty())
            .cloned()
            .collect();
        specific.sort_by(|a, b| {
            let al = a.prefix.as_deref().unwrap_or("").len();
            let bl = b.prefix.as_deref().unwrap_or("").len();
            bl.cmp(&al)
        });

        let default = routers.iter().find(|r| r.is_default()).cloned();

        Self { specific, default }
    }

    /// Resolve a request path to its owning backend and the path to
    /// forward upstream.
    ///
    /// The longest matching non-root prefix wins; the forwarded path is
    /// the remainder re-rooted at `/`. The default descriptor catches
    /// everything else with the path unchanged. `None` means the path is
    /// unroutable.
    pub fn resolve<'a>(&'a self, path: &str) -> Option<(&'a RouteDescriptor, String)> {
        let rooted;
        let path = if path.starts_with('/') {
            path
        } else {
            rooted = format!("/{}", path);
            &rooted
        };

        for router in &self.specific {
            let prefix = router.prefix.as_deref().unwrap_or("");
            if path == prefix || path.starts_with(&format!("{}/", prefix)) {
                let remainder = &path[prefix.len()..];
                let forwarded = if remainder.is_empty() {
                    "/".to_string()
                } else if remainder.starts_with('/') {
                    remainder.to_string()
                } else {
                    format!("/{}", remainder)
                };
                return Some((router, forwarded));
            }
        }

        self.default.as_ref().map(|r| (r, path.to_string()))
    }

    /// Whether any descriptor owns the root prefix
    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }
}
