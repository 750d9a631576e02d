//! # Router (§4.9)
//!
//! Resolves a task name to a destination queue: exact route, then the
//! highest-priority matching glob pattern, then the task's own declared
//! route, then the default queue. A tenant overlay composes after routing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::RouterError;

const DEFAULT_QUEUE: &str = "celery";

#[derive(Clone)]
struct PatternRoute {
    segments: Vec<String>,
    queue: String,
}

/// How a resolved queue name is combined with a tenant id.
#[derive(Clone)]
pub enum TenantOverlay {
    /// `queue{separator}tenant`
    Suffix,
    /// `tenant{separator}queue`
    Prefix,
    /// `queue{separator}tenant` reinterpreted as a hierarchical path (same
    /// rendering as Suffix; kept distinct for callers that care about intent).
    Path,
    Custom(Arc<dyn Fn(&str, &str) -> String + Send + Sync>),
}

impl std::fmt::Debug for TenantOverlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Suffix => write!(f, "Suffix"),
            Self::Prefix => write!(f, "Prefix"),
            Self::Path => write!(f, "Path"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Resolves task names to destination queues (§4.9).
#[derive(Debug, Clone)]
pub struct Router {
    exact: HashMap<String, String>,
    patterns: Vec<PatternRouteDebug>,
    default_queue: String,
    tenant_overlay: Option<(TenantOverlay, String)>,
    tenant_allow_list: Option<HashSet<String>>,
}

#[derive(Clone)]
struct PatternRouteDebug(PatternRoute);

impl std::fmt::Debug for PatternRouteDebug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternRoute")
            .field("pattern", &self.0.segments.join("/"))
            .field("queue", &self.0.queue)
            .finish()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            exact: HashMap::new(),
            patterns: Vec::new(),
            default_queue: DEFAULT_QUEUE.to_string(),
            tenant_overlay: None,
            tenant_allow_list: None,
        }
    }

    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = queue.into();
        self
    }

    pub fn add_exact_route(mut self, task_name: impl Into<String>, queue: impl Into<String>) -> Self {
        self.exact.insert(task_name.into(), queue.into());
        self
    }

    /// `pattern` uses `*` to match exactly one `.`-separated segment and
    /// `**` to match zero or more.
    pub fn add_pattern_route(mut self, pattern: impl Into<String>, queue: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let segments = pattern.split('.').map(str::to_string).collect();
        self.patterns.push(PatternRouteDebug(PatternRoute { segments, queue: queue.into() }));
        self
    }

    pub fn with_tenant_overlay(mut self, overlay: TenantOverlay, separator: impl Into<String>) -> Self {
        self.tenant_overlay = Some((overlay, separator.into()));
        self
    }

    pub fn with_tenant_allow_list(mut self, allowed: impl IntoIterator<Item = String>) -> Self {
        self.tenant_allow_list = Some(allowed.into_iter().collect());
        self
    }

    /// Priority = 10·segments − 5·single-wildcards − 10·double-wildcards.
    fn pattern_priority(segments: &[String]) -> i64 {
        let mut priority = 10 * segments.len() as i64;
        for segment in segments {
            match segment.as_str() {
                "**" => priority -= 10,
                "*" => priority -= 5,
                _ => {}
            }
        }
        priority
    }

    fn pattern_matches(segments: &[String], name_segments: &[&str]) -> bool {
        match segments.split_first() {
            None => name_segments.is_empty(),
            Some((head, rest)) if head == "**" => {
                if rest.is_empty() {
                    return true;
                }
                (0..=name_segments.len()).any(|i| Self::pattern_matches(rest, &name_segments[i..]))
            }
            Some((head, rest)) => match name_segments.split_first() {
                Some((first, name_rest)) if head == "*" || head == *first => {
                    Self::pattern_matches(rest, name_rest)
                }
                _ => false,
            },
        }
    }

    fn best_pattern_match(&self, task_name: &str) -> Option<&str> {
        let name_segments: Vec<&str> = task_name.split('.').collect();
        self.patterns
            .iter()
            .filter(|p| Self::pattern_matches(&p.0.segments, &name_segments))
            .max_by_key(|p| Self::pattern_priority(&p.0.segments))
            .map(|p| p.0.queue.as_str())
    }

    /// Resolve a task's destination queue: exact route, best pattern match,
    /// the task's own declared route, then the configured default.
    pub fn queue(&self, task_name: &str, declared_route: Option<&str>) -> String {
        if let Some(queue) = self.exact.get(task_name) {
            return queue.clone();
        }
        if let Some(queue) = self.best_pattern_match(task_name) {
            return queue.to_string();
        }
        if let Some(queue) = declared_route {
            return queue.to_string();
        }
        self.default_queue.clone()
    }

    /// Apply the tenant overlay (if configured) to a resolved queue name,
    /// after validating `tenant_id` against the allow-list (if configured).
    pub fn apply_tenant(&self, queue: &str, tenant_id: &str) -> Result<String, RouterError> {
        if let Some(allowed) = &self.tenant_allow_list {
            if !allowed.contains(tenant_id) {
                return Err(RouterError::TenantNotAllowed(tenant_id.to_string()));
            }
        }
        let Some((overlay, separator)) = &self.tenant_overlay else {
            return Ok(queue.to_string());
        };
        Ok(match overlay {
            TenantOverlay::Suffix | TenantOverlay::Path => format!("{queue}{separator}{tenant_id}"),
            TenantOverlay::Prefix => format!("{tenant_id}{separator}{queue}"),
            TenantOverlay::Custom(f) => f(queue, tenant_id),
        })
    }
}
