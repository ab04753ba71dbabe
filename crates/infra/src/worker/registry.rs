//! Process-wide map from `job_type` to handler.

use std::collections::HashMap;
use std::sync::Arc;

use courseforge_core::{CoreError, RetryPolicy};

use super::handler::JobHandler;

#[derive(Clone)]
struct Registration {
    handler: Arc<dyn JobHandler>,
    max_attempts: Option<u32>,
}

/// Handlers keyed by job type pattern.
///
/// Lookup order: exact match, then `prefix.*` patterns (longest prefix wins),
/// then the `*` catch-all.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Registration>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns: Vec<&String> = self.handlers.keys().collect();
        patterns.sort();
        f.debug_struct("HandlerRegistry").field("patterns", &patterns).finish()
    }
}

/// Resolved handler plus its retry budget.
#[derive(Clone)]
pub struct ResolvedHandler {
    pub handler: Arc<dyn JobHandler>,
    pub retry: RetryPolicy,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pattern: impl Into<String>, handler: Arc<dyn JobHandler>) -> Result<(), CoreError> {
        self.insert(pattern.into(), handler, None)
    }

    /// Register with a per-type attempt budget.
    ///
    /// The budget can only lower the global `max_attempts`: the claimer never
    /// hands out a row past the global budget, so a larger value is capped at
    /// resolve time.
    pub fn register_with_max_attempts(
        &mut self,
        pattern: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        max_attempts: u32,
    ) -> Result<(), CoreError> {
        if max_attempts == 0 {
            return Err(CoreError::config("max_attempts must be >= 1"));
        }
        self.insert(pattern.into(), handler, Some(max_attempts))
    }

    fn insert(
        &mut self,
        pattern: String,
        handler: Arc<dyn JobHandler>,
        max_attempts: Option<u32>,
    ) -> Result<(), CoreError> {
        if pattern.trim().is_empty() {
            return Err(CoreError::config("handler pattern must not be empty"));
        }
        if self.handlers.contains_key(&pattern) {
            return Err(CoreError::config(format!("handler already registered for {pattern}")));
        }
        self.handlers.insert(pattern, Registration { handler, max_attempts });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Find the handler for `job_type`; `default_retry` applies unless the
    /// registration sets a lower `max_attempts`.
    pub fn resolve(&self, job_type: &str, default_retry: RetryPolicy) -> Option<ResolvedHandler> {
        let registration = self.lookup(job_type)?;
        let retry = match registration.max_attempts {
            Some(n) => default_retry.with_max_attempts(n.min(default_retry.max_attempts)),
            None => default_retry,
        };
        Some(ResolvedHandler {
            handler: registration.handler.clone(),
            retry,
        })
    }

    fn lookup(&self, job_type: &str) -> Option<&Registration> {
        if let Some(r) = self.handlers.get(job_type) {
            return Some(r);
        }

        // Category match, e.g. "chat.*" matches "chat.respond".
        self.handlers
            .iter()
            .filter_map(|(pattern, r)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = job_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), r))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, r)| r)
            .or_else(|| self.handlers.get("*"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::handler::{HandlerOutcome, handler_fn};

    fn noop() -> Arc<dyn JobHandler> {
        Arc::new(handler_fn(|_ctx| async { Ok(HandlerOutcome::Succeeded(None)) }))
    }

    #[test]
    fn exact_then_category_then_wildcard() {
        let mut registry = HandlerRegistry::new();
        let exact = noop();
        let category = noop();
        let narrow = noop();
        let any = noop();
        registry.register("chat_respond", exact.clone()).unwrap();
        registry.register("build.*", category.clone()).unwrap();
        registry.register("build.lessons.*", narrow.clone()).unwrap();
        registry.register("*", any.clone()).unwrap();

        let policy = RetryPolicy::default();
        let pick = |t: &str| registry.resolve(t, policy).unwrap().handler;
        assert!(Arc::ptr_eq(&pick("chat_respond"), &exact));
        assert!(Arc::ptr_eq(&pick("build.ingest"), &category));
        assert!(Arc::ptr_eq(&pick("build.lessons.quiz"), &narrow));
        assert!(Arc::ptr_eq(&pick("buildx"), &any));
    }

    #[test]
    fn unknown_type_without_wildcard_is_unresolved() {
        let mut registry = HandlerRegistry::new();
        registry.register("build", noop()).unwrap();
        assert!(registry.resolve("ingest", RetryPolicy::default()).is_none());
    }

    #[test]
    fn per_type_max_attempts_caps_the_default() {
        let mut registry = HandlerRegistry::new();
        registry.register_with_max_attempts("chat_respond", noop(), 1).unwrap();
        let resolved = registry.resolve("chat_respond", RetryPolicy::default()).unwrap();
        assert_eq!(resolved.retry.max_attempts, 1);
        assert!(registry.register("chat_respond", noop()).is_err());
    }

    #[test]
    fn per_type_max_attempts_never_exceeds_the_global_budget() {
        let mut registry = HandlerRegistry::new();
        registry.register_with_max_attempts("build", noop(), 9).unwrap();
        let global = RetryPolicy::default().with_max_attempts(3);
        let resolved = registry.resolve("build", global).unwrap();
        assert_eq!(resolved.retry.max_attempts, 3);
        assert_eq!(resolved.retry.base_delay, global.base_delay);
    }
}
