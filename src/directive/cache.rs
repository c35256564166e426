use super::{FunctionDef, FunctionKey, RoutingDirective, compile};
use crate::core::Result;
use log::debug;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

struct CachedPlan {
    fingerprint: u64,
    plan: Arc<RoutingDirective>,
}

/// Compiled plans keyed by function identity.
///
/// A plan is reused as long as the definition's fingerprint is unchanged;
/// a redefined function is recompiled on its next call.
pub struct PlanCache {
    entries: Mutex<LruCache<FunctionKey, CachedPlan>>,
}

impl PlanCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the cached plan for `func`, compiling it if missing or stale.
    ///
    /// Compilation failures are returned and never cached.
    pub fn get_or_compile(&self, func: &FunctionDef) -> Result<Arc<RoutingDirective>> {
        let key = func.key();
        let fingerprint = func.fingerprint();

        {
            let mut entries = self.entries.lock()?;
            if let Some(cached) = entries.get(&key) {
                if cached.fingerprint == fingerprint {
                    return Ok(Arc::clone(&cached.plan));
                }
                debug!("Function {} was redefined, recompiling", func.name);
            }
        }

        // Compile outside the lock; a concurrent compile of the same
        // definition produces an identical plan.
        let plan = Arc::new(compile(func)?);

        let mut entries = self.entries.lock()?;
        entries.put(
            key,
            CachedPlan {
                fingerprint,
                plan: Arc::clone(&plan),
            },
        );
        Ok(plan)
    }

    pub fn invalidate(&self, func: &FunctionDef) -> Result<bool> {
        let mut entries = self.entries.lock()?;
        Ok(entries.pop(&func.key()).is_some())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataType, ProxyError};

    fn def(body: &str) -> FunctionDef {
        FunctionDef::new("f", body).arg("x", DataType::Integer)
    }

    #[test]
    fn test_plan_is_reused() {
        let cache = PlanCache::new(8);
        let first = cache.get_or_compile(&def("CLUSTER 'a'; RUN ON x;")).unwrap();
        let second = cache.get_or_compile(&def("CLUSTER 'a'; RUN ON x;")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_redefinition_recompiles() {
        let cache = PlanCache::new(8);
        let first = cache.get_or_compile(&def("CLUSTER 'a'; RUN ON x;")).unwrap();
        let second = cache.get_or_compile(&def("CLUSTER 'b'; RUN ON x;")).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
        assert_eq!(
            second.cluster,
            crate::directive::ClusterExpr::Static("b".into())
        );
    }

    #[test]
    fn test_errors_are_not_cached() {
        let cache = PlanCache::new(8);
        let err = cache.get_or_compile(&def("CLUSTER 'a';")).unwrap_err();
        assert!(matches!(err, ProxyError::DirectiveSyntax(_)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_overloads_are_distinct() {
        let cache = PlanCache::new(8);
        cache.get_or_compile(&def("CLUSTER 'a'; RUN ON ALL;")).unwrap();
        let text_overload = FunctionDef::new("f", "CLUSTER 'a'; RUN ON ALL;").arg("x", DataType::Text);
        cache.get_or_compile(&text_overload).unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.invalidate(&text_overload).unwrap());
        assert_eq!(cache.len(), 1);
    }
}
