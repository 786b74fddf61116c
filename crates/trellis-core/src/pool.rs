//! Context pooling.
//!
//! Contexts are expensive enough to build (parameter slots, header maps,
//! local maps) that the dispatcher recycles them. The pool is a plain
//! mutex-guarded free list; a miss falls back to the factory.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::Ctx;

/// Default upper bound on idle pooled contexts.
pub const DEFAULT_MAX_POOLED: usize = 1024;

/// Builds fresh contexts, optionally with customised defaults.
pub type ContextFactory = Arc<dyn Fn() -> Ctx + Send + Sync>;

/// A bounded free list of request contexts.
pub struct CtxPool {
    idle: Mutex<Vec<Box<Ctx>>>,
    max_idle: usize,
    factory: ContextFactory,
}

impl CtxPool {
    /// Creates a pool keeping at most `max_idle` contexts.
    #[must_use]
    pub fn new(max_idle: usize) -> Self {
        Self::with_factory(max_idle, Arc::new(Ctx::new))
    }

    /// Creates a pool whose misses are served by `factory`.
    #[must_use]
    pub fn with_factory(max_idle: usize, factory: ContextFactory) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
            factory,
        }
    }

    /// Takes an idle context or builds a new one.
    pub fn acquire(&self) -> Box<Ctx> {
        if let Some(ctx) = self.idle.lock().pop() {
            return ctx;
        }
        Box::new((self.factory)())
    }

    /// Releases `ctx` and returns it to the pool unless the pool is full.
    pub fn release(&self, mut ctx: Box<Ctx>) {
        ctx.release();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(ctx);
        }
    }

    /// Number of idle contexts.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

impl Default for CtxPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_POOLED)
    }
}

impl fmt::Debug for CtxPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CtxPool")
            .field("idle", &self.idle())
            .field("max_idle", &self.max_idle)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_and_bound() {
        let pool = CtxPool::new(1);
        let a = pool.acquire();
        let b = pool.acquire();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle(), 1);

        let _ = pool.acquire();
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_released_context_is_clean() {
        let pool = CtxPool::new(4);
        let mut ctx = pool.acquire();
        ctx.set_local("k", 1_u8);
        ctx.send_string("x").unwrap();
        pool.release(ctx);

        let ctx = pool.acquire();
        assert!(ctx.local::<u8>("k").is_none());
        assert!(ctx.response_body_bytes().is_none());
    }

    #[test]
    fn test_factory_defaults() {
        #[derive(Clone)]
        struct Marker(u32);

        let pool = CtxPool::with_factory(4, Arc::new(|| Ctx::new().with_extension(Marker(7))));
        let ctx = pool.acquire();
        assert_eq!(ctx.extension::<Marker>().map(|m| m.0), Some(7));
        pool.release(ctx);
        let ctx = pool.acquire();
        assert_eq!(ctx.extension::<Marker>().map(|m| m.0), Some(7));
    }
}
