//! Tiered call-site cache
//!
//! A call site starts specialized: up to `call.inline_cache_size` serializer
//! pipelines keyed by signature identity, with scalar arguments bound to their
//! kind up front. When that overflows the site serves every signature of the
//! first overflowing arity through one per-arity pipeline, and a signature of
//! any other arity sends it to the fully generic path for good.
//!
//! All tiers produce identical results; only the per-call work differs.

use super::{check_callable, execute, serialize_arguments};
use crate::buffer::ArgumentBuffer;
use crate::context::NativeContext;
use crate::error::Result;
use crate::signature::Signature;
use crate::types::{NativeType, SimpleKind};
use crate::value::{NativeAddress, Value};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::debug;

/// Observable tier of a call site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Number of cached specialized pipelines
    Specialized(usize),
    /// Arity served by the per-arity pipeline
    ByArity(usize),
    Generic,
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Simple(SimpleKind),
    Injected(usize),
    Typed(usize),
}

struct Pipeline {
    signature: Arc<Signature>,
    steps: SmallVec<[Step; 8]>,
}

impl Pipeline {
    fn new(signature: &Arc<Signature>) -> Self {
        let steps = signature
            .arg_types()
            .iter()
            .enumerate()
            .map(|(index, ty)| match ty {
                NativeType::Simple(kind) => Step::Simple(*kind),
                ty if ty.injected() => Step::Injected(index),
                _ => Step::Typed(index),
            })
            .collect();
        Self {
            signature: signature.clone(),
            steps,
        }
    }

    fn serialize(&self, ctx: &NativeContext, buffer: &mut ArgumentBuffer, args: &[Value]) -> Result<()> {
        let types = self.signature.arg_types();
        let mut values = args.iter();
        for step in &self.steps {
            match *step {
                Step::Injected(index) => types[index].serialize(buffer, &Value::Null, ctx)?,
                Step::Simple(kind) => {
                    if let Some(value) = values.next() {
                        kind.serialize(buffer, value)?;
                    }
                }
                Step::Typed(index) => {
                    if let Some(value) = values.next() {
                        types[index].serialize(buffer, value, ctx)?;
                    }
                }
            }
        }
        Ok(())
    }
}

enum State {
    Specialized(SmallVec<[Arc<Pipeline>; 4]>),
    ByArity(usize),
    Generic,
}

enum Route {
    Pipeline(Arc<Pipeline>),
    ByArity(usize),
    Generic,
}

/// Per-call-site dispatch cache
pub struct CallSite {
    capacity: usize,
    state: Mutex<State>,
}

impl CallSite {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(State::Specialized(SmallVec::new())),
        }
    }

    /// Call site sized by the context's `call.inline_cache_size`
    pub fn for_context(ctx: &NativeContext) -> Self {
        Self::new(ctx.config().call.inline_cache_size)
    }

    pub fn tier(&self) -> Tier {
        match &*self.state.lock() {
            State::Specialized(pipelines) => Tier::Specialized(pipelines.len()),
            State::ByArity(arity) => Tier::ByArity(*arity),
            State::Generic => Tier::Generic,
        }
    }

    fn route(&self, signature: &Arc<Signature>) -> Route {
        let mut state = self.state.lock();
        let arity = signature.real_arg_count();
        match &mut *state {
            State::Specialized(pipelines) => {
                if let Some(hit) = pipelines.iter().find(|p| Arc::ptr_eq(&p.signature, signature)) {
                    return Route::Pipeline(hit.clone());
                }
                if pipelines.len() < self.capacity {
                    let pipeline = Arc::new(Pipeline::new(signature));
                    pipelines.push(pipeline.clone());
                    return Route::Pipeline(pipeline);
                }
                debug!(event = "call_site_degraded", tier = "by_arity", arity = arity, "Inline cache full");
                *state = State::ByArity(arity);
                Route::ByArity(arity)
            }
            State::ByArity(cached) if *cached == arity => Route::ByArity(arity),
            State::ByArity(_) => {
                debug!(event = "call_site_degraded", tier = "generic", arity = arity, "Arity mismatch");
                *state = State::Generic;
                Route::Generic
            }
            State::Generic => Route::Generic,
        }
    }

    /// Call through the cheapest tier that applies
    ///
    /// # Safety
    /// As for `call::invoke`: `address` must match `signature`.
    pub unsafe fn call(
        &self,
        ctx: &NativeContext,
        signature: &Arc<Signature>,
        address: NativeAddress,
        args: &[Value],
    ) -> Result<Value> {
        // a rejected call must not change the cache
        check_callable(ctx, signature, args.len())?;
        let route = self.route(signature);

        let mut buffer = signature.new_buffer();
        match route {
            Route::Pipeline(pipeline) => pipeline.serialize(ctx, &mut buffer, args)?,
            Route::ByArity(arity) => {
                let types = signature.arg_types();
                let mut values = args[..arity].iter();
                for ty in types {
                    let value = if ty.injected() {
                        &Value::Null
                    } else {
                        match values.next() {
                            Some(value) => value,
                            None => break,
                        }
                    };
                    ty.serialize(&mut buffer, value, ctx)?;
                }
            }
            Route::Generic => serialize_arguments(ctx, signature, &mut buffer, args)?,
        }
        execute(ctx, signature, address, buffer)
    }
}

impl std::fmt::Debug for CallSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSite")
            .field("capacity", &self.capacity)
            .field("tier", &self.tier())
            .finish()
    }
}
