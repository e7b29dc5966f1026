//! Interceptor pipeline — before/after hooks around tool calls.
//!
//! Each backend keeps one table per phase. A table holds at most one hook per
//! exact tool name plus one wildcard hook registered under `*`; registering
//! into an occupied slot replaces the previous hook.
//!
//! For a call to tool `t` the before-phase runs the exact hook for `t`, then
//! the wildcard hook, each consuming the previous one's output. A `Block`
//! stops the chain and the call never reaches the backend. The after-phase
//! runs in the same order over the response.
//!
//! Hooks run synchronously on the call's task and should be quick.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use super::panic_message;
use super::types::{Request, Response};

/// Registration key of the hook that applies to every tool, after any exact one.
pub const WILDCARD: &str = "*";

/// What a hook knows about the call it is looking at.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub backend: &'a str,
    pub tool: &'a str,
}

/// Result of a before-hook.
#[derive(Debug, Clone, PartialEq)]
pub enum BeforeOutcome {
    /// Hand this (possibly modified) request to the next stage.
    Continue(Request),
    /// Reject the call; the client receives an error carrying `reason`.
    Block { reason: String },
}

impl BeforeOutcome {
    pub fn block(reason: impl Into<String>) -> Self {
        Self::Block {
            reason: reason.into(),
        }
    }
}

pub trait BeforeHook: Send + Sync {
    fn before(&self, ctx: &HookContext<'_>, request: Request) -> anyhow::Result<BeforeOutcome>;
}

pub trait AfterHook: Send + Sync {
    fn after(
        &self,
        ctx: &HookContext<'_>,
        request: &Request,
        response: Response,
    ) -> anyhow::Result<Response>;
}

struct FnBefore<F>(F);

impl<F> BeforeHook for FnBefore<F>
where
    F: Fn(&HookContext<'_>, Request) -> anyhow::Result<BeforeOutcome> + Send + Sync,
{
    fn before(&self, ctx: &HookContext<'_>, request: Request) -> anyhow::Result<BeforeOutcome> {
        (self.0)(ctx, request)
    }
}

struct FnAfter<F>(F);

impl<F> AfterHook for FnAfter<F>
where
    F: Fn(&HookContext<'_>, &Request, Response) -> anyhow::Result<Response> + Send + Sync,
{
    fn after(
        &self,
        ctx: &HookContext<'_>,
        request: &Request,
        response: Response,
    ) -> anyhow::Result<Response> {
        (self.0)(ctx, request, response)
    }
}

// ─── Slots ───────────────────────────────────────────────────────────────────

struct Slots<H: ?Sized> {
    exact: HashMap<String, Arc<H>>,
    wildcard: Option<Arc<H>>,
}

impl<H: ?Sized> Default for Slots<H> {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            wildcard: None,
        }
    }
}

impl<H: ?Sized> Clone for Slots<H> {
    fn clone(&self) -> Self {
        Self {
            exact: self.exact.clone(),
            wildcard: self.wildcard.clone(),
        }
    }
}

impl<H: ?Sized> Slots<H> {
    /// Returns true when an existing hook was replaced.
    fn insert(&mut self, key: &str, hook: Arc<H>) -> bool {
        if key == WILDCARD {
            self.wildcard.replace(hook).is_some()
        } else {
            self.exact.insert(key.to_string(), hook).is_some()
        }
    }

    /// Hooks applying to `tool`, exact first.
    fn chain<'a>(&'a self, tool: &str) -> impl Iterator<Item = (&'static str, &'a Arc<H>)> + 'a {
        let exact = self.exact.get(tool).map(|hook| ("exact", hook));
        let wildcard = self.wildcard.as_ref().map(|hook| (WILDCARD, hook));
        exact.into_iter().chain(wildcard)
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.exact.keys().cloned().collect();
        keys.sort_unstable();
        if self.wildcard.is_some() {
            keys.push(WILDCARD.to_string());
        }
        keys
    }
}

// ─── InterceptorTable ────────────────────────────────────────────────────────

/// Before and after hook tables of one backend.
#[derive(Clone, Default)]
pub struct InterceptorTable {
    before: Slots<dyn BeforeHook>,
    after: Slots<dyn AfterHook>,
}

impl fmt::Debug for InterceptorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorTable")
            .field("before", &self.before.keys())
            .field("after", &self.after.keys())
            .finish()
    }
}

impl InterceptorTable {
    pub fn before<F>(&mut self, tool: &str, hook: F) -> &mut Self
    where
        F: Fn(&HookContext<'_>, Request) -> anyhow::Result<BeforeOutcome> + Send + Sync + 'static,
    {
        self.set_before(tool, Arc::new(FnBefore(hook)))
    }

    pub fn after<F>(&mut self, tool: &str, hook: F) -> &mut Self
    where
        F: Fn(&HookContext<'_>, &Request, Response) -> anyhow::Result<Response>
            + Send
            + Sync
            + 'static,
    {
        self.set_after(tool, Arc::new(FnAfter(hook)))
    }

    pub fn set_before(&mut self, tool: &str, hook: Arc<dyn BeforeHook>) -> &mut Self {
        if self.before.insert(tool, hook) {
            tracing::debug!(tool, "replaced before-hook");
        }
        self
    }

    pub fn set_after(&mut self, tool: &str, hook: Arc<dyn AfterHook>) -> &mut Self {
        if self.after.insert(tool, hook) {
            tracing::debug!(tool, "replaced after-hook");
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.before.exact.is_empty()
            && self.before.wildcard.is_none()
            && self.after.exact.is_empty()
            && self.after.wildcard.is_none()
    }

    /// Run the before-phase.
    ///
    /// A hook that errors or panics is logged and skipped: the request it was
    /// given moves on unchanged.
    pub fn run_before(&self, ctx: &HookContext<'_>, request: Request) -> BeforeOutcome {
        let mut current = request;
        for (slot, hook) in self.before.chain(ctx.tool) {
            let input = current.clone();
            match catch_unwind(AssertUnwindSafe(|| hook.before(ctx, input))) {
                Ok(Ok(BeforeOutcome::Continue(next))) => current = next,
                Ok(Ok(BeforeOutcome::Block { reason })) => {
                    tracing::warn!(
                        backend = ctx.backend,
                        tool = ctx.tool,
                        slot,
                        reason = %reason,
                        "tool call blocked by before-hook"
                    );
                    return BeforeOutcome::Block { reason };
                }
                Ok(Err(e)) => {
                    tracing::error!(
                        backend = ctx.backend,
                        tool = ctx.tool,
                        slot,
                        error = %e,
                        "before-hook failed, passing request through"
                    );
                }
                Err(panic) => {
                    tracing::error!(
                        backend = ctx.backend,
                        tool = ctx.tool,
                        slot,
                        panic = %panic_message(panic.as_ref()),
                        "before-hook panicked, passing request through"
                    );
                }
            }
        }
        BeforeOutcome::Continue(current)
    }

    /// Run the after-phase. A failing hook leaves the response as it was.
    pub fn run_after(&self, ctx: &HookContext<'_>, request: &Request, response: Response) -> Response {
        let mut current = response;
        for (slot, hook) in self.after.chain(ctx.tool) {
            let input = current.clone();
            match catch_unwind(AssertUnwindSafe(|| hook.after(ctx, request, input))) {
                Ok(Ok(next)) => current = next,
                Ok(Err(e)) => {
                    tracing::error!(
                        backend = ctx.backend,
                        tool = ctx.tool,
                        slot,
                        error = %e,
                        "after-hook failed, keeping previous response"
                    );
                }
                Err(panic) => {
                    tracing::error!(
                        backend = ctx.backend,
                        tool = ctx.tool,
                        slot,
                        panic = %panic_message(panic.as_ref()),
                        "after-hook panicked, keeping previous response"
                    );
                }
            }
        }
        current
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::types::RequestId;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx(tool: &str) -> HookContext<'_> {
        HookContext {
            backend: "demo",
            tool,
        }
    }

    fn call(tool: &str) -> Request {
        Request::new(1, "tools/call", Some(json!({"name": tool, "arguments": {}})))
    }

    fn tag(request: &mut Request, label: &str) {
        if let Some(Value::Object(params)) = request.params.as_mut() {
            let trail = params.entry("trail").or_insert_with(|| json!([]));
            if let Value::Array(items) = trail {
                items.push(json!(label));
            }
        }
    }

    #[test]
    fn test_exact_then_wildcard_each_sees_previous_output() {
        let mut table = InterceptorTable::default();
        table.before("add", |_ctx: &HookContext<'_>, mut req: Request| {
            tag(&mut req, "exact");
            Ok(BeforeOutcome::Continue(req))
        });
        table.before(WILDCARD, |_ctx: &HookContext<'_>, mut req: Request| {
            tag(&mut req, "wildcard");
            Ok(BeforeOutcome::Continue(req))
        });

        let BeforeOutcome::Continue(out) = table.run_before(&ctx("add"), call("add")) else {
            panic!("expected continue");
        };
        assert_eq!(out.params.unwrap()["trail"], json!(["exact", "wildcard"]));

        // Another tool only sees the wildcard hook.
        let BeforeOutcome::Continue(out) = table.run_before(&ctx("sub"), call("sub")) else {
            panic!("expected continue");
        };
        assert_eq!(out.params.unwrap()["trail"], json!(["wildcard"]));
    }

    #[test]
    fn test_block_stops_chain() {
        let wildcard_runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&wildcard_runs);

        let mut table = InterceptorTable::default();
        table.before("rm", |_ctx: &HookContext<'_>, _req: Request| {
            Ok(BeforeOutcome::block("destructive"))
        });
        table.before(WILDCARD, move |_ctx: &HookContext<'_>, req: Request| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(BeforeOutcome::Continue(req))
        });

        let outcome = table.run_before(&ctx("rm"), call("rm"));
        assert_eq!(outcome, BeforeOutcome::block("destructive"));
        assert_eq!(wildcard_runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_later_registration_replaces_slot() {
        let mut table = InterceptorTable::default();
        table.before("add", |_ctx: &HookContext<'_>, _req: Request| {
            Ok(BeforeOutcome::block("first"))
        });
        table.before("add", |_ctx: &HookContext<'_>, _req: Request| {
            Ok(BeforeOutcome::block("second"))
        });
        assert_eq!(
            table.run_before(&ctx("add"), call("add")),
            BeforeOutcome::block("second")
        );
    }

    #[test]
    fn test_failing_before_hook_passes_request_through() {
        let mut table = InterceptorTable::default();
        table.before("add", |_ctx: &HookContext<'_>, _req: Request| {
            Err(anyhow::anyhow!("hook exploded"))
        });
        table.before(WILDCARD, |_ctx: &HookContext<'_>, _req: Request| -> anyhow::Result<BeforeOutcome> {
            panic!("hook panicked")
        });
        let outcome = table.run_before(&ctx("add"), call("add"));
        assert_eq!(outcome, BeforeOutcome::Continue(call("add")));
    }

    #[test]
    fn test_after_hooks_transform_response_in_order() {
        let mut table = InterceptorTable::default();
        table.after("add", |_ctx: &HookContext<'_>, _req: &Request, mut resp: Response| {
            if let crate::proxy::types::Outcome::Result(value) = &mut resp.outcome {
                value["exact"] = json!(true);
            }
            Ok(resp)
        });
        table.after(WILDCARD, |_ctx: &HookContext<'_>, _req: &Request, resp: Response| {
            let seen_exact = resp.result().and_then(|v| v.get("exact")).is_some();
            Ok(Response::success(resp.id, json!({"wrapped": seen_exact})))
        });

        let response = Response::success(RequestId::Number(1), json!({}));
        let out = table.run_after(&ctx("add"), &call("add"), response);
        assert_eq!(out.result(), Some(&json!({"wrapped": true})));
    }

    #[test]
    fn test_failing_after_hook_keeps_previous_response() {
        let mut table = InterceptorTable::default();
        table.after(WILDCARD, |_ctx: &HookContext<'_>, _req: &Request, _resp: Response| {
            Err(anyhow::anyhow!("cannot rewrite"))
        });
        let response = Response::success(RequestId::Number(5), json!({"n": 5}));
        let out = table.run_after(&ctx("any"), &call("any"), response.clone());
        assert_eq!(out, response);
    }

    #[test]
    fn test_empty_table_is_identity() {
        let table = InterceptorTable::default();
        assert!(table.is_empty());
        assert_eq!(
            table.run_before(&ctx("x"), call("x")),
            BeforeOutcome::Continue(call("x"))
        );
    }
}
