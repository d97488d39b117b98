//! Ambient call context — per-chain state with scoped propagation.
//!
//! A context is created at the top of a logical call chain (a gateway
//! request, a background job) and is visible to everything awaited inside
//! that chain, including handlers running on remote services: each dispatch
//! re-enters a scope seeded from the request's context data, and the shared
//! subset is merged back into the caller's context when the reply arrives.
//!
//! The store is task-local. Code inside a [`Context::scope`] future observes
//! the same context across arbitrary suspension points; concurrently running
//! unrelated chains never observe each other's data. Tasks started with
//! `tokio::spawn` leave the tree and see no ambient context — pass
//! `Context::current()?.data()` into the new task's own scope instead.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use trellis_protocol::data::keys;
use trellis_protocol::{ApiNotification, ContextData, Fault, GATEWAY_DOMAIN, Recipient};

use crate::client::ServiceClient;
use crate::service::Service;

tokio::task_local! {
    static CURRENT: Arc<ContextCell>;
}

/// Backing store for one chain's context. Mutation goes through a short
/// critical section; the lock is never held across an await point.
pub(crate) struct ContextCell {
    state: Mutex<CellState>,
}

struct CellState {
    data: ContextData,
    shared: ContextData,
    client: Option<Service>,
}

impl ContextCell {
    pub(crate) fn new(data: ContextData) -> Self {
        let mut shared = ContextData::new();
        if let Some(domain) = data.get(keys::DOMAIN) {
            shared.insert(keys::DOMAIN.into(), domain.clone());
        }
        Self {
            state: Mutex::new(CellState {
                data,
                shared,
                client: None,
            }),
        }
    }

    /// Inject the client capability bound to the dispatching service.
    pub(crate) fn bind_client(&self, service: Service) {
        self.state.lock().client = Some(service);
    }

    pub(crate) fn shared_data(&self) -> ContextData {
        self.state.lock().shared.clone()
    }
}

/// Handle to the ambient context of the calling chain.
#[derive(Clone)]
pub struct Context {
    cell: Arc<ContextCell>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("data", &self.data()).finish()
    }
}

impl Context {
    /// Run `fut` inside a new context scope seeded with `data`. The scope is
    /// torn down when `fut` completes; its output (including errors)
    /// propagates unchanged.
    pub fn scope<F: Future>(data: ContextData, fut: F) -> impl Future<Output = F::Output> {
        CURRENT.scope(Arc::new(ContextCell::new(data)), fut)
    }

    /// Re-enter a scope over an existing cell (dispatch and streaming paths).
    pub(crate) fn scope_cell<F: Future>(
        cell: Arc<ContextCell>,
        fut: F,
    ) -> impl Future<Output = F::Output> {
        CURRENT.scope(cell, fut)
    }

    /// The ambient context of the calling chain. Fails with
    /// [`Fault::NoContext`] outside any scope; missing context is a
    /// propagation bug, never silently papered over with an empty context.
    /// Use [`Context::has_current`] to test for presence.
    pub fn current() -> Result<Self, Fault> {
        CURRENT
            .try_with(|cell| Self { cell: cell.clone() })
            .map_err(|_| Fault::NoContext)
    }

    /// Whether the calling chain has an ambient context.
    pub fn has_current() -> bool {
        CURRENT.try_with(|_| ()).is_ok()
    }

    pub(crate) fn ambient() -> Option<Self> {
        CURRENT.try_with(|cell| Self { cell: cell.clone() }).ok()
    }

    /// Read a single field.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.cell.state.lock().data.get(key).cloned()
    }

    /// Write a single field, private to this chain.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.cell.state.lock().data.insert(key, value);
    }

    /// Write a single field and mark it for merge-back to the caller.
    pub fn set_shared(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let mut state = self.cell.state.lock();
        state.data.insert(key.clone(), value.clone());
        state.shared.insert(key, value);
    }

    /// Shallow-overlay fields into the ambient data. Used to fold a reply's
    /// shared data back in after a nested call returns.
    pub fn merge(&self, data: ContextData) {
        let mut state = self.cell.state.lock();
        for (key, value) in data {
            state.data.insert(key, value);
        }
    }

    /// Fold a reply's shared data in. Shared-ness is sticky across hops:
    /// fields that arrived shared stay shared, so an identity set deep in a
    /// call chain propagates through every intermediate hop back to the
    /// chain's entry point.
    pub(crate) fn merge_shared(&self, data: ContextData) {
        let mut state = self.cell.state.lock();
        for (key, value) in data {
            state.data.insert(key.clone(), value.clone());
            state.shared.insert(key, value);
        }
    }

    /// Snapshot of the full context data.
    pub fn data(&self) -> ContextData {
        self.cell.state.lock().data.clone()
    }

    /// Snapshot of the subset marked for merge-back. Always contains at
    /// least the chain's origin domain.
    pub fn shared_data(&self) -> ContextData {
        self.cell.shared_data()
    }

    pub fn identity(&self) -> Option<String> {
        self.get_string(keys::IDENTITY)
    }

    /// Set the authenticated identity. Always shared, so an authentication
    /// deep in a call chain propagates back to the chain's entry point.
    pub fn set_identity(&self, identity: impl Into<String>) {
        self.set_shared(keys::IDENTITY, Value::String(identity.into()));
    }

    pub fn domain(&self) -> Option<String> {
        self.get_string(keys::DOMAIN)
    }

    pub fn connection_id(&self) -> Option<String> {
        self.get_string(keys::CONNECTION_ID)
    }

    pub fn langs(&self) -> Option<Vec<String>> {
        let value = self.get(keys::LANGS)?;
        let langs = value.as_array()?;
        Some(
            langs
                .iter()
                .filter_map(|l| l.as_str().map(str::to_string))
                .collect(),
        )
    }

    /// Client for another domain, scoped so that shared-context updates made
    /// by downstream handlers are merged back into this context when replies
    /// arrive. The capability is injected per-dispatch by the serving
    /// [`Service`]; a context fabricated outside a dispatch has none.
    pub fn client(&self, domain: &str) -> Result<ServiceClient, Fault> {
        let service = self.cell.state.lock().client.clone();
        service
            .map(|service| service.client(domain))
            .ok_or_else(|| Fault::config(format!("No client for domain {domain}")))
    }

    /// Send a best-effort notification to an external connection through the
    /// gateway. With no explicit recipient, the ambient connection id is
    /// used; failing that, this is a configuration fault.
    pub async fn notify(&self, payload: Value, recipient: Option<Recipient>) -> Result<(), Fault> {
        let recipient = recipient
            .or_else(|| self.connection_id().map(|id| Recipient { id }))
            .ok_or_else(|| Fault::config("no recipient given and none set in the context"))?;

        let notification = ApiNotification {
            recipient,
            domain: self.domain(),
            payload,
        };
        let client = self.client(GATEWAY_DOMAIN)?;
        let body = serde_json::to_value(notification)
            .map_err(|e| Fault::config(format!("unserializable notification: {e}")))?;
        client.call("notify", body).await?;
        Ok(())
    }

    fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn data(pairs: &[(&str, Value)]) -> ContextData {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn current_fails_outside_any_scope() {
        assert!(!Context::has_current());
        assert_eq!(Context::current().unwrap_err(), Fault::NoContext);
    }

    #[tokio::test]
    async fn scope_makes_context_visible() {
        Context::scope(data(&[("foo", json!("bar"))]), async {
            assert!(Context::has_current());
            let ctx = Context::current().unwrap();
            assert_eq!(ctx.get("foo"), Some(json!("bar")));
        })
        .await;
        assert!(!Context::has_current());
    }

    #[tokio::test]
    async fn scope_survives_suspension_points() {
        Context::scope(data(&[("key", json!(1))]), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(Context::current().unwrap().get("key"), Some(json!(1)));
            tokio::task::yield_now().await;
            assert_eq!(Context::current().unwrap().get("key"), Some(json!(1)));
        })
        .await;
    }

    #[tokio::test]
    async fn errors_propagate_and_scope_tears_down() {
        let result: Result<(), Fault> = Context::scope(ContextData::new(), async {
            Err(Fault::Handler("boom".into()))
        })
        .await;
        assert!(result.is_err());
        assert!(!Context::has_current());
    }

    #[tokio::test]
    async fn concurrent_chains_are_isolated() {
        let mut tasks = Vec::new();
        for n in 0..8u32 {
            tasks.push(tokio::spawn(Context::scope(
                data(&[("chain", json!(n))]),
                async move {
                    for _ in 0..20 {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        let ctx = Context::current().unwrap();
                        assert_eq!(ctx.get("chain"), Some(json!(n)));
                        ctx.set(format!("private-{n}"), json!(n));
                        assert_eq!(ctx.get(&format!("private-{n}")), Some(json!(n)));
                    }
                },
            )));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn shared_split_tracks_only_marked_fields() {
        Context::scope(data(&[("domain", json!("fruit"))]), async {
            let ctx = Context::current().unwrap();
            ctx.set("private", json!("only4me"));
            ctx.set_shared("public", json!("for-everyone"));

            let shared = ctx.shared_data();
            assert_eq!(shared.get("domain"), Some(&json!("fruit")));
            assert_eq!(shared.get("public"), Some(&json!("for-everyone")));
            assert!(!shared.contains_key("private"));

            let all = ctx.data();
            assert_eq!(all.get("private"), Some(&json!("only4me")));
        })
        .await;
    }

    #[tokio::test]
    async fn identity_is_always_shared() {
        Context::scope(ContextData::new(), async {
            let ctx = Context::current().unwrap();
            ctx.set_identity("ada");
            assert_eq!(ctx.identity().as_deref(), Some("ada"));
            assert_eq!(ctx.shared_data().get("identity"), Some(&json!("ada")));
        })
        .await;
    }

    #[tokio::test]
    async fn merge_overlays_fields() {
        Context::scope(data(&[("a", json!(1))]), async {
            let ctx = Context::current().unwrap();
            ctx.merge(data(&[("a", json!(2)), ("b", json!(3))]));
            assert_eq!(ctx.get("a"), Some(json!(2)));
            assert_eq!(ctx.get("b"), Some(json!(3)));
        })
        .await;
    }

    #[tokio::test]
    async fn client_fails_without_capability() {
        Context::scope(ContextData::new(), async {
            let ctx = Context::current().unwrap();
            let err = ctx.client("veg").unwrap_err();
            assert_eq!(err, Fault::Config("No client for domain veg".into()));
        })
        .await;
    }

    #[tokio::test]
    async fn nested_scope_shadows_outer() {
        Context::scope(data(&[("who", json!("outer"))]), async {
            Context::scope(data(&[("who", json!("inner"))]), async {
                assert_eq!(Context::current().unwrap().get("who"), Some(json!("inner")));
            })
            .await;
            assert_eq!(Context::current().unwrap().get("who"), Some(json!("outer")));
        })
        .await;
    }

    #[tokio::test]
    async fn langs_reads_string_array() {
        Context::scope(data(&[("langs", json!(["is", "en"]))]), async {
            let ctx = Context::current().unwrap();
            assert_eq!(ctx.langs(), Some(vec!["is".to_string(), "en".to_string()]));
        })
        .await;
    }
}
