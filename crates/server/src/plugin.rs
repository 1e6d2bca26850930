//! Server lifecycle hooks.

use crate::context::Context;
use crate::registry::MethodDescriptor;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tether_protocol::Message;

/// Hooks called at fixed points of a connection's and a request's life.
///
/// Every method has a no-op default. A hook returning `Err` fails the
/// request it was called for with that message.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// A service was registered.
    ///
    /// # Errors
    ///
    /// An error aborts the registration.
    fn register(&self, _service: &str, _methods: &[MethodDescriptor]) -> Result<(), String> {
        Ok(())
    }

    /// A connection was accepted. Returning `false` drops it.
    fn post_conn_accept(&self, _peer: SocketAddr) -> bool {
        true
    }

    /// A connection was closed.
    fn post_conn_close(&self, _peer: SocketAddr) {}

    /// A request frame was read, before authentication.
    async fn post_read_request(&self, _request: &Message) -> Result<(), String> {
        Ok(())
    }

    /// The request passed authentication and is about to be dispatched.
    async fn pre_handle_request(&self, _ctx: &Context) -> Result<(), String> {
        Ok(())
    }

    /// Arguments decoded, handler about to run.
    async fn pre_call(&self, _ctx: &Context) -> Result<(), String> {
        Ok(())
    }

    /// The handler returned successfully.
    async fn post_call(&self, _ctx: &Context) -> Result<(), String> {
        Ok(())
    }

    /// A response is about to be written. It may still be modified.
    async fn pre_write_response(
        &self,
        _request: &Message,
        _response: &mut Message,
    ) -> Result<(), String> {
        Ok(())
    }

    /// A response was written (or failed to be).
    async fn post_write_response(&self, _response: &Message, _written: bool) {}
}

/// Ordered set of plugins. Hooks run in insertion order and stop at the first
/// error.
#[derive(Clone)]
pub struct PluginContainer {
    plugins: Arc<ArcSwap<Vec<Arc<dyn Plugin>>>>,
}

impl Default for PluginContainer {
    fn default() -> Self {
        Self {
            plugins: Arc::new(ArcSwap::from_pointee(Vec::new())),
        }
    }
}

impl PluginContainer {
    /// Append a plugin.
    pub fn add(&self, plugin: Arc<dyn Plugin>) {
        self.plugins.rcu(|plugins| {
            let mut plugins = Vec::clone(plugins);
            plugins.push(Arc::clone(&plugin));
            plugins
        });
    }

    /// Number of installed plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.load().len()
    }

    /// Whether no plugin is installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.load().is_empty()
    }

    pub(crate) fn register(
        &self,
        service: &str,
        methods: &[MethodDescriptor],
    ) -> Result<(), String> {
        self.plugins
            .load()
            .iter()
            .try_for_each(|plugin| plugin.register(service, methods))
    }

    pub(crate) fn post_conn_accept(&self, peer: SocketAddr) -> bool {
        self.plugins
            .load()
            .iter()
            .all(|plugin| plugin.post_conn_accept(peer))
    }

    pub(crate) fn post_conn_close(&self, peer: SocketAddr) {
        for plugin in self.plugins.load().iter() {
            plugin.post_conn_close(peer);
        }
    }

    pub(crate) async fn post_read_request(&self, request: &Message) -> Result<(), String> {
        for plugin in self.plugins.load_full().iter() {
            plugin.post_read_request(request).await?;
        }
        Ok(())
    }

    pub(crate) async fn pre_handle_request(&self, ctx: &Context) -> Result<(), String> {
        for plugin in self.plugins.load_full().iter() {
            plugin.pre_handle_request(ctx).await?;
        }
        Ok(())
    }

    pub(crate) async fn pre_call(&self, ctx: &Context) -> Result<(), String> {
        for plugin in self.plugins.load_full().iter() {
            plugin.pre_call(ctx).await?;
        }
        Ok(())
    }

    pub(crate) async fn post_call(&self, ctx: &Context) -> Result<(), String> {
        for plugin in self.plugins.load_full().iter() {
            plugin.post_call(ctx).await?;
        }
        Ok(())
    }

    pub(crate) async fn pre_write_response(
        &self,
        request: &Message,
        response: &mut Message,
    ) -> Result<(), String> {
        for plugin in self.plugins.load_full().iter() {
            plugin.pre_write_response(request, response).await?;
        }
        Ok(())
    }

    pub(crate) async fn post_write_response(&self, response: &Message, written: bool) {
        for plugin in self.plugins.load_full().iter() {
            plugin.post_write_response(response, written).await;
        }
    }
}

impl std::fmt::Debug for PluginContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContainer")
            .field("len", &self.len())
            .finish()
    }
}
