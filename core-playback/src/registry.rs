//! # Renderer Registry
//!
//! Registered renderers in priority order, plus the one currently active.
//! Capabilities are captured from [`Renderer::descriptor`] once, when the
//! renderer registers.

use bridge_traits::{ItemPlayOptions, PlayableItem, Renderer, RendererDescriptor};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct RegisteredRenderer {
    pub descriptor: RendererDescriptor,
    pub renderer: Arc<dyn Renderer>,
}

impl RegisteredRenderer {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Whether the core's queue drives this renderer.
    pub fn is_local_playlist_managed(&self) -> bool {
        self.descriptor.uses_local_playlist()
    }

    fn accepts(&self, item: &PlayableItem, options: &ItemPlayOptions) -> bool {
        if !self.renderer.can_play_media_type(item.media_type) {
            return false;
        }

        if item.is_server_item() {
            self.renderer.can_play_item(item, options)
        } else {
            item.url
                .as_deref()
                .map(|url| self.renderer.can_play_url(url))
                .unwrap_or(false)
        }
    }
}

impl std::fmt::Debug for RegisteredRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredRenderer")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct RendererRegistry {
    renderers: Vec<RegisteredRenderer>,
    current: Option<RegisteredRenderer>,
}

impl RendererRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert and re-sort by priority. Registering an id again replaces the
    /// previous registration.
    pub fn register_renderer(&mut self, renderer: Arc<dyn Renderer>) -> RendererDescriptor {
        let descriptor = renderer.descriptor();
        self.renderers.retain(|r| r.descriptor.id != descriptor.id);
        self.renderers.push(RegisteredRenderer {
            descriptor: descriptor.clone(),
            renderer,
        });
        self.renderers.sort_by_key(|r| r.descriptor.priority);

        debug!(renderer = %descriptor.id, priority = descriptor.priority, "Renderer registered");
        descriptor
    }

    /// Returns `true` when the renderer was current and has been cleared.
    pub fn unregister_renderer(&mut self, id: &str) -> bool {
        self.renderers.retain(|r| r.descriptor.id != id);

        if self.current.as_ref().map(|c| c.id() == id).unwrap_or(false) {
            self.current = None;
            return true;
        }
        false
    }

    pub fn renderers(&self) -> &[RegisteredRenderer] {
        &self.renderers
    }

    pub fn get_renderer(&self, id: &str) -> Option<&RegisteredRenderer> {
        self.renderers.iter().find(|r| r.descriptor.id == id)
    }

    pub fn current(&self) -> Option<&RegisteredRenderer> {
        self.current.as_ref()
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current.as_ref().map(|c| c.id())
    }

    /// Make `id` the active renderer, or clear it with `None`. Returns the
    /// previous id when it changed; unknown ids leave the registry as is.
    pub fn set_current(&mut self, id: Option<&str>) -> Option<Option<String>> {
        let next = match id {
            Some(id) => Some(self.get_renderer(id)?.clone()),
            None => None,
        };

        let previous = self.current_id().map(str::to_string);
        if previous.as_deref() == id {
            return None;
        }

        self.current = next;
        Some(previous)
    }

    /// Pick a renderer for `item`.
    ///
    /// The current renderer wins when it can take the item (unless
    /// `force_local`); otherwise the first automatic renderer, in priority
    /// order, that accepts it.
    pub fn select_renderer(
        &self,
        item: &PlayableItem,
        options: &ItemPlayOptions,
        force_local: bool,
    ) -> Option<RegisteredRenderer> {
        if !force_local {
            if let Some(current) = self.current.as_ref() {
                if current.accepts(item, options) {
                    return Some(current.clone());
                }
            }
        }

        self.renderers
            .iter()
            .filter(|r| r.is_local_playlist_managed())
            .find(|r| r.accepts(item, options))
            .cloned()
    }
}
