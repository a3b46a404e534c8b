//! Change notifications.
//!
//! The registry reports outward through [`ChangeListener`]s, called
//! synchronously inside each tick in registration order. Consumers that
//! live on another task can use [`ChannelListener`] to receive the same
//! notifications as [`RegistryEvent`]s.

use std::collections::BTreeSet;

use measync_core::RegistryConfig;
use tokio::sync::mpsc;

/// Receiver of registry notifications.
pub trait ChangeListener: Send {
    /// The union of graph keys across all sources changed.
    fn on_layout_changed(&mut self, layout: &BTreeSet<String>);

    /// A tick finished. Fires every tick, whether or not data changed.
    fn on_data_refreshed(&mut self);

    /// The registry configuration was replaced.
    fn on_config_changed(&mut self, _config: &RegistryConfig) {}
}

/// A registry notification as a value.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    LayoutChanged(BTreeSet<String>),
    DataRefreshed,
    ConfigChanged(RegistryConfig),
}

/// Forwards notifications into an unbounded channel, in order.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<RegistryEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: RegistryEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl ChangeListener for ChannelListener {
    fn on_layout_changed(&mut self, layout: &BTreeSet<String>) {
        self.forward(RegistryEvent::LayoutChanged(layout.clone()));
    }

    fn on_data_refreshed(&mut self) {
        self.forward(RegistryEvent::DataRefreshed);
    }

    fn on_config_changed(&mut self, config: &RegistryConfig) {
        self.forward(RegistryEvent::ConfigChanged(config.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_listener_preserves_order() {
        let (mut listener, mut rx) = ChannelListener::new();
        let layout = BTreeSet::from(["temp".to_string()]);

        listener.on_layout_changed(&layout);
        listener.on_data_refreshed();
        listener.on_config_changed(&RegistryConfig::default());

        assert_eq!(rx.try_recv().unwrap(), RegistryEvent::LayoutChanged(layout));
        assert_eq!(rx.try_recv().unwrap(), RegistryEvent::DataRefreshed);
        assert!(matches!(rx.try_recv().unwrap(), RegistryEvent::ConfigChanged(_)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (mut listener, rx) = ChannelListener::new();
        drop(rx);
        listener.on_data_refreshed();
    }
}
