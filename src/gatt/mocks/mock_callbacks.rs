//! Mocked implementation of GattClientCallbacks for use in test

use crate::gatt::callbacks::{GattClientCallbacks, GattClientEvent};
use tokio::sync::mpsc::{self, unbounded_channel, UnboundedReceiver};

/// Routes every GattClientEvent into a channel
pub struct MockCallbacks(mpsc::UnboundedSender<GattClientEvent>);

impl MockCallbacks {
    /// Constructor. Returns self and the RX side of the associated channel.
    pub fn new() -> (Self, UnboundedReceiver<GattClientEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self(tx), rx)
    }
}

impl GattClientCallbacks for MockCallbacks {
    fn on_gatt_client_event(&self, event: GattClientEvent) {
        // the test may have dropped its receiver
        self.0.send(event).ok();
    }
}
