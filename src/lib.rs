// Copyright 2022, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The GATT client: a per-connection state machine over a shared, persistent
//! cache of each peer's attribute table.
//!
//! All state lives in one [`gatt::client::GattClientModule`], owned by the
//! event loop defined here. Application calls, transport completions and
//! cache completions are all serialized through that loop.

use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Result};
use log::{error, info, warn};
use tokio::{runtime::Builder, sync::mpsc, task::LocalSet};

pub mod connection;
pub mod core;
pub mod gatt;
pub mod utils;

use gatt::client::GattClientModule;

type BoxedMainThreadCallback = Box<dyn FnOnce(&mut GattClientModule) + Send + 'static>;

enum MainThreadMessage {
    Run(BoxedMainThreadCallback),
    Stop,
}

type MainThreadTx = mpsc::UnboundedSender<MainThreadMessage>;

/// Posts work onto the GATT client thread. Cheap to clone, and usable from
/// any thread.
#[derive(Clone)]
pub struct GattClientHandle {
    task_tx: MainThreadTx,
}

impl GattClientHandle {
    /// Posts a callback to the GATT client thread and gives it access to the
    /// module. Fails only once the event loop has stopped.
    pub fn do_in_gatt_thread<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut GattClientModule) + Send + 'static,
    {
        self.task_tx
            .send(MainThreadMessage::Run(Box::new(f)))
            .map_err(|_| anyhow!("GATT client event loop has stopped"))
    }

    /// Ask the event loop to exit after the work already queued
    pub fn stop(&self) -> Result<()> {
        self.task_tx
            .send(MainThreadMessage::Stop)
            .map_err(|_| anyhow!("GATT client event loop has already stopped"))
    }
}

/// The RX end of the GATT client thread's queue
pub struct GattClientEventLoop {
    rx: mpsc::UnboundedReceiver<MainThreadMessage>,
}

/// Create the queue feeding a GATT client event loop
pub fn new_event_loop() -> (GattClientHandle, GattClientEventLoop) {
    let (task_tx, rx) = mpsc::unbounded_channel();
    (GattClientHandle { task_tx }, GattClientEventLoop { rx })
}

impl GattClientEventLoop {
    /// This is the core event loop that serializes incoming requests into the
    /// GATT client. Returns the module once stopped, or once every handle is
    /// dropped.
    pub async fn run(mut self, mut module: GattClientModule) -> GattClientModule {
        info!("starting GATT client event loop");
        while let Some(message) = self.rx.recv().await {
            match message {
                MainThreadMessage::Run(f) => f(&mut module),
                MainThreadMessage::Stop => break,
            }
        }
        warn!("GATT client queue has stopped");
        module
    }
}

/// Handles bringup of the GATT client on a dedicated thread. `make_module`
/// runs on that thread, so the module and its collaborators need not be Send.
pub fn start<F>(make_module: F) -> Result<(GattClientHandle, JoinHandle<()>)>
where
    F: FnOnce(GattClientHandle) -> GattClientModule + Send + 'static,
{
    let (handle, event_loop) = new_event_loop();
    let module_handle = handle.clone();
    let thread = thread::Builder::new().name("gatt_client".into()).spawn(move || {
        let rt = match Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(err) => {
                error!("failed to start tokio runtime: {err}");
                return;
            }
        };
        let local = LocalSet::new();
        local.block_on(&rt, async move {
            let module = make_module(module_handle);
            event_loop.run(module).await;
        });
        info!("GATT client thread exiting");
    })?;
    Ok((handle, thread))
}
