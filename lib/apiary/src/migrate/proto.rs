// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::migrate::codec::{self, Frame, Message, ProtocolError};

/// Shared writer half of the migration stream.
///
/// Frames are small and the protocol is multiplex, so a single mutex
/// around the writer is the entire serialisation story: whichever task
/// holds it writes one complete frame and lets go.  Block movers are
/// bounded by their concurrency quota, so the mutex also provides the
/// protocol's backpressure.
pub struct FrameSender {
    w: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl FrameSender {
    pub fn new(w: impl AsyncWrite + Send + Unpin + 'static) -> Arc<Self> {
        Arc::new(Self { w: Mutex::new(Box::new(w)) })
    }

    pub async fn send(
        &self,
        device: u32,
        msg: Message,
    ) -> Result<(), ProtocolError> {
        let mut w = self.w.lock().await;
        codec::write_frame(&mut *w, &Frame { device, msg }).await
    }

    /// Flushes and shuts the stream down; the peer observes a clean EOF.
    pub async fn shutdown(&self) -> Result<(), ProtocolError> {
        let mut w = self.w.lock().await;
        w.shutdown().await?;
        Ok(())
    }
}
