use async_trait::async_trait;
use bbp_codec::DEFAULT_FRAME_SIZE;
use bbp_core::{Link, LinkError};
use tokio::sync::mpsc;

/// One end of an in-memory link. Dropping either end closes the other.
#[derive(Debug)]
pub struct SimLink {
    frame_size: usize,
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl Link for SimLink {
    async fn write(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        if frame.len() != self.frame_size {
            return Err(LinkError::Other(anyhow::anyhow!(
                "frame of {} bytes on a {} byte link",
                frame.len(),
                self.frame_size
            )));
        }
        self.tx
            .send(frame.to_vec())
            .await
            .map_err(|_| LinkError::Closed)
    }

    async fn read(&mut self) -> Result<Vec<u8>, LinkError> {
        self.rx.recv().await.ok_or(LinkError::Closed)
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }
}

/// Host and device ends of a fresh link.
pub fn link_pair(frame_size: usize, capacity: usize) -> (SimLink, SimLink) {
    let (host_tx, device_rx) = mpsc::channel(capacity);
    let (device_tx, host_rx) = mpsc::channel(capacity);
    let host = SimLink {
        frame_size,
        tx: host_tx,
        rx: host_rx,
    };
    let device = SimLink {
        frame_size,
        tx: device_tx,
        rx: device_rx,
    };
    (host, device)
}

pub fn default_link_pair() -> (SimLink, SimLink) {
    link_pair(DEFAULT_FRAME_SIZE, 256)
}
