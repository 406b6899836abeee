//! Point-to-point byte transport between the hosts of a fixed-size group.
//!
//! The engine needs very little from a transport: reliable in-order framed
//! delivery on a data plane (consumed by the multiplexer) and a separate
//! flow-control plane (consumed by the collectives), between `num_hosts`
//! endpoints with dense ranks. A TCP implementation is an external
//! collaborator; the in-process [`MeshTransport`] below implements the same
//! trait over channels and is what local jobs and tests run on.

use crate::error::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Mutex;

/// A transport endpoint for one host of the group.
///
/// Per-sender ordering: two messages sent by the same host to the same
/// target arrive in send order. No ordering holds across senders.
pub trait Transport: Send + Sync + 'static {
    fn num_hosts(&self) -> usize;

    fn host_rank(&self) -> usize;

    /// Enqueue a framed message on the data plane.
    fn send(&self, target_host: usize, bytes: Vec<u8>) -> Result<()>;

    /// Receive the next data-plane message from any host; `None` after
    /// shutdown once the inbox drains.
    fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Send on the flow-control plane (collectives only).
    fn flow_send(&self, target_host: usize, bytes: Vec<u8>) -> Result<()>;

    /// Blocking receive on the flow-control plane from a specific host.
    fn flow_recv_from(&self, source_host: usize) -> Result<Vec<u8>>;

    /// Close the endpoint; pending `recv` calls drain and return `None`.
    fn shutdown(&self);
}

/// In-process transport: every pair of hosts is connected by channels.
pub struct MeshTransport {
    host_rank: usize,
    num_hosts: usize,
    /// Data-plane senders to each host, dropped on shutdown.
    data_tx: Mutex<Option<Vec<Sender<Vec<u8>>>>>,
    data_rx: Receiver<Vec<u8>>,
    flow_tx: Mutex<Option<Vec<Sender<Vec<u8>>>>>,
    /// Flow-plane inboxes, one per source host.
    flow_rx: Vec<Receiver<Vec<u8>>>,
}

/// Build a fully connected in-process mesh of `num_hosts` endpoints.
pub fn build_mesh(num_hosts: usize) -> Vec<std::sync::Arc<MeshTransport>> {
    assert!(num_hosts > 0);
    // data_channels[h] is host h's shared inbox.
    let data_channels: Vec<(Sender<Vec<u8>>, Receiver<Vec<u8>>)> =
        (0..num_hosts).map(|_| unbounded()).collect();
    // flow_channels[to][from] is a dedicated pipe.
    let flow_channels: Vec<Vec<(Sender<Vec<u8>>, Receiver<Vec<u8>>)>> = (0..num_hosts)
        .map(|_| (0..num_hosts).map(|_| unbounded()).collect())
        .collect();

    (0..num_hosts)
        .map(|h| {
            let data_tx = data_channels.iter().map(|(tx, _)| tx.clone()).collect();
            let flow_tx = (0..num_hosts)
                .map(|to| flow_channels[to][h].0.clone())
                .collect();
            let flow_rx = (0..num_hosts)
                .map(|from| flow_channels[h][from].1.clone())
                .collect();
            std::sync::Arc::new(MeshTransport {
                host_rank: h,
                num_hosts,
                data_tx: Mutex::new(Some(data_tx)),
                data_rx: data_channels[h].1.clone(),
                flow_tx: Mutex::new(Some(flow_tx)),
                flow_rx,
            })
        })
        .collect()
}

impl Transport for MeshTransport {
    fn num_hosts(&self) -> usize {
        self.num_hosts
    }

    fn host_rank(&self) -> usize {
        self.host_rank
    }

    fn send(&self, target_host: usize, bytes: Vec<u8>) -> Result<()> {
        let guard = self.data_tx.lock().unwrap();
        let senders = guard
            .as_ref()
            .ok_or_else(|| Error::Io(std::io::Error::other("transport shut down")))?;
        senders[target_host]
            .send(bytes)
            .map_err(|_| Error::Io(std::io::Error::other("peer transport closed")))
    }

    fn recv(&self) -> Result<Option<Vec<u8>>> {
        // Disconnection of every sender clone means global shutdown.
        Ok(self.data_rx.recv().ok())
    }

    fn flow_send(&self, target_host: usize, bytes: Vec<u8>) -> Result<()> {
        let guard = self.flow_tx.lock().unwrap();
        let senders = guard
            .as_ref()
            .ok_or_else(|| Error::Io(std::io::Error::other("transport shut down")))?;
        senders[target_host]
            .send(bytes)
            .map_err(|_| Error::Io(std::io::Error::other("peer transport closed")))
    }

    fn flow_recv_from(&self, source_host: usize) -> Result<Vec<u8>> {
        self.flow_rx[source_host]
            .recv()
            .map_err(|_| Error::Io(std::io::Error::other("peer transport closed")))
    }

    fn shutdown(&self) {
        self.data_tx.lock().unwrap().take();
        self.flow_tx.lock().unwrap().take();
    }
}
