//! The async runtime around a [`Node`].
//!
//! One task owns the UDP socket and the node, and drives both from a
//! single `select!` loop: inbound datagrams, the node's earliest timer
//! deadline, and the user command channel. After every input the node's
//! outbox is flushed to the socket and its events to the notification
//! channel. The node itself stays synchronous and single-threaded.

use std::net::SocketAddr;
use std::time::Instant;

use thiserror::Error;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::sleep_until;
use tracing::{debug, info, warn};

use murmur_core::Peer;

use crate::event::{Command, Event};
use crate::node::Node;

/// Ports tried per node, and instances expected per host.
pub const PORT_SPAN: u16 = 4;

/// Command channel depth; sends block briefly when the loop is busy.
const COMMAND_CHANNEL_SIZE: usize = 64;

/// Errors from socket setup and the event loop.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// No port in the node's range could be bound. Fatal at startup.
    #[error("no UDP port available in {base}..={top}")]
    PortBindFailure {
        /// First port tried.
        base: u16,
        /// Last port tried.
        top: u16,
    },

    /// The socket failed outside of bind.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Binds the first free UDP port of the node's four-port range.
///
/// Returns the socket and the port it landed on.
pub async fn bind_socket(port_base: u16) -> Result<(UdpSocket, u16), RuntimeError> {
    let top = port_base + PORT_SPAN - 1;
    for port in port_base..=top {
        match UdpSocket::bind(("127.0.0.1", port)).await {
            Ok(socket) => {
                info!(port, "bound UDP socket");
                return Ok((socket, port));
            }
            Err(err) => debug!(port, error = %err, "port taken, trying next"),
        }
    }
    Err(RuntimeError::PortBindFailure {
        base: port_base,
        top,
    })
}

/// The localhost peers at the other ports of the node's range.
pub fn neighbor_peers(port_base: u16, bound_port: u16) -> Vec<Peer> {
    (port_base..port_base + PORT_SPAN)
        .filter(|&port| port != bound_port)
        .map(Peer::localhost)
        .collect()
}

/// Cheap cloneable handle the UI drives the node through.
#[derive(Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<Command>,
}

impl NodeHandle {
    /// Enqueues a command for the node.
    pub async fn send(&self, command: Command) {
        if self.commands.send(command).await.is_err() {
            warn!("node runtime is gone, command dropped");
        }
    }
}

/// Owns the socket and the node, and runs the event loop.
pub struct NodeRuntime {
    socket: UdpSocket,
    node: Node,
    commands: mpsc::Receiver<Command>,
    command_tx: mpsc::Sender<Command>,
    events: mpsc::UnboundedSender<Event>,
}

impl NodeRuntime {
    /// Wires a node to its socket and notification channel.
    pub fn new(
        socket: UdpSocket,
        node: Node,
        events: mpsc::UnboundedSender<Event>,
    ) -> (Self, NodeHandle) {
        let (command_tx, commands) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let handle = NodeHandle {
            commands: command_tx.clone(),
        };
        (
            Self {
                socket,
                node,
                commands,
                command_tx,
                events,
            },
            handle,
        )
    }

    /// Runs until shutdown is commanded or every handle is dropped.
    pub async fn run(mut self) -> Result<(), RuntimeError> {
        // Announce ourselves once on startup.
        self.node.broadcast_own_route();
        self.flush().await;

        let mut buf = vec![0u8; 65536];
        loop {
            let deadline = tokio::time::Instant::from_std(self.node.next_deadline());

            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, SocketAddr::V4(from))) => {
                            self.node.handle_datagram(&buf[..len], Peer::from(from), Instant::now());
                        }
                        Ok((_, SocketAddr::V6(from))) => {
                            debug!(from = %from, "ignoring IPv6 datagram");
                        }
                        Err(err) => warn!(error = %err, "socket receive failed"),
                    }
                }

                _ = sleep_until(deadline) => {
                    self.node.on_deadline(Instant::now());
                }

                command = self.commands.recv() => {
                    match command {
                        None | Some(Command::Shutdown) => {
                            info!("node runtime shutting down");
                            break;
                        }
                        Some(Command::AddPeer(arg)) => self.add_peer_arg(arg),
                        Some(command) => self.node.handle_command(command, Instant::now()),
                    }
                }
            }

            self.flush().await;
        }

        Ok(())
    }

    /// Drains node output: packets to the wire, events to the UI.
    async fn flush(&mut self) {
        for (peer, packet) in self.node.take_outbox() {
            let bytes = packet.to_vec();
            if let Err(err) = self.socket.send_to(&bytes, peer.socket_addr()).await {
                // UDP sends are best-effort; the protocols recover.
                warn!(peer = %peer, error = %err, "send failed");
            }
        }
        for event in self.node.take_events() {
            let _ = self.events.send(event);
        }
    }

    /// Parses a `host:port` peer argument. IPv4 literals join at once;
    /// hostnames resolve on a background task and come back as
    /// [`Command::LearnPeer`].
    fn add_peer_arg(&mut self, arg: String) {
        let Some((host, port)) = arg.rsplit_once(':') else {
            warn!(arg = %arg, "invalid peer, expected host:port");
            return;
        };
        let Ok(port) = port.parse::<u16>() else {
            warn!(arg = %arg, "invalid peer port");
            return;
        };

        if let Ok(addr) = host.parse() {
            self.node
                .handle_command(Command::LearnPeer(Peer::new(addr, port)), Instant::now());
            return;
        }

        let host = host.to_string();
        let command_tx = self.command_tx.clone();
        tokio::spawn(async move {
            match lookup_host((host.as_str(), port)).await {
                Ok(addrs) => {
                    let resolved = addrs.filter_map(|addr| match addr {
                        SocketAddr::V4(v4) => Some(Peer::from(v4)),
                        SocketAddr::V6(_) => None,
                    });
                    for peer in resolved {
                        let _ = command_tx.send(Command::LearnPeer(peer)).await;
                    }
                }
                Err(err) => warn!(host = %host, error = %err, "hostname lookup failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neighbor_peers_excludes_bound_port() {
        let neighbors = neighbor_peers(32768, 32769);
        assert_eq!(
            neighbors,
            vec![
                Peer::localhost(32768),
                Peer::localhost(32770),
                Peer::localhost(32771),
            ]
        );
    }

    #[tokio::test]
    async fn test_bind_walks_port_range() {
        // Use an uncontended range well away from any running node.
        let base = 42_000;
        let (first, port_a) = bind_socket(base).await.unwrap();
        let (_second, port_b) = bind_socket(base).await.unwrap();
        assert_ne!(port_a, port_b);
        drop(first);

        // Exhausting the range fails with the fatal bind error.
        let mut held = Vec::new();
        for port in base..base + PORT_SPAN {
            if let Ok(socket) = UdpSocket::bind(("127.0.0.1", port)).await {
                held.push(socket);
            }
        }
        let err = bind_socket(base).await.unwrap_err();
        assert!(matches!(err, RuntimeError::PortBindFailure { .. }));
    }
}
