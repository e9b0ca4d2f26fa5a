//! UDP socket actor.
//!
//! Owns the socket and nothing else. Inbound datagrams are decoded here and
//! forwarded as events; outbound messages arrive as commands. Events are
//! delivered with `try_send` so this actor never blocks on the node task:
//! UDP is lossy to begin with, and dropping under backpressure beats the two
//! tasks waiting on each other's full channel.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};

use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};

use crate::error::DhtError;
use crate::message::{DecodeError, KrpcMessage};

const CHANNEL_CAPACITY: usize = 128;
const RECV_BUFFER_LEN: usize = 4096;

pub enum SocketCommand {
    Send { message: KrpcMessage, to: SocketAddrV4 },
    Shutdown,
}

#[derive(Debug)]
pub enum SocketEvent {
    MessageReceived {
        message: KrpcMessage,
        from: SocketAddrV4,
    },
    /// Datagram that did not decode to a usable message. The node task
    /// decides whether it deserves an error reply.
    DecodeError {
        error: DecodeError,
        from: SocketAddrV4,
    },
    SendError {
        message: KrpcMessage,
        to: SocketAddrV4,
        error: io::Error,
    },
}

/// Cheap handle for talking to the socket actor.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    command_tx: Sender<SocketCommand>,
    local_addr: SocketAddrV4,
}

impl SocketHandle {
    pub async fn send(&self, message: KrpcMessage, to: SocketAddrV4) -> Result<(), DhtError> {
        self.command_tx
            .send(SocketCommand::Send { message, to })
            .await
            .map_err(|_| DhtError::ChannelClosed)
    }

    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(SocketCommand::Shutdown).await;
    }

    /// Address the socket actually bound, ephemeral port resolved.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }
}

pub struct KrpcSocket {
    socket: UdpSocket,
    command_rx: Receiver<SocketCommand>,
    event_tx: Sender<SocketEvent>,
}

impl KrpcSocket {
    /// Binds the socket. This is the only I/O failure that aborts node
    /// construction.
    pub async fn bind(
        bind_addr: SocketAddrV4,
    ) -> io::Result<(Self, SocketHandle, Receiver<SocketEvent>)> {
        let socket = UdpSocket::bind(SocketAddr::V4(bind_addr)).await?;
        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(addr) => {
                return Err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("expected an IPv4 socket, bound {addr}"),
                ));
            }
        };
        let (command_tx, command_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let actor = KrpcSocket {
            socket,
            command_rx,
            event_tx,
        };
        let handle = SocketHandle {
            command_tx,
            local_addr,
        };
        Ok((actor, handle, event_rx))
    }

    pub async fn run(mut self) {
        let mut buf = vec![0u8; RECV_BUFFER_LEN];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, SocketAddr::V4(from))) => {
                            let event = match KrpcMessage::from_bytes(&buf[..len]) {
                                Ok(message) => SocketEvent::MessageReceived { message, from },
                                Err(error) => SocketEvent::DecodeError { error, from },
                            };
                            if !self.forward(event) {
                                return;
                            }
                        }
                        // IPv6 is out of scope for this node
                        Ok((_, SocketAddr::V6(from))) => {
                            tracing::debug!(%from, "ignoring datagram from IPv6 source");
                        }
                        Err(e) => {
                            tracing::warn!("UDP recv error: {e}");
                        }
                    }
                }

                command = self.command_rx.recv() => {
                    match command {
                        Some(SocketCommand::Send { message, to }) => {
                            let bytes = message.to_bytes();
                            if let Err(error) = self.socket.send_to(&bytes, SocketAddr::V4(to)).await
                                && !self.forward(SocketEvent::SendError { message, to, error })
                            {
                                return;
                            }
                        }
                        Some(SocketCommand::Shutdown) | None => {
                            tracing::debug!("socket actor shutting down");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// False once the node task is gone and the actor should stop.
    fn forward(&self, event: SocketEvent) -> bool {
        match self.event_tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!("node task is behind, dropping socket event");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}
