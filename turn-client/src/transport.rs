use crate::message::CHANNEL_DATA_HEADER_SIZE;
use async_trait::async_trait;
use log::{debug, trace};
use std::io;
use std::net::SocketAddr;
use stun_rs::MESSAGE_HEADER_SIZE;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs, UdpSocket};
use tokio::sync::{watch, Mutex};

/// Packet transport the client sends and receives STUN/TURN messages on.
///
/// One call to [`Transport::recv`] yields exactly one message. Only the
/// client's dispatch task calls `recv`; `send` may be called from any task.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one message to `to`.
    async fn send(&self, data: &[u8], to: SocketAddr) -> io::Result<()>;

    /// Waits for the next message, returning its size and source.
    async fn recv(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Closes the transport. Pending and future `recv` calls fail.
    async fn close(&self) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Reliable transports deliver every message, so requests sent over
    /// them are never retransmitted.
    fn is_reliable(&self) -> bool {
        false
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport closed")
}

/// Resolves once `closed` carries `true`.
async fn wait_closed(closed: &watch::Sender<bool>) {
    let mut rx = closed.subscribe();
    // The sender lives as long as the transport, so this only fails if
    // the transport is gone, which means closed as well.
    let _ = rx.wait_for(|closed| *closed).await;
}

/// UDP transport over a tokio socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    closed: watch::Sender<bool>,
}

impl UdpTransport {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::from_socket(socket))
    }

    pub fn from_socket(socket: UdpSocket) -> Self {
        let (closed, _) = watch::channel(false);
        Self { socket, closed }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, data: &[u8], to: SocketAddr) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.socket.send_to(data, to).await?;
        Ok(())
    }

    async fn recv(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        if self.is_closed() {
            return Err(closed_error());
        }
        tokio::select! {
            result = self.socket.recv_from(buffer) => result,
            _ = wait_closed(&self.closed) => Err(closed_error()),
        }
    }

    async fn close(&self) -> io::Result<()> {
        if !self.closed.send_replace(true) {
            debug!("UDP transport {:?} closed", self.socket.local_addr());
        }
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// Stream transport that frames a TCP connection into STUN messages and
/// ChannelData messages. Every message is received from, and sent to, the
/// connected peer.
#[derive(Debug)]
pub struct StunTcpTransport {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    closed: watch::Sender<bool>,
}

impl StunTcpTransport {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let (closed, _) = watch::channel(false);
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            local_addr,
            peer_addr,
            closed,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Total size of the frame starting with `header`: a STUN message when the
/// two most significant bits are `00`, a padded ChannelData message when they
/// are `01`.
fn frame_size(header: &[u8; CHANNEL_DATA_HEADER_SIZE]) -> io::Result<usize> {
    let length = usize::from(u16::from_be_bytes([header[2], header[3]]));
    match header[0] & 0xC0 {
        0x00 => Ok(MESSAGE_HEADER_SIZE + length),
        0x40 => Ok((CHANNEL_DATA_HEADER_SIZE + length + 3) & !3),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected frame type 0x{:02x}", header[0]),
        )),
    }
}

async fn read_frame(reader: &mut OwnedReadHalf, buffer: &mut [u8]) -> io::Result<usize> {
    let mut header = [0u8; CHANNEL_DATA_HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let size = frame_size(&header)?;
    if size > buffer.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds buffer of {}", size, buffer.len()),
        ));
    }
    buffer[..CHANNEL_DATA_HEADER_SIZE].copy_from_slice(&header);
    reader
        .read_exact(&mut buffer[CHANNEL_DATA_HEADER_SIZE..size])
        .await?;
    trace!("Read frame of {} bytes", size);
    Ok(size)
}

#[async_trait]
impl Transport for StunTcpTransport {
    async fn send(&self, data: &[u8], _to: SocketAddr) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.writer.lock().await.write_all(data).await
    }

    async fn recv(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        if self.is_closed() {
            return Err(closed_error());
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            result = read_frame(&mut reader, buffer) => Ok((result?, self.peer_addr)),
            _ = wait_closed(&self.closed) => Err(closed_error()),
        }
    }

    async fn close(&self) -> io::Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        debug!("TCP transport {} -> {} closed", self.local_addr, self.peer_addr);
        self.writer.lock().await.shutdown().await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn is_reliable(&self) -> bool {
        true
    }
}
