//! Socket transport under the packet router.
//!
//! - reliable: TCP with `u32` big-endian length-prefixed frames
//! - unreliable: UDP, one router packet per datagram
//!
//! A connection opens with a JSON control handshake on the TCP stream
//! (`Hello` → `Welcome`/`Reject`). After that every frame and datagram is a
//! raw router packet.

use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, UdpSocket,
    },
    time,
};

use crate::net::PeerId;

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted frame payload.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Largest UDP datagram read.
pub const MAX_DATAGRAM_LEN: usize = 64 * 1024;

/// Connection handshake messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMsg {
    Hello {
        protocol: u32,
        name: String,
        udp_port: u16,
    },
    Welcome {
        peer: PeerId,
        session: String,
        tick_hz: u32,
    },
    Reject {
        reason: String,
    },
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> anyhow::Result<()> {
    anyhow::ensure!(
        payload.len() <= MAX_FRAME_LEN,
        "frame of {} bytes exceeds {MAX_FRAME_LEN}",
        payload.len()
    );
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    w.write_all(&buf).await.context("tcp write")?;
    Ok(())
}

/// Reads one length-prefixed frame.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<Bytes> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await.context("tcp read len")?;
    let len = u32::from_be_bytes(len_buf) as usize;
    anyhow::ensure!(len <= MAX_FRAME_LEN, "frame of {len} bytes exceeds {MAX_FRAME_LEN}");
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .await
        .context("tcp read payload")?;
    Ok(Bytes::from(payload))
}

/// Reliable connection over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await.context("tcp connect")?;
        stream.set_nodelay(true).context("tcp nodelay")?;
        Ok(Self::new(stream))
    }

    pub async fn send_frame(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        write_frame(&mut self.stream, payload).await
    }

    pub async fn recv_frame(&mut self) -> anyhow::Result<Bytes> {
        read_frame(&mut self.stream).await
    }

    pub async fn send_control(&mut self, msg: &ControlMsg) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(msg).context("serialize control msg")?;
        self.send_frame(&payload).await
    }

    pub async fn recv_control(&mut self) -> anyhow::Result<ControlMsg> {
        let frame = self.recv_frame().await?;
        serde_json::from_slice(&frame).context("deserialize control msg")
    }

    /// Receives a control message within `timeout`.
    pub async fn recv_control_timeout(&mut self, timeout: Duration) -> anyhow::Result<ControlMsg> {
        time::timeout(timeout, self.recv_control())
            .await
            .context("handshake timed out")?
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Splits into independently owned read and write halves.
    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }
}

/// Unreliable channel over UDP to a single peer.
#[derive(Debug)]
pub struct UnreliableConn {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UnreliableConn {
    pub async fn connect(bind_addr: SocketAddr, peer: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.context("udp bind")?;
        socket.connect(peer).await.context("udp connect")?;
        Ok(Self { socket, peer })
    }

    pub async fn send(&self, payload: &[u8]) -> anyhow::Result<()> {
        self.socket.send(payload).await.context("udp send")?;
        Ok(())
    }

    pub async fn recv(&self) -> anyhow::Result<Bytes> {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        let n = self.socket.recv(&mut buf).await.context("udp recv")?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    /// Receives a datagram within the given timeout.
    pub async fn recv_timeout(&self, timeout: Duration) -> anyhow::Result<Option<Bytes>> {
        match time::timeout(timeout, self.recv()).await {
            Ok(r) => r.map(Some),
            Err(_) => Ok(None),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(ReliableConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        stream.set_nodelay(true).context("tcp nodelay")?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_msg_json_roundtrip() {
        let msg = ControlMsg::Welcome {
            peer: PeerId(3),
            session: "main".into(),
            tick_hz: 30,
        };
        let json = serde_json::to_vec(&msg).unwrap();
        assert_eq!(serde_json::from_slice::<ControlMsg>(&json).unwrap(), msg);
    }

    #[tokio::test]
    async fn frames_roundtrip_over_a_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            write_frame(&mut a, b"hello").await.unwrap();
            write_frame(&mut a, b"").await.unwrap();
        });
        assert_eq!(&read_frame(&mut b).await.unwrap()[..], b"hello");
        assert!(read_frame(&mut b).await.unwrap().is_empty());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_frames_are_refused() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        a.write_all(&len).await.unwrap();
        assert!(read_frame(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn tcp_control_exchange() {
        let listener = ReliableListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.recv_control().await.unwrap()
        });
        let mut client = ReliableConn::connect(addr).await.unwrap();
        let hello = ControlMsg::Hello {
            protocol: PROTOCOL_VERSION,
            name: "x".into(),
            udp_port: 9,
        };
        client.send_control(&hello).await.unwrap();
        assert_eq!(server.await.unwrap(), hello);
    }
}
