use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::Notify,
    time::{Duration, Instant},
};

use crate::{Error, requester::StunRequester, turn::TurnClient};

/// Per-server read/write buffer bound.
pub(crate) const SERVER_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

pub(crate) struct CandidateState {
    pub activated: bool,
    pub connected: bool,
    pub failed: bool,
    pub informed_write_ready: bool,
    /// the authenticated retry keeps the same server; a second 401
    /// after it means the credentials are wrong.
    pub tried_auth: bool,
    pub allocate_requester: Option<Arc<StunRequester>>,
    pub read_buffer: BytesMut,
    pub write_buffer: BytesMut,
    pub tcp_task: Option<tokio::task::JoinHandle<()>>,
}

/// One enumerated TURN server endpoint.
///
/// Candidates are activated on a staggered schedule: a later candidate
/// is tried only if no earlier one has produced a successful allocate
/// by its activation time.  TCP candidates own their connection and a
/// pair of bounded buffers; UDP candidates transmit through the host
/// socket via the client delegate.
pub(crate) struct CandidateServer {
    pub transport: Transport,
    pub addr: SocketAddr,
    /// offset from client start after which this candidate activates.
    pub activate_after: Duration,
    pub state: Mutex<CandidateState>,
    write_wake: Notify,
}

impl CandidateServer {
    pub fn new(transport: Transport, addr: SocketAddr, activate_after: Duration) -> Arc<Self> {
        Arc::new(Self {
            transport,
            addr,
            activate_after,
            state: Mutex::new(CandidateState {
                activated: false,
                connected: false,
                failed: false,
                informed_write_ready: false,
                tried_auth: false,
                allocate_requester: None,
                read_buffer: BytesMut::new(),
                write_buffer: BytesMut::new(),
                tcp_task: None,
            }),
            write_wake: Notify::new(),
        })
    }

    pub fn is_failed(&self) -> bool {
        self.state.lock().failed
    }

    /// Queue bytes for the TCP writer task.
    ///
    /// A full write buffer drops the datagram and clears the
    /// write-ready edge so the delegate is told exactly once when the
    /// buffer drains.
    pub fn queue_write(&self, bytes: &[u8]) -> bool {
        {
            let mut state = self.state.lock();
            if state.failed {
                return false;
            }

            if state.write_buffer.len() + bytes.len() > SERVER_BUFFER_SIZE {
                log::warn!(
                    "server write buffer full, dropping packet: server={:?}, size={}",
                    self.addr,
                    bytes.len()
                );

                state.informed_write_ready = false;
                return false;
            }

            state.write_buffer.extend_from_slice(bytes);
        }

        self.write_wake.notify_one();
        true
    }

    /// Append received bytes and split off every complete frame.
    ///
    /// STUN messages and ChannelData share the stream; ChannelData is
    /// aligned to four bytes on TCP.  A buffer overflow or an
    /// unparseable leading byte poisons the connection, since framing
    /// can not be recovered.
    pub fn absorb(&self, bytes: &[u8]) -> Result<Vec<Bytes>, Error> {
        let mut state = self.state.lock();
        if state.read_buffer.len() + bytes.len() > SERVER_BUFFER_SIZE {
            return Err(Error::InvalidPacket);
        }

        state.read_buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        loop {
            if state.read_buffer.len() < 4 {
                break;
            }

            let size = match codec::frame_size(&state.read_buffer, true) {
                Ok(size) => size,
                Err(_) => return Err(Error::InvalidPacket),
            };

            if state.read_buffer.len() < size {
                break;
            }

            frames.push(state.read_buffer.split_to(size).freeze());
        }

        Ok(frames)
    }

    /// Tear the candidate down.  Idempotent.
    pub fn fail(&self) {
        let (requester, task) = {
            let mut state = self.state.lock();
            state.failed = true;
            state.connected = false;
            (state.allocate_requester.take(), state.tcp_task.take())
        };

        if let Some(requester) = requester {
            requester.cancel();
        }

        if let Some(task) = task {
            task.abort();
        }

        self.write_wake.notify_one();
    }
}

/// Connection task for a TCP candidate.
///
/// Connects, then multiplexes reads (frame reassembly into the client)
/// with drains of the bounded write buffer.  The task exits when the
/// peer closes, an I/O error occurs, framing desynchronizes, or the
/// candidate is failed from outside.
pub(crate) async fn run_tcp(client: Weak<TurnClient>, server: Arc<CandidateServer>) {
    let stream = match TcpStream::connect(server.addr).await {
        Ok(stream) => stream,
        Err(err) => {
            log::debug!("tcp connect failed: server={:?}, err={:?}", server.addr, err);

            if let Some(client) = client.upgrade() {
                client.on_server_failed(&server);
            }

            return;
        }
    };

    log::info!("tcp server connected: server={:?}", server.addr);
    server.state.lock().connected = true;

    if let Some(client) = client.upgrade() {
        client.on_server_connected(&server);
    }

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = [0u8; 4096];

    'session: loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let size = match read {
                    Ok(0) | Err(_) => break 'session,
                    Ok(size) => size,
                };

                let frames = match server.absorb(&buf[..size]) {
                    Ok(frames) => frames,
                    Err(_) => {
                        log::warn!("tcp framing lost: server={:?}", server.addr);
                        break 'session;
                    }
                };

                let Some(client) = client.upgrade() else {
                    return;
                };

                for frame in frames {
                    client.route_server_frame(&server, &frame);
                }
            }
            _ = server.write_wake.notified() => {
                loop {
                    let chunk = {
                        let mut state = server.state.lock();
                        if state.failed {
                            break 'session;
                        }

                        if state.write_buffer.is_empty() {
                            break;
                        }

                        state.write_buffer.split().freeze()
                    };

                    if writer.write_all(&chunk).await.is_err() {
                        break 'session;
                    }
                }

                if let Some(client) = client.upgrade() {
                    client.on_server_drained(&server);
                }
            }
        }
    }

    log::info!("tcp server disconnected: server={:?}", server.addr);

    if let Some(client) = client.upgrade() {
        client.on_server_failed(&server);
    }
}

/// Lay out candidate activation times: the first candidate starts
/// immediately, each later one a fixed stagger after the previous.
pub(crate) fn staggered(index: usize, stagger: Duration) -> Duration {
    stagger * index as u32
}

/// Whether a candidate is due for activation.
pub(crate) fn is_due(server: &CandidateServer, started_at: Instant, now: Instant) -> bool {
    now >= started_at + server.activate_after
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absorb_reassembles_interleaved_frames() {
        let server = CandidateServer::new(
            Transport::Tcp,
            "1.2.3.4:3478".parse().unwrap(),
            Duration::ZERO,
        );

        // channel 0x4000, length 5, payload "ABCDE", padded to 12 bytes
        // on the stream, followed by a 20 byte stun header.
        let channel_frame = [
            0x40u8, 0x00, 0x00, 0x05, 0x41, 0x42, 0x43, 0x44, 0x45, 0x00, 0x00, 0x00,
        ];
        let stun_frame = [
            0x01u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49, 0x42,
            0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
        ];

        // feed everything but the last byte: only the channel frame is
        // complete.
        let mut stream = Vec::new();
        stream.extend_from_slice(&channel_frame);
        stream.extend_from_slice(&stun_frame);

        let frames = server.absorb(&stream[..stream.len() - 1]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &channel_frame);

        // the read buffer advanced by exactly the frame size.
        assert_eq!(server.state.lock().read_buffer.len(), stun_frame.len() - 1);

        let frames = server.absorb(&stream[stream.len() - 1..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &stun_frame);
        assert!(server.state.lock().read_buffer.is_empty());
    }

    #[test]
    fn queue_write_drops_on_overflow_and_clears_the_edge() {
        let server = CandidateServer::new(
            Transport::Tcp,
            "1.2.3.4:3478".parse().unwrap(),
            Duration::ZERO,
        );

        server.state.lock().informed_write_ready = true;

        assert!(server.queue_write(&vec![0u8; SERVER_BUFFER_SIZE]));
        assert!(!server.queue_write(&[0u8; 1]));
        assert!(!server.state.lock().informed_write_ready);
    }
}
