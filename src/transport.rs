//! RSP packet framing: escaping, checksums, the `+`/`-` ack handshake and
//! break detection (spec §4.2, §4.3).
//!
//! The send path and the receive path are independent, per §5: `send` guards
//! only the write half and a FIFO of ack waiters, while `recv` owns the read
//! half and the receive buffer with no other lock in its critical section. A
//! raw `+`/`-` byte observed outside of a `$...#hh` frame resolves the oldest
//! ack waiter instead of being surfaced to the caller, so a `send_packet`
//! call can be acked while another task is parked in `receive_packet`
//! waiting on the next request — this is what lets a Host I/O call proceed
//! while the dispatch loop is blocked reading from the client.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex};

use crate::error::{Error, Result};
use crate::timeout::with_timeout;

const BREAK: u8 = 0x03;
const ACK: u8 = b'+';
const NACK: u8 = b'-';

/// What [`Transport::receive_packet`] produced.
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    /// The client sent the out-of-band interrupt byte.
    Break,
    /// A fully checksummed, unescaped packet body.
    Packet(Vec<u8>),
}

/// How a pending `send_packet` ack wait was resolved by the receive loop.
enum AckOutcome {
    Ack,
    Nack,
    Break,
}

struct SendState<S> {
    write_half: WriteHalf<S>,
}

struct RecvState<S> {
    read_half: ReadHalf<S>,
    recv_buf: Vec<u8>,
    recv_pos: usize,
}

/// Frames, escapes and checksums RSP packets over an async duplex stream.
pub struct Transport<S> {
    send: Mutex<SendState<S>>,
    recv: Mutex<RecvState<S>>,
    ack_waiters: Mutex<VecDeque<oneshot::Sender<AckOutcome>>>,
    ack_mode: AtomicBool,
    packet_capacity: usize,
    read_chunk_size: usize,
    timeout: Duration,
    allow_inbound_rle: bool,
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        socket: S,
        packet_capacity: usize,
        read_chunk_size: usize,
        timeout: Duration,
        ack_mode: bool,
        allow_inbound_rle: bool,
    ) -> Self {
        let (read_half, write_half) = split(socket);
        Self {
            send: Mutex::new(SendState { write_half }),
            recv: Mutex::new(RecvState {
                read_half,
                recv_buf: Vec::new(),
                recv_pos: 0,
            }),
            ack_waiters: Mutex::new(VecDeque::new()),
            ack_mode: AtomicBool::new(ack_mode),
            packet_capacity,
            read_chunk_size,
            timeout,
            allow_inbound_rle,
        }
    }

    /// Disables the `+`/`-` ack handshake, per a `QStartNoAckMode` request.
    pub async fn disable_ack_mode(&self) {
        self.ack_mode.store(false, Ordering::SeqCst);
    }

    pub async fn ack_mode(&self) -> bool {
        self.ack_mode.load(Ordering::SeqCst)
    }

    /// Frames and sends `payload` as `$<payload>#<checksum>`, retransmitting
    /// on a `-` nack. Returns `Ok(true)` if a break byte arrived while
    /// waiting for the ack instead. Does not touch the receive side: the ack
    /// itself is delivered by whichever task is driving `receive_packet`.
    pub async fn send_packet(&self, payload: &[u8]) -> Result<bool> {
        with_timeout(self.send_packet_inner(payload), self.timeout).await
    }

    async fn send_packet_inner(&self, payload: &[u8]) -> Result<bool> {
        let frame = build_frame(payload);

        loop {
            let wait_for_ack = self.ack_mode.load(Ordering::SeqCst);
            let rx = if wait_for_ack {
                let (tx, rx) = oneshot::channel();
                // Registering the waiter before writing (both under `send`)
                // keeps waiter order identical to frame-write order, so the
                // receive loop's FIFO pop always resolves the right call.
                let mut send = self.send.lock().await;
                self.ack_waiters.lock().await.push_back(tx);
                send.write_half.write_all(&frame).await?;
                send.write_half.flush().await?;
                Some(rx)
            } else {
                let mut send = self.send.lock().await;
                send.write_half.write_all(&frame).await?;
                send.write_half.flush().await?;
                None
            };

            let Some(rx) = rx else {
                return Ok(false);
            };

            match rx.await.map_err(|_| Error::Cancelled)? {
                AckOutcome::Ack => return Ok(false),
                AckOutcome::Break => return Ok(true),
                AckOutcome::Nack => continue,
            }
        }
    }

    /// Reads the next break byte or fully validated packet, nacking and
    /// retrying on a checksum mismatch. Also the sole reader of the socket:
    /// a bare ack/nack byte seen here resolves the oldest waiter registered
    /// by a concurrent `send_packet` instead of being treated as a protocol
    /// error, so this call must be driven continuously (as the dispatch
    /// loop in [`crate::connection`] does) for outstanding sends to unblock.
    pub async fn receive_packet(&self) -> Result<Received> {
        with_timeout(self.receive_packet_inner(), self.timeout).await
    }

    async fn receive_packet_inner(&self) -> Result<Received> {
        let mut recv = self.recv.lock().await;

        #[derive(Clone, Copy)]
        enum State {
            Initial,
            PacketData,
            Escaped,
            CheckHi,
            CheckLo,
        }

        'restart: loop {
            let mut body: Vec<u8> = Vec::new();
            let mut checksum: u8 = 0;
            let mut csum_hi: i32 = -1;
            let mut state = State::Initial;

            loop {
                let c = get_byte(&mut recv, self.read_chunk_size).await?;
                match state {
                    State::Initial => {
                        if c == b'$' {
                            state = State::PacketData;
                        } else if c == BREAK {
                            if self.resolve_ack_waiter(AckOutcome::Break).await {
                                continue;
                            }
                            return Ok(Received::Break);
                        } else if c == ACK {
                            if !self.resolve_ack_waiter(AckOutcome::Ack).await {
                                tracing::trace!("discarding unmatched ack byte");
                            }
                        } else if c == NACK {
                            if !self.resolve_ack_waiter(AckOutcome::Nack).await {
                                tracing::trace!("discarding unmatched nack byte");
                            }
                        } else {
                            tracing::trace!(byte = c, "discarding byte outside a frame");
                        }
                    }
                    State::PacketData => {
                        if c == b'#' {
                            state = State::CheckHi;
                        } else if c == b'}' {
                            checksum = checksum.wrapping_add(c);
                            state = State::Escaped;
                        } else if c == b'*' && !self.allow_inbound_rle {
                            return Err(Error::Malformed("unsupported inbound RLE".into()));
                        } else {
                            if body.len() >= self.packet_capacity {
                                return Err(Error::BufferTooSmall { writable: 0 });
                            }
                            checksum = checksum.wrapping_add(c);
                            body.push(c);
                        }
                    }
                    State::Escaped => {
                        checksum = checksum.wrapping_add(c);
                        if body.len() >= self.packet_capacity {
                            return Err(Error::BufferTooSmall { writable: 0 });
                        }
                        body.push(c ^ 0x20);
                        state = State::PacketData;
                    }
                    State::CheckHi => {
                        csum_hi = decode_hex_lenient(c);
                        state = State::CheckLo;
                    }
                    State::CheckLo => {
                        let csum_lo = decode_hex_lenient(c);
                        let expected = if csum_hi >= 0 && csum_lo >= 0 {
                            Some(((csum_hi as u8) << 4) | (csum_lo as u8))
                        } else {
                            None
                        };

                        if self.ack_mode.load(Ordering::SeqCst) {
                            if expected != Some(checksum) {
                                self.ack_via_recv(NACK).await?;
                                continue 'restart;
                            }
                            self.ack_via_recv(ACK).await?;
                        }
                        return Ok(Received::Packet(body));
                    }
                }
            }
        }
    }

    /// Pops the oldest ack waiter (if any) and resolves it with `outcome`.
    /// Returns whether a waiter was actually waiting.
    async fn resolve_ack_waiter(&self, outcome: AckOutcome) -> bool {
        let waiter = self.ack_waiters.lock().await.pop_front();
        match waiter {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Writes a single ack/nack byte back to the peer in response to a just
    /// received packet. Briefly takes the `send` lock purely to serialize
    /// writes to the (shared) write half; it never waits on anything that
    /// could block, so it can't deadlock against a concurrent `send_packet`.
    async fn ack_via_recv(&self, byte: u8) -> Result<()> {
        let mut send = self.send.lock().await;
        send.write_half.write_all(&[byte]).await?;
        send.write_half.flush().await?;
        Ok(())
    }
}

fn build_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + payload.len() * 2);
    frame.push(b'$');
    let mut checksum: u8 = 0;
    for &c in payload {
        if must_escape_outbound(c) {
            frame.push(b'}');
            checksum = checksum.wrapping_add(b'}');
            let escaped = c ^ 0x20;
            frame.push(escaped);
            checksum = checksum.wrapping_add(escaped);
        } else {
            frame.push(c);
            checksum = checksum.wrapping_add(c);
        }
    }
    frame.push(b'#');
    frame.push(encode_hex_nibble(checksum >> 4));
    frame.push(encode_hex_nibble(checksum & 0x0f));
    frame
}

async fn get_byte<S>(recv: &mut RecvState<S>, read_chunk_size: usize) -> Result<u8>
where
    S: AsyncRead + Unpin,
{
    if recv.recv_pos >= recv.recv_buf.len() {
        let mut chunk = vec![0u8; read_chunk_size];
        let n = recv.read_half.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed the connection",
            )));
        }
        chunk.truncate(n);
        recv.recv_buf = chunk;
        recv.recv_pos = 0;
    }
    let byte = recv.recv_buf[recv.recv_pos];
    recv.recv_pos += 1;
    Ok(byte)
}

fn must_escape_outbound(c: u8) -> bool {
    matches!(c, b'$' | b'#' | b'}' | b'*')
}

fn encode_hex_nibble(n: u8) -> u8 {
    match n {
        0..=9 => b'0' + n,
        10..=15 => b'a' + (n - 10),
        _ => unreachable!("nibble out of range"),
    }
}

/// Like [`crate::codec::decode_hex_nibble`] but returns `-1` for an invalid
/// digit instead of an error, matching the original checksum parser: a bad
/// digit simply guarantees a checksum mismatch rather than aborting the read.
fn decode_hex_lenient(c: u8) -> i32 {
    match c {
        b'0'..=b'9' => (c - b'0') as i32,
        b'a'..=b'f' => (c - b'a' + 10) as i32,
        b'A'..=b'F' => (c - b'A' + 10) as i32,
        _ => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;
    use tokio::io::duplex;

    fn new_pair(ack_mode: bool) -> (Transport<tokio::io::DuplexStream>, tokio::io::DuplexStream) {
        let (server, client) = duplex(4096);
        let transport = Transport::new(server, 4096, 256, Duration::from_secs(1), ack_mode, false);
        (transport, client)
    }

    #[tokio::test]
    async fn send_then_ack_round_trips() {
        let (transport, mut client) = new_pair(true);
        let send = tokio::spawn(async move { transport.send_packet(b"OK").await });

        let mut frame = [0u8; 64];
        let n = client.read(&mut frame).await.unwrap();
        assert_eq!(&frame[..n], b"$OK#9a");
        client.write_all(b"+").await.unwrap();

        assert_eq!(send.await.unwrap().unwrap(), false);
    }

    #[tokio::test]
    async fn nack_triggers_retransmit() {
        let (transport, mut client) = new_pair(true);
        let send = tokio::spawn(async move { transport.send_packet(b"hi").await });

        let mut frame = [0u8; 64];
        let n = client.read(&mut frame).await.unwrap();
        let first = frame[..n].to_vec();
        client.write_all(b"-").await.unwrap();

        let n = client.read(&mut frame).await.unwrap();
        assert_eq!(&frame[..n], first.as_slice());
        client.write_all(b"+").await.unwrap();

        send.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn receive_parses_body_and_acks() {
        let (transport, mut client) = new_pair(true);
        client.write_all(b"$hello#").await.unwrap();
        let checksum: u8 = b"hello".iter().fold(0u8, |a, &b| a.wrapping_add(b));
        client
            .write_all(&[encode_hex_nibble(checksum >> 4), encode_hex_nibble(checksum & 0xf)])
            .await
            .unwrap();

        let received = transport.receive_packet().await.unwrap();
        assert_eq!(received, Received::Packet(b"hello".to_vec()));

        let mut ack = [0u8; 1];
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, [ACK]);
    }

    #[tokio::test]
    async fn bad_checksum_is_nacked_and_retried() {
        let (transport, mut client) = new_pair(true);
        client.write_all(b"$hi#00").await.unwrap();

        let recv = tokio::spawn(async move { transport.receive_packet().await });

        let mut nack = [0u8; 1];
        client.read_exact(&mut nack).await.unwrap();
        assert_eq!(nack, [NACK]);

        client.write_all(b"$hi#d1").await.unwrap();
        let mut ack = [0u8; 1];
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, [ACK]);

        assert_eq!(recv.await.unwrap().unwrap(), Received::Packet(b"hi".to_vec()));
    }

    #[tokio::test]
    async fn break_byte_is_reported() {
        let (transport, mut client) = new_pair(true);
        client.write_all(&[BREAK]).await.unwrap();
        assert_eq!(transport.receive_packet().await.unwrap(), Received::Break);
    }

    #[tokio::test]
    async fn escaped_special_characters_round_trip() {
        let (transport, mut client) = new_pair(true);
        let send = tokio::spawn(async move { transport.send_packet(b"a$b#c}d*e").await });

        let mut frame = Vec::new();
        let mut chunk = [0u8; 128];
        let n = client.read(&mut chunk).await.unwrap();
        frame.extend_from_slice(&chunk[..n]);
        client.write_all(b"+").await.unwrap();
        send.await.unwrap().unwrap();

        assert!(frame.starts_with(b"$a}\x04b}\x03c}\x5dd}\x0ae#"));
    }

    #[tokio::test]
    async fn no_ack_mode_skips_handshake() {
        let (transport, mut client) = new_pair(false);
        let result = transport.send_packet(b"x").await.unwrap();
        assert_eq!(result, false);

        let mut frame = [0u8; 16];
        let n = client.read(&mut frame).await.unwrap();
        assert_eq!(&frame[..n], b"$x#78");
    }

    /// The regression test for the send/receive deadlock: a `send_packet`
    /// call's ack wait must resolve even though a concurrent task is parked
    /// in `receive_packet` waiting on a request that hasn't arrived yet.
    #[tokio::test]
    async fn send_unblocks_while_receive_is_parked_waiting_for_a_request() {
        let (transport, mut client) = new_pair(true);
        let transport = Arc::new(transport);

        let recv_transport = transport.clone();
        let recv_task = tokio::spawn(async move { recv_transport.receive_packet().await });
        // Give the receive task a chance to actually park in `get_byte`.
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        let send_transport = transport.clone();
        let send_task = tokio::spawn(async move { send_transport.send_packet(b"Fopen,0,0,0").await });

        let mut frame = [0u8; 64];
        let n = tokio::time::timeout(StdDuration::from_secs(1), client.read(&mut frame))
            .await
            .expect("send_packet's frame should arrive without waiting on receive_packet")
            .unwrap();
        assert!(frame[..n].starts_with(b"$Fopen,0,0,0#"));
        client.write_all(b"+").await.unwrap();
        assert_eq!(send_task.await.unwrap().unwrap(), false);

        client.write_all(b"$?#3f").await.unwrap();
        let received = recv_task.await.unwrap().unwrap();
        assert_eq!(received, Received::Packet(b"?".to_vec()));
    }
}
