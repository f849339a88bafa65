//! Connection-like sessions over a datagram socket.
//!
//! A [`Session`] binds one ARQ engine and one FEC encoder/decoder pair to a
//! socket and a remote address, and presents blocking, deadline-aware
//! `read`/`write` on top. Client sessions own their socket and run a read
//! loop thread; server sessions receive ingress fanned out by their
//! [`Listener`](crate::Listener).
//!
//! Locking: one mutex guards the per-session state. Datagrams produced by a
//! flush are staged under the lock and written to the socket after it is
//! released, preserving flush order without ever blocking the lock on the
//! kernel.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use socket2::SockRef;
use tracing::{debug, trace};

use crate::control::ControlBlock;
use crate::fec::{
    shard_flag, FecDecoder, FecEncoder, FEC_HEADER_SIZE, FEC_HEADER_SIZE_PLUS_2, TYPE_DATA,
    TYPE_PARITY,
};
use crate::listener::ListenerShared;
use crate::pool;
use crate::protocol::{MTU_LIMIT, OVERHEAD};
use crate::stats::{self, stats};
use crate::updater;
use crate::{current_ms, Error};

/// The decoder window holds this many blocks' worth of shards.
pub(crate) const RX_FEC_MULTI: usize = 3;

/// Socket read timeout used by ingress loops so they can observe shutdown.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A reliable, ordered session with one remote peer.
///
/// Cheap to clone; clones share the same underlying state and may be used
/// from multiple threads.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    core: Mutex<Core>,
    read_ready: Condvar,
    write_ready: Condvar,
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    /// Set on server-side sessions; used to deregister on close.
    listener: Option<Weak<ListenerShared>>,
    closed: AtomicBool,
}

struct Core {
    arq: ControlBlock,
    fec_encoder: Option<FecEncoder>,
    fec_decoder: Option<FecDecoder>,
    /// Bytes of shard framing in front of every ARQ datagram.
    header_size: usize,
    /// Reassembly scratch; `recv_buf[pos..]` is unread leftover.
    recv_buf: Vec<u8>,
    pos: usize,
    rd: Option<Instant>,
    wd: Option<Instant>,
    ack_no_delay: bool,
    write_delay: bool,
    dup: usize,
    closed: bool,
    read_err: Option<io::Error>,
    write_err: Option<io::Error>,
    /// Datagrams flushed under the lock, sent after it is released.
    staged: Vec<Vec<u8>>,
}

/// Copy one flushed datagram into a pooled buffer, wrap it in FEC framing
/// and append it (plus any parity shards) to the staging queue.
fn stage_datagram(
    fec_encoder: &mut Option<FecEncoder>,
    staged: &mut Vec<Vec<u8>>,
    min_len: usize,
    dgram: &mut [u8],
) {
    if dgram.len() < min_len {
        return;
    }
    let mut buf = pool::get();
    buf.extend_from_slice(dgram);
    match fec_encoder.as_mut() {
        Some(enc) => {
            let parity: Vec<Vec<u8>> = enc
                .encode(&mut buf)
                .iter()
                .map(|p| {
                    let mut pb = pool::get();
                    pb.extend_from_slice(p);
                    pb
                })
                .collect();
            staged.push(buf);
            staged.extend(parity);
        }
        None => staged.push(buf),
    }
}

impl Session {
    /// Establish a client session over a caller-supplied socket.
    ///
    /// `conv` must match the value the peer uses for this conversation.
    /// FEC is enabled when both shard counts are non-zero.
    pub fn client(
        socket: UdpSocket,
        remote: SocketAddr,
        conv: u32,
        data_shards: usize,
        parity_shards: usize,
    ) -> Result<Self, Error> {
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        Self::create(
            conv,
            data_shards,
            parity_shards,
            None,
            Arc::new(socket),
            remote,
        )
    }

    pub(crate) fn create(
        conv: u32,
        data_shards: usize,
        parity_shards: usize,
        listener: Option<Weak<ListenerShared>>,
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
    ) -> Result<Self, Error> {
        let fec = data_shards > 0 && parity_shards > 0;
        let (fec_encoder, fec_decoder, header_size) = if fec {
            let shard_size = data_shards + parity_shards;
            (
                Some(FecEncoder::new(data_shards, parity_shards, 0)?),
                Some(FecDecoder::new(
                    RX_FEC_MULTI * shard_size,
                    data_shards,
                    parity_shards,
                )?),
                FEC_HEADER_SIZE_PLUS_2,
            )
        } else {
            (None, None, 0)
        };

        let mut arq = ControlBlock::new(conv);
        arq.reserve_bytes(header_size);

        let client = listener.is_none();
        let inner = Arc::new(SessionInner {
            core: Mutex::new(Core {
                arq,
                fec_encoder,
                fec_decoder,
                header_size,
                recv_buf: Vec::new(),
                pos: 0,
                rd: None,
                wd: None,
                ack_no_delay: false,
                write_delay: false,
                dup: 0,
                closed: false,
                read_err: None,
                write_err: None,
                staged: Vec::new(),
            }),
            read_ready: Condvar::new(),
            write_ready: Condvar::new(),
            socket,
            remote,
            listener,
            closed: AtomicBool::new(false),
        });

        updater::register(&inner);
        if client {
            let handle = inner.clone();
            std::thread::Builder::new()
                .name("arq256-read".into())
                .spawn(move || read_loop(handle))?;
        }
        stats::session_established(client);
        debug!(conv, %remote, client, "session established");
        Ok(Self { inner })
    }

    /// The conversation id of this session.
    pub fn conv(&self) -> u32 {
        self.inner.core.lock().arq.conv()
    }

    /// Local socket address.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.inner.socket.local_addr()?)
    }

    /// Remote peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.remote
    }

    /// Read the next bytes, blocking until a message arrives, the read
    /// deadline passes, or the session is closed.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        loop {
            let mut core = self.inner.core.lock();

            // Leftover from a message larger than an earlier caller buffer.
            if core.pos < core.recv_buf.len() {
                let n = (core.recv_buf.len() - core.pos).min(buf.len());
                let pos = core.pos;
                buf[..n].copy_from_slice(&core.recv_buf[pos..pos + n]);
                core.pos += n;
                drop(core);
                stats().bytes_received.fetch_add(n as u64, Relaxed);
                return Ok(n);
            }

            if core.closed {
                return Err(Error::BrokenPipe);
            }
            if let Some(err) = core.read_err.take() {
                return Err(Error::Io(err));
            }

            if let Some(size) = core.arq.peek_size() {
                if buf.len() >= size {
                    match core.arq.recv(buf) {
                        Ok(n) => {
                            drop(core);
                            stats().bytes_received.fetch_add(n as u64, Relaxed);
                            return Ok(n);
                        }
                        Err(_) => continue,
                    }
                }
                // Message larger than the caller's buffer: stage it in the
                // reassembly scratch and hand out a prefix.
                let mut tmp = std::mem::take(&mut core.recv_buf);
                tmp.clear();
                tmp.resize(size, 0);
                match core.arq.recv(&mut tmp) {
                    Ok(got) => {
                        tmp.truncate(got);
                        let n = buf.len().min(got);
                        buf[..n].copy_from_slice(&tmp[..n]);
                        core.recv_buf = tmp;
                        core.pos = n;
                        drop(core);
                        stats().bytes_received.fetch_add(n as u64, Relaxed);
                        return Ok(n);
                    }
                    Err(_) => {
                        core.recv_buf = tmp;
                        continue;
                    }
                }
            }

            match core.rd {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    let _ = self.inner.read_ready.wait_until(&mut core, deadline);
                }
                None => self.inner.read_ready.wait(&mut core),
            }
        }
    }

    /// Write `buf`, blocking while the send window is full.
    pub fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        self.write_vectored(&[buf])
    }

    /// Write several buffers as one call, blocking while the send window
    /// is full.
    pub fn write_vectored(&self, bufs: &[&[u8]]) -> Result<usize, Error> {
        loop {
            let mut core = self.inner.core.lock();
            if core.closed {
                return Err(Error::BrokenPipe);
            }
            if let Some(err) = core.write_err.take() {
                return Err(Error::Io(err));
            }
            if core.arq.is_dead() {
                return Err(Error::Dead);
            }

            if core.arq.wait_snd() < core.arq.snd_wnd() as usize {
                let mss = core.arq.mss();
                let mut n = 0;
                for b in bufs {
                    n += b.len();
                    let mut b = *b;
                    while b.len() > mss {
                        let _ = core.arq.send(&b[..mss]);
                        b = &b[mss..];
                    }
                    if !b.is_empty() {
                        let _ = core.arq.send(b);
                    }
                }

                if core.arq.wait_snd() >= core.arq.snd_wnd() as usize || !core.write_delay {
                    let now = current_ms();
                    let core_ref = &mut *core;
                    let min_len = OVERHEAD + core_ref.header_size;
                    let Core {
                        arq,
                        fec_encoder,
                        staged,
                        ..
                    } = core_ref;
                    arq.flush(false, now, &mut |d: &mut [u8]| {
                        stage_datagram(fec_encoder, staged, min_len, d)
                    });
                }

                let staged = std::mem::take(&mut core.staged);
                let dup = core.dup;
                drop(core);
                self.inner.send_staged(staged, dup);
                stats().bytes_sent.fetch_add(n as u64, Relaxed);
                return Ok(n);
            }

            match core.wd {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    let _ = self.inner.write_ready.wait_until(&mut core, deadline);
                }
                None => self.inner.write_ready.wait(&mut core),
            }
        }
    }

    /// Close the session. The first call succeeds; every later call (and
    /// any read or write after it) fails with [`Error::BrokenPipe`].
    pub fn close(&self) -> Result<(), Error> {
        if let Some(listener) = &self.inner.listener {
            if let Some(listener) = listener.upgrade() {
                listener.close_session(self.inner.remote);
            }
        }

        let mut core = self.inner.core.lock();
        if core.closed {
            return Err(Error::BrokenPipe);
        }
        core.closed = true;
        self.inner.closed.store(true, Relaxed);
        let staged = std::mem::take(&mut core.staged);
        drop(core);

        for buf in staged {
            pool::put(buf);
        }
        self.inner.read_ready.notify_all();
        self.inner.write_ready.notify_all();
        stats::session_closed();
        debug!(remote = %self.inner.remote, "session closed");
        Ok(())
    }

    /// Set both deadlines at once. `None` disables them.
    pub fn set_deadline(&self, t: Option<Instant>) {
        let mut core = self.inner.core.lock();
        core.rd = t;
        core.wd = t;
        drop(core);
        self.inner.read_ready.notify_all();
        self.inner.write_ready.notify_all();
    }

    /// Deadline for blocked reads. `None` disables it.
    pub fn set_read_deadline(&self, t: Option<Instant>) {
        self.inner.core.lock().rd = t;
        self.inner.read_ready.notify_all();
    }

    /// Deadline for blocked writes. `None` disables it.
    pub fn set_write_deadline(&self, t: Option<Instant>) {
        self.inner.core.lock().wd = t;
        self.inner.write_ready.notify_all();
    }

    /// Send and receive window sizes, in segments.
    pub fn set_window_size(&self, snd_wnd: u32, rcv_wnd: u32) {
        self.inner.core.lock().arq.set_window_size(snd_wnd, rcv_wnd);
    }

    /// Change the MTU. Fails for values above the transport limit or below
    /// the framing overhead.
    pub fn set_mtu(&self, mtu: usize) -> bool {
        if mtu > MTU_LIMIT {
            return false;
        }
        self.inner.core.lock().arq.set_mtu(mtu).is_ok()
    }

    /// Toggle byte-stream mode (message boundaries are not preserved).
    pub fn set_stream_mode(&self, enable: bool) {
        self.inner.core.lock().arq.set_stream(enable);
    }

    /// Flush ACKs immediately on every input instead of batching them to
    /// the next update tick.
    pub fn set_ack_no_delay(&self, nodelay: bool) {
        self.inner.core.lock().ack_no_delay = nodelay;
    }

    /// Defer the eager flush in `write` to the next update tick; improves
    /// batching for bulk transfers.
    pub fn set_write_delay(&self, delay: bool) {
        self.inner.core.lock().write_delay = delay;
    }

    /// Latency tuning; see [`ControlBlock::set_nodelay`].
    pub fn set_nodelay(&self, nodelay: bool, interval: u32, resend: u32, nocwnd: bool) {
        self.inner
            .core
            .lock()
            .arq
            .set_nodelay(nodelay, interval, resend, nocwnd);
    }

    /// Transmit every outbound datagram `dup` extra times. Testing aid.
    pub fn set_dup(&self, dup: usize) {
        self.inner.core.lock().dup = dup;
    }

    /// Set the DSCP bits (IPv4 TOS / IPv6 traffic class) on the owned
    /// socket. Server-side sessions share their listener's socket and
    /// refuse with [`Error::InvalidOperation`].
    pub fn set_dscp(&self, dscp: u32) -> Result<(), Error> {
        if self.inner.listener.is_some() {
            return Err(Error::InvalidOperation);
        }
        let sock = SockRef::from(&*self.inner.socket);
        if self.inner.socket.local_addr()?.is_ipv4() {
            sock.set_tos(dscp << 2)?;
        } else {
            sock.set_tclass_v6(dscp)?;
        }
        Ok(())
    }

    /// Size the kernel receive buffer of the owned socket.
    pub fn set_read_buffer(&self, bytes: usize) -> Result<(), Error> {
        if self.inner.listener.is_some() {
            return Err(Error::InvalidOperation);
        }
        SockRef::from(&*self.inner.socket).set_recv_buffer_size(bytes)?;
        Ok(())
    }

    /// Size the kernel send buffer of the owned socket.
    pub fn set_write_buffer(&self, bytes: usize) -> Result<(), Error> {
        if self.inner.listener.is_some() {
            return Err(Error::InvalidOperation);
        }
        SockRef::from(&*self.inner.socket).set_send_buffer_size(bytes)?;
        Ok(())
    }
}

impl SessionInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Relaxed)
    }

    /// Periodic flush, driven by the global updater. Returns the cadence,
    /// in milliseconds, the engine suggests for the next call.
    pub(crate) fn update(&self) -> u32 {
        let mut core = self.core.lock();
        if core.closed {
            return 0;
        }
        let waitsnd = core.arq.wait_snd();
        let now = current_ms();
        let core_ref = &mut *core;
        let min_len = OVERHEAD + core_ref.header_size;
        let Core {
            arq,
            fec_encoder,
            staged,
            ..
        } = core_ref;
        let interval = arq.flush(false, now, &mut |d: &mut [u8]| {
            stage_datagram(fec_encoder, staged, min_len, d)
        });
        if core.arq.wait_snd() < waitsnd {
            self.write_ready.notify_all();
        }
        let staged = std::mem::take(&mut core.staged);
        let dup = core.dup;
        drop(core);
        self.send_staged(staged, dup);
        interval
    }

    /// Deliver one raw datagram from the socket into the protocol.
    pub(crate) fn packet_input(&self, data: &[u8]) {
        let mut arq_errors = 0u64;
        let mut fec_errors = 0u64;
        let mut fec_recovered = 0u64;
        let mut fec_parity = 0u64;

        let mut core = self.core.lock();
        if core.closed {
            return;
        }
        let now = current_ms();
        let waitsnd = core.arq.wait_snd();
        let ack_no_delay = core.ack_no_delay;
        let core_ref = &mut *core;
        let min_len = OVERHEAD + core_ref.header_size;

        if core_ref.fec_decoder.is_some() {
            if data.len() > FEC_HEADER_SIZE {
                let flag = shard_flag(data);
                if flag == TYPE_DATA || flag == TYPE_PARITY {
                    if flag == TYPE_PARITY {
                        fec_parity += 1;
                    }
                    let recovers = match core_ref.fec_decoder.as_mut() {
                        Some(dec) => dec.decode(data),
                        None => Vec::new(),
                    };
                    let Core {
                        arq,
                        fec_encoder,
                        staged,
                        ..
                    } = core_ref;
                    let mut sink = |d: &mut [u8]| stage_datagram(fec_encoder, staged, min_len, d);
                    if flag == TYPE_DATA
                        && arq
                            .input(
                                &data[FEC_HEADER_SIZE_PLUS_2..],
                                true,
                                ack_no_delay,
                                now,
                                &mut sink,
                            )
                            .is_err()
                    {
                        arq_errors += 1;
                    }
                    for frame in recovers {
                        if frame.len() >= 2 {
                            let sz = u16::from_le_bytes([frame[0], frame[1]]) as usize;
                            if sz >= 2 && sz <= frame.len() {
                                if arq
                                    .input(&frame[2..sz], false, ack_no_delay, now, &mut sink)
                                    .is_ok()
                                {
                                    fec_recovered += 1;
                                } else {
                                    arq_errors += 1;
                                }
                            } else {
                                fec_errors += 1;
                            }
                        } else {
                            fec_errors += 1;
                        }
                        pool::put(frame);
                    }
                } else {
                    stats().pre_input_errors.fetch_add(1, Relaxed);
                }
            } else {
                stats().input_errors.fetch_add(1, Relaxed);
            }
        } else {
            let Core {
                arq,
                fec_encoder,
                staged,
                ..
            } = core_ref;
            let mut sink = |d: &mut [u8]| stage_datagram(fec_encoder, staged, min_len, d);
            if arq.input(data, true, ack_no_delay, now, &mut sink).is_err() {
                arq_errors += 1;
            }
        }

        if core_ref.arq.peek_size().is_some() {
            self.read_ready.notify_all();
        }
        if core_ref.arq.wait_snd() < waitsnd {
            self.write_ready.notify_all();
        }
        let staged = std::mem::take(&mut core_ref.staged);
        let dup = core_ref.dup;
        drop(core);
        self.send_staged(staged, dup);

        stats().input_packets.fetch_add(1, Relaxed);
        stats().input_bytes.fetch_add(data.len() as u64, Relaxed);
        if fec_parity > 0 {
            stats().fec_parity_shards.fetch_add(fec_parity, Relaxed);
        }
        if arq_errors > 0 {
            stats().input_errors.fetch_add(arq_errors, Relaxed);
        }
        if fec_errors > 0 {
            stats().fec_failures.fetch_add(fec_errors, Relaxed);
        }
        if fec_recovered > 0 {
            trace!(remote = %self.remote, recovered = fec_recovered, "fec recovery");
            stats().fec_recovered.fetch_add(fec_recovered, Relaxed);
        }
    }

    /// Write staged datagrams to the socket, each `dup + 1` times, in
    /// flush order.
    fn send_staged(&self, staged: Vec<Vec<u8>>, dup: usize) {
        if staged.is_empty() {
            return;
        }
        let mut npkts = 0u64;
        let mut nbytes = 0u64;
        for dgram in staged {
            for _ in 0..=dup {
                match self.socket.send_to(&dgram, self.remote) {
                    Ok(n) => {
                        npkts += 1;
                        nbytes += n as u64;
                    }
                    Err(err) => self.notify_write_error(err),
                }
            }
            pool::put(dgram);
        }
        if npkts > 0 {
            stats().output_packets.fetch_add(npkts, Relaxed);
            stats().output_bytes.fetch_add(nbytes, Relaxed);
        }
    }

    fn notify_write_error(&self, err: io::Error) {
        let mut core = self.core.lock();
        if core.write_err.is_none() {
            core.write_err = Some(err);
        }
        drop(core);
        self.write_ready.notify_all();
    }

    fn notify_read_error(&self, err: io::Error) {
        let mut core = self.core.lock();
        if core.read_err.is_none() {
            core.read_err = Some(err);
        }
        drop(core);
        self.read_ready.notify_all();
    }
}

/// Ingress loop for client sessions: datagrams must come from the dialed
/// peer and be long enough to carry at least one segment.
fn read_loop(inner: Arc<SessionInner>) {
    let mut buf = vec![0u8; MTU_LIMIT];
    let min_len = OVERHEAD + inner.core.lock().header_size;
    loop {
        if inner.is_closed() {
            return;
        }
        match inner.socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                if from != inner.remote {
                    stats().input_errors.fetch_add(1, Relaxed);
                    continue;
                }
                if n >= min_len {
                    inner.packet_input(&buf[..n]);
                } else {
                    stats().input_errors.fetch_add(1, Relaxed);
                }
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => {
                stats().pre_input_errors.fetch_add(1, Relaxed);
                inner.notify_read_error(err);
                return;
            }
        }
    }
}
