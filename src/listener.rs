//! Shared-socket listener: accepts peers and fans ingress out to sessions.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::fec::{shard_flag, FecDecoder, FEC_HEADER_SIZE_PLUS_2, TYPE_DATA};
use crate::protocol::{MTU_LIMIT, OVERHEAD};
use crate::session::{Session, POLL_INTERVAL, RX_FEC_MULTI};
use crate::stats::stats;
use crate::Error;

/// Peers awaiting `accept` beyond this count are dropped on the floor.
pub const ACCEPT_BACKLOG: usize = 256;

/// Accepts ARQ conversations on one UDP socket.
pub struct Listener {
    shared: Arc<ListenerShared>,
}

pub(crate) struct ListenerShared {
    socket: Arc<UdpSocket>,
    state: Mutex<ListenerState>,
    accept_ready: Condvar,
    data_shards: usize,
    parity_shards: usize,
    header_size: usize,
    closed: AtomicBool,
}

struct ListenerState {
    sessions: HashMap<SocketAddr, Session>,
    backlog: VecDeque<Session>,
    rd: Option<Instant>,
    closed: bool,
}

impl Listener {
    /// Serve the protocol on an already-bound socket, with `data_shards` +
    /// `parity_shards` FEC (zero/zero disables it).
    pub fn serve(
        socket: UdpSocket,
        data_shards: usize,
        parity_shards: usize,
    ) -> Result<Self, Error> {
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let fec = data_shards > 0 && parity_shards > 0;
        if fec {
            // Validate the geometry now, the way each admitted session will.
            FecDecoder::new(
                RX_FEC_MULTI * (data_shards + parity_shards),
                data_shards,
                parity_shards,
            )?;
        }
        let shared = Arc::new(ListenerShared {
            socket: Arc::new(socket),
            state: Mutex::new(ListenerState {
                sessions: HashMap::new(),
                backlog: VecDeque::new(),
                rd: None,
                closed: false,
            }),
            accept_ready: Condvar::new(),
            data_shards,
            parity_shards,
            header_size: if fec { FEC_HEADER_SIZE_PLUS_2 } else { 0 },
            closed: AtomicBool::new(false),
        });

        let handle = shared.clone();
        std::thread::Builder::new()
            .name("arq256-listener".into())
            .spawn(move || monitor(handle))?;
        Ok(Self { shared })
    }

    /// Wait for the next admitted peer, honouring the listener deadline.
    pub fn accept(&self) -> Result<Session, Error> {
        loop {
            let mut state = self.shared.state.lock();
            if let Some(sess) = state.backlog.pop_front() {
                return Ok(sess);
            }
            if state.closed {
                return Err(Error::BrokenPipe);
            }
            match state.rd {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    let _ = self.shared.accept_ready.wait_until(&mut state, deadline);
                }
                None => self.shared.accept_ready.wait(&mut state),
            }
        }
    }

    /// Stop listening. Pending and future `accept` calls fail with
    /// [`Error::BrokenPipe`]; sessions already accepted are not closed.
    pub fn close(&self) -> Result<(), Error> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(Error::BrokenPipe);
        }
        state.closed = true;
        state.backlog.clear();
        drop(state);
        self.shared.closed.store(true, Relaxed);
        self.shared.accept_ready.notify_all();
        debug!("listener closed");
        Ok(())
    }

    /// Forget the session bound to `addr`; returns whether one existed.
    pub fn close_session(&self, addr: SocketAddr) -> bool {
        self.shared.close_session(addr)
    }

    /// Deadline for blocked `accept` calls. `None` disables it.
    pub fn set_deadline(&self, t: Option<Instant>) {
        self.shared.state.lock().rd = t;
        self.shared.accept_ready.notify_all();
    }

    /// Local socket address.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.shared.socket.local_addr()?)
    }

    /// Set the DSCP bits (IPv4 TOS / IPv6 traffic class) on the socket.
    pub fn set_dscp(&self, dscp: u32) -> Result<(), Error> {
        let sock = socket2::SockRef::from(&*self.shared.socket);
        if self.shared.socket.local_addr()?.is_ipv4() {
            sock.set_tos(dscp << 2)?;
        } else {
            sock.set_tclass_v6(dscp)?;
        }
        Ok(())
    }

    /// Size the kernel receive buffer of the socket.
    pub fn set_read_buffer(&self, bytes: usize) -> Result<(), Error> {
        socket2::SockRef::from(&*self.shared.socket).set_recv_buffer_size(bytes)?;
        Ok(())
    }

    /// Size the kernel send buffer of the socket.
    pub fn set_write_buffer(&self, bytes: usize) -> Result<(), Error> {
        socket2::SockRef::from(&*self.shared.socket).set_send_buffer_size(bytes)?;
        Ok(())
    }
}

impl ListenerShared {
    pub(crate) fn close_session(&self, addr: SocketAddr) -> bool {
        self.state.lock().sessions.remove(&addr).is_some()
    }

    /// Route one datagram: to its session if the peer is known, otherwise
    /// through admission.
    fn packet_input(self: &Arc<Self>, data: &[u8], from: SocketAddr) {
        let known = self.state.lock().sessions.get(&from).cloned();
        if let Some(sess) = known {
            sess.inner.packet_input(data);
            return;
        }

        {
            let state = self.state.lock();
            if state.closed || state.backlog.len() >= ACCEPT_BACKLOG {
                return;
            }
        }

        // A conversation can only be seeded by a plain segment or a DATA
        // shard; a parity shard alone has no decodable conv field.
        let conv = if self.header_size > 0 {
            if data.len() >= FEC_HEADER_SIZE_PLUS_2 + 4 && shard_flag(data) == TYPE_DATA {
                Some(u32::from_le_bytes([data[8], data[9], data[10], data[11]]))
            } else {
                None
            }
        } else if data.len() >= 4 {
            Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
        } else {
            None
        };
        let Some(conv) = conv else { return };

        let sess = match Session::create(
            conv,
            self.data_shards,
            self.parity_shards,
            Some(Arc::downgrade(self)),
            self.socket.clone(),
            from,
        ) {
            Ok(sess) => sess,
            Err(_) => return,
        };
        sess.inner.packet_input(data);

        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.sessions.insert(from, sess.clone());
        state.backlog.push_back(sess);
        drop(state);
        self.accept_ready.notify_one();
        debug!(conv, %from, "peer admitted");
    }
}

/// Ingress loop: too-short datagrams are counted and dropped, everything
/// else is routed by source address.
fn monitor(shared: Arc<ListenerShared>) {
    let mut buf = vec![0u8; MTU_LIMIT];
    let min_len = shared.header_size + OVERHEAD;
    loop {
        if shared.closed.load(Relaxed) {
            return;
        }
        match shared.socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                if n >= min_len {
                    shared.packet_input(&buf[..n], from);
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
            Err(_) => return,
        }
    }
}

fn resolve<A: ToSocketAddrs>(addr: A) -> Result<SocketAddr, Error> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::AddrNotAvailable, "no address")))
}

/// Listen for conversations on `addr` without FEC.
pub fn listen<A: ToSocketAddrs>(addr: A) -> Result<Listener, Error> {
    listen_with_options(addr, 0, 0)
}

/// Listen for conversations on `addr` with the given FEC geometry.
pub fn listen_with_options<A: ToSocketAddrs>(
    addr: A,
    data_shards: usize,
    parity_shards: usize,
) -> Result<Listener, Error> {
    let socket = UdpSocket::bind(resolve(addr)?)?;
    Listener::serve(socket, data_shards, parity_shards)
}

/// Dial `addr` without FEC, with a random conversation id.
pub fn dial<A: ToSocketAddrs>(addr: A) -> Result<Session, Error> {
    dial_with_options(addr, 0, 0)
}

/// Dial `addr` with the given FEC geometry and a random conversation id.
pub fn dial_with_options<A: ToSocketAddrs>(
    addr: A,
    data_shards: usize,
    parity_shards: usize,
) -> Result<Session, Error> {
    let remote = resolve(addr)?;
    let bind: SocketAddr = if remote.is_ipv4() {
        "0.0.0.0:0".parse().map_err(|_| Error::InvalidParams)?
    } else {
        "[::]:0".parse().map_err(|_| Error::InvalidParams)?
    };
    let socket = UdpSocket::bind(bind)?;
    Session::client(socket, remote, rand::random(), data_shards, parity_shards)
}
