//! The reader thread: opens the socket, sends the opening `version`, and
//! runs the blocking read loop until the connection terminates.

use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, SocketAddrV4, SocketAddrV6, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};

use crate::error::PeerError;
use crate::peer::delegate::PeerDelegate;
use crate::peer::{handlers, unix_time, BlockAssembly, PeerStatus, Shared};
use crate::wire::codec;
use crate::wire::constants::{
    CONNECT_TIMEOUT, HEADER_LENGTH, MAX_ASSET_DATA_LENGTH, MESSAGE_TIMEOUT, SOCKET_TIMEOUT,
};
use crate::wire::message::{Command, RawMessage};
use crate::wire::payload;

/// Entry point of the per-peer thread spawned by
/// [`Peer::connect`](crate::peer::Peer::connect).
pub(crate) fn run(shared: Arc<Shared>) {
    let delegate = shared.delegate();
    let error = match connect_and_read(&shared, &delegate) {
        Ok(()) => None,
        Err(err) => Some(err),
    };
    teardown(&shared, &delegate, error);
}

fn connect_and_read(
    shared: &Arc<Shared>,
    delegate: &Arc<dyn PeerDelegate>,
) -> Result<(), PeerError> {
    let stream = open_stream(shared)?;

    {
        let mut conn = shared.conn.lock().unwrap();
        *conn = Some(stream.try_clone().map_err(PeerError::Socket)?);
    }
    if shared.closed.load(Ordering::Acquire) {
        return Ok(()); // a disconnect raced the dial
    }

    let nonce: u64 = rand::random();
    {
        let mut st = shared.state.lock().unwrap();
        st.nonce = nonce;
        st.start_time = Some(Instant::now());
    }
    let version = payload::build_version_payload(
        &shared.remote,
        shared.network.standard_port(),
        nonce,
        unix_time(),
    )
    .map_err(PeerError::Socket)?;
    shared.send_message(Command::Version, &version);

    read_loop(shared, delegate, stream)
}

/// Dials the remote with the connect timeout. IPv6 is preferred; a
/// v4-mapped peer that fails the IPv6 connect is retried over plain IPv4.
fn open_stream(shared: &Shared) -> Result<TcpStream, PeerError> {
    let remote = &shared.remote;
    let v6 = SocketAddrV6::new(remote.address.into(), remote.port, 0, 0);

    let stream = match TcpStream::connect_timeout(&SocketAddr::V6(v6), CONNECT_TIMEOUT) {
        Ok(stream) => stream,
        Err(err) if remote.is_ipv4() => {
            debug!("[{}] IPv6 connect failed ({}), retrying IPv4", shared.log_id(), err);
            let v4 = SocketAddrV4::new(
                std::net::Ipv4Addr::new(
                    remote.address[12],
                    remote.address[13],
                    remote.address[14],
                    remote.address[15],
                ),
                remote.port,
            );
            TcpStream::connect_timeout(&SocketAddr::V4(v4), CONNECT_TIMEOUT)
                .map_err(PeerError::from_socket)?
        }
        Err(err) => return Err(PeerError::from_socket(err)),
    };

    // short socket timeouts keep the reader responsive to deadlines
    stream
        .set_read_timeout(Some(SOCKET_TIMEOUT))
        .map_err(PeerError::Socket)?;
    stream
        .set_write_timeout(Some(SOCKET_TIMEOUT))
        .map_err(PeerError::Socket)?;
    if let Err(err) = socket2::SockRef::from(&stream).set_keepalive(true) {
        debug!("[{}] SO_KEEPALIVE failed: {}", shared.log_id(), err);
    }

    info!("[{}] socket connected", shared.log_id());
    Ok(stream)
}

/// `WouldBlock`, `TimedOut` and `Interrupted` are retried inside the loop;
/// everything else is terminal.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

fn read_loop(
    shared: &Arc<Shared>,
    delegate: &Arc<dyn PeerDelegate>,
    mut stream: TcpStream,
) -> Result<(), PeerError> {
    let magic = shared.network.magic().to_le_bytes();
    let mut header = [0u8; HEADER_LENGTH];

    loop {
        // --- header, byte-aligned to the magic
        let mut len = 0;
        while len < HEADER_LENGTH {
            if shared.closed.load(Ordering::Acquire) {
                return Ok(());
            }
            match stream.read(&mut header[len..]) {
                Ok(0) => return Err(PeerError::ConnectionReset),
                Ok(n) => len += n,
                Err(err) if is_transient(&err) => {}
                Err(err) => return Err(PeerError::from_socket(err)),
            }

            if shared.disconnect_at.is_expired() {
                return Err(PeerError::TimedOut);
            }
            if shared.mempool_at.is_expired() {
                flush_mempool_request(shared);
            }

            // consume one byte at a time until we find the magic number
            while len >= 4 && header[..4] != magic {
                header.copy_within(1..len, 0);
                len -= 1;
            }
        }

        codec::validate_header(&header).map_err(PeerError::Protocol)?;

        let cmd: [u8; 12] = header[4..16].try_into().unwrap();
        let command = Command::from(&cmd);
        let msg_len = u32::from_le_bytes(header[16..20].try_into().unwrap()) as usize;
        let expected: [u8; 4] = header[20..24].try_into().unwrap();

        // --- payload, with a rolling per-message deadline
        let mut msg_payload = vec![0u8; msg_len];
        let mut read = 0;
        let mut message_deadline = Instant::now() + MESSAGE_TIMEOUT;
        while read < msg_len {
            if shared.closed.load(Ordering::Acquire) {
                return Ok(());
            }
            match stream.read(&mut msg_payload[read..]) {
                Ok(0) => return Err(PeerError::ConnectionReset),
                Ok(n) => {
                    read += n;
                    message_deadline = Instant::now() + MESSAGE_TIMEOUT;
                }
                Err(err) if is_transient(&err) => {}
                Err(err) => return Err(PeerError::from_socket(err)),
            }
            if Instant::now() >= message_deadline {
                return Err(PeerError::TimedOut);
            }
        }

        if codec::checksum(&msg_payload) != expected {
            warn!(
                "[{}] error reading {:?}, invalid checksum, payload length {}",
                shared.log_id(),
                command,
                msg_len
            );
            return Err(PeerError::Protocol("invalid payload checksum"));
        }

        dispatch(shared, delegate, command, msg_payload, expected)?;
    }
}

fn dispatch(
    shared: &Arc<Shared>,
    delegate: &Arc<dyn PeerDelegate>,
    command: Command,
    msg_payload: Vec<u8>,
    checksum: [u8; 4],
) -> Result<(), PeerError> {
    // oversize assetdata is dropped, not fatal
    if command == Command::AssetData && msg_payload.len() > MAX_ASSET_DATA_LENGTH {
        warn!(
            "[{}] dropping assetdata message, {} bytes is too large",
            shared.log_id(),
            msg_payload.len()
        );
        return Ok(());
    }

    let raw = RawMessage {
        command,
        payload: msg_payload,
        magic: shared.network.magic().to_le_bytes(),
        checksum,
    };

    let message = raw
        .into_message(shared.network)
        .map_err(PeerError::Malformed)?;
    handlers::handle_message(shared, delegate, message)
}

/// The mempool deadline expired without a tx inv: chain the armed
/// callback through a ping so it completes once the pipe is flushed.
fn flush_mempool_request(shared: &Shared) {
    let callback = {
        let mut st = shared.state.lock().unwrap();
        st.mempool_callback.take()
    };
    shared.mempool_at.disable();

    if let Some(callback) = callback {
        debug!("[{}] done waiting for mempool response", shared.log_id());
        shared.send_ping(Some(callback));
    }
}

/// Terminal cleanup: close the socket, fail every outstanding callback,
/// clear the session flags and report the disconnect.
fn teardown(shared: &Shared, delegate: &Arc<dyn PeerDelegate>, error: Option<PeerError>) {
    {
        let mut conn = shared.conn.lock().unwrap();
        if let Some(stream) = conn.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
    shared.disconnect_at.disable();
    shared.mempool_at.disable();

    let (pongs, mempool) = {
        let mut st = shared.state.lock().unwrap();
        st.status = PeerStatus::Disconnected;
        st.waiting_for_network = false;
        st.sent_verack = false;
        st.got_verack = false;
        st.sent_getaddr = false;
        st.sent_filter = false;
        st.sent_getdata = false;
        st.sent_mempool = false;
        st.sent_getblocks = false;
        st.start_time = None;
        st.assembly = BlockAssembly::Idle;
        let pongs: Vec<_> = st.pong_callbacks.drain(..).collect();
        (pongs, st.mempool_callback.take())
    };

    match &error {
        Some(err) => warn!("[{}] disconnected: {}", shared.log_id(), err),
        None => info!("[{}] disconnected", shared.log_id()),
    }

    for callback in pongs.into_iter().flatten() {
        callback(false);
    }
    if let Some(callback) = mempool {
        callback(false);
    }

    delegate.disconnected(error);
    delegate.thread_cleanup();
}
