#![forbid(unsafe_code)]

// Blocking protocol stack: std TCP (optionally rustls) with one reader
// thread per connection. Simpler than the bridged stack and useful for
// small runs; the reader polls with a short read timeout so it can notice
// the stop flag and keep-alive deadline between packets.

use crate::mqtt::codec::{self, Packet};
use crate::mqtt::{process_packet, ConnectArgs, SUBSCRIBE_PACKET_ID};
use crate::session::{DenyReason, ErrorClass, Inbox};
use bytes::BytesMut;
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, StreamOwned};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How often the reader thread wakes to check the stop flag and the
/// keep-alive deadline.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

enum Wire {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Wire {
    fn socket(&self) -> &TcpStream {
        match self {
            Wire::Plain(sock) => sock,
            Wire::Tls(stream) => stream.get_ref(),
        }
    }
}

impl Read for Wire {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Wire::Plain(sock) => sock.read(buf),
            Wire::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Wire {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Wire::Plain(sock) => sock.write(buf),
            Wire::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Wire::Plain(sock) => sock.flush(),
            Wire::Tls(stream) => stream.flush(),
        }
    }
}

/// Handle to a live blocking connection.
pub struct BlockingLink {
    stop: Arc<AtomicBool>,
}

impl BlockingLink {
    pub(crate) fn close(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

fn would_block(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Open a connection, authenticate, and subscribe, entirely on the calling
/// thread; then hand the socket to a dedicated reader thread.
pub(crate) fn establish(args: ConnectArgs, inbox: Arc<Inbox>) -> Result<BlockingLink, ErrorClass> {
    let started = Instant::now();
    let deadline = started + args.connect_timeout;

    let addr = (args.host.as_str(), args.port)
        .to_socket_addrs()
        .map_err(ErrorClass::transport)?
        .next()
        .ok_or_else(|| ErrorClass::Transport(format!("{} resolved to no address", args.host)))?;
    let tcp = TcpStream::connect_timeout(&addr, args.connect_timeout)
        .map_err(|err| {
            if would_block(err.kind()) {
                ErrorClass::Timeout
            } else {
                ErrorClass::transport(err)
            }
        })?;
    let _ = tcp.set_nodelay(true);
    // The TLS handshake reads under this bound too; a read timing out here
    // means the connect deadline has passed.
    tcp.set_read_timeout(Some(args.connect_timeout))
        .map_err(ErrorClass::transport)?;
    tcp.set_write_timeout(Some(args.connect_timeout))
        .map_err(ErrorClass::transport)?;

    let mut wire = match &args.tls {
        Some(config) => {
            let server_name = ServerName::try_from(args.host.clone())
                .map_err(ErrorClass::transport)?;
            let conn = ClientConnection::new(config.clone(), server_name)
                .map_err(ErrorClass::transport)?;
            Wire::Tls(Box::new(StreamOwned::new(conn, tcp)))
        }
        None => Wire::Plain(tcp),
    };

    let mut out = BytesMut::with_capacity(64);
    codec::encode_connect(
        &mut out,
        &args.client_id,
        Some(&args.client_id),
        args.keepalive.as_secs() as u16,
    );
    write_bytes(&mut wire, &out)?;

    let mut buf = BytesMut::with_capacity(4096);
    match read_packet_until(&mut wire, &mut buf, deadline)? {
        Packet::Connack { code: 0, .. } => {}
        Packet::Connack { code, .. } => {
            return Err(ErrorClass::ProtocolDenied(DenyReason::from_code(code)));
        }
        other => {
            return Err(ErrorClass::Transport(format!(
                "expected CONNACK, got {other:?}"
            )));
        }
    }
    inbox.on_connected(started.elapsed());

    out.clear();
    codec::encode_subscribe(&mut out, SUBSCRIBE_PACKET_ID, &args.topic, 1);
    write_bytes(&mut wire, &out)?;
    let sub_sent = Instant::now();

    wire.socket()
        .set_read_timeout(Some(POLL_INTERVAL))
        .map_err(ErrorClass::transport)?;

    let stop = Arc::new(AtomicBool::new(false));
    let reader_stop = stop.clone();
    let keepalive = args.keepalive;
    let spawned = std::thread::Builder::new()
        .name(format!("mqtt-conn-{}", args.client_id))
        .spawn(move || reader_loop(wire, buf, inbox, reader_stop, keepalive, sub_sent));
    if let Err(err) = spawned {
        return Err(ErrorClass::Transport(format!(
            "failed to spawn reader thread: {err}"
        )));
    }

    Ok(BlockingLink { stop })
}

fn write_bytes(wire: &mut Wire, bytes: &[u8]) -> Result<(), ErrorClass> {
    wire.write_all(bytes).map_err(|err| {
        if would_block(err.kind()) {
            ErrorClass::Timeout
        } else {
            ErrorClass::transport(err)
        }
    })
}

/// Read whole packets until one arrives or the deadline passes.
fn read_packet_until(
    wire: &mut Wire,
    buf: &mut BytesMut,
    deadline: Instant,
) -> Result<Packet, ErrorClass> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(packet) = codec::decode(buf).map_err(ErrorClass::transport)? {
            return Ok(packet);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ErrorClass::Timeout);
        }
        wire.socket()
            .set_read_timeout(Some(deadline - now))
            .map_err(ErrorClass::transport)?;

        match wire.read(&mut chunk) {
            Ok(0) => {
                return Err(ErrorClass::Transport(
                    "connection closed by broker".to_string(),
                ))
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(err) if would_block(err.kind()) => return Err(ErrorClass::Timeout),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(ErrorClass::transport(err)),
        }
    }
}

fn reader_loop(
    mut wire: Wire,
    mut buf: BytesMut,
    inbox: Arc<Inbox>,
    stop: Arc<AtomicBool>,
    keepalive: Duration,
    sub_sent: Instant,
) {
    let mut sub_pending = Some(sub_sent);
    let mut last_ping = Instant::now();
    let mut chunk = [0u8; 4096];
    let mut out = BytesMut::with_capacity(16);

    loop {
        if stop.load(Ordering::Acquire) {
            out.clear();
            codec::encode_disconnect(&mut out);
            let _ = wire.write_all(&out);
            debug!(client_id = %inbox.client_id(), "session closed");
            inbox.on_disconnected(None);
            return;
        }

        loop {
            match codec::decode(&mut buf) {
                Ok(Some(packet)) => {
                    if let Some(reply) = process_packet(&inbox, &mut sub_pending, packet) {
                        if let Err(err) = wire.write_all(&reply) {
                            inbox.on_disconnected(Some(&err.to_string()));
                            return;
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(client_id = %inbox.client_id(), %err, "protocol error");
                    inbox.on_disconnected(Some("protocol error"));
                    return;
                }
            }
        }

        if !keepalive.is_zero() && last_ping.elapsed() >= keepalive {
            out.clear();
            codec::encode_pingreq(&mut out);
            if let Err(err) = wire.write_all(&out) {
                inbox.on_disconnected(Some(&err.to_string()));
                return;
            }
            last_ping = Instant::now();
        }

        match wire.read(&mut chunk) {
            Ok(0) => {
                inbox.on_disconnected(Some("connection closed by broker"));
                return;
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(err) if would_block(err.kind()) => continue,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                inbox.on_disconnected(Some(&err.to_string()));
                return;
            }
        }
    }
}
