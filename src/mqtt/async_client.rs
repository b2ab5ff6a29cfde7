#![forbid(unsafe_code)]

// Bridged protocol stack: connections established and driven on the
// background I/O loop. One read-loop task per connection handles SUBACK,
// inbound deliveries, keep-alive pings, and teardown; no task ever blocks.

use crate::mqtt::codec::{self, Packet};
use crate::mqtt::{process_packet, ConnectArgs, SUBSCRIBE_PACKET_ID};
use crate::session::{DenyReason, ErrorClass, Inbox};
use bytes::BytesMut;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Conn for T {}

type BoxConn = Box<dyn Conn>;

enum Command {
    Disconnect,
}

/// Handle to a live bridged connection. Dropping it (or calling `close`)
/// makes the read loop send DISCONNECT and release the socket.
pub struct AsyncLink {
    commands: mpsc::UnboundedSender<Command>,
}

impl AsyncLink {
    pub(crate) fn close(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }
}

/// Open a connection, authenticate, and subscribe to the session topic.
///
/// Runs on the I/O loop; the synchronous caller reaches it through the
/// bridge. Everything up to the CONNACK is bounded by the connect
/// timeout, so this resolves with `ErrorClass::Timeout` before the
/// bridge's own grace period expires.
pub(crate) async fn establish(args: ConnectArgs, inbox: Arc<Inbox>) -> Result<AsyncLink, ErrorClass> {
    let started = Instant::now();
    let (mut stream, buf) =
        match tokio::time::timeout(args.connect_timeout, authenticate(&args)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(class)) => return Err(class),
            Err(_) => return Err(ErrorClass::Timeout),
        };
    inbox.on_connected(started.elapsed());

    let mut out = BytesMut::with_capacity(64);
    codec::encode_subscribe(&mut out, SUBSCRIBE_PACKET_ID, &args.topic, 1);
    stream
        .write_all(&out)
        .await
        .map_err(ErrorClass::transport)?;
    let sub_sent = Instant::now();

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    tokio::spawn(read_loop(stream, buf, inbox, cmd_rx, args.keepalive, sub_sent));

    Ok(AsyncLink { commands: cmd_tx })
}

/// Connect the socket, complete the TLS handshake if enabled, and wait
/// for the broker's CONNACK.
async fn authenticate(args: &ConnectArgs) -> Result<(BoxConn, BytesMut), ErrorClass> {
    let tcp = TcpStream::connect((args.host.as_str(), args.port))
        .await
        .map_err(ErrorClass::transport)?;
    let _ = tcp.set_nodelay(true);

    let mut stream: BoxConn = match &args.tls {
        Some(config) => {
            let server_name = ServerName::try_from(args.host.clone())
                .map_err(ErrorClass::transport)?;
            let connector = TlsConnector::from(config.clone());
            let tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(ErrorClass::transport)?;
            Box::new(tls)
        }
        None => Box::new(tcp),
    };

    let mut out = BytesMut::with_capacity(64);
    codec::encode_connect(
        &mut out,
        &args.client_id,
        Some(&args.client_id),
        args.keepalive.as_secs() as u16,
    );
    stream
        .write_all(&out)
        .await
        .map_err(ErrorClass::transport)?;

    let mut buf = BytesMut::with_capacity(4096);
    match read_packet(&mut stream, &mut buf).await? {
        Packet::Connack { code: 0, .. } => Ok((stream, buf)),
        Packet::Connack { code, .. } => {
            Err(ErrorClass::ProtocolDenied(DenyReason::from_code(code)))
        }
        other => Err(ErrorClass::Transport(format!(
            "expected CONNACK, got {other:?}"
        ))),
    }
}

async fn read_packet(stream: &mut BoxConn, buf: &mut BytesMut) -> Result<Packet, ErrorClass> {
    loop {
        if let Some(packet) = codec::decode(buf).map_err(ErrorClass::transport)? {
            return Ok(packet);
        }
        let n = stream.read_buf(buf).await.map_err(ErrorClass::transport)?;
        if n == 0 {
            return Err(ErrorClass::Transport(
                "connection closed by broker".to_string(),
            ));
        }
    }
}

enum Step {
    Read(std::io::Result<usize>),
    Ping,
    Teardown,
}

async fn read_loop(
    mut stream: BoxConn,
    mut buf: BytesMut,
    inbox: Arc<Inbox>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    keepalive: Duration,
    sub_sent: Instant,
) {
    let mut sub_pending = Some(sub_sent);
    // A zero keepalive disables pings; the interval still needs a real period.
    let ping_period = if keepalive.is_zero() {
        Duration::from_secs(1)
    } else {
        keepalive
    };
    let mut ping =
        tokio::time::interval_at(tokio::time::Instant::now() + ping_period, ping_period);
    let mut out = BytesMut::with_capacity(16);

    loop {
        // Drain complete frames before waiting for more I/O.
        let mut teardown: Option<String> = None;
        loop {
            match codec::decode(&mut buf) {
                Ok(Some(packet)) => {
                    if let Some(reply) = process_packet(&inbox, &mut sub_pending, packet) {
                        if let Err(err) = stream.write_all(&reply).await {
                            teardown = Some(err.to_string());
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    teardown = Some(format!("protocol error: {err}"));
                    break;
                }
            }
        }
        if let Some(reason) = teardown {
            inbox.on_disconnected(Some(&reason));
            return;
        }

        let step = tokio::select! {
            result = stream.read_buf(&mut buf) => Step::Read(result),
            _ = ping.tick(), if !keepalive.is_zero() => Step::Ping,
            // A closed channel means the link was dropped: same teardown.
            _ = commands.recv() => Step::Teardown,
        };

        match step {
            Step::Read(Ok(0)) => {
                inbox.on_disconnected(Some("connection closed by broker"));
                return;
            }
            Step::Read(Ok(_)) => {}
            Step::Read(Err(err)) => {
                inbox.on_disconnected(Some(&err.to_string()));
                return;
            }
            Step::Ping => {
                out.clear();
                codec::encode_pingreq(&mut out);
                if let Err(err) = stream.write_all(&out).await {
                    inbox.on_disconnected(Some(&err.to_string()));
                    return;
                }
                trace!(client_id = %inbox.client_id(), "keep-alive ping");
            }
            Step::Teardown => {
                out.clear();
                codec::encode_disconnect(&mut out);
                let _ = stream.write_all(&out).await;
                let _ = stream.shutdown().await;
                debug!(client_id = %inbox.client_id(), "session closed");
                inbox.on_disconnected(None);
                return;
            }
        }
    }
}
