#![forbid(unsafe_code)]

// Protocol plumbing: the wire codec, TLS setup, and the two connection
// stacks (bridged-async and blocking) that drive it.

pub mod async_client;
pub mod blocking;
pub mod codec;
pub mod tls;

#[cfg(test)]
pub(crate) mod testutil;

use crate::session::Inbox;
use bytes::BytesMut;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Packet id used for the single per-session subscription.
pub(crate) const SUBSCRIBE_PACKET_ID: u16 = 1;

/// Everything a stack needs to establish one session's connection.
#[derive(Clone)]
pub struct ConnectArgs {
    pub host: String,
    pub port: u16,
    pub tls: Option<Arc<rustls::ClientConfig>>,
    pub client_id: String,
    pub topic: String,
    pub keepalive: Duration,
    pub connect_timeout: Duration,
}

/// Dispatch one inbound packet for a live session; returns bytes to write
/// back (a PUBACK), if any. Shared by both stacks' receive loops.
pub(crate) fn process_packet(
    inbox: &Inbox,
    sub_pending: &mut Option<Instant>,
    packet: codec::Packet,
) -> Option<BytesMut> {
    match packet {
        codec::Packet::Suback { codes, .. } => {
            if let Some(sent) = sub_pending.take() {
                let granted = codes
                    .first()
                    .is_some_and(|code| *code != codec::SUBACK_FAILURE);
                inbox.on_subscribed(sent.elapsed(), granted);
            }
            None
        }
        codec::Packet::Publish {
            packet_id,
            qos,
            payload,
            ..
        } => {
            inbox.on_message(&payload);
            match (qos, packet_id) {
                (1.., Some(id)) => {
                    let mut reply = BytesMut::with_capacity(4);
                    codec::encode_puback(&mut reply, id);
                    Some(reply)
                }
                _ => None,
            }
        }
        codec::Packet::Pingresp => {
            trace!(client_id = %inbox.client_id(), "keep-alive pong");
            None
        }
        codec::Packet::Connack { .. } => {
            debug!(client_id = %inbox.client_id(), "ignoring duplicate CONNACK");
            None
        }
    }
}
