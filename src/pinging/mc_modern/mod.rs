use std::{net::SocketAddr, time::Duration};

use byteorder::{BigEndian, WriteBytesExt};
use log::{debug, trace};
use serde::Serialize;

use self::{
    helpers::{CodecError, McModernValue, VarInt},
    ping_json::PingResponse,
};

use super::{
    error::{PingError, ProtocolViolation},
    serialize_secs,
    transport::{with_transport, Deadline, TcpTransport, TimedReader, Transport},
    Pinger,
};

pub mod helpers;
pub mod ping_json;

/// Protocol version sent in the handshake. Status requests are answered
/// whatever this says.
pub const HANDSHAKE_PROTOCOL_VERSION: i32 = 0x04;

/// The handshake is framed with a one-byte length, so its body has to stay
/// below the first VarInt continuation threshold.
pub const MAX_HANDSHAKE_BODY: usize = 0x7F;

/// Responses shorter than this cannot hold a status document.
const MIN_RESPONSE_LENGTH: i32 = 10;

const STATUS_REQUEST: [u8; 2] = [0x01, 0x00];

/// Upper bound on a single payload read.
const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Serialize)]
pub struct ModernPingData {
    #[serde(flatten)]
    pub response: PingResponse,
    #[serde(rename = "latency_seconds", serialize_with = "serialize_secs")]
    pub latency: Duration,
}

impl ModernPingData {
    pub fn latency_seconds(&self) -> f64 {
        self.latency.as_secs_f64()
    }
}

pub struct ModernPinger {
    /// Sent in the handshake; usually the name the user typed.
    pub hostname: String,
    /// Bounds the whole call, not just one socket operation.
    pub timeout: Duration,
}

enum Stage {
    Connected,
    HandshakeSent,
    StatusRequested,
    ResponseReceived(Vec<u8>),
    Parsed(PingResponse),
}

impl Pinger for ModernPinger {
    type Data = ModernPingData;

    type Error = PingError;

    fn ping(&self, addr: SocketAddr) -> std::result::Result<Self::Data, Self::Error> {
        self.ping_within(addr, Deadline::start(self.timeout))
    }
}

impl ModernPinger {
    /// Like [`Pinger::ping`], but against a budget that may already be running.
    pub(crate) fn ping_within(
        &self,
        addr: SocketAddr,
        deadline: Deadline,
    ) -> Result<ModernPingData, PingError> {
        let handshake = self.handshake_packet(addr.port())?;

        let connect_timeout = deadline.remaining("connect")?;
        let transport = TcpTransport::connect(addr, connect_timeout)
            .map_err(|source| PingError::connect(addr, source))?;

        self.exchange(transport, &handshake, deadline)
    }

    /// Handshake packet including its one-byte length prefix.
    pub fn handshake_packet(&self, port: u16) -> Result<Vec<u8>, PingError> {
        let mut body = vec![];
        let encode = |e: CodecError| e.into_ping_error("handshake");

        VarInt(0x00).write_to(&mut body).map_err(encode)?;
        VarInt(HANDSHAKE_PROTOCOL_VERSION)
            .write_to(&mut body)
            .map_err(encode)?;
        self.hostname.write_to(&mut body).map_err(encode)?;
        body.write_u16::<BigEndian>(port).map_err(|e| PingError::from_io("handshake", e))?;
        VarInt(1).write_to(&mut body).map_err(encode)?;

        if body.len() > MAX_HANDSHAKE_BODY {
            return Err(PingError::InvalidArgument(format!(
                "hostname {:?} is too long for a single-byte handshake frame",
                self.hostname
            )));
        }

        let mut packet = Vec::with_capacity(body.len() + 1);
        packet.push(body.len() as u8);
        packet.extend_from_slice(&body);
        Ok(packet)
    }

    /// Drives the status exchange over an already connected transport and
    /// closes it afterwards.
    pub(crate) fn exchange<T: Transport>(
        &self,
        transport: T,
        handshake: &[u8],
        deadline: Deadline,
    ) -> Result<ModernPingData, PingError> {
        let response = with_transport(transport, |transport| {
            transport
                .set_timeout(deadline.remaining("connect")?)
                .map_err(|e| PingError::from_io("connect", e))?;

            let mut stage = Stage::Connected;
            loop {
                stage = match stage {
                    Stage::Connected => {
                        transport
                            .write(handshake)
                            .map_err(|e| PingError::from_io("handshake", e))?;
                        Stage::HandshakeSent
                    }
                    Stage::HandshakeSent => {
                        transport
                            .write(&STATUS_REQUEST)
                            .map_err(|e| PingError::from_io("status request", e))?;
                        Stage::StatusRequested
                    }
                    Stage::StatusRequested => {
                        Stage::ResponseReceived(read_status_payload(transport, deadline)?)
                    }
                    Stage::ResponseReceived(payload) => {
                        Stage::Parsed(PingResponse::from_json(&payload)?)
                    }
                    Stage::Parsed(response) => break Ok(response),
                };
                trace!("status ping advanced after {:?}", deadline.elapsed());
            }
        })?;

        let latency = deadline.elapsed();
        debug!(
            "status ping answered in {:?}: {} of {} players online",
            latency, response.players.online, response.players.max
        );

        Ok(ModernPingData { response, latency })
    }
}

/// Reads the framed status response and returns its JSON payload.
fn read_status_payload<T: Transport>(
    transport: &mut T,
    deadline: Deadline,
) -> Result<Vec<u8>, PingError> {
    let total_length = {
        let mut reader = TimedReader::new(transport, deadline);
        VarInt::read_from(&mut reader).map_err(|e| e.into_ping_error("response length"))?
    };
    if *total_length < MIN_RESPONSE_LENGTH {
        return Err(ProtocolViolation::UndersizedResponse(*total_length).into());
    }

    let payload_length = {
        let mut reader = TimedReader::new(transport, deadline);
        // packet id
        let mut id = [0u8; 1];
        std::io::Read::read_exact(&mut reader, &mut id)
            .map_err(|e| PingError::from_io("packet id", e))?;
        VarInt::read_from(&mut reader).map_err(|e| e.into_ping_error("payload length"))?
    };
    if *payload_length < 0 {
        return Err(ProtocolViolation::NegativeLength(*payload_length).into());
    }
    // the packet id and the payload length VarInt share the declared total
    let room = i64::from(*total_length) - 1 - payload_length.encoded_len() as i64;
    if i64::from(*payload_length) > room {
        return Err(ProtocolViolation::PayloadExceedsFrame {
            total: *total_length,
            payload: *payload_length,
        }
        .into());
    }

    read_payload(transport, *payload_length as usize, deadline)
}

/// Collects exactly `length` bytes, however the peer chunks them. The deadline
/// is checked before every read since the socket timeout only bounds one read.
/// The buffer only grows by what actually arrived.
fn read_payload<T: Transport>(
    transport: &mut T,
    length: usize,
    deadline: Deadline,
) -> Result<Vec<u8>, PingError> {
    let mut payload = Vec::with_capacity(length.min(READ_CHUNK));
    let mut chunk = [0u8; READ_CHUNK];
    while payload.len() < length {
        let left = deadline.remaining("payload")?;
        transport
            .set_timeout(left)
            .map_err(|e| PingError::from_io("payload", e))?;

        let wanted = (length - payload.len()).min(READ_CHUNK);
        match transport.read_some(&mut chunk[..wanted]) {
            Ok(0) => return Err(ProtocolViolation::Truncated("payload").into()),
            Ok(n) => payload.extend_from_slice(&chunk[..n]),
            Err(e) => return Err(PingError::from_io("payload", e)),
        }
    }
    Ok(payload)
}
