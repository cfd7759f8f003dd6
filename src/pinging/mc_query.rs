use std::{net::SocketAddr, time::Duration};

use log::{debug, trace};
use serde::Serialize;

use super::{
    cursor::{split_bytes, ByteCursor},
    error::{PingError, ProtocolViolation},
    serialize_secs,
    transport::{with_transport, Deadline, Transport, UdpTransport},
    Pinger,
};

const MAGIC: [u8; 2] = [0xFE, 0xFD];

/// Session id sent with every request. Servers echo it back; it is not checked.
pub const SESSION_ID: [u8; 4] = [0x01, 0x02, 0x03, 0x04];

const HANDSHAKE: u8 = 0x09;
const STAT: u8 = 0x00;

/// Type byte plus session id.
const REPLY_HEADER_LEN: usize = 5;

/// `splitnum\0\x80\0` ahead of the key/value section.
const PREAMBLE_LEN: usize = 11;

const PLAYER_SENTINEL: &[u8] = b"\x00\x00\x01player_\x00\x00";

/// The largest payload a UDP datagram can carry.
const MAX_DATAGRAM: usize = 65_535;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryData {
    pub motd: Option<String>,
    pub game_type: Option<String>,
    pub version: Option<String>,
    /// Server software, taken from the part of `plugins` before `": "`.
    pub software: Option<String>,
    pub plugins: Vec<String>,
    pub raw_plugins: Option<String>,
    pub map: Option<String>,
    pub num_players: i32,
    pub max_players: i32,
    pub host_port: i32,
    pub host_ip: Option<String>,
    pub game_id: Option<String>,
    /// `None` rather than empty when nobody is online.
    pub player_list: Option<Vec<String>>,
    #[serde(rename = "latency_seconds", serialize_with = "serialize_secs")]
    pub latency: Duration,
}

impl QueryData {
    pub fn latency_seconds(&self) -> f64 {
        self.latency.as_secs_f64()
    }
}

pub struct QueryPinger {
    /// Bounds the whole call, not just one socket operation.
    pub timeout: Duration,
}

enum Stage {
    Connected,
    HandshakeSent,
    Challenged(i32),
    StatRequested,
    Parsed(QueryData),
}

impl Pinger for QueryPinger {
    type Data = QueryData;

    type Error = PingError;

    fn ping(&self, addr: SocketAddr) -> std::result::Result<Self::Data, Self::Error> {
        self.ping_within(addr, Deadline::start(self.timeout))
    }
}

impl QueryPinger {
    /// Like [`Pinger::ping`], but against a budget that may already be running.
    pub(crate) fn ping_within(
        &self,
        addr: SocketAddr,
        deadline: Deadline,
    ) -> Result<QueryData, PingError> {
        let connect_timeout = deadline.remaining("connect")?;
        let transport = UdpTransport::connect(addr, connect_timeout)
            .map_err(|source| PingError::connect(addr, source))?;

        // a closed UDP port only shows up as a refused receive
        self.exchange(transport, deadline).map_err(|e| match e {
            PingError::Io(source) if source.kind() == std::io::ErrorKind::ConnectionRefused => {
                PingError::connect(addr, source)
            }
            other => other,
        })
    }

    /// Runs handshake and full-stat request over a connected transport and
    /// closes it afterwards.
    pub(crate) fn exchange<T: Transport>(
        &self,
        transport: T,
        deadline: Deadline,
    ) -> Result<QueryData, PingError> {
        let mut data = with_transport(transport, |transport| {
            let mut stage = Stage::Connected;
            loop {
                stage = match stage {
                    Stage::Connected => {
                        send(transport, &query_packet(HANDSHAKE, &[]), deadline)?;
                        Stage::HandshakeSent
                    }
                    Stage::HandshakeSent => {
                        let reply = read_reply(transport, HANDSHAKE, deadline)?;
                        Stage::Challenged(parse_challenge(&reply)?)
                    }
                    Stage::Challenged(token) => {
                        trace!("query challenge token {}", token);
                        let mut payload = token.to_be_bytes().to_vec();
                        payload.extend_from_slice(&[0x00; 4]);
                        send(transport, &query_packet(STAT, &payload), deadline)?;
                        Stage::StatRequested
                    }
                    Stage::StatRequested => {
                        let reply = read_reply(transport, STAT, deadline)?;
                        Stage::Parsed(parse_stat(&reply)?)
                    }
                    Stage::Parsed(data) => break Ok(data),
                };
            }
        })?;

        data.latency = deadline.elapsed();
        debug!(
            "full-stat query answered in {:?}: {} of {} players online",
            data.latency, data.num_players, data.max_players
        );
        Ok(data)
    }
}

/// `FE FD <kind> <session id> <payload>`
pub fn query_packet(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(MAGIC.len() + 1 + SESSION_ID.len() + payload.len());
    packet.extend_from_slice(&MAGIC);
    packet.push(kind);
    packet.extend_from_slice(&SESSION_ID);
    packet.extend_from_slice(payload);
    packet
}

fn send<T: Transport>(transport: &mut T, packet: &[u8], deadline: Deadline) -> Result<(), PingError> {
    transport
        .set_timeout(deadline.remaining("query request")?)
        .map_err(|e| PingError::from_io("query request", e))?;
    transport
        .write(packet)
        .map_err(|e| PingError::from_io("query request", e))
}

/// Receives one datagram, checks its type byte and strips the header.
fn read_reply<T: Transport>(
    transport: &mut T,
    kind: u8,
    deadline: Deadline,
) -> Result<Vec<u8>, PingError> {
    transport
        .set_timeout(deadline.remaining("query reply")?)
        .map_err(|e| PingError::from_io("query reply", e))?;

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let read = transport
        .read_some(&mut buf)
        .map_err(|e| PingError::from_io("query reply", e))?;

    let mut cursor = ByteCursor::new(&buf[..read]);
    let actual = cursor.read_u8().ok_or(ProtocolViolation::ShortReply(read))?;
    if actual != kind {
        return Err(ProtocolViolation::WrongType {
            expected: kind,
            actual,
        }
        .into());
    }
    let _session_id = cursor
        .read_u32_be()
        .ok_or(ProtocolViolation::ShortReply(read))?;
    debug_assert_eq!(cursor.position(), REPLY_HEADER_LEN);

    Ok(cursor.remaining().to_vec())
}

/// The handshake reply carries the token as NUL-terminated ASCII digits.
pub fn parse_challenge(payload: &[u8]) -> Result<i32, PingError> {
    let digits = split_bytes(payload, b"\0")[0];
    let text = String::from_utf8_lossy(digits);
    let text = text.trim();

    // tokens are signed 32-bit, but some servers print them unsigned
    text.parse::<i32>()
        .or_else(|_| text.parse::<u32>().map(|token| token as i32))
        .map_err(|_| ProtocolViolation::BadChallenge(text.to_string()).into())
}

#[derive(Default)]
struct RawFields {
    motd: Option<String>,
    game_type: Option<String>,
    version: Option<String>,
    plugins: Option<String>,
    map: Option<String>,
    num_players: Option<String>,
    max_players: Option<String>,
    host_port: Option<String>,
    host_ip: Option<String>,
    game_id: Option<String>,
}

/// Parses a full-stat payload with the reply header already removed.
pub fn parse_stat(payload: &[u8]) -> Result<QueryData, PingError> {
    let mut cursor = ByteCursor::new(payload);
    cursor
        .skip(PREAMBLE_LEN)
        .ok_or(ProtocolViolation::ShortReply(payload.len()))?;

    let sections = cursor.split_on(PLAYER_SENTINEL);
    if sections.len() != 2 {
        return Err(ProtocolViolation::Sentinel(sections.len() - 1).into());
    }
    let pairs = sections[0];
    let players = &sections[1][..sections[1].len().saturating_sub(2)];

    let mut raw = RawFields::default();
    let tokens = split_bytes(pairs, b"\0");
    for pair in tokens.chunks(2) {
        let slot = match pair[0] {
            b"hostname" => &mut raw.motd,
            b"gametype" => &mut raw.game_type,
            b"version" => &mut raw.version,
            b"plugins" => &mut raw.plugins,
            b"map" => &mut raw.map,
            b"numplayers" => &mut raw.num_players,
            b"maxplayers" => &mut raw.max_players,
            b"hostport" => &mut raw.host_port,
            b"hostip" => &mut raw.host_ip,
            b"game_id" => &mut raw.game_id,
            unknown => {
                trace!("skipping unknown query key {:?}", String::from_utf8_lossy(unknown));
                continue;
            }
        };
        *slot = pair.get(1).and_then(|value| text(value));
    }

    let (software, plugins) = split_plugins(raw.plugins.as_deref());

    let player_list = if players.is_empty() {
        None
    } else {
        Some(
            split_bytes(players, b"\0")
                .into_iter()
                .map(|name| String::from_utf8_lossy(name).into_owned())
                .collect(),
        )
    };

    Ok(QueryData {
        motd: raw.motd,
        game_type: raw.game_type,
        version: raw.version,
        software,
        plugins,
        raw_plugins: raw.plugins,
        map: raw.map,
        num_players: lenient_int(raw.num_players.as_deref()),
        max_players: lenient_int(raw.max_players.as_deref()),
        host_port: lenient_int(raw.host_port.as_deref()),
        host_ip: raw.host_ip,
        game_id: raw.game_id,
        player_list,
        latency: Duration::ZERO,
    })
}

/// Zero-length values mean the key is absent. Invalid UTF-8 is replaced, not rejected.
fn text(value: &[u8]) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(value).into_owned())
    }
}

/// `"CraftBukkit on Bukkit 1.2.5: WorldEdit 5.3; CommandBook 2.1"` becomes the
/// software name and its plugin list.
fn split_plugins(raw: Option<&str>) -> (Option<String>, Vec<String>) {
    let raw = match raw {
        Some(raw) if !raw.is_empty() => raw,
        _ => return (None, vec![]),
    };

    match raw.split_once(": ") {
        Some((software, list)) => (
            text(software.as_bytes()),
            list.split("; ")
                .filter(|plugin| !plugin.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        None => (Some(raw.to_string()), vec![]),
    }
}

/// Leading-digit integer coercion: `"20"` is 20, `"20 slots"` is 20, anything
/// without leading digits is 0.
fn lenient_int(text: Option<&str>) -> i32 {
    let text = match text {
        Some(text) => text.trim_start(),
        None => return 0,
    };
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let magnitude = digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0i64, |acc, d| {
            acc.saturating_mul(10).saturating_add(i64::from(d - b'0'))
        });
    let value = if negative { -magnitude } else { magnitude };
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pinging::{error::FailureKind, transport::fake::FakeTransport};

    fn stat_payload(pairs: &[(&str, &str)], players: &[&str]) -> Vec<u8> {
        let mut out = b"splitnum\x00\x80\x00".to_vec();
        for (i, (key, value)) in pairs.iter().enumerate() {
            if i > 0 {
                out.push(0);
            }
            out.extend_from_slice(key.as_bytes());
            out.push(0);
            out.extend_from_slice(value.as_bytes());
        }
        out.extend_from_slice(PLAYER_SENTINEL);
        for player in players {
            out.extend_from_slice(player.as_bytes());
            out.push(0);
        }
        out.push(0);
        out
    }

    fn reply(kind: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![kind];
        out.extend_from_slice(&SESSION_ID);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn parses_core_fields_and_players() {
        let payload = stat_payload(
            &[("hostname", "Test"), ("numplayers", "3"), ("maxplayers", "20")],
            &["A", "B", "C"],
        );
        let data = parse_stat(&payload).unwrap();
        assert_eq!(data.motd.as_deref(), Some("Test"));
        assert_eq!(data.num_players, 3);
        assert_eq!(data.max_players, 20);
        assert_eq!(data.host_port, 0);
        assert_eq!(
            data.player_list,
            Some(vec!["A".to_string(), "B".to_string(), "C".to_string()])
        );
    }

    #[test]
    fn parses_a_vanilla_reply() {
        let payload = stat_payload(
            &[
                ("hostname", "A Minecraft Server"),
                ("gametype", "SMP"),
                ("game_id", "MINECRAFT"),
                ("version", "1.20.1"),
                ("plugins", ""),
                ("map", "world"),
                ("numplayers", "0"),
                ("maxplayers", "20"),
                ("hostport", "25565"),
                ("hostip", "127.0.0.1"),
            ],
            &[],
        );
        let data = parse_stat(&payload).unwrap();
        assert_eq!(data.game_type.as_deref(), Some("SMP"));
        assert_eq!(data.game_id.as_deref(), Some("MINECRAFT"));
        assert_eq!(data.version.as_deref(), Some("1.20.1"));
        assert_eq!(data.map.as_deref(), Some("world"));
        assert_eq!(data.host_port, 25565);
        assert_eq!(data.host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(data.raw_plugins, None);
        assert_eq!(data.software, None);
        assert!(data.plugins.is_empty());
        assert_eq!(data.player_list, None);
    }

    #[test]
    fn missing_sentinel_is_a_protocol_error() {
        let mut payload = b"splitnum\x00\x80\x00hostname\x00Test".to_vec();
        payload.extend_from_slice(b"\x00\x00");
        let err = parse_stat(&payload).unwrap_err();
        assert!(matches!(
            err,
            PingError::Protocol(ProtocolViolation::Sentinel(0))
        ));
    }

    #[test]
    fn repeated_sentinel_is_a_protocol_error() {
        let mut payload = stat_payload(&[("hostname", "Test")], &["A"]);
        payload.extend_from_slice(PLAYER_SENTINEL);
        let err = parse_stat(&payload).unwrap_err();
        assert!(matches!(
            err,
            PingError::Protocol(ProtocolViolation::Sentinel(2))
        ));
    }

    #[test]
    fn payload_shorter_than_preamble_is_rejected() {
        let err = parse_stat(b"splitnum").unwrap_err();
        assert_eq!(err.kind(), FailureKind::Protocol);
    }

    #[test]
    fn unknown_keys_are_skipped_with_their_values() {
        let payload = stat_payload(
            &[("weather", "rain"), ("hostname", "Test"), ("hostname2", "x")],
            &[],
        );
        let data = parse_stat(&payload).unwrap();
        assert_eq!(data.motd.as_deref(), Some("Test"));
        assert_eq!(
            data,
            QueryData {
                motd: Some("Test".to_string()),
                ..QueryData::default()
            }
        );
    }

    #[test]
    fn empty_values_are_absent() {
        let payload = stat_payload(&[("hostname", ""), ("map", "world")], &[]);
        let data = parse_stat(&payload).unwrap();
        assert_eq!(data.motd, None);
        assert_eq!(data.map.as_deref(), Some("world"));
    }

    #[test]
    fn plugins_are_split_into_software_and_list() {
        let plugins = "CraftBukkit on Bukkit 1.2.5-R4.0: WorldEdit 5.3; CommandBook 2.1";
        let payload = stat_payload(&[("plugins", plugins)], &[]);
        let data = parse_stat(&payload).unwrap();
        assert_eq!(data.software.as_deref(), Some("CraftBukkit on Bukkit 1.2.5-R4.0"));
        assert_eq!(data.plugins, vec!["WorldEdit 5.3", "CommandBook 2.1"]);
        assert_eq!(data.raw_plugins.as_deref(), Some(plugins));
    }

    #[test]
    fn plugins_without_separator_are_only_software() {
        let (software, plugins) = split_plugins(Some("Paper"));
        assert_eq!(software.as_deref(), Some("Paper"));
        assert!(plugins.is_empty());
    }

    #[test]
    fn numbers_are_coerced_leniently() {
        assert_eq!(lenient_int(Some("20")), 20);
        assert_eq!(lenient_int(Some("  7 players")), 7);
        assert_eq!(lenient_int(Some("-3")), -3);
        assert_eq!(lenient_int(Some("lots")), 0);
        assert_eq!(lenient_int(Some("")), 0);
        assert_eq!(lenient_int(None), 0);
        assert_eq!(lenient_int(Some("99999999999")), i32::MAX);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut payload = b"splitnum\x00\x80\x00hostname\x00caf\xE9".to_vec();
        payload.extend_from_slice(PLAYER_SENTINEL);
        payload.push(0);
        let data = parse_stat(&payload).unwrap();
        assert_eq!(data.motd.as_deref(), Some("caf\u{FFFD}"));
    }

    #[test]
    fn challenge_tokens() {
        assert_eq!(parse_challenge(b"9513307\0").unwrap(), 9_513_307);
        assert_eq!(parse_challenge(b"-4236917\0").unwrap(), -4_236_917);
        assert_eq!(parse_challenge(b"4294967295").unwrap(), -1);
        let err = parse_challenge(b"nope\0").unwrap_err();
        assert!(matches!(
            err,
            PingError::Protocol(ProtocolViolation::BadChallenge(_))
        ));
    }

    #[test]
    fn packets_are_byte_exact() {
        assert_eq!(
            query_packet(HANDSHAKE, &[]),
            [0xFE, 0xFD, 0x09, 0x01, 0x02, 0x03, 0x04]
        );
    }

    #[test]
    fn full_exchange_over_fake_transport() {
        let stat = stat_payload(&[("hostname", "Test"), ("numplayers", "1")], &["Notch"]);
        let (transport, log) = FakeTransport::new(vec![
            reply(HANDSHAKE, b"9513307\0"),
            reply(STAT, &stat),
        ]);
        let pinger = QueryPinger {
            timeout: Duration::from_secs(2),
        };
        let data = pinger
            .exchange(transport, Deadline::start(pinger.timeout))
            .unwrap();
        assert_eq!(data.motd.as_deref(), Some("Test"));
        assert_eq!(data.player_list, Some(vec!["Notch".to_string()]));
        assert!(data.latency <= Duration::from_secs(2));

        let log = log.borrow();
        assert_eq!(log.written[0], [0xFE, 0xFD, 0x09, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(
            log.written[1],
            [
                0xFE, 0xFD, 0x00, 0x01, 0x02, 0x03, 0x04, 0x00, 0x91, 0x29, 0x5B, 0x00, 0x00,
                0x00, 0x00
            ]
        );
        assert!(log.closed);
    }

    #[test]
    fn wrong_reply_type_fails_and_closes() {
        let (transport, log) = FakeTransport::new(vec![reply(STAT, b"9513307\0")]);
        let pinger = QueryPinger {
            timeout: Duration::from_secs(2),
        };
        let err = pinger
            .exchange(transport, Deadline::start(pinger.timeout))
            .unwrap_err();
        assert!(matches!(
            err,
            PingError::Protocol(ProtocolViolation::WrongType {
                expected: 0x09,
                actual: 0x00
            })
        ));
        assert_eq!(log.borrow().written.len(), 1);
        assert!(log.borrow().closed);
    }

    #[test]
    fn short_reply_is_rejected() {
        let (transport, log) = FakeTransport::new(vec![vec![0x09, 0x01]]);
        let pinger = QueryPinger {
            timeout: Duration::from_secs(2),
        };
        let err = pinger
            .exchange(transport, Deadline::start(pinger.timeout))
            .unwrap_err();
        assert!(matches!(
            err,
            PingError::Protocol(ProtocolViolation::ShortReply(2))
        ));
        assert!(log.borrow().closed);
    }
}
