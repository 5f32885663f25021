/*! Outer telemetry packet framing.

Wire layout, numeric fields big-endian:

```text
"##" | cmd:1 | ans:1 | vin:17 | enc:1 | len:2 | payload:len | checksum:1
```

The checksum is the XOR of every byte from `cmd` through the last
payload byte. The VIN is right-padded with NUL to 17 bytes, and the
encryption byte is always 0x01 (plaintext).

[PacketReader] is the byte-oriented inbound parser: it hunts for the
`##` marker, collects the 22 header bytes, then the payload and the
checksum. A checksum mismatch drops the frame with a warning and
resets the parser; the connection stays up.
*/
use log::warn;

use crate::crc::xor_checksum;

/// Payload length ceiling imposed by the frame format.
pub const MAX_PAYLOAD: usize = 65531;

/// Offset of the first payload byte from the start of the packet.
const HEADER_LEN: usize = 24;

/// Command byte of an outer packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Vehicle login.
    VehicleLogin = 0x01,
    /// Realtime report.
    RealtimeData = 0x02,
    /// Delayed (repeat) report.
    RepeatData = 0x03,
    /// Vehicle logout.
    VehicleLogout = 0x04,
    /// Platform login.
    PlatformLogin = 0x05,
    /// Platform logout.
    PlatformLogout = 0x06,
    /// Keep-alive with empty payload.
    ClientHeartbeat = 0x07,
    /// Server-driven time synchronisation.
    SetTime = 0x08,
    /// Parameter query from the server.
    Query = 0x80,
    /// Parameter setup from the server.
    Setup = 0x81,
    /// Terminal control (update, power off, reboot, ...).
    TerminalControl = 0x82,
}

impl Command {
    /// Decode a command byte.
    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x01 => Command::VehicleLogin,
            0x02 => Command::RealtimeData,
            0x03 => Command::RepeatData,
            0x04 => Command::VehicleLogout,
            0x05 => Command::PlatformLogin,
            0x06 => Command::PlatformLogout,
            0x07 => Command::ClientHeartbeat,
            0x08 => Command::SetTime,
            0x80 => Command::Query,
            0x81 => Command::Setup,
            0x82 => Command::TerminalControl,
            _ => return None,
        })
    }
}

/// Answer byte of an outer packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Answer {
    /// Positive acknowledgement.
    Succeed = 0x01,
    /// Negative acknowledgement.
    Error = 0x02,
    /// Login rejected, VIN already registered elsewhere.
    VinDuplicated = 0x03,
    /// Not an answer: the packet is a command awaiting one.
    Command = 0xFE,
}

impl Answer {
    /// Decode an answer byte.
    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x01 => Answer::Succeed,
            0x02 => Answer::Error,
            0x03 => Answer::VinDuplicated,
            0xFE => Answer::Command,
            _ => return None,
        })
    }
}

/// Encryption byte for plaintext payloads.
pub const ENCRYPTION_NONE: u8 = 0x01;

/// Assemble one outer packet.
///
/// The VIN is truncated or NUL-padded to exactly 17 bytes.
#[must_use]
pub fn build(command: Command, answer: Answer, vin: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + 1);
    out.extend_from_slice(b"##");
    out.push(command as u8);
    out.push(answer as u8);
    let mut vin_buf = [0u8; 17];
    let n = vin.len().min(17);
    vin_buf[..n].copy_from_slice(&vin.as_bytes()[..n]);
    out.extend_from_slice(&vin_buf);
    out.push(ENCRYPTION_NONE);
    out.extend_from_slice(&(payload.len().min(MAX_PAYLOAD) as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out.push(xor_checksum(&out[2..]));
    out
}

/// One fully parsed inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Raw command byte.
    pub command: u8,
    /// Raw answer byte.
    pub answer: u8,
    /// VIN with trailing NUL padding stripped.
    pub vin: String,
    /// Encryption byte.
    pub encryption: u8,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

#[derive(Debug, Default, Clone, Copy)]
enum ReadState {
    /// Waiting for the first '#'.
    #[default]
    Idle,
    /// One '#' seen.
    Marker,
    /// Collecting header + payload + checksum; `expect` is the packet
    /// length from the marker through the last payload byte.
    Collect {
        expect: usize,
    },
}

/// Byte-oriented inbound packet parser.
#[derive(Debug, Default)]
pub struct PacketReader {
    state: ReadState,
    buf: Vec<u8>,
}

impl PacketReader {
    /// New parser in the hunting state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes, returning every completed packet.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Packet> {
        let mut out = Vec::new();
        for &byte in data {
            if let Some(pkt) = self.feed_byte(byte) {
                out.push(pkt);
            }
        }
        out
    }

    fn feed_byte(&mut self, byte: u8) -> Option<Packet> {
        match self.state {
            ReadState::Idle => {
                if byte == b'#' {
                    self.buf.clear();
                    self.buf.push(byte);
                    self.state = ReadState::Marker;
                }
                None
            }
            ReadState::Marker => {
                if byte == b'#' {
                    self.buf.push(byte);
                    // Until the length field arrives, expect a bare
                    // header.
                    self.state = ReadState::Collect { expect: HEADER_LEN };
                } else {
                    self.buf.clear();
                    self.state = ReadState::Idle;
                }
                None
            }
            ReadState::Collect { expect } => {
                self.buf.push(byte);
                if self.buf.len() == HEADER_LEN {
                    let len = u16::from_be_bytes([self.buf[22], self.buf[23]]) as usize;
                    let len = len.min(MAX_PAYLOAD);
                    self.state = ReadState::Collect {
                        expect: HEADER_LEN + len,
                    };
                    None
                } else if self.buf.len() == expect + 1 {
                    // Last byte is the checksum.
                    let want = self.buf[expect];
                    let got = xor_checksum(&self.buf[2..expect]);
                    let packet = if want == got {
                        let vin_end = self.buf[4..21]
                            .iter()
                            .position(|&b| b == 0)
                            .map(|p| 4 + p)
                            .unwrap_or(21);
                        Some(Packet {
                            command: self.buf[2],
                            answer: self.buf[3],
                            vin: String::from_utf8_lossy(&self.buf[4..vin_end]).into_owned(),
                            encryption: self.buf[21],
                            payload: self.buf[HEADER_LEN..expect].to_vec(),
                        })
                    } else {
                        warn!("dropping packet with checksum error: want {want:#04x}, got {got:#04x}");
                        None
                    };
                    self.buf.clear();
                    self.state = ReadState::Idle;
                    packet
                } else {
                    None
                }
            }
        }
    }
}
