//! SmartSDR TCP command/response/status encoding and decoding.
//!
//! The control protocol is newline-terminated ASCII over TCP port 4992.
//! Commands flow from the bridge to the radio; responses, status lines and
//! handshake lines flow back.
//!
//! # Line formats
//!
//! ```text
//! Command:   C<seq>|<verb> <args>\n
//! Response:  R<seq>|<hex_status>|<data>\n
//! Status:    S<hex_handle>|<object> <key>=<value> ...\n
//! Message:   M<seq>|<text>\n
//! Version:   V<major>.<minor>.<patch>.<build>\n
//! Handle:    H<hex_handle>\n
//! ```
//!
//! Everything in this module is pure parsing; no I/O is performed.

use bytes::{Buf, BytesMut};

use flexbridge_core::{Error, Result};

// ---------------------------------------------------------------------------
// Frequency conversion helpers
// ---------------------------------------------------------------------------

/// Convert frequency in Hz to MHz for SmartSDR commands.
pub fn hz_to_mhz(hz: u64) -> f64 {
    hz as f64 / 1_000_000.0
}

/// Convert frequency in MHz (as sent by the radio) to Hz.
pub fn mhz_to_hz(mhz: f64) -> u64 {
    (mhz * 1_000_000.0).round() as u64
}

// ---------------------------------------------------------------------------
// Command encoding
// ---------------------------------------------------------------------------

/// Encode a command line with the given sequence number.
///
/// Format: `C<seq>|<verb> <args>\n`, or `C<seq>|<verb>\n` when `args` is
/// empty.
pub fn encode_command(seq: u32, verb: &str, args: &str) -> Vec<u8> {
    if args.is_empty() {
        format!("C{seq}|{verb}\n").into_bytes()
    } else {
        format!("C{seq}|{verb} {args}\n").into_bytes()
    }
}

/// A command ready to be framed by the command channel.
///
/// Builders return the verb and arguments without the `C<seq>|` prefix;
/// the channel adds it when it assigns a sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command verb, possibly multi-word (e.g. `"slice tune"`).
    pub verb: &'static str,
    /// Space-separated arguments; may be empty.
    pub args: String,
}

impl Command {
    /// `slice tune <index> <MHz>`
    pub fn slice_tune(slice_index: u8, freq_hz: u64) -> Self {
        Command {
            verb: "slice tune",
            args: format!("{} {:.6}", slice_index, hz_to_mhz(freq_hz)),
        }
    }

    /// `slice set <index> mode=<MODE>`
    pub fn slice_set_mode(slice_index: u8, mode: &str) -> Self {
        Command {
            verb: "slice set",
            args: format!("{slice_index} mode={mode}"),
        }
    }

    /// `slice set <index> nb=<0|1>`
    pub fn slice_set_nb(slice_index: u8, on: bool) -> Self {
        Command {
            verb: "slice set",
            args: format!("{slice_index} nb={}", u8::from(on)),
        }
    }

    /// `slice set <index> nr=<0|1>`
    pub fn slice_set_nr(slice_index: u8, on: bool) -> Self {
        Command {
            verb: "slice set",
            args: format!("{slice_index} nr={}", u8::from(on)),
        }
    }

    /// `slice set <index> step=<Hz>`
    pub fn slice_set_step(slice_index: u8, step_hz: u64) -> Self {
        Command {
            verb: "slice set",
            args: format!("{slice_index} step={step_hz}"),
        }
    }

    /// `xmit <0|1>`
    pub fn xmit(on: bool) -> Self {
        Command {
            verb: "xmit",
            args: u8::from(on).to_string(),
        }
    }

    /// `client program <name>`
    pub fn client_program(name: &str) -> Self {
        Command {
            verb: "client program",
            args: name.to_string(),
        }
    }

    /// `client udpport <port>`: where the radio sends meter readings.
    pub fn client_udpport(port: u16) -> Self {
        Command {
            verb: "client udpport",
            args: port.to_string(),
        }
    }

    /// `sub <object>`
    pub fn subscribe(object: &str) -> Self {
        Command {
            verb: "sub",
            args: object.to_string(),
        }
    }

    /// `info`
    pub fn info() -> Self {
        Command {
            verb: "info",
            args: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound line buffering
// ---------------------------------------------------------------------------

/// Longest line held while waiting for its terminator.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Accumulates raw TCP bytes and yields complete lines.
///
/// Lines are split on `\n` with a trailing `\r` stripped. A partial line is
/// held until the rest of it arrives in a later read.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        LineBuffer {
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Append freshly read bytes.
    ///
    /// Returns `false` if an unterminated line grew past [`MAX_LINE_LEN`];
    /// the held bytes are discarded in that case.
    pub fn extend(&mut self, data: &[u8]) -> bool {
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_LINE_LEN && !self.buf.contains(&b'\n') {
            self.buf.clear();
            return false;
        }
        true
    }

    /// Take the next complete line, if one is buffered.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line = self.buf.split_to(pos);
        self.buf.advance(1);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Number of bytes held that do not yet form a complete line.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

// ---------------------------------------------------------------------------
// Response / status / message types
// ---------------------------------------------------------------------------

/// A decoded response to a previously-sent command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    /// Sequence number of the command this answers.
    pub sequence: u32,
    /// Status code. `0` is success; anything else is a radio error code.
    pub status: u32,
    /// Response data (may be empty).
    pub data: String,
}

impl CommandResponse {
    /// Whether the radio reported success.
    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

/// A decoded unsolicited status line.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusLine {
    /// Client handle this status was addressed to.
    pub handle: u32,
    /// Object type and optional identifier (e.g. `"slice 0"`, `"interlock"`).
    pub object: String,
    /// Key-value pairs in arrival order.
    pub params: Vec<(String, String)>,
}

impl StatusLine {
    /// Look up a parameter value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First word of the object (e.g. `"slice"` for `"slice 0"`).
    pub fn object_kind(&self) -> &str {
        self.object.split_whitespace().next().unwrap_or("")
    }
}

/// Version reported by the radio when a client connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: u32,
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.patch, self.build)
    }
}

/// Kinds of lines received from the radio.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundLine {
    /// `V1.4.0.0`
    Version(ProtocolVersion),
    /// `H12345678`
    Handle(u32),
    /// `R<seq>|<status>|<data>`
    Response(CommandResponse),
    /// `S<handle>|<object> <kv>...`
    Status(StatusLine),
    /// `M<seq>|<text>`
    Message(String),
    /// Anything else.
    Unknown(String),
}

// ---------------------------------------------------------------------------
// Line parsing
// ---------------------------------------------------------------------------

/// Parse a single line received from the radio.
///
/// The line should not include the trailing `\n`. Surrounding whitespace is
/// ignored.
pub fn parse_line(line: &str) -> Result<InboundLine> {
    let line = line.trim();
    let Some(first) = line.bytes().next() else {
        return Err(Error::Protocol("empty line".into()));
    };

    match first {
        b'V' => parse_version(line),
        b'H' => parse_handle(line),
        b'R' => parse_response(line),
        b'S' => parse_status(line),
        b'M' => parse_msg(line),
        _ => Ok(InboundLine::Unknown(line.to_string())),
    }
}

fn parse_version(line: &str) -> Result<InboundLine> {
    let parts: Vec<&str> = line[1..].split('.').collect();
    if parts.len() != 4 {
        return Err(Error::Protocol(format!("invalid version format: {line}")));
    }

    let parse_u32 = |s: &str| -> Result<u32> {
        s.parse::<u32>()
            .map_err(|_| Error::Protocol(format!("invalid version number: {s}")))
    };

    Ok(InboundLine::Version(ProtocolVersion {
        major: parse_u32(parts[0])?,
        minor: parse_u32(parts[1])?,
        patch: parse_u32(parts[2])?,
        build: parse_u32(parts[3])?,
    }))
}

fn parse_handle(line: &str) -> Result<InboundLine> {
    let body = &line[1..];
    let handle = u32::from_str_radix(body, 16)
        .map_err(|_| Error::Protocol(format!("invalid hex handle: {body}")))?;
    Ok(InboundLine::Handle(handle))
}

fn parse_response(line: &str) -> Result<InboundLine> {
    let parts: Vec<&str> = line[1..].splitn(3, '|').collect();
    if parts.len() < 2 {
        return Err(Error::Protocol(format!(
            "malformed response (need at least seq|status): {line}"
        )));
    }

    let sequence = parts[0]
        .parse::<u32>()
        .map_err(|_| Error::Protocol(format!("invalid response sequence: {}", parts[0])))?;
    let status = u32::from_str_radix(parts[1], 16)
        .map_err(|_| Error::Protocol(format!("invalid response status: {}", parts[1])))?;
    let data = parts.get(2).map(|s| s.to_string()).unwrap_or_default();

    Ok(InboundLine::Response(CommandResponse {
        sequence,
        status,
        data,
    }))
}

fn parse_status(line: &str) -> Result<InboundLine> {
    let body = &line[1..];
    let (handle_str, payload) = body
        .split_once('|')
        .ok_or_else(|| Error::Protocol(format!("malformed status (no pipe): {line}")))?;

    let handle = u32::from_str_radix(handle_str, 16)
        .map_err(|_| Error::Protocol(format!("invalid status handle: {handle_str}")))?;

    // The leading run of tokens without '=' names the object; the rest are
    // key=value pairs. Stray bare tokens after the first pair are skipped.
    let mut object_parts: Vec<&str> = Vec::new();
    let mut params: Vec<(String, String)> = Vec::new();
    for token in payload.split_whitespace() {
        match token.split_once('=') {
            Some((key, value)) => params.push((key.to_string(), value.to_string())),
            None if params.is_empty() => object_parts.push(token),
            None => {}
        }
    }

    Ok(InboundLine::Status(StatusLine {
        handle,
        object: object_parts.join(" "),
        params,
    }))
}

fn parse_msg(line: &str) -> Result<InboundLine> {
    let (_seq, text) = line[1..]
        .split_once('|')
        .ok_or_else(|| Error::Protocol(format!("malformed message (no pipe): {line}")))?;
    Ok(InboundLine::Message(text.to_string()))
}

// ---------------------------------------------------------------------------
// Status object parsers
// ---------------------------------------------------------------------------

/// Fields of a `slice` status line that feed the device state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SliceStatus {
    /// Slice index (0-7).
    pub index: u8,
    /// `RF_frequency`, in MHz.
    pub frequency_mhz: Option<f64>,
    /// `mode`, as the radio spells it.
    pub mode: Option<String>,
    /// `nb`
    pub nb: Option<bool>,
    /// `nr`
    pub nr: Option<bool>,
    /// `step`, in Hz.
    pub step_hz: Option<u64>,
    /// `active`
    pub active: Option<bool>,
}

/// Parse a slice status from its object string and parameters.
pub fn parse_slice_status(status: &StatusLine) -> Result<SliceStatus> {
    let index_str = status.object.split_whitespace().nth(1).ok_or_else(|| {
        Error::Protocol(format!(
            "slice status missing index in object: {}",
            status.object
        ))
    })?;
    let index = index_str
        .parse::<u8>()
        .map_err(|_| Error::Protocol(format!("invalid slice index: {index_str}")))?;

    let mut slice = SliceStatus {
        index,
        ..SliceStatus::default()
    };

    for (key, value) in &status.params {
        match key.as_str() {
            "RF_frequency" => {
                slice.frequency_mhz = Some(
                    value
                        .parse::<f64>()
                        .map_err(|_| Error::Protocol(format!("invalid RF_frequency: {value}")))?,
                );
            }
            "mode" => slice.mode = Some(value.clone()),
            "nb" => slice.nb = Some(value == "1"),
            "nr" => slice.nr = Some(value == "1"),
            "step" => {
                slice.step_hz = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| Error::Protocol(format!("invalid step: {value}")))?,
                );
            }
            "active" => slice.active = Some(value == "1"),
            _ => {}
        }
    }

    Ok(slice)
}

/// Transmit state carried by `interlock`, `transmit` or `tx` status lines.
///
/// Returns `None` when the line carries no transmit-state key.
pub fn parse_tx_state(status: &StatusLine) -> Option<bool> {
    match status.object_kind() {
        "interlock" => status
            .get("state")
            .map(|s| matches!(s, "TRANSMITTING" | "PTT_REQUESTED" | "TX")),
        "transmit" | "tx" => status
            .get("state")
            .or_else(|| status.get("mox"))
            .map(|s| s == "1"),
        _ => None,
    }
}

/// One meter definition announced by the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterStatus {
    /// Meter numeric id, as used in telemetry datagrams.
    pub id: u16,
    /// Meter name (e.g. `"LEVEL"`, `"FWDPWR"`, `"SWR"`).
    pub name: Option<String>,
    /// Meter source (e.g. `"SLC"`, `"TX-"`, `"RAD"`).
    pub source: Option<String>,
}

/// Parse meter definitions from a `meter` status line.
///
/// Two layouts are accepted: flat keys (`meter num=3 nam=SWR src=TX-`)
/// and the radio's packed list (`meter 7.num=7#7.nam=FWDPWR#7.src=TX-#`),
/// which may define several meters on one line.
pub fn parse_meter_status(status: &StatusLine) -> Result<Vec<MeterStatus>> {
    let mut flat = MeterFields::default();
    let mut packed: Vec<(u16, MeterFields)> = Vec::new();

    for (key, value) in &status.params {
        let joined = format!("{key}={value}");
        for field in joined.split('#').filter(|f| !f.is_empty()) {
            let Some((k, v)) = field.split_once('=') else {
                continue;
            };
            match k.split_once('.') {
                Some((id_str, sub)) => {
                    let id = id_str
                        .parse::<u16>()
                        .map_err(|_| Error::Protocol(format!("invalid meter id: {id_str}")))?;
                    let pos = match packed.iter().position(|(pid, _)| *pid == id) {
                        Some(pos) => pos,
                        None => {
                            packed.push((id, MeterFields::default()));
                            packed.len() - 1
                        }
                    };
                    packed[pos].1.set(sub, v)?;
                }
                None => flat.set(k, v)?,
            }
        }
    }

    let mut meters: Vec<MeterStatus> = packed
        .into_iter()
        .map(|(id, fields)| MeterStatus {
            id,
            name: fields.name,
            source: fields.source,
        })
        .collect();

    if let Some(id) = flat.id {
        meters.push(MeterStatus {
            id,
            name: flat.name,
            source: flat.source,
        });
    }

    if meters.is_empty() {
        return Err(Error::Protocol("meter status missing id/num field".into()));
    }
    Ok(meters)
}

#[derive(Debug, Default)]
struct MeterFields {
    id: Option<u16>,
    name: Option<String>,
    source: Option<String>,
}

impl MeterFields {
    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "num" | "id" => {
                self.id = Some(
                    value
                        .parse::<u16>()
                        .map_err(|_| Error::Protocol(format!("invalid meter id: {value}")))?,
                );
            }
            "nam" | "name" => self.name = Some(value.to_string()),
            "src" | "source" => self.source = Some(value.to_string()),
            _ => {}
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
