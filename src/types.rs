//! Wire-level value types shared by every component: client command lines,
//! client response lines, modem message lines, socket addresses, and the
//! measurement-kind dictionary.
//!
//! None of these types touch a queue or a socket themselves — they are pure
//! parsing/formatting, which keeps them trivially testable.

use std::fmt;

/// A command line received from a client, already stripped of its line
/// terminator: `VERB [ARG ...]`. Arguments are either bare tokens or
/// `KEY=VALUE` pairs; this type does not interpret them, it only splits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCommand {
    verb: String,
    args: Vec<String>,
}

impl ClientCommand {
    /// Parse a raw line. Trailing `\r`, `\n`, and NUL are trimmed before
    /// splitting on whitespace; an empty line yields an empty verb.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim_end_matches(['\n', '\r', '\0']);
        let mut parts = trimmed.split_whitespace();
        let verb = parts.next().unwrap_or("").to_uppercase();
        let args = parts.map(ToString::to_string).collect();
        Self { verb, args }
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Look up the value of a `KEY=VALUE` argument by key (case-insensitive).
    pub fn keyed(&self, key: &str) -> Option<&str> {
        self.args.iter().find_map(|a| {
            let (k, v) = a.split_once('=')?;
            k.eq_ignore_ascii_case(key).then_some(v)
        })
    }

    /// Whether a bare (non-`KEY=VALUE`) token is present, case-insensitive.
    pub fn has_flag(&self, flag: &str) -> bool {
        self.args.iter().any(|a| a.eq_ignore_ascii_case(flag))
    }

    /// First positional (non-`KEY=VALUE`) argument, if any.
    pub fn positional(&self, index: usize) -> Option<&str> {
        self.args
            .iter()
            .filter(|a| !a.contains('='))
            .nth(index)
            .map(String::as_str)
    }
}

/// A response line sent back to the client: `TYPE[=VALUE]` followed by the
/// `\n\r` terminator, type and value uppercased.
#[derive(Debug, Clone)]
pub struct ClientCommandResponse {
    ty: String,
    value: Option<String>,
}

impl ClientCommandResponse {
    pub fn new(ty: impl Into<String>) -> Self {
        Self {
            ty: ty.into().to_uppercase(),
            value: None,
        }
    }

    pub fn with_value(ty: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            ty: ty.into().to_uppercase(),
            value: Some(value.into().to_uppercase()),
        }
    }

    /// Render the full wire line, `\n\r`-terminated.
    pub fn render(&self) -> String {
        match &self.value {
            Some(v) if !v.is_empty() => format!("{}={}\n\r", self.ty, v),
            _ => format!("{}\n\r", self.ty),
        }
    }
}

impl fmt::Display for ClientCommandResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// A line received from the modem: either a synchronous reply (`OK`,
/// numeric, `DELIVEREDIM...`, `ERROR...`) or an unsolicited event (`RECVIM`,
/// `RECV`, `USBL`), comma-delimited with payload at field index 9.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModemMessage {
    raw: String,
}

/// Field index carrying the payload in `RECVIM`/`RECV` event lines.
const PAYLOAD_FIELD: usize = 9;
/// Field index carrying the source address in `RECVIM` event lines.
const SOURCE_ADDR_FIELD: usize = 2;

impl ModemMessage {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Split the raw line on `,`.
    pub fn chunks(&self) -> Vec<&str> {
        self.raw.split(',').collect()
    }

    pub fn is_received_im(&self) -> bool {
        self.raw.starts_with("RECVIM")
    }

    /// Note: exactly `RECV,` — must not also match `RECVIM`.
    pub fn is_received_data(&self) -> bool {
        self.raw.starts_with("RECV,")
    }

    pub fn is_ping_msg(&self) -> bool {
        self.is_received_im() && self.raw.trim_end().ends_with(",mwp")
    }

    pub fn is_power_ping_msg(&self) -> bool {
        self.is_received_data() && self.raw.trim_end().ends_with(",pow")
    }

    pub fn is_position_data(&self) -> bool {
        self.raw.starts_with("USBL")
    }

    pub fn is_error(&self) -> bool {
        self.raw.starts_with("ERROR")
    }

    fn chunk(&self, idx: usize) -> Option<&str> {
        self.chunks().get(idx).copied()
    }

    /// Source address field of a `RECVIM` event (field 2).
    pub fn source_address(&self) -> Option<&str> {
        self.chunk(SOURCE_ADDR_FIELD)
    }

    /// Payload field of an event line (field 9). For frames whose payload
    /// itself contains commas (e.g. embedded base64 text), the remaining
    /// fields from index 9 onward must be rejoined with `,`.
    pub fn payload(&self) -> Option<String> {
        let chunks = self.chunks();
        if chunks.len() <= PAYLOAD_FIELD {
            return None;
        }
        Some(chunks[PAYLOAD_FIELD..].join(","))
    }

    fn payload_starts_with(&self, prefix: &str) -> bool {
        self.payload().is_some_and(|p| p.starts_with(prefix))
    }

    pub fn is_sleep_request(&self) -> bool {
        self.is_received_data() && self.payload_starts_with("slp")
    }

    pub fn is_wakeup_request(&self) -> bool {
        self.is_received_data() && self.payload_starts_with("wup")
    }

    pub fn is_transmission_request(&self) -> bool {
        self.is_received_data() && self.payload_starts_with("H")
    }

    pub fn is_ack(&self) -> bool {
        self.is_received_data() && self.payload_starts_with("ack")
    }

    pub fn is_nack(&self) -> bool {
        self.is_received_data() && self.payload_starts_with("nack")
    }
}

/// A resolved `host:port` endpoint. DNS resolution (when `host` is not
/// already a dotted-quad) happens once, at config-load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketAddress {
    pub ip: String,
    pub port: u16,
}

impl SocketAddress {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    pub fn to_socket_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Measurement kind dictionary: `TEMPERATURA`/`PH`/`SALINIDAD`/`PRESION`
/// mapped to short wire mnemonics (`temp`/`ph`/`sal`/`pres`). A
/// class-as-namespace lookup table, not an enum with variants, so new kinds
/// are one array entry away.
pub struct Measure;

const MEASURE_KINDS: &[(&str, &str)] = &[
    ("TEMPERATURA", "temp"),
    ("PH", "ph"),
    ("SALINIDAD", "sal"),
    ("PRESION", "pres"),
];

impl Measure {
    /// `TEMPERATURA` → `temp`, etc. `None` for an unknown kind.
    pub fn code_for_kind(kind: &str) -> Option<&'static str> {
        MEASURE_KINDS
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, code)| *code)
    }

    /// Reverse of [`Self::code_for_kind`].
    pub fn kind_for_code(code: &str) -> Option<&'static str> {
        MEASURE_KINDS
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(k, _)| *k)
    }

    /// Build a `g_<code>` get-measurement IM payload.
    pub fn getmeas_encode(kind: &str) -> Result<String, String> {
        let code = Self::code_for_kind(kind).ok_or_else(|| format!("unknown kind {kind}"))?;
        Ok(format!("g_{code}"))
    }

    /// Build a `s_<code> <value>` set-measurement IM payload.
    pub fn setmeas_encode(kind: &str, value: &str) -> Result<String, String> {
        let code = Self::code_for_kind(kind).ok_or_else(|| format!("unknown kind {kind}"))?;
        Ok(format!("s_{code} {value}"))
    }

    /// Build a `gf <name>` get-file IM payload.
    pub fn getfile_encode(name: &str) -> String {
        format!("gf {name}")
    }

    /// Build an `sr <payload>` raw-send IM payload.
    pub fn sendraw_encode(payload: &str) -> String {
        format!("sr {payload}")
    }

    pub fn is_meas_msg(payload: &str) -> bool {
        payload.starts_with("g_") || payload.starts_with("s_")
    }

    pub fn is_raw_msg(payload: &str) -> bool {
        payload.starts_with("sr ") || payload == "sr"
    }

    pub fn is_file_request(payload: &str) -> bool {
        payload.starts_with("gf ")
    }

    pub fn is_list_dir_request(payload: &str) -> bool {
        payload == "ls" || payload == "lsf"
    }

    /// Decode a `g_<code>`/`s_<code> <value>` payload back into a client
    /// command line (`GETMEAS <KIND>` / `SENDMEAS <KIND>=<value>`).
    pub fn meas_decode(payload: &str) -> Option<String> {
        if let Some(code) = payload.strip_prefix("g_") {
            let kind = Self::kind_for_code(code)?;
            return Some(format!("GETMEAS {kind}"));
        }
        if let Some(rest) = payload.strip_prefix("s_") {
            let (code, value) = rest.split_once(' ')?;
            let kind = Self::kind_for_code(code)?;
            return Some(format!("SENDMEAS {kind}={value}"));
        }
        None
    }

    /// Decode `sr <payload>` into `SENDRAW DATA=<payload>`.
    pub fn rawmsg_decode(payload: &str) -> Option<String> {
        let rest = payload.strip_prefix("sr ").or_else(|| {
            if payload == "sr" {
                Some("")
            } else {
                None
            }
        })?;
        Some(format!("SENDRAW DATA={rest}"))
    }

    /// Decode `gf <name>` into `GETFILE NOMBRE=<name>`.
    pub fn getfile_decode(payload: &str) -> Option<String> {
        let name = payload.strip_prefix("gf ")?;
        Some(format!("GETFILE NOMBRE={name}"))
    }

    /// Decode `ls`/`lsf` into `GETDIR` / `GETDIR FULL`.
    pub fn listdir_decode(payload: &str) -> Option<String> {
        match payload {
            "ls" => Some("GETDIR".to_string()),
            "lsf" => Some("GETDIR FULL".to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_verb_and_args() {
        let cmd = ClientCommand::parse("GETMEAS TEMPERATURA DESTINO=3\r\n");
        assert_eq!(cmd.verb(), "GETMEAS");
        assert_eq!(cmd.positional(0), Some("TEMPERATURA"));
        assert_eq!(cmd.keyed("destino"), Some("3"));
    }

    #[test]
    fn response_renders_with_value() {
        let resp = ClientCommandResponse::with_value("delay", "0.0432");
        assert_eq!(resp.render(), "DELAY=0.0432\n\r");
    }

    #[test]
    fn response_renders_bare() {
        let resp = ClientCommandResponse::new("ok");
        assert_eq!(resp.render(), "OK\n\r");
    }

    #[test]
    fn classifies_ping_and_power_ping() {
        let ping = ModemMessage::new("RECVIM,5,12,3,0,0,0,0,0,mwp".to_string());
        assert!(ping.is_ping_msg());
        let pping = ModemMessage::new("RECV,0,0,0,0,0,0,0,0,pow".to_string());
        assert!(pping.is_power_ping_msg());
    }

    #[test]
    fn recv_im_does_not_match_recv_data() {
        let im = ModemMessage::new("RECVIM,5,12,3,0,0,0,0,0,g_temp".to_string());
        assert!(im.is_received_im());
        assert!(!im.is_received_data());
    }

    #[test]
    fn payload_rejoins_extra_commas() {
        let msg = ModemMessage::new("RECV,0,0,0,0,0,0,0,0,0|YWJj|1a2b3c4d".to_string());
        assert_eq!(msg.payload().as_deref(), Some("0|YWJj|1a2b3c4d"));
    }

    #[test]
    fn measure_round_trips() {
        for (kind, _) in MEASURE_KINDS {
            let enc = Measure::getmeas_encode(kind).unwrap();
            let decoded = Measure::meas_decode(&enc).unwrap();
            assert_eq!(decoded, format!("GETMEAS {kind}"));

            let enc = Measure::setmeas_encode(kind, "7.4").unwrap();
            let decoded = Measure::meas_decode(&enc).unwrap();
            assert_eq!(decoded, format!("SENDMEAS {kind}=7.4"));
        }
    }

    #[test]
    fn measure_rejects_unknown_kind() {
        assert!(Measure::getmeas_encode("BOGUS").is_err());
    }
}
