//! Text to record mapping for AMI and CLI output.
//!
//! Nothing here performs I/O and nothing here fails: a field that cannot be found
//! keeps its default, so a record produced from truncated or unfamiliar text is
//! still a valid record with fewer facts in it.
//!
//! Endpoint text arrives in two shapes that describe the same thing:
//!
//! - AMI `Key: value` blocks ([`extract_endpoint_ami`], [`extract_endpoints_ami`])
//! - `pjsip show endpoint <x>` CLI tables ([`extract_endpoint_cli`])
//!
//! [`merge_endpoint`] reconciles the two, preferring AMI.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
#[cfg(feature = "docs")]
use utoipa::ToSchema;

static CONTACT_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"sips?:(?:[^@\s;,>]+@)?([A-Za-z0-9.\-]+)(?::(\d+))?").expect("contact regex")
});
static CLI_ENDPOINT_ROW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*Endpoint:\s+(\S+)\s+(.+?)\s+\d+\s+of\s+\S+\s*$").expect("endpoint row regex")
});
static CLI_CONTACT_ROW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*Contact:\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)").expect("contact row regex")
});
static LEADING_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-?\d+(?:\.\d+)?").expect("number regex"));

/// Overall status of an endpoint as shown to operators.
#[cfg_attr(feature = "docs", derive(ToSchema))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointState {
    Registered,
    Offline,
    Error,
    Unknown,
}

impl EndpointState {
    /// Whether the PBX actually answered for this endpoint.
    pub fn is_answered(self) -> bool {
        matches!(self, EndpointState::Registered | EndpointState::Offline)
    }
}

/// Asterisk device state, normalized from its many spellings
/// (`Not in use`, `not_inuse`, `NOT_INUSE`, ...).
#[cfg_attr(feature = "docs", derive(ToSchema))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    InUse,
    NotInUse,
    Ringing,
    RingInUse,
    Busy,
    OnHold,
    Unavailable,
    Invalid,
    Unknown,
}

impl DeviceState {
    pub fn parse(text: &str) -> Self {
        let key: String = text
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .flat_map(char::to_lowercase)
            .collect();
        match key.as_str() {
            "inuse" => DeviceState::InUse,
            "notinuse" => DeviceState::NotInUse,
            "ringing" => DeviceState::Ringing,
            "ringinuse" => DeviceState::RingInUse,
            "busy" => DeviceState::Busy,
            "onhold" => DeviceState::OnHold,
            "unavailable" => DeviceState::Unavailable,
            "invalid" => DeviceState::Invalid,
            _ => DeviceState::Unknown,
        }
    }

    /// `in_use`, `not_in_use` and `ringing` count as registered; everything else is offline.
    pub fn counts_as_registered(self) -> bool {
        matches!(
            self,
            DeviceState::InUse | DeviceState::NotInUse | DeviceState::Ringing
        )
    }
}

/// Registration and reachability facts for one PJSIP endpoint.
///
/// `registered` follows the device state, not the contact list: an idle endpoint
/// with no contacts is still `registered`. `has_contacts` and
/// `device_state_registered` keep the two signals apart.
#[cfg_attr(feature = "docs", derive(ToSchema))]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointStatus {
    pub name: String,
    pub registered: bool,
    pub status: EndpointState,
    pub device_state: DeviceState,
    pub device_state_registered: bool,
    pub has_contacts: bool,
    pub contacts: Vec<String>,
    pub ip_address: Option<String>,
    pub port: Option<u16>,
    pub codecs: Vec<String>,
    pub last_qualify_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EndpointStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registered: false,
            status: EndpointState::Unknown,
            device_state: DeviceState::Unknown,
            device_state_registered: false,
            has_contacts: false,
            contacts: Vec::new(),
            ip_address: None,
            port: None,
            codecs: Vec::new(),
            last_qualify_ms: None,
            error: None,
        }
    }

    /// The PBX could not be asked.
    pub fn unknown(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(name)
        }
    }

    /// The PBX was asked and refused or failed to answer.
    pub fn failed(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: EndpointState::Error,
            error: Some(error.into()),
            ..Self::new(name)
        }
    }

    fn apply_device_state(&mut self, raw: &str) {
        self.device_state = DeviceState::parse(raw);
        self.device_state_registered = self.device_state.counts_as_registered();
        self.registered = self.device_state_registered;
        self.status = if self.registered {
            EndpointState::Registered
        } else {
            EndpointState::Offline
        };
    }

    fn apply_contacts(&mut self, contacts: Vec<String>) {
        if let Some((ip, port)) = contacts.iter().find_map(|c| contact_address(c)) {
            self.ip_address = Some(ip);
            self.port = port;
        }
        self.has_contacts = !contacts.is_empty();
        self.contacts = contacts;
    }
}

/// Codec and format details of one active channel.
#[cfg_attr(feature = "docs", derive(ToSchema))]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelCodecInfo {
    pub channel: String,
    pub read_codec: Option<String>,
    pub write_codec: Option<String>,
    pub read_format: Option<String>,
    pub write_format: Option<String>,
    pub native_formats: Vec<String>,
    pub sample_rate: u32,
    pub is_hd: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// RTP counters for one channel. `packet_loss_percent` is always present.
#[cfg_attr(feature = "docs", derive(ToSchema))]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RtpStats {
    pub channel: String,
    pub packets_sent: Option<u64>,
    pub packets_received: Option<u64>,
    pub packets_lost: Option<u64>,
    pub jitter: Option<f64>,
    pub rtt: Option<f64>,
    pub packet_loss_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct CodecSpec {
    name: &'static str,
    sample_rate: u32,
    hd: bool,
}

const CODECS: &[CodecSpec] = &[
    CodecSpec { name: "ulaw", sample_rate: 8_000, hd: false },
    CodecSpec { name: "alaw", sample_rate: 8_000, hd: false },
    CodecSpec { name: "gsm", sample_rate: 8_000, hd: false },
    CodecSpec { name: "g729", sample_rate: 8_000, hd: false },
    CodecSpec { name: "g723", sample_rate: 8_000, hd: false },
    CodecSpec { name: "g726", sample_rate: 8_000, hd: false },
    CodecSpec { name: "g726aal2", sample_rate: 8_000, hd: false },
    CodecSpec { name: "ilbc", sample_rate: 8_000, hd: false },
    CodecSpec { name: "lpc10", sample_rate: 8_000, hd: false },
    CodecSpec { name: "adpcm", sample_rate: 8_000, hd: false },
    CodecSpec { name: "speex", sample_rate: 8_000, hd: false },
    CodecSpec { name: "slin", sample_rate: 8_000, hd: false },
    CodecSpec { name: "g722", sample_rate: 16_000, hd: true },
    CodecSpec { name: "siren7", sample_rate: 16_000, hd: true },
    CodecSpec { name: "speex16", sample_rate: 16_000, hd: true },
    CodecSpec { name: "slin16", sample_rate: 16_000, hd: true },
    CodecSpec { name: "siren14", sample_rate: 32_000, hd: true },
    CodecSpec { name: "speex32", sample_rate: 32_000, hd: true },
    CodecSpec { name: "slin32", sample_rate: 32_000, hd: true },
    CodecSpec { name: "g719", sample_rate: 48_000, hd: true },
    CodecSpec { name: "slin48", sample_rate: 48_000, hd: true },
    CodecSpec { name: "opus", sample_rate: 48_000, hd: true },
];

const NARROWBAND_RATE: u32 = 8_000;

/// Canonical codec id for a codec or format string (`PCMU`, `G.722`, `0x4 (ulaw)`).
pub fn canonical_codec(text: &str) -> Option<String> {
    let inner = match (text.find('('), text.rfind(')')) {
        (Some(open), Some(close)) if close > open => &text[open + 1..close],
        _ => text,
    };
    let token = inner
        .split(|c: char| c == '|' || c == ',' || c.is_whitespace())
        .find(|t| !t.is_empty())?;
    let id: String = token
        .chars()
        .filter(|c| !matches!(c, '.' | '-' | '_'))
        .flat_map(char::to_lowercase)
        .collect();
    let id = match id.as_str() {
        "pcmu" | "g711u" | "g711ulaw" => "ulaw".to_string(),
        "pcma" | "g711a" | "g711alaw" => "alaw".to_string(),
        "nothing" | "none" => return None,
        _ => id,
    };
    Some(id)
}

/// Sample rate and HD flag for a canonical codec id; unknown codecs are narrowband.
pub fn codec_profile(codec: &str) -> (u32, bool) {
    CODECS
        .iter()
        .find(|spec| spec.name == codec)
        .map(|spec| (spec.sample_rate, spec.hd))
        .unwrap_or((NARROWBAND_RATE, false))
}

/// `Key: value` pairs from AMI-style text. Keys containing spaces are skipped.
fn ami_pairs(text: &str) -> impl Iterator<Item = (&str, &str)> {
    text.lines().filter_map(|line| {
        let (key, value) = line.split_once(':')?;
        let key = key.trim();
        if key.is_empty() || key.contains(' ') {
            return None;
        }
        Some((key, value.trim()))
    })
}

fn first_value<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    ami_pairs(text)
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

/// Split a comma-joined contact list, dropping empty entries and `aor/` prefixes.
fn split_contacts(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(|c| match c.split_once('/') {
            Some((aor, uri)) if !aor.contains(':') => uri.to_string(),
            _ => c.to_string(),
        })
        .collect()
}

/// IP (or host) and port out of a `sip:user@host:port` contact.
pub fn contact_address(contact: &str) -> Option<(String, Option<u16>)> {
    let captures = CONTACT_ADDRESS.captures(contact)?;
    let host = captures.get(1)?.as_str().to_string();
    let port = captures.get(2).and_then(|p| p.as_str().parse().ok());
    Some((host, port))
}

fn split_codecs(value: &str) -> Vec<String> {
    let mut codecs: Vec<String> = Vec::new();
    for token in value.split(|c: char| matches!(c, '|' | ',' | '(' | ')') || c.is_whitespace()) {
        let token = token.trim().to_ascii_lowercase();
        if token.is_empty() || token == "!all" || token == "all" || token.starts_with('!') {
            continue;
        }
        if !codecs.contains(&token) {
            codecs.push(token);
        }
    }
    codecs
}

fn parse_number(value: &str) -> Option<f64> {
    LEADING_NUMBER
        .find(value.trim())
        .and_then(|m| m.as_str().parse().ok())
}

/// Endpoint status from a `PJSIPShowEndpoint` response or any `Key: value` block.
pub fn extract_endpoint_ami(name: &str, text: &str) -> EndpointStatus {
    let mut status = EndpointStatus::new(name);

    if let Some(state) = first_value(text, "DeviceState") {
        status.apply_device_state(state);
    }

    let contacts: Vec<String> = ami_pairs(text)
        .filter(|(k, _)| k.eq_ignore_ascii_case("Contacts"))
        .flat_map(|(_, v)| split_contacts(v))
        .collect();
    status.apply_contacts(contacts);

    if let Some(codecs) = first_value(text, "Allow").or_else(|| first_value(text, "Codecs")) {
        status.codecs = split_codecs(codecs);
    }

    status.last_qualify_ms = ami_pairs(text)
        .find(|(k, v)| k.eq_ignore_ascii_case("RoundtripUsec") && parse_number(v).is_some())
        .and_then(|(_, v)| parse_number(v))
        .map(|usec| usec / 1000.0);

    status
}

/// One record per `ObjectName:` marker of a `PJSIPShowEndpoints` listing.
///
/// A record is closed only when the next marker or the end of input is reached.
pub fn extract_endpoints_ami(text: &str) -> Vec<EndpointStatus> {
    let mut records = Vec::new();
    let mut current: Option<(String, String)> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(object) = trimmed.strip_prefix("ObjectName:") {
            if let Some((name, block)) = current.take() {
                records.push(extract_endpoint_ami(&name, &block));
            }
            current = Some((object.trim().to_string(), String::new()));
            continue;
        }
        if let Some((_, block)) = current.as_mut() {
            block.push_str(trimmed);
            block.push('\n');
        }
    }
    if let Some((name, block)) = current {
        records.push(extract_endpoint_ami(&name, &block));
    }
    records
}

/// Endpoint status from `pjsip show endpoint <name>` output.
///
/// Contacts come only from a `Contacts:` line; the `Contact:` rows of the table
/// contribute the qualify round trip time.
pub fn extract_endpoint_cli(name: &str, text: &str) -> EndpointStatus {
    let mut status = EndpointStatus::new(name);

    if text.contains("Unable to find object") {
        status.status = EndpointState::Error;
        status.error = Some(format!("endpoint '{name}' not found"));
        return status;
    }

    let mut device_state = None;
    let mut contacts = Vec::new();

    for line in text.lines() {
        if line.contains('<') {
            continue;
        }
        if let Some(captures) = CLI_ENDPOINT_ROW.captures(line) {
            if device_state.is_none() {
                device_state = Some(captures[2].trim().to_string());
            }
            continue;
        }
        if let Some(captures) = CLI_CONTACT_ROW.captures(line) {
            if status.last_qualify_ms.is_none() {
                status.last_qualify_ms = parse_number(&captures[4]);
            }
            continue;
        }

        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.eq_ignore_ascii_case("Contacts") {
            contacts.extend(split_contacts(value));
        } else if key.eq_ignore_ascii_case("DeviceState") && device_state.is_none() {
            device_state = Some(value.to_string());
        } else if (key.eq_ignore_ascii_case("allow") || key.eq_ignore_ascii_case("codecs"))
            && status.codecs.is_empty()
        {
            status.codecs = split_codecs(value);
        }
    }

    if let Some(state) = device_state {
        status.apply_device_state(&state);
    }
    status.apply_contacts(contacts);
    status
}

/// One `Contact:` row of a `pjsip show aor|endpoint|contacts` table.
#[derive(Debug, Clone, PartialEq)]
pub struct CliContact {
    pub uri: String,
    pub status: String,
    pub rtt_ms: Option<f64>,
}

/// Contact rows with a SIP URI; table headers are skipped.
pub fn cli_contact_rows(text: &str) -> Vec<CliContact> {
    text.lines()
        .filter(|line| !line.contains('<'))
        .filter_map(|line| CLI_CONTACT_ROW.captures(line))
        .filter_map(|captures| {
            let uri = split_contacts(&captures[1]).into_iter().next()?;
            if !uri.starts_with("sip:") && !uri.starts_with("sips:") {
                return None;
            }
            Some(CliContact {
                uri,
                status: captures[3].to_string(),
                rtt_ms: parse_number(&captures[4]),
            })
        })
        .collect()
}

/// Reconcile AMI and CLI views of the same endpoint.
///
/// The AMI record wins whenever the PBX answered through it; CLI values only fill
/// fields the AMI record left empty. When AMI did not answer, an answered CLI
/// record is used instead. When neither answered, the AMI record (with its error)
/// is returned.
pub fn merge_endpoint(ami: EndpointStatus, cli: Option<EndpointStatus>) -> EndpointStatus {
    let Some(cli) = cli else {
        return ami;
    };
    let (mut primary, secondary) = if ami.status.is_answered() || !cli.status.is_answered() {
        (ami, cli)
    } else {
        (cli, ami)
    };

    if primary.contacts.is_empty() && !secondary.contacts.is_empty() {
        primary.contacts = secondary.contacts.clone();
    }
    if primary.ip_address.is_none() {
        primary.ip_address = secondary.ip_address.clone();
        primary.port = secondary.port;
    }
    if primary.codecs.is_empty() {
        primary.codecs = secondary.codecs.clone();
    }
    if primary.last_qualify_ms.is_none() {
        primary.last_qualify_ms = secondary.last_qualify_ms;
    }
    primary.has_contacts = !primary.contacts.is_empty();
    primary
}

/// Codec details from `core show channel <name>` output.
pub fn extract_channel_codecs(channel: &str, text: &str) -> ChannelCodecInfo {
    let field = |key: &str| first_value(text, key).map(str::to_string);

    let read_format = field("ReadFormat");
    let write_format = field("WriteFormat");
    let native_formats = field("NativeFormats")
        .or_else(|| field("NativeFormat"))
        .map(|v| split_codecs(&v))
        .unwrap_or_default();

    let read_codec = read_format.as_deref().and_then(canonical_codec);
    let write_codec = write_format.as_deref().and_then(canonical_codec);

    let reference = read_codec
        .as_deref()
        .or(write_codec.as_deref())
        .or(native_formats.first().map(String::as_str));
    let (sample_rate, is_hd) = reference
        .map(codec_profile)
        .unwrap_or((NARROWBAND_RATE, false));

    ChannelCodecInfo {
        channel: channel.to_string(),
        read_codec,
        write_codec,
        read_format,
        write_format,
        native_formats,
        sample_rate,
        is_hd,
        error: None,
    }
}

/// Value of a `Label: number` line, matching labels case- and spacing-insensitively.
fn labelled_number(text: &str, labels: &[&str]) -> Option<f64> {
    text.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        let key = key.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_lowercase();
        if labels.iter().any(|l| *l == key) {
            parse_number(value)
        } else {
            None
        }
    })
}

/// RTP counters from `rtp show stats` style output.
pub fn extract_rtp_stats(channel: &str, text: &str) -> RtpStats {
    let count = |labels: &[&str]| labelled_number(text, labels).map(|n| n.max(0.0) as u64);

    let packets_sent = count(&["packets sent", "sent packets", "txcount"]);
    let packets_received = count(&["packets received", "received packets", "rxcount"]);
    let packets_lost = count(&["packets lost", "lost packets", "rxploss"]);
    let jitter = labelled_number(text, &["jitter", "rxjitter"]);
    let rtt = labelled_number(text, &["rtt", "round trip time"]);

    RtpStats {
        channel: channel.to_string(),
        packets_sent,
        packets_received,
        packets_lost,
        jitter,
        rtt,
        packet_loss_percent: packet_loss_percent(
            packets_received.unwrap_or(0),
            packets_lost.unwrap_or(0),
        ),
        error: None,
    }
}

/// `lost / (received + lost) * 100`, rounded to two decimals; 0 when nothing was seen.
pub fn packet_loss_percent(received: u64, lost: u64) -> f64 {
    let total = received as f64 + lost as f64;
    if total == 0.0 {
        return 0.0;
    }
    let percent = lost as f64 / total * 100.0;
    (percent * 100.0).round() / 100.0
}
