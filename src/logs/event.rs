//! Asterisk log lines as structured events.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;
#[cfg(feature = "docs")]
use utoipa::ToSchema;

/// `[timestamp] LEVEL[pid][C-call] source: message`; the call tag is optional.
static LOG_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[([^\]]+)\]\s+([A-Za-z]+)\[(\d+)\](?:\[([^\]]+)\])?\s+([^:]+?):\s?(.*)$")
        .expect("log line regex")
});

/// Priority used when a level is not recognized.
pub const DEFAULT_PRIORITY: u8 = 5;

#[cfg_attr(feature = "docs", derive(ToSchema))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warning,
    Notice,
    Info,
    Verbose,
    Dtmf,
    Security,
    Debug,
}

impl LogLevel {
    /// Lower is more severe.
    pub fn priority(self) -> u8 {
        match self {
            LogLevel::Error => 1,
            LogLevel::Warning => 2,
            LogLevel::Notice => 3,
            LogLevel::Info => 4,
            LogLevel::Verbose => DEFAULT_PRIORITY,
            LogLevel::Dtmf => 6,
            LogLevel::Security => 7,
            LogLevel::Debug => 8,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warning => "WARNING",
            LogLevel::Notice => "NOTICE",
            LogLevel::Info => "INFO",
            LogLevel::Verbose => "VERBOSE",
            LogLevel::Dtmf => "DTMF",
            LogLevel::Security => "SECURITY",
            LogLevel::Debug => "DEBUG",
        }
    }

    /// Case-insensitive; `None` for levels Asterisk does not define.
    pub fn parse(value: &str) -> Option<Self> {
        let level = match value.trim().to_ascii_uppercase().as_str() {
            "ERROR" => LogLevel::Error,
            "WARNING" | "WARN" => LogLevel::Warning,
            "NOTICE" => LogLevel::Notice,
            "INFO" => LogLevel::Info,
            "VERBOSE" => LogLevel::Verbose,
            "DTMF" => LogLevel::Dtmf,
            "SECURITY" => LogLevel::Security,
            "DEBUG" => LogLevel::Debug,
            _ => return None,
        };
        Some(level)
    }

    pub fn is_error(self) -> bool {
        matches!(self, LogLevel::Error | LogLevel::Warning)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg_attr(feature = "docs", derive(ToSchema))]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEvent {
    /// As written by Asterisk; the format depends on `dateformat` in `logger.conf`.
    pub timestamp: Option<String>,
    pub level: LogLevel,
    /// Thread/process id from `LEVEL[pid]`.
    pub process: Option<u32>,
    pub source: Option<String>,
    /// `C-xxxxxxxx` tag on call-scoped lines.
    pub call_id: Option<String>,
    pub message: String,
    pub raw: String,
    pub is_error: bool,
}

impl LogEvent {
    /// An event produced by the observer itself rather than read from the log.
    pub fn synthetic(level: LogLevel, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            timestamp: None,
            level,
            process: None,
            source: None,
            call_id: None,
            raw: message.clone(),
            message,
            is_error: level.is_error(),
        }
    }

    pub fn priority(&self) -> u8 {
        self.level.priority()
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{} {}: {}", self.level, source, self.message),
            None => write!(f, "{} {}", self.level, self.message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEventParser {
    verbosity: u8,
}

impl Default for LogEventParser {
    /// Everything except debug output.
    fn default() -> Self {
        Self::new(LogLevel::Security.priority())
    }
}

impl LogEventParser {
    pub fn new(verbosity: u8) -> Self {
        Self { verbosity }
    }

    pub fn verbosity(&self) -> u8 {
        self.verbosity
    }

    /// Never fails: a line that does not look like an Asterisk log line becomes
    /// a `verbose` event carrying the whole line as its message.
    pub fn parse_line(line: &str) -> LogEvent {
        let raw = line.trim_end_matches(['\r', '\n']).to_string();
        let Some(captures) = LOG_LINE.captures(&raw) else {
            return LogEvent {
                timestamp: None,
                level: LogLevel::Verbose,
                process: None,
                source: None,
                call_id: None,
                message: raw.clone(),
                raw,
                is_error: false,
            };
        };

        let level = LogLevel::parse(&captures[2]).unwrap_or(LogLevel::Verbose);
        LogEvent {
            timestamp: Some(captures[1].trim().to_string()),
            level,
            process: captures[3].parse().ok(),
            call_id: captures.get(4).map(|m| m.as_str().to_string()),
            source: Some(captures[5].trim().to_string()),
            message: captures[6].to_string(),
            is_error: level.is_error(),
            raw: raw.clone(),
        }
    }

    /// `None` when the event is more verbose than this parser lets through.
    pub fn filter(&self, event: LogEvent) -> Option<LogEvent> {
        (event.priority() <= self.verbosity).then_some(event)
    }

    pub fn parse_filtered(&self, line: &str) -> Option<LogEvent> {
        self.filter(Self::parse_line(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_line() {
        let event = LogEventParser::parse_line(
            "[2024-01-15 10:30:45.123] WARNING[12345] chan_pjsip.c: Endpoint 100 is unreachable\n",
        );
        assert_eq!(event.timestamp.as_deref(), Some("2024-01-15 10:30:45.123"));
        assert_eq!(event.level, LogLevel::Warning);
        assert_eq!(event.process, Some(12345));
        assert_eq!(event.source.as_deref(), Some("chan_pjsip.c"));
        assert_eq!(event.call_id, None);
        assert_eq!(event.message, "Endpoint 100 is unreachable");
        assert!(event.is_error);
        assert!(!event.raw.ends_with('\n'));
    }

    #[test]
    fn test_parse_call_scoped_line() {
        let event = LogEventParser::parse_line(
            "[Jan 15 10:30:45] VERBOSE[2201][C-0000000a] pbx.c: Executing [100@from-internal:1] Dial(\"PJSIP/200-00000012\", \"PJSIP/100,30\") in new stack",
        );
        assert_eq!(event.level, LogLevel::Verbose);
        assert_eq!(event.call_id.as_deref(), Some("C-0000000a"));
        assert_eq!(event.source.as_deref(), Some("pbx.c"));
        assert!(event.message.starts_with("Executing [100@from-internal:1]"));
        assert!(!event.is_error);
    }

    #[test]
    fn test_unparsable_line_is_kept() {
        let event = LogEventParser::parse_line("    -- Remote UNIX connection");
        assert_eq!(event.level, LogLevel::Verbose);
        assert_eq!(event.timestamp, None);
        assert_eq!(event.message, "    -- Remote UNIX connection");
        assert_eq!(event.raw, event.message);
    }

    #[test]
    fn test_unknown_level_defaults_to_verbose_priority() {
        let event = LogEventParser::parse_line("[2024-01-15 10:30:45] CDR[77] cdr.c: posted");
        assert_eq!(event.level, LogLevel::Verbose);
        assert_eq!(event.priority(), DEFAULT_PRIORITY);
        assert_eq!(event.process, Some(77));
    }

    #[test]
    fn test_priority_table() {
        let ordered = [
            LogLevel::Error,
            LogLevel::Warning,
            LogLevel::Notice,
            LogLevel::Info,
            LogLevel::Verbose,
            LogLevel::Dtmf,
            LogLevel::Security,
            LogLevel::Debug,
        ];
        for (index, level) in ordered.iter().enumerate() {
            assert_eq!(level.priority() as usize, index + 1);
            assert_eq!(LogLevel::parse(level.label()), Some(*level));
        }
    }

    #[test]
    fn test_verbosity_filter() {
        let parser = LogEventParser::new(3);
        assert!(parser
            .parse_filtered("[2024-01-15 10:30:45] NOTICE[1] manager.c: login")
            .is_some());
        assert!(parser
            .parse_filtered("[2024-01-15 10:30:45] INFO[1] loader.c: loaded")
            .is_none());
        assert!(parser.parse_filtered("plain text").is_none());
        assert!(LogEventParser::new(5).parse_filtered("plain text").is_some());
    }

    #[test]
    fn test_serializes_lowercase_level() {
        let event = LogEventParser::parse_line("[2024-01-15 10:30:45] ERROR[9] res_pjsip.c: boom");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["level"], "error");
        assert_eq!(json["is_error"], true);
    }

    #[test]
    fn test_reparse_raw_is_identical() {
        for line in [
            "[2024-01-15 10:30:45.123] WARNING[12345] chan_pjsip.c: Endpoint 100 is unreachable\r\n",
            "[Jan 15 10:30:45] VERBOSE[2201][C-0000000a] pbx.c: Executing [100@from-internal:1] Answer(\"PJSIP/100-00000001\", \"\")",
            "[2024-01-15 10:30:45] CDR[77] cdr.c: posted",
            "    -- Remote UNIX connection",
        ] {
            let event = LogEventParser::parse_line(line);
            assert_eq!(LogEventParser::parse_line(&event.raw), event, "{line}");
        }
    }

    #[test]
    fn test_debug_suppressed_at_default_verbosity() {
        let parser = LogEventParser::new(5);
        assert!(parser
            .parse_filtered("[2024-01-15 10:30:45] DEBUG[42] res_pjsip.c: transmitting")
            .is_none());
        assert!(parser
            .parse_filtered("[2024-01-15 10:30:45] VERBOSE[42] pbx.c: executing")
            .is_some());
        let error = LogEventParser::new(1)
            .parse_filtered("[2024-01-15 10:30:45] ERROR[42] res_pjsip.c: boom")
            .expect("errors pass at verbosity 1");
        assert_eq!(error.level, LogLevel::Error);
    }
}
