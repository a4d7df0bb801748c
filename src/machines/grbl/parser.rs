//! Pure parsing for Grbl response lines.
//!
//! No async, no I/O — only string/line parsing. The streaming engine's
//! dispatcher classifies every inbound line with [`classify`] and acts on
//! the resulting [`GrblLine`].

use super::state::{AlarmCode, HoldReason, MachineState, Position, Setting};
use thiserror::Error;

/// Errors produced when parsing Grbl response strings.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid status line: {0}")]
    InvalidStatus(String),
    #[error("invalid position: {0}")]
    InvalidPosition(String),
    #[error("invalid parser state line: {0}")]
    InvalidParserState(String),
    #[error("invalid hash state line: {0}")]
    InvalidHashState(String),
    #[error("invalid settings line: {0}")]
    InvalidSettingsLine(String),
    #[error("invalid alarm message: {0}")]
    InvalidAlarm(String),
}

/// A status report parsed from `<…>`. Either position may be absent in the
/// v1.1 form (Grbl reports MPos or WPos depending on `$10`).
#[derive(Clone, Debug, PartialEq)]
pub struct StatusReport {
    pub mode: MachineState,
    pub mpos: Option<Position>,
    pub wpos: Option<Position>,
}

/// One inbound line, classified the way the dispatcher consumes it.
#[derive(Clone, Debug, PartialEq)]
pub enum GrblLine {
    /// `ok` acknowledgment.
    Ok,
    /// `<…>` status report.
    Status(StatusReport),
    /// `[G0 G54 …]` or `[GC:G0 G54 …]` parser state (12 fields).
    ParserState(Vec<String>),
    /// `[KEY:v1,v2,v3]` hash state entry.
    HashState { key: String, position: Position },
    /// `$k=v (cmt)` settings echo.
    Setting { key: u32, setting: Setting },
    /// `ALARM:…` line (raw).
    Alarm(String),
    /// `error:…` line (raw).
    Error(String),
    /// `Grbl <version> …` boot banner (raw).
    Boot(String),
    /// `[MSG:…]` informational line (raw).
    Msg(String),
    /// A recognized form that failed to parse; carries the reason.
    Malformed { raw: String, reason: String },
    /// Anything else (raw).
    Other(String),
}

/// Classifies a single inbound line. Follows the dispatch order the engine
/// relies on: status, ack, parser state, messages, hash state, alarm, error,
/// boot banner, settings echo, everything else.
pub fn classify(line: &str) -> GrblLine {
    let line = line.trim();
    if line.starts_with('<') {
        return match parse_status(line) {
            Ok(report) => GrblLine::Status(report),
            Err(e) => GrblLine::Malformed {
                raw: line.to_string(),
                reason: e.to_string(),
            },
        };
    }
    if line == "ok" {
        return GrblLine::Ok;
    }
    if is_parser_state_line(line) {
        return match parse_parser_state(line) {
            Ok(fields) => GrblLine::ParserState(fields),
            Err(e) => GrblLine::Malformed {
                raw: line.to_string(),
                reason: e.to_string(),
            },
        };
    }
    if line.starts_with("[MSG:") {
        return GrblLine::Msg(line.to_string());
    }
    if line.starts_with('[') && line.contains(':') {
        return match parse_hash_state(line) {
            Ok((key, position)) => GrblLine::HashState { key, position },
            Err(e) => GrblLine::Malformed {
                raw: line.to_string(),
                reason: e.to_string(),
            },
        };
    }
    if line.contains("ALARM") {
        return GrblLine::Alarm(line.to_string());
    }
    if line.contains("error") {
        return GrblLine::Error(line.to_string());
    }
    if line.contains("Grbl ") {
        return GrblLine::Boot(line.to_string());
    }
    if line.starts_with('$') && line.contains('=') {
        return match parse_setting(line) {
            Ok((key, setting)) => GrblLine::Setting { key, setting },
            Err(e) => GrblLine::Malformed {
                raw: line.to_string(),
                reason: e.to_string(),
            },
        };
    }
    GrblLine::Other(line.to_string())
}

/// `[G<d> …` with a motion-mode digit is a `$G` report; `[G54:…` is hash
/// state. Grbl 1.1 prefixes the report with `GC:`.
fn is_parser_state_line(line: &str) -> bool {
    if line.starts_with("[GC:") {
        return true;
    }
    let bytes = line.as_bytes();
    bytes.len() >= 4
        && bytes.starts_with(b"[G")
        && (b'0'..=b'3').contains(&bytes[2])
        && bytes[3] == b' '
}

/// Parses a real-time status line (response to `?`).
///
/// The v1.1 form `<Mode|MPos:x,y,z|…>` / `<Mode|WPos:x,y,z|…>` is attempted
/// first; the v0.9 form `<Mode,MPos:x,y,z,WPos:x,y,z>` is the fallback.
pub fn parse_status(line: &str) -> Result<StatusReport, ParseError> {
    let s = line.trim();
    let s = s.strip_prefix('<').unwrap_or(s);
    let s = s.strip_suffix('>').unwrap_or(s);

    if s.contains('|') {
        let mut parts = s.split('|');
        let mode_token = parts.next().unwrap_or("").trim();
        if mode_token.is_empty() {
            return Err(ParseError::InvalidStatus("empty mode".into()));
        }
        let mode = parse_mode(mode_token);
        let mut mpos = None;
        let mut wpos = None;
        for part in parts {
            let part = part.trim();
            if let Some(pos_str) = part.strip_prefix("MPos:") {
                mpos = Some(parse_position(pos_str)?);
            } else if let Some(pos_str) = part.strip_prefix("WPos:") {
                wpos = Some(parse_position(pos_str)?);
            }
        }
        if mpos.is_none() && wpos.is_none() {
            return Err(ParseError::InvalidStatus(format!(
                "neither MPos nor WPos in: {}",
                line
            )));
        }
        return Ok(StatusReport { mode, mpos, wpos });
    }

    // v0.9: <Idle,MPos:0.000,3.000,0.000,WPos:0.000,3.000,0.000>
    let (mode_token, rest) = s
        .split_once(",MPos:")
        .ok_or_else(|| ParseError::InvalidStatus(format!("no MPos in: {}", line)))?;
    let (mpos_str, wpos_str) = rest
        .split_once(",WPos:")
        .ok_or_else(|| ParseError::InvalidStatus(format!("no WPos in: {}", line)))?;
    Ok(StatusReport {
        mode: parse_mode(mode_token.trim()),
        mpos: Some(parse_position(mpos_str)?),
        wpos: Some(parse_position(wpos_str)?),
    })
}

/// Parses the mode token (first status segment). Grbl modes: Idle, Run,
/// Hold, Jog, Alarm, Door, Check, Home, Sleep; v1.1 appends substates
/// (`Hold:0`, `Door:3`).
fn parse_mode(s: &str) -> MachineState {
    let (base, rest) = match s.find(':') {
        Some(i) => (&s[..i], Some(&s[i + 1..])),
        None => (s, None),
    };
    match base.trim() {
        "Idle" => MachineState::Idle,
        "Run" => MachineState::Run,
        "Hold" => MachineState::Hold(HoldReason::FeedHold),
        "Jog" => MachineState::Jog,
        "Alarm" => {
            let code = rest
                .and_then(|r| r.trim().parse::<u8>().ok())
                .map(AlarmCode::from);
            MachineState::Alarm(code)
        }
        "Door" => MachineState::Door,
        "Check" => MachineState::Check,
        "Home" => MachineState::Home,
        "Sleep" => MachineState::Sleep,
        _ => MachineState::Unknown(s.to_string()),
    }
}

/// Parses "x,y,z" into a Position. Extra fields (e.g. a 4th axis) are
/// ignored.
fn parse_position(s: &str) -> Result<Position, ParseError> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    if parts.len() < 3 {
        return Err(ParseError::InvalidPosition(format!(
            "expected at least x,y,z, got: {}",
            s
        )));
    }
    let mut coords = [0.0_f64; 3];
    for (i, part) in parts.iter().take(3).enumerate() {
        coords[i] = part
            .parse()
            .map_err(|_| ParseError::InvalidPosition(format!("invalid coordinate: {}", part)))?;
    }
    Ok(Position::from(coords))
}

/// Parses a `$G` report: `[G0 G54 G17 G21 G90 G94 M0 M5 M9 T0 F0. S0.]`
/// (v1.1 wraps it as `[GC:…]`). Returns the 12 value strings with their
/// word letters stripped.
pub fn parse_parser_state(line: &str) -> Result<Vec<String>, ParseError> {
    let s = line.trim();
    let s = s.strip_prefix('[').unwrap_or(s);
    let s = s.strip_suffix(']').unwrap_or(s);
    let s = s.strip_prefix("GC:").unwrap_or(s);
    let fields: Vec<String> = s
        .split_whitespace()
        .map(|tok| tok.get(1..).unwrap_or("").to_string())
        .collect();
    if fields.len() != 12 {
        return Err(ParseError::InvalidParserState(format!(
            "expected 12 fields, got {} in: {}",
            fields.len(),
            line
        )));
    }
    Ok(fields)
}

/// Parses one hash state entry: `[G54:0.000,0.000,0.000]`, `[TLO:0.000]`,
/// `[PRB:0.000,0.000,0.000:1]`. Scalar entries are zero-padded to three
/// values; the probe's trailing success flag is ignored.
pub fn parse_hash_state(line: &str) -> Result<(String, Position), ParseError> {
    let s = line.trim();
    let s = s.strip_prefix('[').unwrap_or(s);
    let s = s.strip_suffix(']').unwrap_or(s);
    let (key, rest) = s
        .split_once(':')
        .ok_or_else(|| ParseError::InvalidHashState(line.to_string()))?;
    let values = rest.split(':').next().unwrap_or(rest);
    let mut coords = [0.0_f64; 3];
    for (i, part) in values.split(',').take(3).enumerate() {
        coords[i] = part
            .trim()
            .parse()
            .map_err(|_| ParseError::InvalidHashState(format!("bad value {} in: {}", part, line)))?;
    }
    Ok((key.to_string(), Position::from(coords)))
}

/// Parses a settings echo: `$13=0 (report inches, bool)` (v0.9) or the
/// comment-less `$13=0` (v1.1).
pub fn parse_setting(line: &str) -> Result<(u32, Setting), ParseError> {
    let s = line.trim();
    let rest = s
        .strip_prefix('$')
        .ok_or_else(|| ParseError::InvalidSettingsLine(line.to_string()))?;
    let (key_str, value_part) = rest
        .split_once('=')
        .ok_or_else(|| ParseError::InvalidSettingsLine(line.to_string()))?;
    let key: u32 = key_str
        .trim()
        .parse()
        .map_err(|_| ParseError::InvalidSettingsLine(format!("bad key in: {}", line)))?;
    let (val, cmt) = match value_part.split_once(" (") {
        Some((val, cmt)) => (val.trim(), cmt.trim_end_matches(')').trim()),
        None => (value_part.trim(), ""),
    };
    Ok((
        key,
        Setting {
            val: val.to_string(),
            cmt: cmt.to_string(),
        },
    ))
}

/// Extracts the numeric alarm code from an `ALARM:n` line, if present.
pub fn parse_alarm_code(line: &str) -> Result<AlarmCode, ParseError> {
    let s = line.trim();
    let num_str = s
        .strip_prefix("ALARM:")
        .map(str::trim)
        .ok_or_else(|| ParseError::InvalidAlarm(s.to_string()))?;
    let n: u8 = num_str
        .parse()
        .map_err(|_| ParseError::InvalidAlarm(s.to_string()))?;
    Ok(AlarmCode::from(n))
}
