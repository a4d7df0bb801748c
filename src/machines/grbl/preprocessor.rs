//! G-code machine: per-line transformer and modal-state mirror.
//!
//! Every G-code line passes through here before it is buffered or sent:
//! comment/unsupported-word cleanup, `#n` variable substitution, dynamic
//! feed override, spindle scaling, and fractionization of long linear moves
//! and arcs into short `G1` chords. The struct mirrors the firmware's modal
//! state (motion mode, distance mode, plane, feed) so those transforms are
//! pure functions of line + state.
//!
//! Events raised during a transform (feed change, undefined variable) are
//! queued internally and drained by the engine; the preprocessor holds no
//! reference back to it.

use super::event::Event;
use super::state::Position;
use std::collections::HashMap;
use std::f64::consts::PI;
use thiserror::Error;
use tracing::{debug, warn};

/// Linear moves shorter than this are not fractionized.
pub const DEFAULT_FRACT_LINEAR_THRESHOLD: f64 = 0.5;

/// Approximate segment length of fractionized linear moves.
pub const DEFAULT_FRACT_LINEAR_SEGMENT_LEN: f64 = 0.5;

/// Maximum chord deviation when approximating arcs.
pub const DEFAULT_ARC_TOLERANCE: f64 = 0.004;

/// Angular snap threshold distinguishing a full circle from a zero-length
/// arc.
const ARC_ANGULAR_TRAVEL_EPSILON: f64 = 5e-7;

const AXIS_LETTERS: [char; 3] = ['X', 'Y', 'Z'];

/// Comments with these prefixes survive `tidy()` for downstream
/// visualization; all other comments are stripped.
const PRESERVED_COMMENT_PREFIXES: [&str; 2] = [";_gerbil", "%_gerbil"];

/// G90 (absolute) or G91 (relative) interpretation of axis words.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistanceMode {
    Absolute,
    Relative,
}

/// Arc plane selection: G17 (XY), G18 (ZX), G19 (YZ).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaneMode {
    Xy,
    Zx,
    Yz,
}

impl PlaneMode {
    /// The two arc axes and the linear (helical) axis, as X=0/Y=1/Z=2
    /// indices.
    fn axes(self) -> (usize, usize, usize) {
        match self {
            PlaneMode::Xy => (0, 1, 2),
            PlaneMode::Zx => (2, 0, 1),
            PlaneMode::Yz => (1, 2, 0),
        }
    }
}

/// Geometry failures while converting an arc to chords. The offending line
/// is passed through unfractionized.
#[derive(Debug, Error)]
pub enum ArcError {
    #[error("arc has no radius (zero I/J offsets)")]
    ZeroRadius,
    #[error("arc endpoint unreachable with given radius")]
    UnreachableEndpoint,
    #[error("arc endpoints deviate from radius by {0:.4}")]
    EndpointMismatch(f64),
}

/// The G-code machine. One instance lives inside the streaming engine.
pub struct Preprocessor {
    /// The staged line (code part only; see [`Preprocessor::comment`]).
    pub line: String,
    /// Trailing `;`/`%` comment split off the staged line.
    pub comment: String,
    /// `#n` variables and their substitution values.
    pub vars: HashMap<String, Option<String>>,
    /// Coordinate system offsets mirrored from the firmware's `$#` report.
    pub cs_offsets: HashMap<String, Position>,
    /// When true, `override_feed()` rewrites `F` words to `request_feed`.
    pub do_feed_override: bool,
    /// The feed to inject while override is enabled (mm/min).
    pub request_feed: Option<f64>,
    pub do_fractionize_lines: bool,
    pub do_fractionize_arcs: bool,
    pub fract_linear_threshold: f64,
    pub fract_linear_segment_len: f64,
    pub arc_tolerance: f64,
    /// Multiplier applied to `S` words by `scale_spindle()`.
    pub spindle_factor: f64,
    /// Mirrored machine position (start point of the staged line).
    pub position_m: [f64; 3],

    feed_last: Option<f64>,
    motion_mode: Option<u8>,
    distance_mode: DistanceMode,
    plane_mode: PlaneMode,
    target: [f64; 3],
    offset: [f64; 3],
    radius: Option<f64>,
    feed_in_line: Option<f64>,
    spindle_in_line: Option<f64>,
    axes_in_line: [bool; 3],
    dist: f64,
    dists: [f64; 3],
    color_seed: u32,
    events: Vec<Event>,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Preprocessor {
    pub fn new() -> Self {
        Self {
            line: String::new(),
            comment: String::new(),
            vars: HashMap::new(),
            cs_offsets: HashMap::new(),
            do_feed_override: false,
            request_feed: None,
            do_fractionize_lines: false,
            do_fractionize_arcs: false,
            fract_linear_threshold: DEFAULT_FRACT_LINEAR_THRESHOLD,
            fract_linear_segment_len: DEFAULT_FRACT_LINEAR_SEGMENT_LEN,
            arc_tolerance: DEFAULT_ARC_TOLERANCE,
            spindle_factor: 1.0,
            position_m: [0.0; 3],
            feed_last: None,
            motion_mode: None,
            distance_mode: DistanceMode::Absolute,
            plane_mode: PlaneMode::Xy,
            target: [0.0; 3],
            offset: [0.0; 3],
            radius: None,
            feed_in_line: None,
            spindle_in_line: None,
            axes_in_line: [false; 3],
            dist: 0.0,
            dists: [0.0; 3],
            color_seed: 0x2F6E_2B1,
            events: Vec::new(),
        }
    }

    /// Stages a line for processing. Splits off any trailing `;`/`%`
    /// comment and resets per-line parse state.
    pub fn set_line(&mut self, line: &str) {
        let (code, comment) = split_comment(line);
        self.line = code.to_string();
        self.comment = comment.to_string();
        self.target = self.position_m;
        self.offset = [0.0; 3];
        self.radius = None;
        self.feed_in_line = None;
        self.spindle_in_line = None;
        self.axes_in_line = [false; 3];
        self.dist = 0.0;
        self.dists = [0.0; 3];
    }

    /// Removes leading/trailing whitespace and inner blanks for reduced
    /// serial bandwidth.
    pub fn strip(&mut self) {
        self.line = self.line.trim().replace(' ', "");
    }

    /// Removes comments and words Grbl does not support. Idempotent.
    ///
    /// Bracketed `(…)` comments are dropped from the code part; trailing
    /// comments survive only with a `;_gerbil`/`%_gerbil` prefix. Tool
    /// changes (`T…`, `M6`) and `#n=` variable assignments empty the line —
    /// anything else unsupported is left for the firmware to reject, so the
    /// user sees the error.
    pub fn tidy(&mut self) {
        self.line = strip_bracket_comments(&self.line);
        if !is_preserved_comment(&self.comment) {
            self.comment.clear();
        }
        if self.is_unsupported() {
            debug!("preprocessor: dropping unsupported line: {}", self.line);
            self.line.clear();
        }
    }

    fn is_unsupported(&self) -> bool {
        for (letter, value, _, _) in words_spanned(&self.line) {
            if letter == 'T' {
                return true;
            }
            if letter == 'M' && value == 6.0 {
                return true;
            }
        }
        is_var_assignment(&self.line)
    }

    /// Updates the modal mirror from the staged line and computes per-axis
    /// deltas and the travel distance.
    pub fn parse_state(&mut self) {
        for (letter, value, _, _) in words_spanned(&self.line) {
            match letter {
                'G' if value.fract() == 0.0 => match value as i64 {
                    0..=3 => self.motion_mode = Some(value as u8),
                    17 => self.plane_mode = PlaneMode::Xy,
                    18 => self.plane_mode = PlaneMode::Zx,
                    19 => self.plane_mode = PlaneMode::Yz,
                    90 => self.distance_mode = DistanceMode::Absolute,
                    91 => self.distance_mode = DistanceMode::Relative,
                    _ => {}
                },
                'X' | 'Y' | 'Z' => {
                    let i = AXIS_LETTERS.iter().position(|&a| a == letter).unwrap_or(0);
                    self.axes_in_line[i] = true;
                    self.target[i] = match self.distance_mode {
                        DistanceMode::Absolute => value,
                        DistanceMode::Relative => self.position_m[i] + value,
                    };
                }
                'I' => self.offset[0] = value,
                'J' => self.offset[1] = value,
                'K' => self.offset[2] = value,
                'R' => self.radius = Some(value),
                'F' => self.feed_in_line = Some(value),
                'S' => self.spindle_in_line = Some(value),
                _ => {}
            }
        }
        for i in 0..3 {
            self.dists[i] = self.target[i] - self.position_m[i];
        }
        self.dist =
            (self.dists[0].powi(2) + self.dists[1].powi(2) + self.dists[2].powi(2)).sqrt();
    }

    /// Registers every `#n` reference in the staged line with an unset
    /// value.
    pub fn find_vars(&mut self) {
        let bytes = self.line.as_bytes();
        for i in 0..bytes.len().saturating_sub(1) {
            if bytes[i] == b'#' && bytes[i + 1].is_ascii_digit() {
                let key = (bytes[i + 1] as char).to_string();
                self.vars.entry(key).or_insert(None);
            }
        }
    }

    /// Replaces each `#n` with its stored value. An unset variable empties
    /// the line and raises `on_preprocessor_var_undefined` — user error, the
    /// stream must stop.
    pub fn substitute_vars(&mut self) {
        if !self.line.contains('#') {
            return;
        }
        let bytes = self.line.clone();
        let bytes = bytes.as_bytes();
        let mut out = String::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'#' && i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() {
                let key = (bytes[i + 1] as char).to_string();
                match self.vars.get(&key) {
                    Some(Some(val)) => {
                        self.events.push(Event::Log {
                            message: format!("substituted var #{} -> {}", key, val),
                        });
                        out.push_str(val);
                        i += 2;
                    }
                    _ => {
                        self.line.clear();
                        self.events
                            .push(Event::PreprocessorVarUndefined { key });
                        return;
                    }
                }
            } else {
                out.push(bytes[i] as char);
                i += 1;
            }
        }
        self.line = out;
    }

    /// Reports feed changes, or rewrites the feed while override is active.
    ///
    /// Override off: an `F` word only raises `on_preprocessor_feed_change`
    /// when the value differs from the last one seen. Override on: any `F`
    /// word is stripped and `F<request>` appended whenever the requested
    /// feed differs from the last feed sent.
    pub fn override_feed(&mut self) {
        if !self.do_feed_override {
            if let Some(feed) = self.feed_in_line {
                if self.feed_last != Some(feed) {
                    self.events
                        .push(Event::PreprocessorFeedChange { feed });
                }
                self.feed_last = Some(feed);
            }
            return;
        }
        let Some(requested) = self.request_feed else {
            return;
        };
        if self.feed_in_line.is_some() {
            self.line = strip_feed_words(&self.line);
        }
        if self.feed_last != Some(requested) {
            self.line.push_str(&format!("F{:.1}", requested));
            self.feed_last = Some(requested);
            self.events.push(Event::Log {
                message: format!("overriding feed: {:.1}", requested),
            });
            self.events
                .push(Event::PreprocessorFeedChange { feed: requested });
        }
    }

    /// Scales `S` words by `spindle_factor`.
    pub fn scale_spindle(&mut self) {
        if (self.spindle_factor - 1.0).abs() < f64::EPSILON {
            return;
        }
        let mut out = String::with_capacity(self.line.len());
        let mut last = 0;
        for (letter, value, start, end) in words_spanned(&self.line) {
            if letter == 'S' {
                out.push_str(&self.line[last..start]);
                out.push('S');
                out.push_str(&fmt_coord(value * self.spindle_factor));
                last = end;
            }
        }
        out.push_str(&self.line[last..]);
        self.line = out;
    }

    /// Splits a physical line containing multiple commands into one line
    /// per command: a cut is made before each motion-group word (`G0`–`G3`)
    /// that follows an earlier word.
    pub fn split_lines(&self) -> Vec<String> {
        let spans = words_spanned(&self.line);
        let first_start = match spans.first() {
            Some(&(_, _, start, _)) => start,
            None => return vec![self.line.clone()],
        };
        let mut cuts = Vec::new();
        for &(letter, value, start, _) in &spans {
            if letter == 'G'
                && value.fract() == 0.0
                && (0.0..=3.0).contains(&value)
                && start != first_start
            {
                cuts.push(start);
            }
        }
        if cuts.is_empty() {
            return vec![self.line.clone()];
        }
        let mut out = Vec::with_capacity(cuts.len() + 1);
        let mut prev = 0;
        for cut in cuts {
            out.push(self.line[prev..cut].to_string());
            prev = cut;
        }
        out.push(self.line[prev..].to_string());
        out
    }

    /// Breaks the staged move into short `G1` segments when it is a long
    /// linear move or an arc. Returns the replacement lines (just the
    /// original line when nothing applies).
    pub fn fractionize(&mut self) -> Vec<String> {
        if self.do_fractionize_lines
            && self.motion_mode == Some(1)
            && self.dist > self.fract_linear_threshold
        {
            return self.fractionize_linear_motion();
        }
        if self.do_fractionize_arcs && matches!(self.motion_mode, Some(2) | Some(3)) {
            match self.fractionize_circular_motion() {
                Ok(lines) => return lines,
                Err(e) => {
                    warn!("preprocessor: arc not fractionized: {}", e);
                    return vec![self.line.clone()];
                }
            }
        }
        vec![self.line.clone()]
    }

    /// Equal-length segmentation of a linear move. The emitted block is
    /// bracketed with visualization sentinels; the first segment carries the
    /// modal words.
    fn fractionize_linear_motion(&mut self) -> Vec<String> {
        let num_fractions = ((self.dist / self.fract_linear_segment_len).floor() as usize).max(1);
        let (r, g, b) = self.next_color();
        let mut out = Vec::with_capacity(num_fractions + 4);
        out.push(format!(";_gerbil.line_begin:'{}'", self.line));
        out.push(format!(";_gerbil.color_begin[{:.2},{:.2},{:.2}]", r, g, b));
        for k in 0..num_fractions {
            let mut txt = String::new();
            if k == 0 {
                txt.push_str("G1");
                if let Some(s) = self.spindle_in_line {
                    txt.push('S');
                    txt.push_str(&fmt_coord(s));
                }
                if let Some(f) = self.feed_in_line {
                    txt.push('F');
                    txt.push_str(&fmt_coord(f));
                }
            }
            for i in 0..3 {
                if self.dists[i] == 0.0 {
                    continue;
                }
                let step = self.dists[i] / num_fractions as f64;
                let value = match self.distance_mode {
                    DistanceMode::Absolute => self.position_m[i] + (k as f64 + 1.0) * step,
                    DistanceMode::Relative => step,
                };
                txt.push(AXIS_LETTERS[i]);
                txt.push_str(&fmt_coord(value));
            }
            out.push(txt);
        }
        out.push(";_gerbil.color_end".to_string());
        out.push(";_gerbil.line_end".to_string());
        out
    }

    /// Chord approximation of the staged arc (G2/G3), following Grbl's own
    /// arc generator: solve the center, measure angular travel, then emit
    /// one `G1` per chord with the final chord landing exactly on the
    /// target. Relative blocks are emitted in G90 so chained chords cannot
    /// accumulate float drift, with the original distance mode restored at
    /// the end.
    fn fractionize_circular_motion(&mut self) -> Result<Vec<String>, ArcError> {
        let (axis_0, axis_1, axis_linear) = self.plane_mode.axes();
        let is_clockwise = self.motion_mode == Some(2);
        let position = self.position_m;
        let target = self.target;
        let mut offset = self.offset;

        if let Some(given) = self.radius {
            // Radius form: derive the center offset from the chord and R.
            let x = target[axis_0] - position[axis_0];
            let y = target[axis_1] - position[axis_1];
            let mut radius = given;
            let discriminant = 4.0 * radius * radius - x * x - y * y;
            if discriminant < 0.0 {
                return Err(ArcError::UnreachableEndpoint);
            }
            let mut h_x2_div_d = -discriminant.sqrt() / (x * x + y * y).sqrt();
            if !is_clockwise {
                h_x2_div_d = -h_x2_div_d;
            }
            if radius < 0.0 {
                h_x2_div_d = -h_x2_div_d;
                radius = -radius;
            }
            let _ = radius;
            offset[axis_0] = 0.5 * (x - y * h_x2_div_d);
            offset[axis_1] = 0.5 * (y + x * h_x2_div_d);
        }

        let radius = (offset[axis_0].powi(2) + offset[axis_1].powi(2)).sqrt();
        if radius == 0.0 {
            return Err(ArcError::ZeroRadius);
        }
        let center_0 = position[axis_0] + offset[axis_0];
        let center_1 = position[axis_1] + offset[axis_1];
        let rt_0 = target[axis_0] - center_0;
        let rt_1 = target[axis_1] - center_1;

        if self.radius.is_none() {
            // Offset form: the endpoint must sit on the circle.
            let target_r = (rt_0 * rt_0 + rt_1 * rt_1).sqrt();
            let deviation = (target_r - radius).abs();
            if deviation > 0.005 {
                if deviation > 0.5 || deviation > 0.001 * radius {
                    return Err(ArcError::EndpointMismatch(deviation));
                }
                warn!(
                    "preprocessor: arc endpoints deviate from radius by {:.4}",
                    deviation
                );
            }
        }

        let r_0 = -offset[axis_0];
        let r_1 = -offset[axis_1];
        let mut angular_travel = (r_0 * rt_1 - r_1 * rt_0).atan2(r_0 * rt_0 + r_1 * rt_1);
        if is_clockwise {
            if angular_travel >= -ARC_ANGULAR_TRAVEL_EPSILON {
                angular_travel -= 2.0 * PI;
            }
        } else if angular_travel <= ARC_ANGULAR_TRAVEL_EPSILON {
            angular_travel += 2.0 * PI;
        }

        let segments = ((0.5 * angular_travel * radius).abs()
            / (self.arc_tolerance * (2.0 * radius - self.arc_tolerance)).sqrt())
        .floor() as usize;

        let mut out = Vec::with_capacity(segments + 4);
        out.push(format!(";_gerbil.arc_begin[{}]", self.line));
        if self.distance_mode == DistanceMode::Relative {
            out.push("G90".to_string());
        }

        let mut current = position;
        let mut first = true;
        if segments > 1 {
            let theta_per_segment = angular_travel / segments as f64;
            let linear_per_segment =
                (target[axis_linear] - position[axis_linear]) / segments as f64;
            for i in 1..segments {
                let theta = theta_per_segment * i as f64;
                let (sin_t, cos_t) = theta.sin_cos();
                let mut next = current;
                next[axis_0] = center_0 + r_0 * cos_t - r_1 * sin_t;
                next[axis_1] = center_1 + r_0 * sin_t + r_1 * cos_t;
                next[axis_linear] = position[axis_linear] + linear_per_segment * i as f64;
                out.push(self.chord_line(&current, &next, first));
                current = next;
                first = false;
            }
        }
        out.push(self.chord_line(&current, &target, first));

        if self.distance_mode == DistanceMode::Relative {
            out.push("G91".to_string());
        }
        out.push(";_gerbil.arc_end".to_string());
        Ok(out)
    }

    /// Formats one chord. The first chord carries `G1` and the modal
    /// spindle/feed; later chords only carry the axis words that changed.
    fn chord_line(&self, from: &[f64; 3], to: &[f64; 3], first: bool) -> String {
        let mut txt = String::new();
        if first {
            txt.push_str("G1");
            if let Some(s) = self.spindle_in_line {
                txt.push('S');
                txt.push_str(&fmt_coord(s));
            }
            if let Some(f) = self.feed_in_line {
                txt.push('F');
                txt.push_str(&fmt_coord(f));
            }
        }
        for i in 0..3 {
            if (to[i] - from[i]).abs() > 1e-9 {
                txt.push(AXIS_LETTERS[i]);
                txt.push_str(&fmt_coord(to[i]));
            }
        }
        txt
    }

    /// Commits the staged target to the mirrored position and expires
    /// non-modal motion modes (G2/G3 do not persist here; G0/G1 stay
    /// modal).
    pub fn done(&mut self) {
        for i in 0..3 {
            if self.axes_in_line[i] {
                self.position_m[i] = self.target[i];
            }
        }
        if !matches!(self.motion_mode, Some(0) | Some(1)) {
            self.motion_mode = None;
        }
    }

    /// Starts a new job: variables do not carry over, modal state does.
    pub fn job_new(&mut self) {
        self.vars.clear();
    }

    /// Mimics Grbl's modal state right after boot. The firmware's feed is
    /// unset at that point.
    pub fn onboot_init(&mut self) {
        self.motion_mode = None;
        self.distance_mode = DistanceMode::Absolute;
        self.plane_mode = PlaneMode::Xy;
        self.feed_last = Some(0.0);
        self.events
            .push(Event::PreprocessorFeedChange { feed: 0.0 });
    }

    /// Full reset: boot state plus cleared position, variables and staged
    /// line.
    pub fn reset(&mut self) {
        self.onboot_init();
        self.position_m = [0.0; 3];
        self.target = [0.0; 3];
        self.vars.clear();
        self.line.clear();
        self.comment.clear();
    }

    /// Re-anchors the mirrored position (e.g. from a machine status
    /// report). The staged target follows so stale deltas cannot survive.
    pub fn set_position(&mut self, position: [f64; 3]) {
        self.position_m = position;
        self.target = position;
    }

    /// Drains the events queued by the transforms since the last call.
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    fn next_channel(&mut self) -> f64 {
        self.color_seed = self
            .color_seed
            .wrapping_mul(1_664_525)
            .wrapping_add(1_013_904_223);
        (self.color_seed >> 8) as f64 / (1u32 << 24) as f64
    }

    /// Visualization color for the next fractionized block. Colors only
    /// need to differ between blocks; an LCG keeps them reproducible.
    fn next_color(&mut self) -> (f64, f64, f64) {
        (
            self.next_channel(),
            self.next_channel(),
            self.next_channel(),
        )
    }
}

/// True for comments that survive `tidy()` and stay visible to downstream
/// visualization.
pub fn is_preserved_comment(comment: &str) -> bool {
    PRESERVED_COMMENT_PREFIXES
        .iter()
        .any(|prefix| comment.starts_with(prefix))
}

/// Splits a raw line into its code part and the trailing `;`/`%` comment
/// (delimiter included in the comment).
fn split_comment(line: &str) -> (&str, &str) {
    match line.find(|c| c == ';' || c == '%') {
        Some(i) => (&line[..i], &line[i..]),
        None => (line, ""),
    }
}

/// Removes `(…)` comment groups. An unterminated group runs to end of line.
fn strip_bracket_comments(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut depth = 0usize;
    for c in line.chars() {
        match c {
            '(' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

/// True for `#n=…` variable assignment lines (unsupported by Grbl).
fn is_var_assignment(line: &str) -> bool {
    let bytes = line.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] == b'#'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_digit()
            && bytes[i + 2] == b'='
        {
            return true;
        }
    }
    false
}

/// Removes every `F<number>` word.
fn strip_feed_words(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut last = 0;
    for (letter, _, start, end) in words_spanned(line) {
        if letter == 'F' {
            out.push_str(&line[last..start]);
            last = end;
        }
    }
    out.push_str(&line[last..]);
    out
}

/// Scans `letter + signed decimal` words, returning
/// `(uppercased letter, value, start, end)` byte spans. Letters without a
/// parseable number (e.g. `X#1` before substitution) are skipped.
fn words_spanned(line: &str) -> Vec<(char, f64, usize, usize)> {
    let bytes = line.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_alphabetic() {
            let num_start = i + 1;
            let mut j = num_start;
            while j < bytes.len()
                && (bytes[j] == b'-'
                    || bytes[j] == b'+'
                    || bytes[j] == b'.'
                    || bytes[j].is_ascii_digit())
            {
                j += 1;
            }
            if j > num_start {
                if let Ok(value) = line[num_start..j].parse::<f64>() {
                    out.push((c.to_ascii_uppercase(), value, i, j));
                    i = j;
                    continue;
                }
            }
        }
        i += 1;
    }
    out
}

/// 3-decimal formatting with trailing zeros and a trailing dot trimmed.
fn fmt_coord(value: f64) -> String {
    let s = format!("{:.3}", value);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" {
        "0".to_string()
    } else {
        s.to_string()
    }
}
