//! Grbl status report parsing
//!
//! Handles both report shapes:
//! - Grbl 0.9: `<Idle,MPos:0.000,0.000,0.000,WPos:0.000,0.000,0.000,Buf:0,RX:0>`
//! - Grbl 1.1: `<Idle|MPos:0.000,0.000,0.000|Bf:15,128|FS:0,0|WCO:0.000,0.000,0.000>`
//!
//! Position fields parse as floating point. When only MPos and WCO are
//! reported the work position is derived as `MPos - WCO`.

use gcodelink_core::{AxisPosition, DeviceStatus};
use regex::Regex;
use std::sync::LazyLock;

const NUM: &str = r"[-+]?\d*\.?\d+";

static STATUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<([A-Za-z]+(?::\d+)?)[,|]?(.*)>\s*$").expect("valid regex"));

static MPOS_RE: LazyLock<Regex> = LazyLock::new(|| coord_field("MPos"));
static WPOS_RE: LazyLock<Regex> = LazyLock::new(|| coord_field("WPos"));
static WCO_RE: LazyLock<Regex> = LazyLock::new(|| coord_field("WCO"));

static FS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"(?:^|[|,])FS:({NUM}),({NUM})")).expect("valid regex"));
static F_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"(?:^|[|,])F:({NUM})")).expect("valid regex"));
static BF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[|,])Bf:(\d+),(\d+)").expect("valid regex"));
static BUF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[|,])Buf:(\d+)").expect("valid regex"));
static RX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[|,])RX:(\d+)").expect("valid regex"));

fn coord_field(name: &str) -> Regex {
    Regex::new(&format!(r"(?:^|[|,]){name}:({NUM}(?:,{NUM})*)")).expect("valid regex")
}

/// True if `line` looks like a status report
pub fn is_status_report(line: &str) -> bool {
    STATUS_RE.is_match(line.trim())
}

/// Parse a status report, `None` if `line` is not one
pub fn parse_status(line: &str) -> Option<DeviceStatus> {
    let caps = STATUS_RE.captures(line.trim())?;
    let state = caps.get(1)?.as_str().to_string();
    let fields = caps.get(2).map(|m| m.as_str()).unwrap_or("");

    let machine_pos = position(&MPOS_RE, fields);
    let work_offset = position(&WCO_RE, fields);
    let work_pos = position(&WPOS_RE, fields).or_else(|| match (machine_pos, work_offset) {
        (Some(mpos), Some(wco)) => Some(mpos.minus(&wco)),
        _ => None,
    });

    let (feed_rate, spindle_speed) = match FS_RE.captures(fields) {
        Some(fs) => (number(fs.get(1)), number(fs.get(2))),
        None => (
            F_RE.captures(fields).and_then(|f| number(f.get(1))),
            None,
        ),
    };

    let (planner_blocks, rx_bytes) = match BF_RE.captures(fields) {
        Some(bf) => (integer(bf.get(1)), integer(bf.get(2))),
        None => (
            BUF_RE.captures(fields).and_then(|b| integer(b.get(1))),
            RX_RE.captures(fields).and_then(|r| integer(r.get(1))),
        ),
    };

    Some(DeviceStatus {
        state,
        machine_pos,
        work_pos,
        work_offset,
        feed_rate,
        spindle_speed,
        planner_blocks,
        rx_bytes,
        buffer_usage: 0.0,
    })
}

fn position(re: &Regex, fields: &str) -> Option<AxisPosition> {
    re.captures(fields)
        .and_then(|caps| caps.get(1))
        .and_then(|m| AxisPosition::parse(m.as_str()))
}

fn number(m: Option<regex::Match<'_>>) -> Option<f64> {
    m.and_then(|m| m.as_str().parse().ok())
}

fn integer(m: Option<regex::Match<'_>>) -> Option<u32> {
    m.and_then(|m| m.as_str().parse().ok())
}
