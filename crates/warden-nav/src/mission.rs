//! QGC WPL 110 mission files: the line-oriented tab-separated waypoint
//! format used by the ground station. Seq 0 is the home position.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const WPL_HEADER: &str = "QGC WPL 110";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub seq: u16,
    pub current: u8,
    pub frame: u8,
    pub command: u16,
    pub param1: f64,
    pub param2: f64,
    pub param3: f64,
    pub param4: f64,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub autocontinue: u8,
}

#[derive(Debug, Clone, Default)]
pub struct MissionPlan {
    pub items: Vec<Waypoint>,
}

impl MissionPlan {
    /// The home position is the seq-0 row by convention.
    pub fn home(&self) -> Option<&Waypoint> {
        self.items.iter().find(|w| w.seq == 0)
    }

    pub fn waypoints(&self) -> impl Iterator<Item = &Waypoint> {
        self.items.iter().filter(|w| w.seq != 0)
    }
}

pub fn parse_wpl(text: &str) -> Result<MissionPlan> {
    let mut lines = text.lines().enumerate();
    let (_, header) = lines.next().context("empty mission file")?;
    anyhow::ensure!(
        header.trim() == WPL_HEADER,
        "bad mission header: {:?} (expected {:?})",
        header.trim(),
        WPL_HEADER
    );

    let mut items = Vec::new();
    for (lineno, line) in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        anyhow::ensure!(
            fields.len() == 12,
            "line {}: expected 12 fields, found {}",
            lineno + 1,
            fields.len()
        );
        let parse_ctx = |idx: usize| format!("line {}: field {}", lineno + 1, idx + 1);
        items.push(Waypoint {
            seq: fields[0].parse().with_context(|| parse_ctx(0))?,
            current: fields[1].parse().with_context(|| parse_ctx(1))?,
            frame: fields[2].parse().with_context(|| parse_ctx(2))?,
            command: fields[3].parse().with_context(|| parse_ctx(3))?,
            param1: fields[4].parse().with_context(|| parse_ctx(4))?,
            param2: fields[5].parse().with_context(|| parse_ctx(5))?,
            param3: fields[6].parse().with_context(|| parse_ctx(6))?,
            param4: fields[7].parse().with_context(|| parse_ctx(7))?,
            lat: fields[8].parse().with_context(|| parse_ctx(8))?,
            lon: fields[9].parse().with_context(|| parse_ctx(9))?,
            alt: fields[10].parse().with_context(|| parse_ctx(10))?,
            autocontinue: fields[11].parse().with_context(|| parse_ctx(11))?,
        });
    }
    Ok(MissionPlan { items })
}

pub fn write_wpl(plan: &MissionPlan) -> String {
    let mut out = String::from(WPL_HEADER);
    out.push('\n');
    for w in &plan.items {
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{:.8}\t{:.8}\t{:.6}\t{}\n",
            w.seq,
            w.current,
            w.frame,
            w.command,
            w.param1,
            w.param2,
            w.param3,
            w.param4,
            w.lat,
            w.lon,
            w.alt,
            w.autocontinue
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "QGC WPL 110\n\
0\t1\t0\t16\t0\t0\t0\t0\t21.02851100\t105.80481700\t10.000000\t1\n\
1\t0\t3\t22\t15\t0\t0\t0\t21.02900000\t105.80500000\t50.000000\t1\n\
2\t0\t3\t16\t0\t0\t0\t0\t21.03000000\t105.80600000\t80.000000\t1\n";

    #[test]
    fn parses_home_and_waypoints() {
        let plan = parse_wpl(SAMPLE).unwrap();
        assert_eq!(plan.items.len(), 3);
        let home = plan.home().unwrap();
        assert!((home.lat - 21.028511).abs() < 1e-9);
        assert_eq!(plan.waypoints().count(), 2);
        // seq 1 is a NAV_TAKEOFF (22)
        assert_eq!(plan.items[1].command, 22);
    }

    #[test]
    fn rejects_wrong_header() {
        assert!(parse_wpl("QGC WPL 120\n").is_err());
        assert!(parse_wpl("").is_err());
    }

    #[test]
    fn rejects_short_rows() {
        let bad = "QGC WPL 110\n0\t1\t0\t16\n";
        let err = parse_wpl(bad).unwrap_err();
        assert!(err.to_string().contains("12 fields"));
    }

    #[test]
    fn round_trips_through_writer() {
        let plan = parse_wpl(SAMPLE).unwrap();
        let text = write_wpl(&plan);
        let again = parse_wpl(&text).unwrap();
        assert_eq!(plan.items, again.items);
    }
}
