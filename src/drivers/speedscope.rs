//! Speedscope-to-collapsed conversion for `dotnet-trace` output.
//!
//! dotnet-trace emits evented speedscope profiles (one per thread), in
//! milliseconds, with open/close events per frame. The walk below
//! reconstructs the running stack and converts elapsed wall time between
//! events into whole sample counts at the configured frequency, carrying
//! the fractional remainder forward so totals stay unbiased without
//! randomized rounding.

use serde::Deserialize;

use crate::domain::{DriverError, Frame, FrameKind, Stack, StackCounts};

#[derive(Debug, Deserialize)]
struct SpeedscopeFile {
    shared: Shared,
    profiles: Vec<Profile>,
}

#[derive(Debug, Deserialize)]
struct Shared {
    frames: Vec<FrameDef>,
}

#[derive(Debug, Deserialize)]
struct FrameDef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Profile {
    #[serde(rename = "type")]
    kind: String,
    unit: String,
    // dotnet-trace writes this as a string.
    #[serde(rename = "startValue")]
    start_value: serde_json::Value,
    events: Vec<Event>,
}

#[derive(Debug, Deserialize)]
struct Event {
    #[serde(rename = "type")]
    kind: String,
    at: f64,
    frame: usize,
}

fn invalid(reason: impl Into<String>) -> DriverError {
    DriverError::UnparseableOutput { tool: format!("dotnet-trace ({})", reason.into()), malformed: 1, total: 1 }
}

fn value_as_f64(value: &serde_json::Value) -> Option<f64> {
    value.as_f64().or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

/// Convert a speedscope JSON document into stack counts at `frequency` Hz.
pub fn speedscope_to_stacks(json: &str, frequency: u32) -> Result<StackCounts, DriverError> {
    let file: SpeedscopeFile =
        serde_json::from_str(json).map_err(|e| invalid(format!("bad json: {e}")))?;

    let interval_ms = 1000.0 / f64::from(frequency.max(1));
    let mut counts = StackCounts::new();

    for profile in &file.profiles {
        if profile.kind != "evented" {
            return Err(invalid(format!("unexpected profile type {:?}", profile.kind)));
        }
        if profile.unit != "milliseconds" {
            return Err(invalid(format!("unexpected unit {:?}", profile.unit)));
        }
        let mut last_ts = value_as_f64(&profile.start_value)
            .ok_or_else(|| invalid("non-numeric startValue"))?;

        let mut open_frames: Vec<usize> = Vec::new();
        let mut carry = 0.0_f64;

        for event in &profile.events {
            let elapsed = event.at - last_ts;
            last_ts = event.at;

            match event.kind.as_str() {
                "O" => open_frames.push(event.frame),
                "C" => {
                    if open_frames.last() != Some(&event.frame) {
                        return Err(invalid("mismatched close event"));
                    }
                    open_frames.pop();
                }
                other => return Err(invalid(format!("unexpected event type {other:?}"))),
            }

            if open_frames.is_empty() || elapsed <= 0.0 {
                continue;
            }

            // Whole samples for this interval, with remainder carry-over.
            let exact = elapsed / interval_ms + carry;
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let whole = exact.floor() as u64;
            carry = exact - exact.floor();
            if whole == 0 {
                continue;
            }

            // Speedscope stacks open root-first; flip to leaf-first.
            let frames: Result<Vec<Frame>, DriverError> = open_frames
                .iter()
                .rev()
                .map(|&idx| {
                    file.shared
                        .frames
                        .get(idx)
                        .map(|def| Frame::new(def.name.clone(), FrameKind::DotNet))
                        .ok_or_else(|| invalid(format!("frame index {idx} out of range")))
                })
                .collect();
            counts.add(Stack::new(frames?), whole);
        }
    }

    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(events: &str, start: &str) -> String {
        format!(
            r#"{{
  "shared": {{ "frames": [ {{"name": "Main"}}, {{"name": "Work"}} ] }},
  "profiles": [ {{
    "type": "evented", "unit": "milliseconds", "startValue": {start},
    "events": [ {events} ]
  }} ]
}}"#
        )
    }

    #[test]
    fn test_simple_open_close() {
        // 100 Hz -> 10ms interval. Main open for 100ms => 10 samples,
        // of which Main;Work runs 50ms => 5 samples.
        let events = r#"
            {"type": "O", "at": 0.0, "frame": 0},
            {"type": "O", "at": 50.0, "frame": 1},
            {"type": "C", "at": 100.0, "frame": 1},
            {"type": "C", "at": 100.0, "frame": 0}
        "#;
        let counts = speedscope_to_stacks(&doc(events, "\"0\""), 100).unwrap();

        let main_only = Stack::new(vec![Frame::new("Main", FrameKind::DotNet)]);
        let main_work = Stack::new(vec![
            Frame::new("Work", FrameKind::DotNet),
            Frame::new("Main", FrameKind::DotNet),
        ]);
        assert_eq!(counts.get(&main_only), Some(5));
        assert_eq!(counts.get(&main_work), Some(5));
        assert_eq!(counts.total(), 10);
    }

    #[test]
    fn test_fractional_carry_accumulates() {
        // Three 5ms intervals at 100 Hz (10ms per sample) total 15ms:
        // deterministic carry must yield 1 whole sample, not 0 or 3.
        let events = r#"
            {"type": "O", "at": 0.0, "frame": 0},
            {"type": "O", "at": 5.0, "frame": 1},
            {"type": "C", "at": 10.0, "frame": 1},
            {"type": "C", "at": 15.0, "frame": 0}
        "#;
        let counts = speedscope_to_stacks(&doc(events, "0"), 100).unwrap();
        assert_eq!(counts.total(), 1);
    }

    #[test]
    fn test_rejects_unknown_profile_type() {
        let json = r#"{"shared":{"frames":[]},"profiles":[{"type":"sampled","unit":"milliseconds","startValue":0,"events":[]}]}"#;
        assert!(speedscope_to_stacks(json, 100).is_err());
    }

    #[test]
    fn test_rejects_mismatched_close() {
        let events = r#"
            {"type": "O", "at": 0.0, "frame": 0},
            {"type": "C", "at": 10.0, "frame": 1}
        "#;
        assert!(speedscope_to_stacks(&doc(events, "0"), 100).is_err());
    }
}
