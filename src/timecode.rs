//! Parsing of the time expressions used by VAST and VMAP documents.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VastError};

/// Parse `HH:MM:SS` or `HH:MM:SS.mmm` into a duration
pub fn parse_clock(value: &str) -> Result<Duration> {
    let value = value.trim();
    let mut parts = value.split(':');
    let (Some(hours), Some(minutes), Some(seconds), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(VastError::malformed(format!("invalid time expression '{value}'")));
    };

    let hours: u64 = parse_component(hours, value)?;
    let minutes: u64 = parse_component(minutes, value)?;
    let (whole, millis) = match seconds.split_once('.') {
        Some((whole, fraction)) => {
            let digits: String = fraction.chars().take(3).collect();
            let scale = 10u64.pow(3 - digits.len() as u32);
            (whole, parse_component::<u64>(&digits, value)? * scale)
        }
        None => (seconds, 0),
    };
    let seconds: u64 = parse_component(whole, value)?;
    if minutes >= 60 || seconds >= 60 {
        return Err(VastError::malformed(format!("invalid time expression '{value}'")));
    }

    hours
        .checked_mul(3600)
        .and_then(|s| s.checked_add(minutes * 60 + seconds))
        .and_then(|s| s.checked_mul(1000))
        .and_then(|ms| ms.checked_add(millis))
        .map(Duration::from_millis)
        .ok_or_else(|| VastError::malformed(format!("time expression '{value}' out of range")))
}

fn parse_component<T: std::str::FromStr>(component: &str, whole: &str) -> Result<T> {
    component
        .trim()
        .parse()
        .map_err(|_| VastError::malformed(format!("invalid time expression '{whole}'")))
}

/// A `skipoffset` value before the creative duration is known
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SkipOffset {
    Absolute(Duration),
    Percent(f64),
}

impl SkipOffset {
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        match value.strip_suffix('%') {
            Some(percent) => percent
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|p| (0.0..=100.0).contains(p))
                .map(SkipOffset::Percent)
                .ok_or_else(|| VastError::malformed(format!("invalid skip offset '{value}'"))),
            None => parse_clock(value).map(SkipOffset::Absolute),
        }
    }

    /// Resolve against the creative duration. Percentages need a duration.
    pub fn resolve(self, duration: Option<Duration>) -> Option<Duration> {
        match self {
            SkipOffset::Absolute(offset) => Some(offset),
            SkipOffset::Percent(percent) => {
                duration.map(|d| Duration::from_millis((d.as_millis() as f64 * percent / 100.0) as u64))
            }
        }
    }
}
