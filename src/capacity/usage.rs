use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Raw, human-readable resource requirements as they appear in a job spec
/// or node configuration. Empty strings mean "unspecified".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsageConfig {
    pub cpu: String,
    pub memory: String,
    pub disk: String,
    pub gpu: String,
}

/// Parsed resource quantities. CPU in fractional cores, memory and disk in
/// bytes, GPU as a device count. Zero is the identity for all operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu: f64,
    pub memory: u64,
    pub disk: u64,
    pub gpu: u64,
}

impl ResourceUsage {
    pub fn parse(config: &ResourceUsageConfig) -> Result<Self> {
        Ok(Self {
            cpu: parse_cpu(&config.cpu)?,
            memory: parse_bytes(&config.memory)?,
            disk: parse_bytes(&config.disk)?,
            gpu: parse_gpu(&config.gpu)?,
        })
    }

    /// Pointwise addition.
    pub fn add(&self, other: &ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            cpu: self.cpu + other.cpu,
            memory: self.memory + other.memory,
            disk: self.disk + other.disk,
            gpu: self.gpu + other.gpu,
        }
    }

    /// Pointwise subtraction, saturating at zero.
    pub fn sub(&self, other: &ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            cpu: (self.cpu - other.cpu).max(0.0),
            memory: self.memory.saturating_sub(other.memory),
            disk: self.disk.saturating_sub(other.disk),
            gpu: self.gpu.saturating_sub(other.gpu),
        }
    }

    /// Pointwise `<=`: true when `other` can hold `self`.
    pub fn fits_within(&self, other: &ResourceUsage) -> bool {
        self.cpu <= other.cpu
            && self.memory <= other.memory
            && self.disk <= other.disk
            && self.gpu <= other.gpu
    }

    pub fn is_zero(&self) -> bool {
        self.cpu == 0.0 && self.memory == 0 && self.disk == 0 && self.gpu == 0
    }

    /// Fills unspecified (zero) fields from `defaults`.
    pub fn with_defaults(&self, defaults: &ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            cpu: if self.cpu == 0.0 { defaults.cpu } else { self.cpu },
            memory: if self.memory == 0 {
                defaults.memory
            } else {
                self.memory
            },
            disk: if self.disk == 0 { defaults.disk } else { self.disk },
            gpu: if self.gpu == 0 { defaults.gpu } else { self.gpu },
        }
    }
}

impl std::fmt::Display for ResourceUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cpu={} memory={} disk={} gpu={}",
            self.cpu, self.memory, self.disk, self.gpu
        )
    }
}

/// Parse a CPU quantity: fractional cores ("1.5") or millicores ("500m").
fn parse_cpu(raw: &str) -> Result<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0.0);
    }
    let (value, millis) = match raw.strip_suffix('m') {
        Some(head) => (head, true),
        None => (raw, false),
    };
    let value: f64 = value
        .parse()
        .map_err(|_| Error::UnparseableUnit(raw.to_string()))?;
    if value < 0.0 {
        return Err(Error::NegativeValue(raw.to_string()));
    }
    Ok(if millis { value / 1000.0 } else { value })
}

/// Parse a byte quantity with SI ("K", "M", "G", "T") or IEC ("Ki", "Mi",
/// "Gi", "Ti") suffixes, case-insensitive, optional trailing "b"/"B".
fn parse_bytes(raw: &str) -> Result<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0);
    }
    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-')
        .unwrap_or(raw.len());
    let (value, suffix) = raw.split_at(split);
    let value: f64 = value
        .parse()
        .map_err(|_| Error::UnparseableUnit(raw.to_string()))?;
    if value < 0.0 {
        return Err(Error::NegativeValue(raw.to_string()));
    }
    let suffix = suffix.trim_end_matches(['b', 'B']);
    let multiplier: u64 = match suffix.to_ascii_lowercase().as_str() {
        "" => 1,
        "k" => 1000,
        "m" => 1000 * 1000,
        "g" => 1000 * 1000 * 1000,
        "t" => 1000 * 1000 * 1000 * 1000,
        "ki" => 1 << 10,
        "mi" => 1 << 20,
        "gi" => 1 << 30,
        "ti" => 1 << 40,
        _ => return Err(Error::UnparseableUnit(raw.to_string())),
    };
    Ok((value * multiplier as f64) as u64)
}

/// Parse a GPU count. Fractional devices are rejected.
fn parse_gpu(raw: &str) -> Result<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0);
    }
    if raw.starts_with('-') {
        return Err(Error::NegativeValue(raw.to_string()));
    }
    raw.parse()
        .map_err(|_| Error::UnparseableUnit(raw.to_string()))
}
