//! Memory sizes and pool sizing.
//!
//! Parses human-readable memory sizes (e.g. "512M", "2G") and estimates how
//! many workers fit in a memory and CPU budget.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Memory size in bytes with parsing and formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemorySize(u64);

impl MemorySize {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from mebibytes (MiB).
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Create from gibibytes (GiB).
    pub const fn from_gib(gib: u64) -> Self {
        Self(gib * 1024 * 1024 * 1024)
    }

    /// Get the raw byte count.
    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    /// Get the size in mebibytes (MiB).
    pub const fn as_mib(&self) -> u64 {
        self.0 / (1024 * 1024)
    }

    /// Get the size in gibibytes (GiB), truncated.
    pub const fn as_gib(&self) -> u64 {
        self.0 / (1024 * 1024 * 1024)
    }
}

/// Errors from parsing sizes or sizing a pool.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryError {
    /// Invalid format in memory size string.
    InvalidFormat(String),
    /// A per-worker estimate or limit is zero, negative or not finite.
    InvalidEstimate(String),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFormat(msg) => write!(f, "invalid memory size: {}", msg),
            Self::InvalidEstimate(msg) => write!(f, "invalid resource estimate: {}", msg),
        }
    }
}

impl std::error::Error for MemoryError {}

impl FromStr for MemorySize {
    type Err = MemoryError;

    /// Parse a human-readable memory size string.
    ///
    /// - Plain number: MiB (e.g., "512" = 512 MiB)
    /// - With suffix: "2G", "2GB", "2GiB", "512M", "512MB", "512MiB", "64K", "100B"
    /// - Case insensitive
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(MemoryError::InvalidFormat("empty string".into()));
        }

        let num_end = s
            .chars()
            .position(|c| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(MemoryError::InvalidFormat(format!(
                "no numeric value in '{}'",
                s
            )));
        }

        let num_str = &s[..num_end];
        let suffix = s[num_end..].trim().to_lowercase();

        let value: f64 = num_str
            .parse()
            .map_err(|_| MemoryError::InvalidFormat(format!("invalid number: '{}'", num_str)))?;

        let multiplier: u64 = match suffix.as_str() {
            "" => 1024 * 1024,
            "b" => 1,
            "k" | "kb" | "kib" => 1024,
            "m" | "mb" | "mib" => 1024 * 1024,
            "g" | "gb" | "gib" => 1024 * 1024 * 1024,
            "t" | "tb" | "tib" => 1024_u64 * 1024 * 1024 * 1024,
            _ => {
                return Err(MemoryError::InvalidFormat(format!(
                    "unknown suffix: '{}'",
                    suffix
                )));
            }
        };

        Ok(MemorySize((value * multiplier as f64) as u64))
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const GIB: u64 = 1024 * 1024 * 1024;

        if self.0 >= GIB {
            let gib = self.0 as f64 / GIB as f64;
            if gib.fract() < 0.01 {
                write!(f, "{} GiB", self.as_gib())
            } else {
                write!(f, "{:.1} GiB", gib)
            }
        } else if self.as_mib() > 0 {
            write!(f, "{} MiB", self.as_mib())
        } else {
            write!(f, "{} bytes", self.0)
        }
    }
}

/// Assumed total memory when `/proc/meminfo` is unavailable.
const FALLBACK_SYSTEM_MEMORY: MemorySize = MemorySize::from_gib(64);

/// Share of total memory the pool may use by default.
const DEFAULT_MEMORY_SHARE: f64 = 0.9;

/// Total system memory in bytes (cached on first read).
static SYSTEM_MEMORY_BYTES: AtomicU64 = AtomicU64::new(0);

/// Total system memory.
pub fn system_memory() -> MemorySize {
    let cached = SYSTEM_MEMORY_BYTES.load(Ordering::Relaxed);
    if cached > 0 {
        return MemorySize(cached);
    }

    let total = read_mem_total().unwrap_or(FALLBACK_SYSTEM_MEMORY);
    SYSTEM_MEMORY_BYTES.store(total.as_bytes(), Ordering::Relaxed);
    total
}

#[cfg(target_os = "linux")]
fn read_mem_total() -> Option<MemorySize> {
    let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
    contents
        .lines()
        .find(|line| line.starts_with("MemTotal:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| MemorySize(kb * 1024))
}

#[cfg(not(target_os = "linux"))]
fn read_mem_total() -> Option<MemorySize> {
    None
}

/// Default memory budget for a pool: 90% of system memory.
pub fn default_memory_limit() -> MemorySize {
    MemorySize((system_memory().as_bytes() as f64 * DEFAULT_MEMORY_SHARE) as u64)
}

/// Default CPU budget for a pool: the available parallelism.
pub fn default_cpu_limit() -> f64 {
    std::thread::available_parallelism()
        .map(|n| n.get() as f64)
        .unwrap_or(1.0)
}

/// Number of workers that fit both budgets, never less than one.
///
/// `max(min(round(memory_limit / memory_estimate), round(cpu_limit / cpu_estimate)), 1)`
pub fn estimate_worker_count(
    memory_limit: MemorySize,
    memory_estimate: MemorySize,
    cpu_limit: f64,
    cpu_estimate: f64,
) -> Result<usize, MemoryError> {
    if memory_estimate.as_bytes() == 0 {
        return Err(MemoryError::InvalidEstimate(
            "memory estimate must be positive".into(),
        ));
    }
    if !(cpu_estimate.is_finite() && cpu_estimate > 0.0) {
        return Err(MemoryError::InvalidEstimate(format!(
            "cpu estimate must be positive, got {}",
            cpu_estimate
        )));
    }
    if !(cpu_limit.is_finite() && cpu_limit >= 0.0) {
        return Err(MemoryError::InvalidEstimate(format!(
            "cpu limit must be non-negative, got {}",
            cpu_limit
        )));
    }

    let by_memory = (memory_limit.as_bytes() as f64 / memory_estimate.as_bytes() as f64).round();
    let by_cpu = (cpu_limit / cpu_estimate).round();
    Ok(by_memory.min(by_cpu).max(1.0) as usize)
}
