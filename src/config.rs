//! Run configuration values and their command-line decoding.

use bytesize::ByteSize;
use std::fmt;
use std::time::Duration;

/// Run length used when none is given on the command line.
pub const DEFAULT_RUN_SECS: u64 = 10;

/// Share of available device memory used when no budget is given.
pub const DEFAULT_MEMORY_PERCENT: u32 = 90;

/// Seconds workers get to honour the stop flag before forced termination.
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 30;

/// Floating point precision of the burn matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    #[default]
    Single,
    Double,
}

impl Precision {
    /// Size of one matrix element in bytes.
    pub fn element_size(&self) -> usize {
        match self {
            Precision::Single => std::mem::size_of::<f32>(),
            Precision::Double => std::mem::size_of::<f64>(),
        }
    }

    /// Largest difference between two results of the same product that
    /// still counts as equal.
    pub fn tolerance(&self) -> f64 {
        match self {
            Precision::Single => 1e-3,
            Precision::Double => 1e-7,
        }
    }

    /// Human readable label used in the launch banner.
    pub fn label(&self) -> &'static str {
        match self {
            Precision::Single => "FLOATS",
            Precision::Double => "DOUBLES",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::Single => write!(f, "single"),
            Precision::Double => write!(f, "double"),
        }
    }
}

/// How much device memory each worker may claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryBudget {
    /// An absolute number of bytes.
    Bytes(u64),
    /// A percentage of the memory available when the worker starts.
    Percent(u32),
}

impl Default for MemoryBudget {
    fn default() -> Self {
        MemoryBudget::Percent(DEFAULT_MEMORY_PERCENT)
    }
}

impl MemoryBudget {
    /// Decodes the legacy signed encoding: `0` means the default share,
    /// negative values are percentages and positive values are bytes.
    pub fn decode(raw: i64) -> Self {
        match raw {
            0 => MemoryBudget::default(),
            r if r < 0 => MemoryBudget::Percent(r.unsigned_abs().min(u32::MAX as u64) as u32),
            r => MemoryBudget::Bytes(r as u64),
        }
    }

    /// Resolves the budget against the memory currently available on a device.
    pub fn resolve(&self, available: u64) -> u64 {
        match *self {
            MemoryBudget::Bytes(bytes) => bytes,
            MemoryBudget::Percent(pct) => (available as u128 * pct as u128 / 100) as u64,
        }
    }
}

impl fmt::Display for MemoryBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryBudget::Bytes(bytes) => write!(f, "{}", ByteSize::b(*bytes)),
            MemoryBudget::Percent(pct) => write!(f, "{}% of available", pct),
        }
    }
}

/// Parses a `-m` argument.
///
/// `NNN` is megabytes, `NN%` a percentage of available memory and anything
/// else is tried as a byte size such as `4GiB`. Zero is rejected.
pub fn parse_memory_budget(s: &str) -> Result<MemoryBudget, String> {
    let s = s.trim();
    if let Some(pct) = s.strip_suffix('%') {
        let pct: u32 = pct
            .parse()
            .map_err(|_| format!("invalid memory percentage '{}'", s))?;
        if pct == 0 || pct > 100 {
            return Err(format!("memory percentage must be 1-100, got {}", pct));
        }
        return Ok(MemoryBudget::decode(-i64::from(pct)));
    }

    if let Ok(mb) = s.parse::<u64>() {
        if mb == 0 {
            return Err("memory size must be non-zero".to_string());
        }
        return mb
            .checked_mul(1024 * 1024)
            .and_then(|bytes| i64::try_from(bytes).ok())
            .map(MemoryBudget::decode)
            .ok_or_else(|| format!("memory size '{}' is too large", s));
    }

    match s.parse::<ByteSize>() {
        Ok(size) if size.as_u64() > 0 => Ok(MemoryBudget::Bytes(size.as_u64())),
        _ => Err(format!("invalid memory size '{}'", s)),
    }
}

/// Parses the run length: a plain integer is seconds, anything else goes
/// through humantime (`5m`, `1h 30m`).
pub fn parse_run_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| format!("invalid run length '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_percent_of_available() {
        let budget = parse_memory_budget("50%").unwrap();
        assert_eq!(budget, MemoryBudget::Percent(50));
        assert_eq!(budget.resolve(8 * GIB), 4_294_967_296);
    }

    #[test]
    fn test_default_budget_is_ninety_percent() {
        assert_eq!(MemoryBudget::default().resolve(1000), 900);
    }

    #[test]
    fn test_plain_number_is_megabytes() {
        assert_eq!(
            parse_memory_budget("512").unwrap(),
            MemoryBudget::Bytes(512 * 1024 * 1024)
        );
    }

    #[test]
    fn test_byte_size_strings() {
        assert_eq!(
            parse_memory_budget("4GiB").unwrap(),
            MemoryBudget::Bytes(4 * GIB)
        );
    }

    #[test]
    fn test_invalid_memory_arguments() {
        assert!(parse_memory_budget("0").is_err());
        assert!(parse_memory_budget("0%").is_err());
        assert!(parse_memory_budget("150%").is_err());
        assert!(parse_memory_budget("abc").is_err());
        assert!(parse_memory_budget("12%x").is_err());
        assert!(parse_memory_budget("").is_err());
    }

    #[test]
    fn test_legacy_signed_encoding() {
        assert_eq!(MemoryBudget::decode(0), MemoryBudget::Percent(90));
        assert_eq!(MemoryBudget::decode(-50), MemoryBudget::Percent(50));
        assert_eq!(MemoryBudget::decode(4096), MemoryBudget::Bytes(4096));
        assert_eq!(MemoryBudget::decode(-50).resolve(8 * GIB), 4 * GIB);
    }

    #[test]
    fn test_bytes_ignore_available() {
        assert_eq!(MemoryBudget::Bytes(1234).resolve(0), 1234);
    }

    #[test]
    fn test_resolve_does_not_overflow() {
        assert_eq!(MemoryBudget::Percent(100).resolve(u64::MAX), u64::MAX);
    }

    #[test]
    fn test_run_duration_seconds() {
        assert_eq!(parse_run_duration("3600").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_run_duration_humantime() {
        assert_eq!(parse_run_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_run_duration("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn test_run_duration_invalid() {
        assert!(parse_run_duration("soon").is_err());
        assert!(parse_run_duration("").is_err());
    }

    #[test]
    fn test_precision_element_size() {
        assert_eq!(Precision::Single.element_size(), 4);
        assert_eq!(Precision::Double.element_size(), 8);
        assert_eq!(Precision::default(), Precision::Single);
    }
}
