//! Partition profiles and the memory arithmetic behind instance counts.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A partition profile as listed by the tool (e.g. "3g.20gb" with ID 9).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionProfile {
    pub name: String,
    pub numeric_id: u32,
    pub memory_mb: Option<u64>,
}

impl PartitionProfile {
    pub fn new(name: impl Into<String>, numeric_id: u32) -> Self {
        let name = name.into();
        Self {
            memory_mb: profile_memory_mb(&name),
            name,
            numeric_id,
        }
    }
}

/// Memory requirement of a profile string in megabytes.
///
/// The profile is `<compute>.<memory>` where the memory token is digits
/// followed by `g` or `gb`, in gigabytes. Anything else yields `None`.
///
/// ```
/// use microgpu_plugin::partition::profile::profile_memory_mb;
/// assert_eq!(profile_memory_mb("3g.20gb"), Some(20480));
/// assert_eq!(profile_memory_mb("1g.5g"), Some(5120));
/// ```
pub fn profile_memory_mb(profile: &str) -> Option<u64> {
    let mut parts = profile.split('.');
    let (_compute, memory) = (parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let digits = memory
        .strip_suffix("gb")
        .or_else(|| memory.strip_suffix('g'))?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    digits.parse::<u64>().ok()?.checked_mul(1024)
}

/// How many instances of a profile fit in a GPU's memory.
pub fn max_instances(total_memory_mb: u64, profile_memory_mb: u64) -> u64 {
    if profile_memory_mb == 0 {
        return 0;
    }
    total_memory_mb / profile_memory_mb
}

/// Instances to create: the requested count capped at the maximum, or the
/// maximum when no count was requested.
pub fn effective_count(requested: u32, max: u64) -> u64 {
    if requested > 0 {
        u64::from(requested).min(max)
    } else {
        max
    }
}

static PROFILE_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\|\s*\d+\s+MIG\s+(\S+)\s+(\d+)\s").expect("valid profile row pattern")
});

/// Profile ID → name lookup built from the tool's profile listing.
#[derive(Debug, Clone, Default)]
pub struct ProfileTable {
    by_id: HashMap<u32, PartitionProfile>,
}

impl ProfileTable {
    /// Parse `nvidia-smi mig -lgip` output.
    ///
    /// Profile rows look like
    /// `|   0  MIG 1g.10gb       19     7/7        9.50       No ...|`;
    /// continuation rows, borders and headers are ignored.
    pub fn parse(text: &str) -> Self {
        let mut by_id = HashMap::new();
        for line in text.lines() {
            let Some(caps) = PROFILE_ROW.captures(line.trim_start()) else {
                continue;
            };
            let Ok(id) = caps[2].parse::<u32>() else {
                continue;
            };
            by_id
                .entry(id)
                .or_insert_with(|| PartitionProfile::new(&caps[1], id));
        }
        Self { by_id }
    }

    /// Human name for a profile ID, "unknown" when not listed.
    pub fn name_of(&self, id: u32) -> &str {
        self.by_id
            .get(&id)
            .map(|p| p.name.as_str())
            .unwrap_or("unknown")
    }

    pub fn find_by_name(&self, name: &str) -> Option<&PartitionProfile> {
        self.by_id.values().find(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::samples::A100_80GB_PROFILES;

    #[test]
    fn test_profile_memory() {
        assert_eq!(profile_memory_mb("3g.20gb"), Some(20480));
        assert_eq!(profile_memory_mb("1g.5g"), Some(5120));
        assert_eq!(profile_memory_mb("1g.10gb"), Some(10240));
    }

    #[test]
    fn test_profile_memory_rejects_malformed() {
        for bad in ["", "3g", "3g.", "3g.gb", "3g.20mb", "3g.20", "3g.2x0gb", "a.b.c", "3g.-1gb"] {
            assert_eq!(profile_memory_mb(bad), None, "{bad}");
        }
    }

    #[test]
    fn test_max_instances() {
        assert_eq!(max_instances(20480, profile_memory_mb("3g.20gb").unwrap()), 1);
        assert_eq!(max_instances(81920, profile_memory_mb("1g.10gb").unwrap()), 8);
        assert_eq!(max_instances(10240, 20480), 0);
        assert_eq!(max_instances(10240, 0), 0);
    }

    #[test]
    fn test_effective_count() {
        assert_eq!(effective_count(0, 8), 8);
        assert_eq!(effective_count(3, 8), 3);
        assert_eq!(effective_count(12, 8), 8);
    }

    #[test]
    fn test_profile_table() {
        let table = ProfileTable::parse(A100_80GB_PROFILES);
        assert_eq!(table.len(), 4);
        assert_eq!(table.name_of(19), "1g.10gb");
        assert_eq!(table.name_of(9), "3g.40gb");
        assert_eq!(table.name_of(42), "unknown");

        let p = table.find_by_name("2g.20gb").unwrap();
        assert_eq!(p.numeric_id, 14);
        assert_eq!(p.memory_mb, Some(20480));
    }

    #[test]
    fn test_profile_table_empty_on_sentinel() {
        let table = ProfileTable::parse("No MIG-supported devices found.");
        assert!(table.is_empty());
    }
}
