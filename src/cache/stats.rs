//! Cache statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Process-wide cache counters. Derived on demand, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
  /// Total number of cache entries
  pub total_entries: usize,

  /// Approximate size of all entries in bytes
  pub total_size: u64,

  /// Number of cache hits since startup
  pub hits: u64,

  /// Number of cache misses since startup
  pub misses: u64,

  /// hits / (hits + misses), 0.0 when nothing was read
  pub hit_rate: f64,

  /// Last expired-entry sweep
  pub last_cleanup: Option<DateTime<Utc>>,
}

impl CacheMetadata {
  /// Calculate hit rate from hits and misses
  pub fn calculate_hit_rate(&mut self) {
    let total = self.hits + self.misses;
    self.hit_rate = if total > 0 {
      self.hits as f64 / total as f64
    } else {
      0.0
    };
  }

  /// Get human-readable size string
  pub fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;

    if size >= MB {
      format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
      format!("{:.2} KB", size as f64 / KB as f64)
    } else {
      format!("{} B", size)
    }
  }

  /// Display statistics in a human-readable format
  pub fn display(&self) -> String {
    let mut output = String::new();
    output.push_str(&format!("  Total entries: {}\n", self.total_entries));
    output.push_str(&format!(
      "  Total size: {}\n",
      Self::format_size(self.total_size)
    ));
    output.push_str(&format!("  Hits: {}\n", self.hits));
    output.push_str(&format!("  Misses: {}\n", self.misses));
    output.push_str(&format!("  Hit rate: {:.1}%\n", self.hit_rate * 100.0));
    if let Some(at) = self.last_cleanup {
      output.push_str(&format!("  Last cleanup: {}\n", at.to_rfc3339()));
    }
    output
  }
}

/// Hit/miss counters shared by a cache instance.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Counters {
  pub hits: u64,
  pub misses: u64,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_calculate_hit_rate() {
    let mut stats = CacheMetadata {
      hits: 3,
      misses: 1,
      ..Default::default()
    };
    stats.calculate_hit_rate();
    assert_eq!(stats.hit_rate, 0.75);

    let mut empty = CacheMetadata::default();
    empty.calculate_hit_rate();
    assert_eq!(empty.hit_rate, 0.0);
  }

  #[test]
  fn test_format_size() {
    assert_eq!(CacheMetadata::format_size(500), "500 B");
    assert_eq!(CacheMetadata::format_size(2048), "2.00 KB");
    assert_eq!(CacheMetadata::format_size(5 * 1024 * 1024), "5.00 MB");
  }
}
