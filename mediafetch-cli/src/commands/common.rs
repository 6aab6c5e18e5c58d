//! Common types and utilities shared across CLI commands.

use clap::ValueEnum;
use mediafetch::Platform;

/// Platform selection for CLI arguments.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum PlatformArg {
    Youtube,
    Instagram,
    Kuaishou,
    /// Xiaohongshu
    Rednote,
    /// Anything else; uses the generic chain
    Generic,
}

impl From<PlatformArg> for Platform {
    fn from(arg: PlatformArg) -> Self {
        match arg {
            PlatformArg::Youtube => Platform::YouTube,
            PlatformArg::Instagram => Platform::Instagram,
            PlatformArg::Kuaishou => Platform::Kuaishou,
            PlatformArg::Rednote => Platform::RedNote,
            PlatformArg::Generic => Platform::Generic,
        }
    }
}

/// Formats a byte count with a binary unit suffix.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KiB");
        assert_eq!(format_size(12_582_912), "12.0 MiB");
    }

    #[test]
    fn test_platform_arg_conversion() {
        assert_eq!(Platform::from(PlatformArg::Rednote), Platform::RedNote);
        assert_eq!(Platform::from(PlatformArg::Youtube), Platform::YouTube);
    }
}
