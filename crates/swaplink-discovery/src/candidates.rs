//! Name-pattern enumeration: `swaplink-{n}.local` over a numeric range.

use swaplink_core::config::DiscoveryConfig;

/// Substitute `n`, zero-padded to `digits`, for `{n}` in `template`.
pub fn format_name(template: &str, digits: usize, n: u32) -> String {
    template.replace("{n}", &format!("{n:0digits$}"))
}

/// Every hostname in the configured range, in ascending order.
pub fn name_candidates(config: &DiscoveryConfig) -> Vec<String> {
    (config.name_range_start..=config.name_range_end)
        .map(|n| format_name(&config.name_template, config.name_digits, n))
        .collect()
}
