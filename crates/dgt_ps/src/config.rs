//! Environment-driven configuration for the DGT send pipeline.
//!
//! Two groups of knobs with different lifetimes: [`DgtConfig`] is read at
//! worker construction and every entry has a default; [`ChannelConfig`] is
//! read lazily when the first push initializes the channel machinery and
//! every entry is mandatory there.

use std::env;
use std::str::FromStr;

use anyhow::Context;

/// Pipeline knobs sampled at worker construction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DgtConfig {
    /// EWMA smoothing factor for contribution scores (`DGT_CONTRI_ALPHA`).
    pub contri_alpha: f32,
    /// Shuffle fragments instead of rank-sorting them (`DGT_SET_RANDOM`).
    pub set_random: bool,
    /// Raise pipeline diagnostics to info level (`DGT_INFO`).
    pub dgt_info: bool,
    /// Fragment push payloads into blocks (`DGT_ENABLE_BLOCK`).
    pub enable_block: bool,
    /// Fragment block size in bytes (`DGT_BLOCK_SIZE`).
    pub block_size: usize,
    /// Route fragments through the channel classifier (`ENABLE_DGT`).
    pub enable_dgt: bool,
    /// Drop zero-score fragments, terminator excepted (`CLEAR_ZERO`).
    pub clear_zero: bool,
}

impl Default for DgtConfig {
    fn default() -> Self {
        Self {
            contri_alpha: dgt_core::contribution::DEFAULT_ALPHA,
            set_random: false,
            dgt_info: false,
            enable_block: false,
            block_size: 0,
            enable_dgt: false,
            clear_zero: false,
        }
    }
}

impl DgtConfig {
    pub fn from_env() -> Self {
        Self {
            contri_alpha: read_env_f32(
                "DGT_CONTRI_ALPHA",
                dgt_core::contribution::DEFAULT_ALPHA,
            ),
            set_random: read_env_bool("DGT_SET_RANDOM", false),
            dgt_info: read_env_bool("DGT_INFO", false),
            enable_block: read_env_bool("DGT_ENABLE_BLOCK", false),
            block_size: read_env_usize("DGT_BLOCK_SIZE", 0),
            enable_dgt: read_env_bool("ENABLE_DGT", false),
            clear_zero: read_env_bool("CLEAR_ZERO", false),
        }
    }
}

/// Reliability-channel knobs; all mandatory once a worker starts pushing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelConfig {
    /// Initial reliability fraction (`DMLC_K`).
    pub k_init: f32,
    /// Lower bound on the reliability fraction (`DMLC_K_MIN`).
    pub k_min: f32,
    /// Scale `k` with observed loss (`ADAPTIVE_K_FLAG`).
    pub adaptive_k: bool,
    /// Number of lossy channels (`DMLC_UDP_CHANNEL_NUM`).
    pub udp_channels: u32,
}

impl ChannelConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            k_init: require_env("DMLC_K")?,
            k_min: require_env("DMLC_K_MIN")?,
            adaptive_k: require_env::<u32>("ADAPTIVE_K_FLAG")? != 0,
            udp_channels: require_env("DMLC_UDP_CHANNEL_NUM")?,
        })
    }
}

fn read_env_f32(name: &str, default: f32) -> f32 {
    env::var(name)
        .ok()
        .and_then(|v| f32::from_str(v.trim()).ok())
        .unwrap_or(default)
}

fn read_env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| usize::from_str(v.trim()).ok())
        .unwrap_or(default)
}

fn read_env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|v| {
            matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "y" | "on"
            )
        })
        .unwrap_or(default)
}

fn require_env<T: FromStr>(name: &str) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = env::var(name)
        .with_context(|| format!("environment variable {name} is required"))?;
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("environment variable {name} has invalid value {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment mutation is process-global, so everything env-related
    // lives in this single test.
    #[test]
    fn env_round_trip() {
        for name in [
            "DGT_CONTRI_ALPHA",
            "DGT_SET_RANDOM",
            "DGT_ENABLE_BLOCK",
            "DGT_BLOCK_SIZE",
            "ENABLE_DGT",
            "CLEAR_ZERO",
            "DGT_INFO",
            "DMLC_K",
            "DMLC_K_MIN",
            "ADAPTIVE_K_FLAG",
            "DMLC_UDP_CHANNEL_NUM",
        ] {
            env::remove_var(name);
        }

        let cfg = DgtConfig::from_env();
        assert_eq!(cfg, DgtConfig::default());
        assert!(ChannelConfig::from_env().is_err());

        env::set_var("DGT_CONTRI_ALPHA", "0.5");
        env::set_var("DGT_SET_RANDOM", "1");
        env::set_var("DGT_ENABLE_BLOCK", "true");
        env::set_var("DGT_BLOCK_SIZE", "4096");
        env::set_var("ENABLE_DGT", "1");
        env::set_var("CLEAR_ZERO", "1");
        env::set_var("DMLC_K", "0.5");
        env::set_var("DMLC_K_MIN", "0.1");
        env::set_var("ADAPTIVE_K_FLAG", "1");
        env::set_var("DMLC_UDP_CHANNEL_NUM", "3");

        let cfg = DgtConfig::from_env();
        assert_eq!(cfg.contri_alpha, 0.5);
        assert!(cfg.set_random);
        assert!(cfg.enable_block);
        assert_eq!(cfg.block_size, 4096);
        assert!(cfg.enable_dgt);
        assert!(cfg.clear_zero);

        let link = ChannelConfig::from_env().unwrap();
        assert_eq!(link.k_init, 0.5);
        assert_eq!(link.k_min, 0.1);
        assert!(link.adaptive_k);
        assert_eq!(link.udp_channels, 3);

        env::set_var("DMLC_K", "not-a-number");
        assert!(ChannelConfig::from_env().is_err());

        for name in [
            "DGT_CONTRI_ALPHA",
            "DGT_SET_RANDOM",
            "DGT_ENABLE_BLOCK",
            "DGT_BLOCK_SIZE",
            "ENABLE_DGT",
            "CLEAR_ZERO",
            "DMLC_K",
            "DMLC_K_MIN",
            "ADAPTIVE_K_FLAG",
            "DMLC_UDP_CHANNEL_NUM",
        ] {
            env::remove_var(name);
        }
    }
}
