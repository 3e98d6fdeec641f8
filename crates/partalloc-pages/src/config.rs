//! Runtime check-mode configuration.
//!
//! The check mode is set via the `PARTALLOC_CHECKS` environment variable:
//! - `checked`: integrity cookies bracket every slot, fresh slots are filled
//!   with the uninitialized pattern and freed slots with the freed pattern.
//! - `release`: no cookies and no poison fills.
//!
//! When the variable is unset, debug builds run checked and release builds do
//! not. Roots may override the process default through their options.
//!
//! The zero-on-free policy is set via `PARTALLOC_ZERO_ON_FREE`:
//! `never`, `always`, or a decimal sampling period (one free in roughly every
//! `period` is zeroed).

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use serde::Serialize;

/// Whether slot cookies and poison fills are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckMode {
    /// Cookies and poison fills on every allocate / free.
    Checked,
    /// No cookies, no poison.
    Release,
}

impl Default for CheckMode {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Checked
        } else {
            Self::Release
        }
    }
}

impl CheckMode {
    /// Parse from string (case-insensitive). Unknown values yield the build default.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "checked" | "debug" | "on" | "cookies" => Self::Checked,
            "release" | "off" | "none" => Self::Release,
            _ => Self::default(),
        }
    }

    /// Returns true if slot cookies are written and verified.
    #[must_use]
    pub const fn cookies_enabled(self) -> bool {
        matches!(self, Self::Checked)
    }

    /// Returns true if allocate / free fill slots with poison patterns.
    #[must_use]
    pub const fn poison_enabled(self) -> bool {
        matches!(self, Self::Checked)
    }
}

/// Policy for zeroing slots on free when poisoning is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroOnFree {
    Never,
    Always,
    /// Zero roughly one free in every `period`.
    Sampled { period: u32 },
}

pub const DEFAULT_ZERO_ON_FREE_PERIOD: u32 = 128;

impl Default for ZeroOnFree {
    fn default() -> Self {
        Self::Sampled {
            period: DEFAULT_ZERO_ON_FREE_PERIOD,
        }
    }
}

impl ZeroOnFree {
    /// Parse from string (case-insensitive). Unknown values yield the default.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        let lowered = s.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "never" | "off" | "0" => Self::Never,
            "always" | "on" | "1" => Self::Always,
            other => match other.parse::<u32>() {
                Ok(period) => Self::Sampled { period },
                Err(_) => Self::default(),
            },
        }
    }
}

// Atomic cache: 0=unresolved, 1=Checked, 2=Release, 255=resolving.
static CACHED_CHECKS: AtomicU8 = AtomicU8::new(0);

const CHECKS_UNRESOLVED: u8 = 0;
const CHECKS_CHECKED: u8 = 1;
const CHECKS_RELEASE: u8 = 2;
const CHECKS_RESOLVING: u8 = 255;

fn checks_to_u8(mode: CheckMode) -> u8 {
    match mode {
        CheckMode::Checked => CHECKS_CHECKED,
        CheckMode::Release => CHECKS_RELEASE,
    }
}

fn u8_to_checks(v: u8) -> CheckMode {
    match v {
        CHECKS_CHECKED => CheckMode::Checked,
        CHECKS_RELEASE => CheckMode::Release,
        _ => CheckMode::default(),
    }
}

/// Get the configured check mode (reads env var on first call, caches thereafter).
///
/// A call that races with the first resolution sees the build default.
#[must_use]
pub fn check_mode() -> CheckMode {
    let cached = CACHED_CHECKS.load(Ordering::Relaxed);
    if cached != CHECKS_UNRESOLVED && cached != CHECKS_RESOLVING {
        return u8_to_checks(cached);
    }
    if cached == CHECKS_RESOLVING {
        return CheckMode::default();
    }
    if CACHED_CHECKS
        .compare_exchange(
            CHECKS_UNRESOLVED,
            CHECKS_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        return u8_to_checks(CACHED_CHECKS.load(Ordering::Relaxed));
    }

    let mode = std::env::var("PARTALLOC_CHECKS")
        .map(|v| CheckMode::from_str_loose(&v))
        .unwrap_or_default();
    CACHED_CHECKS.store(checks_to_u8(mode), Ordering::Release);
    mode
}

// 0=unresolved, 1=Never, 2=Always, u64::MAX=resolving, otherwise (period << 2) | 3.
static CACHED_ZERO_ON_FREE: AtomicU64 = AtomicU64::new(0);

const ZOF_UNRESOLVED: u64 = 0;
const ZOF_NEVER: u64 = 1;
const ZOF_ALWAYS: u64 = 2;
const ZOF_SAMPLED_TAG: u64 = 3;
const ZOF_RESOLVING: u64 = u64::MAX;

fn zero_on_free_to_u64(policy: ZeroOnFree) -> u64 {
    match policy {
        ZeroOnFree::Never => ZOF_NEVER,
        ZeroOnFree::Always => ZOF_ALWAYS,
        ZeroOnFree::Sampled { period } => (u64::from(period) << 2) | ZOF_SAMPLED_TAG,
    }
}

fn u64_to_zero_on_free(v: u64) -> ZeroOnFree {
    match v {
        ZOF_NEVER => ZeroOnFree::Never,
        ZOF_ALWAYS => ZeroOnFree::Always,
        ZOF_UNRESOLVED | ZOF_RESOLVING => ZeroOnFree::default(),
        encoded => ZeroOnFree::Sampled {
            period: (encoded >> 2) as u32,
        },
    }
}

/// Get the configured zero-on-free policy (reads env var on first call).
#[must_use]
pub fn zero_on_free_policy() -> ZeroOnFree {
    let cached = CACHED_ZERO_ON_FREE.load(Ordering::Relaxed);
    if cached != ZOF_UNRESOLVED {
        return u64_to_zero_on_free(cached);
    }
    if CACHED_ZERO_ON_FREE
        .compare_exchange(
            ZOF_UNRESOLVED,
            ZOF_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        return u64_to_zero_on_free(CACHED_ZERO_ON_FREE.load(Ordering::Relaxed));
    }

    let policy = std::env::var("PARTALLOC_ZERO_ON_FREE")
        .map(|v| ZeroOnFree::from_str_loose(&v))
        .unwrap_or_default();
    CACHED_ZERO_ON_FREE.store(zero_on_free_to_u64(policy), Ordering::Release);
    policy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_check_modes() {
        assert_eq!(CheckMode::from_str_loose("checked"), CheckMode::Checked);
        assert_eq!(CheckMode::from_str_loose("CHECKED"), CheckMode::Checked);
        assert_eq!(CheckMode::from_str_loose("debug"), CheckMode::Checked);
        assert_eq!(CheckMode::from_str_loose("release"), CheckMode::Release);
        assert_eq!(CheckMode::from_str_loose("off"), CheckMode::Release);
        assert_eq!(CheckMode::from_str_loose("bogus"), CheckMode::default());
    }

    #[test]
    fn default_check_mode_follows_build() {
        assert_eq!(
            CheckMode::default() == CheckMode::Checked,
            cfg!(debug_assertions)
        );
    }

    #[test]
    fn cookies_and_poison_only_when_checked() {
        assert!(CheckMode::Checked.cookies_enabled());
        assert!(CheckMode::Checked.poison_enabled());
        assert!(!CheckMode::Release.cookies_enabled());
        assert!(!CheckMode::Release.poison_enabled());
    }

    #[test]
    fn parse_zero_on_free() {
        assert_eq!(ZeroOnFree::from_str_loose("never"), ZeroOnFree::Never);
        assert_eq!(ZeroOnFree::from_str_loose("Always"), ZeroOnFree::Always);
        assert_eq!(
            ZeroOnFree::from_str_loose(" 64 "),
            ZeroOnFree::Sampled { period: 64 }
        );
        assert_eq!(ZeroOnFree::from_str_loose("junk"), ZeroOnFree::default());
    }

    #[test]
    fn zero_on_free_encoding_round_trips_through_cache_format() {
        for policy in [
            ZeroOnFree::Never,
            ZeroOnFree::Always,
            ZeroOnFree::Sampled { period: 7 },
            ZeroOnFree::Sampled { period: u32::MAX },
        ] {
            assert_eq!(u64_to_zero_on_free(zero_on_free_to_u64(policy)), policy);
        }
    }

    #[test]
    fn cached_check_mode_is_process_sticky_until_cache_reset() {
        let previous = CACHED_CHECKS.swap(CHECKS_RELEASE, Ordering::SeqCst);
        assert_eq!(check_mode(), CheckMode::Release);
        CACHED_CHECKS.store(CHECKS_CHECKED, Ordering::SeqCst);
        assert_eq!(check_mode(), CheckMode::Checked);
        CACHED_CHECKS.store(previous, Ordering::SeqCst);
    }
}
