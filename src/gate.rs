//! Feature gating by application mode, license override and per-project flags.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

/// Prefix stripped from feature keys before flag lookup.
pub const FLAG_PREFIX: &str = "features.flags.";

/// The mode the application runs in.
///
/// `Dev` unlocks every feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppMode {
    Dev,
    #[default]
    Production,
}

impl AppMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Production => "prod",
        }
    }

    /// Parse a mode string. Anything other than `dev` is production.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Self::Dev,
            _ => Self::Production,
        }
    }
}

impl fmt::Display for AppMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// License override read from `license.override` in the project config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LicenseOverride {
    AllOn,
    AllOff,
    #[default]
    None,
}

impl LicenseOverride {
    pub fn from_str(s: &str) -> Self {
        match s {
            "all_on" => Self::AllOn,
            "all_off" => Self::AllOff,
            _ => Self::None,
        }
    }
}

/// Resolved gate inputs. Pure data; no side effects.
#[derive(Debug, Clone, Default)]
pub struct FeatureGate {
    app_mode: AppMode,
    license_override: LicenseOverride,
    flags: HashMap<String, bool>,
}

impl FeatureGate {
    /// Build a gate from the project config. Missing or malformed sections fall
    /// back to no flags and no override.
    pub fn new(app_mode: AppMode, project_config: &Value) -> Self {
        let license_override = project_config
            .pointer("/license/override")
            .and_then(Value::as_str)
            .map(LicenseOverride::from_str)
            .unwrap_or_default();

        let flags = project_config
            .pointer("/features/flags")
            .and_then(Value::as_object)
            .map(|flags| {
                flags
                    .iter()
                    .map(|(name, value)| (name.clone(), value.as_bool().unwrap_or(false)))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            app_mode,
            license_override,
            flags,
        }
    }

    pub fn app_mode(&self) -> AppMode {
        self.app_mode
    }

    pub fn license_override(&self) -> LicenseOverride {
        self.license_override
    }

    /// Whether `feature_key` is permitted. First matching rule wins.
    pub fn can(&self, feature_key: &str) -> bool {
        if feature_key.is_empty() {
            return true;
        }
        if self.license_override == LicenseOverride::AllOn || self.app_mode == AppMode::Dev {
            return true;
        }
        if self.license_override == LicenseOverride::AllOff {
            return false;
        }
        let name = feature_key.strip_prefix(FLAG_PREFIX).unwrap_or(feature_key);
        self.flags.get(name).copied().unwrap_or(false)
    }

    /// Whether every key in `required` is permitted. An empty list is permitted.
    pub fn can_all<S: AsRef<str>>(&self, required: &[S]) -> bool {
        required.iter().all(|key| self.can(key.as_ref()))
    }
}
