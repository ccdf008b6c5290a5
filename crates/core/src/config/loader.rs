//! Layered configuration loading.

use figment::{
    providers::{Env, Serialized},
    Figment,
};
use std::path::PathBuf;

use super::user::UserConfig;
use super::{ConfigError, ScanConfig};

/// Loads the effective runtime configuration.
///
/// Merge order, lowest to highest precedence: built-in defaults,
/// `TRUESPEC_*` environment variables, then the persisted user config when
/// the user has completed `truespec config` at least once. CLI flags are
/// applied on top by the caller. Unknown environment keys are ignored.
pub fn load_config() -> Result<ScanConfig, ConfigError> {
    let mut config: ScanConfig = Figment::from(Serialized::defaults(ScanConfig::default()))
        .merge(Env::prefixed("TRUESPEC_"))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;

    // ffprobe keeps its historical unprefixed variable.
    if config.ffprobe_path.is_none() {
        if let Some(path) = std::env::var_os("FFPROBE_PATH") {
            config.ffprobe_path = Some(PathBuf::from(path));
        }
    }

    UserConfig::load().apply_to(&mut config);

    Ok(config)
}
