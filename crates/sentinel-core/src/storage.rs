//! Settings persistence on top of the [`PersistencePort`].
//!
//! The typed document lives under one key. The two raw keys seeded by the
//! store (`run_on_startup`, `last_directory`) are mirrored on every save so
//! that older tooling reading them keeps seeing current values.

use crate::settings::MonitorSettings;
use crate::store::{PersistencePort, Result};
use std::path::PathBuf;

const SETTINGS_KEY: &str = "sentinel.settings";
const RUN_ON_STARTUP_KEY: &str = "run_on_startup";
const LAST_DIRECTORY_KEY: &str = "last_directory";

pub fn load_settings(store: &dyn PersistencePort) -> Result<MonitorSettings> {
    if let Some(json) = store.get_setting(SETTINGS_KEY)? {
        return Ok(serde_json::from_str(&json)?);
    }
    // First run: build from the seeded raw keys.
    let mut settings = MonitorSettings::default();
    if let Some(raw) = store.get_setting(RUN_ON_STARTUP_KEY)? {
        settings.run_on_startup = raw != "0";
    }
    if let Some(dir) = store.get_setting(LAST_DIRECTORY_KEY)? {
        if !dir.is_empty() {
            settings.monitored_root = Some(PathBuf::from(dir));
        }
    }
    Ok(settings)
}

pub fn save_settings(store: &dyn PersistencePort, settings: &MonitorSettings) -> Result<()> {
    settings.validate()?;
    let json = serde_json::to_string(settings)?;
    store.set_setting(SETTINGS_KEY, &json)?;
    store.set_setting(
        RUN_ON_STARTUP_KEY,
        if settings.run_on_startup { "1" } else { "0" },
    )?;
    let last = settings
        .monitored_root
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    store.set_setting(LAST_DIRECTORY_KEY, &last)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SqliteStore;
    use crate::fingerprint::HashAlgorithm;

    #[test]
    fn fresh_store_yields_seeded_defaults() {
        let store = SqliteStore::open_in_memory().unwrap();
        let settings = load_settings(&store).unwrap();
        assert!(settings.run_on_startup);
        assert!(settings.monitored_root.is_none());
    }

    #[test]
    fn save_mirrors_raw_keys() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut settings = load_settings(&store).unwrap();
        settings.monitored_root = Some(PathBuf::from("/srv/site"));
        settings.run_on_startup = false;
        settings.hash_algorithm = HashAlgorithm::Blake3;
        save_settings(&store, &settings).unwrap();

        assert_eq!(load_settings(&store).unwrap(), settings);
        assert_eq!(store.get_setting("last_directory").unwrap().as_deref(), Some("/srv/site"));
        assert_eq!(store.get_setting("run_on_startup").unwrap().as_deref(), Some("0"));
    }

    #[test]
    fn invalid_settings_are_not_saved() {
        let store = SqliteStore::open_in_memory().unwrap();
        let settings = MonitorSettings {
            settle_delay_ms: 1,
            ..MonitorSettings::default()
        };
        assert!(save_settings(&store, &settings).is_err());
        assert!(store.get_setting(SETTINGS_KEY).unwrap().is_none());
    }
}
