//! Settings file loading.

use std::path::Path;

use rp_engine::EngineSettings;
use tracing::{debug, info};

use crate::MasterError;

/// Read engine settings from a YAML file. A missing file yields defaults.
pub fn load_settings(path: impl AsRef<Path>) -> Result<EngineSettings, MasterError> {
    let path = path.as_ref();
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("no settings at {}, using defaults", path.display());
            return Ok(EngineSettings::default());
        }
        Err(e) => return Err(e.into()),
    };
    let settings = parse_settings(&text)?;
    info!("loaded settings from {}", path.display());
    Ok(settings)
}

/// Parse YAML settings; an empty document yields defaults.
pub fn parse_settings(text: &str) -> Result<EngineSettings, MasterError> {
    if text.trim().is_empty() {
        return Ok(EngineSettings::default());
    }
    Ok(serde_yaml::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rp_engine::SampleRateMode;

    #[test]
    fn missing_file_gives_defaults() {
        let s = load_settings("/nonexistent/renderpipe/settings.yaml").unwrap();
        assert_eq!(s, EngineSettings::default());
    }

    #[test]
    fn empty_document_gives_defaults() {
        assert_eq!(parse_settings("\n").unwrap(), EngineSettings::default());
    }

    #[test]
    fn fields_override_defaults() {
        let s = parse_settings("channels: 8\nsample_rate_mode: !fixed 44100\nperiod_ms: 10\n").unwrap();
        assert_eq!(s.channels, 8);
        assert_eq!(s.sample_rate_mode, SampleRateMode::Fixed(44100));
        assert_eq!(s.period_ms, 10);
        assert_eq!(s.device, "default");
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        assert!(matches!(parse_settings("channels: [1, 2"), Err(MasterError::Yaml(_))));
    }
}
