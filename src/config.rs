use std::{str::FromStr, time::Duration};

use ash::vk;

use crate::{error::RenderError, render::FrameConfig};

/// Engine-wide settings. Every window shares them.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub app_name: String,
    pub pipeline_depth: usize,
    pub validation: bool,
    pub frame_timeout: Duration,
    pub clear_color: [f32; 4],
    pub present_mode: vk::PresentModeKHR,
    pub window_size: [u32; 2],
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_name: "cadence".to_owned(),
            pipeline_depth: 2,
            validation: cfg!(debug_assertions),
            frame_timeout: Duration::from_secs(5),
            clear_color: [0.02, 0.02, 0.03, 1.0],
            present_mode: vk::PresentModeKHR::MAILBOX,
            window_size: [800, 600],
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `CADENCE_PIPELINE_DEPTH`, `CADENCE_VALIDATION` and
    /// `CADENCE_FRAME_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, RenderError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RenderError> {
        let mut config = Self::default();
        if let Some(depth) = parsed::<usize>(&lookup, "CADENCE_PIPELINE_DEPTH")? {
            config.pipeline_depth = depth;
        }
        if let Some(value) = lookup("CADENCE_VALIDATION") {
            config.validation = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => true,
                "0" | "false" | "off" | "no" => false,
                other => {
                    return Err(RenderError::InvalidConfig(format!(
                        "CADENCE_VALIDATION must be a boolean, got {:?}",
                        other
                    )));
                }
            };
        }
        if let Some(ms) = parsed::<u64>(&lookup, "CADENCE_FRAME_TIMEOUT_MS")? {
            config.frame_timeout = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RenderError> {
        if !(1..=3).contains(&self.pipeline_depth) {
            return Err(RenderError::InvalidConfig(format!(
                "pipeline depth {} is outside 1..=3",
                self.pipeline_depth
            )));
        }
        if self.frame_timeout.is_zero() {
            return Err(RenderError::InvalidConfig(
                "frame timeout must be positive".into(),
            ));
        }
        if self.window_size.contains(&0) {
            return Err(RenderError::InvalidConfig(format!(
                "window size {:?} has a zero dimension",
                self.window_size
            )));
        }
        Ok(())
    }

    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            pipeline_depth: self.pipeline_depth,
            clear_color: self.clear_color,
        }
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, RenderError> {
    lookup(name)
        .map(|value| {
            value.trim().parse::<T>().map_err(|_| {
                RenderError::InvalidConfig(format!("{} has an invalid value {:?}", name, value))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<EngineConfig, RenderError> {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        EngineConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = config_from(&[
            ("CADENCE_PIPELINE_DEPTH", "3"),
            ("CADENCE_VALIDATION", "off"),
            ("CADENCE_FRAME_TIMEOUT_MS", "250"),
        ])
        .unwrap();
        assert_eq!(config.pipeline_depth, 3);
        assert!(!config.validation);
        assert_eq!(config.frame_timeout, Duration::from_millis(250));
    }

    #[test]
    fn invalid_values_are_configuration_errors() {
        for vars in [
            [("CADENCE_PIPELINE_DEPTH", "0")],
            [("CADENCE_PIPELINE_DEPTH", "two")],
            [("CADENCE_VALIDATION", "maybe")],
            [("CADENCE_FRAME_TIMEOUT_MS", "0")],
        ] {
            let err = config_from(&vars).unwrap_err();
            assert!(matches!(err, RenderError::InvalidConfig(_)), "{:?}", vars);
        }
    }

    #[test]
    fn defaults_are_valid() {
        assert!(config_from(&[]).is_ok());
    }
}
