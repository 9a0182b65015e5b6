use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Anything that can be saved and loaded as ron
pub trait Config: Send + Sync {
    fn config(&self) -> Result<String>;
    fn load_config(&mut self, config: &str) -> Result<()>;
}

impl<T: Serialize + DeserializeOwned + Send + Sync> Config for T {
    fn config(&self) -> Result<String> {
        ron::to_string(self).context("Failed to serialize config")
    }
    fn load_config(&mut self, config: &str) -> Result<()> {
        *self = ron::from_str(config).context(format!("Failed to load config {}", config))?;
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct LayoutConfig {
    /// alignment of every backing region, must be a power of two
    pub alignment: usize,
    /// swap in the shift/mask resolver when every extent on a path is a power of two
    pub pow2_fast_path: bool,
    /// cap on the bytes live at once in a context built with `LayoutContext::from_config`
    pub max_region_bytes: Option<usize>,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        LayoutConfig { alignment: 64, pow2_fast_path: true, max_region_bytes: None }
    }
}

impl LayoutConfig {
    pub fn from_ron(src: &str) -> Result<Self> {
        let mut config = LayoutConfig::default();
        config.load_config(src)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.alignment.is_power_of_two(), "alignment {} is not a power of two", self.alignment);
        Ok(())
    }
}

#[test]
fn config_round_trip() {
    let config = LayoutConfig { alignment: 16, pow2_fast_path: false, max_region_bytes: Some(1 << 20) };
    let src = config.config().unwrap();
    assert_eq!(LayoutConfig::from_ron(&src).unwrap(), config);
}

#[test]
fn config_partial_and_invalid() {
    let config = LayoutConfig::from_ron("(pow2_fast_path: false)").unwrap();
    assert_eq!(config.alignment, 64);
    assert!(!config.pow2_fast_path);

    assert!(LayoutConfig::from_ron("(alignment: 48)").is_err());
    assert!(LayoutConfig { alignment: 48, ..LayoutConfig::default() }.validate().is_err());
    assert!(LayoutConfig::from_ron("(alignment: \"wide\")").is_err());
}
