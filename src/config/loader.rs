use super::CompilerConfig;
use crate::error::{Error, Result};
use std::path::Path;
use tracing::debug;

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "TESTFLOW_";

impl CompilerConfig {
    /// Read a TOML file and apply environment overrides on top
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        debug!("Loaded compiler configuration from {}", path.display());
        config.merge_env_vars()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CompilerConfig = toml::from_str(content)?;
        if config.max_optimize_passes == 0 {
            return Err(Error::Config(
                "max_optimize_passes must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn merge_env_vars(&mut self) -> Result<()> {
        self.merge_vars(|name| std::env::var(name).ok())
    }

    fn merge_vars<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(image) = var("INIT_IMAGE") {
            self.images.init = image;
        }
        if let Some(image) = var("TOOLKIT_IMAGE") {
            self.images.toolkit = image;
        }
        if let Some(isolated) = var("ISOLATED_CONTAINERS") {
            self.isolated_containers = parse_flag("ISOLATED_CONTAINERS", &isolated)?;
        }
        if let Some(pure) = var("PURE_BY_DEFAULT") {
            self.pure_by_default = Some(parse_flag("PURE_BY_DEFAULT", &pure)?);
        }
        Ok(())
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!(
            "{ENV_PREFIX}{name} expects a boolean, got '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CompilerConfig::from_toml_str(
            r#"
isolated_containers = true

[images]
init = "registry.local/init:1.0"
"#,
        )
        .unwrap();
        assert!(config.isolated_containers);
        assert_eq!(config.images.init, "registry.local/init:1.0");
        assert_eq!(config.images.toolkit, "testflow/toolkit:latest");
        assert_eq!(config.paths.internal_init, "/.tktw/init");
        assert_eq!(config.max_optimize_passes, 16);
    }

    #[test]
    fn test_zero_pass_cap_is_rejected() {
        let err = CompilerConfig::from_toml_str("max_optimize_passes = 0").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = CompilerConfig::default();
        config
            .merge_vars(lookup(&[
                ("TESTFLOW_TOOLKIT_IMAGE", "mirror/toolkit:2"),
                ("TESTFLOW_ISOLATED_CONTAINERS", "yes"),
                ("TESTFLOW_PURE_BY_DEFAULT", "false"),
            ]))
            .unwrap();
        assert_eq!(config.images.toolkit, "mirror/toolkit:2");
        assert!(config.isolated_containers);
        assert_eq!(config.pure_by_default, Some(false));
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = CompilerConfig::default();
        let err = config
            .merge_vars(lookup(&[("TESTFLOW_ISOLATED_CONTAINERS", "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains("TESTFLOW_ISOLATED_CONTAINERS"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_optimize_passes = 4").unwrap();
        let config = CompilerConfig::load(file.path()).unwrap();
        assert_eq!(config.max_optimize_passes, 4);
    }
}
