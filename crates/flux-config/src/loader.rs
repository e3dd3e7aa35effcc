use anyhow::{anyhow, Result};
use config::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};

use crate::RuntimeConfig;

/// 配置加载器
pub struct ConfigLoader {
    config_path: PathBuf,
}

impl ConfigLoader {
    /// 创建配置加载器
    pub fn new<P: AsRef<Path>>(config_path: P) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
        }
    }

    /// 加载配置：文件（可选）+ `FLUX_` 前缀环境变量，例如 `FLUX_SCRIPT__TIMEOUT_SECONDS`
    pub fn load(&self) -> Result<RuntimeConfig> {
        let mut builder = Config::builder();

        if self.config_path.exists() {
            builder = builder.add_source(File::new(
                self.config_path.to_str().ok_or_else(|| anyhow!("Invalid config path"))?,
                FileFormat::Toml,
            ));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("FLUX")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// 加载并验证配置
    pub fn load_validated(&self) -> Result<RuntimeConfig> {
        let config = self.load()?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// 验证配置
    pub fn validate(config: &RuntimeConfig) -> Result<()> {
        if config.script.timeout_seconds == 0 {
            return Err(anyhow!("script.timeout_seconds must be greater than 0"));
        }

        // 超时后阻塞线程上的脚本仍会继续运行，必须有操作数上限
        if config.script.max_operations == 0 {
            return Err(anyhow!("script.max_operations must be greater than 0"));
        }

        if config.bus.capacity == 0 {
            return Err(anyhow!("bus.capacity must be greater than 0"));
        }

        if config.rules.extension.trim_start_matches('.').is_empty() {
            return Err(anyhow!("rules.extension must not be empty"));
        }

        Ok(())
    }

    /// 序列化为 TOML
    pub fn to_toml(config: &RuntimeConfig) -> Result<String> {
        Ok(toml::to_string_pretty(config)?)
    }
}
