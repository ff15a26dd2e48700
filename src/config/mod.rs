// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 上传线程数上限
pub const MAX_UPLOAD_THREADS: usize = 32;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 分片上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 单个文件的并发上传线程数（1-32）
    #[serde(default = "default_upload_threads")]
    pub upload_threads: usize,
    /// 分片大小上限 (MB)，后端给出的建议值更小时以后端为准
    #[serde(default = "default_max_chunk_size_mb")]
    pub max_chunk_size_mb: u64,
    /// 多分片会话每批获取上传地址的分片数
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// 每个分片的最大尝试次数
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 首次重试延迟（毫秒），之后指数增长
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// 最大重试延迟（毫秒）
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// 总上传限速 (KB/s)，0 表示不限速
    #[serde(default)]
    pub rate_limit_kbps: u64,
    /// 规划阶段预留的进度（百分比）
    #[serde(default = "default_progress_floor")]
    pub progress_floor: f64,
    /// 分片上传阶段占用的进度跨度（百分比），剩余部分留给提交阶段
    #[serde(default = "default_progress_span")]
    pub progress_span: f64,
    /// 表示上传地址过期的 HTTP 状态码
    #[serde(default = "default_expired_status")]
    pub expired_status: u16,
    /// 单个分片请求超时（秒）
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
}

fn default_upload_threads() -> usize {
    3
}

fn default_max_chunk_size_mb() -> u64 {
    16
}

fn default_batch_size() -> usize {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_progress_floor() -> f64 {
    10.0
}

fn default_progress_span() -> f64 {
    85.0
}

fn default_expired_status() -> u16 {
    403
}

fn default_chunk_timeout_secs() -> u64 {
    300
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            upload_threads: default_upload_threads(),
            max_chunk_size_mb: default_max_chunk_size_mb(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            rate_limit_kbps: 0,
            progress_floor: default_progress_floor(),
            progress_span: default_progress_span(),
            expired_status: default_expired_status(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
        }
    }
}

impl UploadConfig {
    /// 分片大小上限（字节）
    pub fn max_chunk_size(&self) -> u64 {
        self.max_chunk_size_mb * 1024 * 1024
    }

    /// 生效的线程数，限制在 1-32
    pub fn effective_threads(&self) -> usize {
        self.upload_threads.clamp(1, MAX_UPLOAD_THREADS)
    }

    /// 限速（字节/秒），None 表示不限速
    pub fn rate_limit_bytes_per_sec(&self) -> Option<u64> {
        match self.rate_limit_kbps {
            0 => None,
            kbps => Some(kbps * 1024),
        }
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_size_mb == 0 {
            anyhow::bail!("max_chunk_size_mb 必须大于 0");
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size 必须大于 0");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts 必须大于 0");
        }
        let in_range = |v: f64| (0.0..=100.0).contains(&v);
        if !in_range(self.progress_floor)
            || !in_range(self.progress_span)
            || self.progress_floor + self.progress_span >= 100.0
        {
            anyhow::bail!(
                "进度区间非法: floor={}, span={}",
                self.progress_floor,
                self.progress_span
            );
        }
        Ok(())
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .upload
            .validate()
            .context("配置文件中的上传配置验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.upload
            .validate()
            .context("保存配置失败：上传配置非法")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);

        Ok(())
    }

    /// 加载或使用默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_upload_config() {
        let config = UploadConfig::default();
        assert_eq!(config.upload_threads, 3);
        assert_eq!(config.max_chunk_size(), 16 * 1024 * 1024);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.rate_limit_bytes_per_sec(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_effective_threads_clamped() {
        let mut config = UploadConfig::default();
        config.upload_threads = 0;
        assert_eq!(config.effective_threads(), 1);
        config.upload_threads = 100;
        assert_eq!(config.effective_threads(), MAX_UPLOAD_THREADS);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = UploadConfig::default();
        config.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = UploadConfig::default();
        config.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = UploadConfig::default();
        config.progress_floor = 20.0;
        config.progress_span = 90.0;
        assert!(config.validate().is_err());

        // 100 只留给提交成功之后
        let mut config = UploadConfig::default();
        config.progress_floor = 10.0;
        config.progress_span = 90.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [upload]
            upload_threads = 8
            rate_limit_kbps = 512
            "#,
        )
        .unwrap();
        assert_eq!(config.upload.upload_threads, 8);
        assert_eq!(config.upload.rate_limit_bytes_per_sec(), Some(512 * 1024));
        assert_eq!(config.upload.max_chunk_size_mb, 16);
        assert_eq!(config.log.level, "info");
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config/app.toml");
        let path = path.to_str().unwrap();

        let mut config = AppConfig::default();
        config.upload.upload_threads = 5;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.upload.upload_threads, 5);
    }

    #[tokio::test]
    async fn test_load_or_default_missing_file() {
        let config = AppConfig::load_or_default("/nonexistent/app.toml").await;
        assert_eq!(config.upload.upload_threads, 3);
    }
}
