// 本地配置持久化服务

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

use crate::models::AppSettings;

/// 数据库路径环境变量
pub const DB_PATH_ENV: &str = "OCULTUM_DB";

/// 获取配置目录路径
/// macOS: ~/Library/Application Support/ocultum
/// Linux: ~/.config/ocultum
/// Windows: C:\Users\<用户名>\AppData\Roaming\ocultum
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("无法获取系统配置目录")?
        .join("ocultum");
    if !config_dir.exists() {
        fs::create_dir_all(&config_dir).context("无法创建配置目录")?;
    }
    Ok(config_dir)
}

// ======================== Settings 配置持久化 ========================

/// 获取设置配置文件路径
pub fn get_settings_file() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("settings.json"))
}

/// 加载应用设置（文件不存在时使用默认值），并应用环境变量覆盖
pub fn load_settings() -> Result<AppSettings> {
    let mut settings = load_settings_from(&get_settings_file()?)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    Ok(settings)
}

/// 从指定文件加载设置
pub fn load_settings_from(path: &std::path::Path) -> Result<AppSettings> {
    if !path.exists() {
        return Ok(AppSettings::default());
    }
    let content = fs::read_to_string(path).context("无法读取设置配置文件")?;
    let settings: AppSettings = serde_json::from_str(&content).context("无法解析设置配置文件")?;
    Ok(settings)
}

/// 保存应用设置
pub fn save_settings(settings: &AppSettings) -> Result<()> {
    let path = get_settings_file()?;
    let content = serde_json::to_string_pretty(settings).context("无法序列化设置配置")?;
    fs::write(&path, content).context("无法写入设置配置文件")?;
    Ok(())
}

/// 环境变量覆盖
pub fn apply_env_overrides<F>(settings: &mut AppSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = lookup(DB_PATH_ENV).filter(|p| !p.is_empty()) {
        settings.database.path = Some(path);
    }
}

// ======================== 数据文件路径 ========================

/// 数据库文件路径
pub fn database_path(settings: &AppSettings) -> Result<PathBuf> {
    match &settings.database.path {
        Some(path) => Ok(PathBuf::from(path)),
        None => Ok(get_config_dir()?.join("ocultum.db")),
    }
}

/// 大输出存放目录
pub fn artifacts_dir(settings: &AppSettings) -> Result<PathBuf> {
    let dir = match &settings.output.artifacts_dir {
        Some(dir) => PathBuf::from(dir),
        None => get_config_dir()?.join("artifacts"),
    };
    if !dir.exists() {
        fs::create_dir_all(&dir).context("无法创建输出存放目录")?;
    }
    Ok(dir)
}
