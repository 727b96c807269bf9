pub mod error;

pub use error::*;

use driftflow_engine::{EngineOptions, ExecutorOptions, ResourceDeclaration, RetryConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_CANDIDATES: [&str; 4] = [
    "driftflow.local.yaml",
    ".driftflow.local.yaml",
    "driftflow.yaml",
    ".driftflow.yaml",
];

/// DriftFlowの設定ディレクトリを取得
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("driftflow");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// カレントディレクトリを起点に設定ファイルを探す
pub fn find_config_file() -> Result<PathBuf> {
    find_config_file_in(&std::env::current_dir()?)
}

/// プロジェクトの設定ファイルを探す
///
/// 以下の優先順位で設定ファイルを検索:
/// 1. 環境変数 DRIFTFLOW_CONFIG_PATH (直接パス指定)
/// 2. プロジェクトディレクトリ: driftflow.local.yaml, .driftflow.local.yaml, driftflow.yaml, .driftflow.yaml
/// 3. <project>/.driftflow/ ディレクトリ内: 同様の順序
/// 4. ~/.config/driftflow/driftflow.yaml (グローバル設定)
pub fn find_config_file_in(project_dir: &Path) -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var("DRIFTFLOW_CONFIG_PATH") {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
    }

    for filename in &CONFIG_CANDIDATES {
        let path = project_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    let state_dir = project_dir.join(".driftflow");
    if state_dir.is_dir() {
        for filename in &CONFIG_CANDIDATES {
            let path = state_dir.join(filename);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("driftflow").join("driftflow.yaml");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::ConfigFileNotFound)
}

/// エンジン設定
///
/// 設定ファイルで省略された項目はデフォルト値になる。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 同時に実行するプロバイダー呼び出しの上限
    pub parallelism: usize,

    pub retry: RetrySettings,

    /// プロバイダー呼び出し1回あたりのタイムアウト (秒)
    pub call_timeout_secs: u64,

    /// ステートロックのリース期間 (秒)
    pub lock_lease_secs: u64,

    /// ステートディレクトリ (省略時は `<project>/.driftflow`)
    pub state_dir: Option<PathBuf>,

    /// ロック保持者として記録する名前
    pub holder: Option<String>,

    pub local: LocalProviderSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            parallelism: 4,
            retry: RetrySettings::default(),
            call_timeout_secs: 300,
            lock_lease_secs: 3600,
            state_dir: None,
            holder: None,
            local: LocalProviderSettings::default(),
        }
    }
}

/// リトライ設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// local プロバイダーの設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalProviderSettings {
    /// リソースを書き出すディレクトリ (省略時は `<state_dir>/local-cloud`)
    pub root: Option<PathBuf>,
}

impl Settings {
    /// 値の妥当性を検証
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(ConfigError::Invalid(
                "parallelism は 1 以上である必要があります".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts は 1 以上である必要があります".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.backoff_multiplier は 1.0 以上である必要があります".to_string(),
            ));
        }
        if self.call_timeout_secs == 0 || self.lock_lease_secs == 0 {
            return Err(ConfigError::Invalid(
                "call_timeout_secs と lock_lease_secs は 1 以上である必要があります".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry.max_attempts,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            backoff_multiplier: self.retry.backoff_multiplier,
        }
    }

    /// エンジンのオプションに変換
    pub fn engine_options(&self) -> EngineOptions {
        let mut options = EngineOptions {
            executor: ExecutorOptions {
                parallelism: self.parallelism,
                retry: self.retry_config(),
                call_timeout: Duration::from_secs(self.call_timeout_secs),
            },
            lock_lease: Duration::from_secs(self.lock_lease_secs),
            ..EngineOptions::default()
        };
        if let Some(holder) = &self.holder {
            options.holder = holder.clone();
        }
        options
    }

    /// ステートディレクトリを解決 (相対パスはプロジェクトルート基準)
    pub fn state_dir(&self, project_root: &Path) -> PathBuf {
        match &self.state_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => project_root.join(dir),
            None => project_root.join(".driftflow"),
        }
    }

    /// local プロバイダーのルートディレクトリを解決
    pub fn local_root(&self, project_root: &Path) -> PathBuf {
        match &self.local.root {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => project_root.join(dir),
            None => self.state_dir(project_root).join("local-cloud"),
        }
    }
}

/// 指定されたファイルから設定を読み込む
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    let content = std::fs::read_to_string(path)?;
    let settings: Settings = if content.trim().is_empty() {
        Settings::default()
    } else {
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?
    };
    settings.validate()?;
    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// 設定ファイルを探して読み込む (見つからなければデフォルト値)
pub fn load_settings() -> Result<Settings> {
    load_settings_in(&std::env::current_dir()?)
}

/// プロジェクトディレクトリを起点に設定を読み込む
pub fn load_settings_in(project_dir: &Path) -> Result<Settings> {
    match find_config_file_in(project_dir) {
        Ok(path) => load_settings_from(&path),
        Err(ConfigError::ConfigFileNotFound) => {
            tracing::debug!("No settings file found, using defaults");
            Ok(Settings::default())
        }
        Err(e) => Err(e),
    }
}

/// マニフェスト (リソース宣言の一覧)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub resources: Vec<ResourceDeclaration>,
}

/// マニフェストファイルを読み込む
///
/// 拡張子が `.json` なら JSON、それ以外は YAML として解釈する。
pub fn load_manifest(path: &Path) -> Result<Vec<ResourceDeclaration>> {
    if !path.exists() {
        return Err(ConfigError::ManifestNotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let manifest: Manifest = if is_json {
        serde_json::from_str(&content).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?
    };

    tracing::debug!(
        "Loaded {} declarations from {}",
        manifest.resources.len(),
        path.display()
    );
    Ok(manifest.resources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    #[test]
    fn test_get_config_dir() {
        let result = get_config_dir();
        assert!(result.is_ok());

        let config_dir = result.unwrap();
        assert!(config_dir.ends_with("driftflow"));
        assert!(config_dir.exists());
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_current_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        fs::write(temp_dir.path().join("driftflow.yaml"), "parallelism: 2").unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let result = find_config_file();
        assert!(result.unwrap().ends_with("driftflow.yaml"));

        std::env::set_current_dir(original_dir).unwrap();
    }

    #[test]
    #[serial]
    fn test_find_config_file_local_priority() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        fs::write(temp_dir.path().join("driftflow.yaml"), "parallelism: 2").unwrap();
        fs::write(temp_dir.path().join("driftflow.local.yaml"), "parallelism: 8").unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        // driftflow.local.yaml が優先される
        let result = find_config_file().unwrap();
        assert!(result.ends_with("driftflow.local.yaml"));

        std::env::set_current_dir(original_dir).unwrap();
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_project_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        let project_dir = temp_dir.path().join(".driftflow");
        fs::create_dir(&project_dir).unwrap();
        fs::write(project_dir.join("driftflow.yaml"), "parallelism: 2").unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let result = find_config_file().unwrap();
        assert!(result.ends_with(".driftflow/driftflow.yaml"));

        std::env::set_current_dir(original_dir).unwrap();
    }

    #[test]
    #[serial]
    fn test_find_config_file_env_var() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("custom.yaml");
        fs::write(&config_path, "parallelism: 1").unwrap();

        unsafe {
            std::env::set_var("DRIFTFLOW_CONFIG_PATH", config_path.to_str().unwrap());
        }

        let result = find_config_file().unwrap();
        assert_eq!(result, config_path);

        unsafe {
            std::env::remove_var("DRIFTFLOW_CONFIG_PATH");
        }
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_explicit_project() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join(".driftflow.yaml"), "parallelism: 2").unwrap();

        let result = find_config_file_in(temp_dir.path()).unwrap();
        assert_eq!(result, temp_dir.path().join(".driftflow.yaml"));

        let settings = load_settings_in(temp_dir.path()).unwrap();
        assert_eq!(settings.parallelism, 2);
    }

    #[test]
    #[serial]
    fn test_load_settings_falls_back_to_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        // グローバル設定が存在する環境では比較できない
        let global_exists = dirs::config_dir()
            .map(|d| d.join("driftflow").join("driftflow.yaml").exists())
            .unwrap_or(false);
        if !global_exists {
            assert_eq!(load_settings().unwrap(), Settings::default());
        }

        std::env::set_current_dir(original_dir).unwrap();
    }

    #[test]
    fn test_partial_settings_keep_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("driftflow.yaml");
        fs::write(
            &path,
            "parallelism: 8\nretry:\n  max_attempts: 5\nstate_dir: state\n",
        )
        .unwrap();

        let settings = load_settings_from(&path).unwrap();
        assert_eq!(settings.parallelism, 8);
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.retry.initial_delay_ms, 1000);
        assert_eq!(settings.call_timeout_secs, 300);
        assert_eq!(
            settings.state_dir(Path::new("/srv/app")),
            PathBuf::from("/srv/app/state")
        );
        assert_eq!(
            settings.local_root(Path::new("/srv/app")),
            PathBuf::from("/srv/app/state/local-cloud")
        );

        let options = settings.engine_options();
        assert_eq!(options.executor.parallelism, 8);
        assert_eq!(options.executor.retry.max_attempts, 5);
        assert_eq!(options.executor.call_timeout, Duration::from_secs(300));
        assert_eq!(options.lock_lease, Duration::from_secs(3600));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("driftflow.yaml");
        fs::write(&path, "parallelism: 0\n").unwrap();

        assert!(matches!(
            load_settings_from(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_load_yaml_manifest() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("resources.yaml");
        fs::write(
            &path,
            r#"
resources:
  - type: application
    name: api
    provider: local
    attributes:
      display_name: api
  - type: federated_credential
    name: github
    provider: local
    attributes:
      application_id:
        $ref: application.api
        output: client_id
      subject: "repo:org/api:ref:refs/heads/main"
"#,
        )
        .unwrap();

        let decls = load_manifest(&path).unwrap();
        assert_eq!(decls.len(), 2);
        assert_eq!(decls[1].id().to_string(), "federated_credential.github");

        let graph = driftflow_engine::ResourceGraph::build(decls).unwrap();
        let app = driftflow_engine::ResourceId::new("application", "api");
        let cred = driftflow_engine::ResourceId::new("federated_credential", "github");
        assert!(graph.dependencies(&cred).unwrap().contains(&app));
    }

    #[test]
    fn test_load_json_manifest() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("resources.json");
        fs::write(
            &path,
            r#"{"resources": [{"type": "storage_account", "name": "logs", "provider": "local",
                "attributes": {"location": "westeurope"}}]}"#,
        )
        .unwrap();

        let decls = load_manifest(&path).unwrap();
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].provider, "local");
    }

    #[test]
    fn test_missing_manifest() {
        let result = load_manifest(Path::new("/nonexistent/resources.yaml"));
        assert!(matches!(result, Err(ConfigError::ManifestNotFound(_))));
    }
}
