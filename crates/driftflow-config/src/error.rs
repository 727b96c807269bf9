use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("設定ディレクトリが見つかりません")]
    ConfigDirNotFound,

    #[error(
        "設定ファイルが見つかりません。以下の場所を確認してください:\n\
        - カレントディレクトリ: driftflow.local.yaml, .driftflow.local.yaml, driftflow.yaml, .driftflow.yaml\n\
        - ./.driftflow/ ディレクトリ\n\
        - ~/.config/driftflow/driftflow.yaml\n\
        または DRIFTFLOW_CONFIG_PATH 環境変数で直接指定できます"
    )]
    ConfigFileNotFound,

    #[error("マニフェストが見つかりません: {0}")]
    ManifestNotFound(PathBuf),

    #[error("設定値が不正です: {0}")]
    Invalid(String),

    #[error("YAML パースエラー ({path}): {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("JSON パースエラー ({path}): {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
