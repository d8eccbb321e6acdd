//! Configuração do batchkeeper carregada a partir de `batchkeeper.toml`.
//!
//! A struct [`BatchConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `BATCHKEEPER_RM_URL` tem precedência sobre o arquivo.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::monitor::{Backoff, PollSettings};
use crate::registry::RegistrySettings;

pub const DEFAULT_CONFIG_FILE: &str = "batchkeeper.toml";
pub const RM_URL_ENV: &str = "BATCHKEEPER_RM_URL";

/// Configuração de nível superior carregada de `batchkeeper.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Diretório onde o estado das sessões é persistido.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// URL base do ResourceManager do YARN.
    #[serde(default = "default_resource_manager_url")]
    pub resource_manager_url: String,

    /// Comando usado para submeter aplicações.
    #[serde(default = "default_spark_submit")]
    pub spark_submit: PathBuf,

    #[serde(default = "default_spark_master")]
    pub spark_master: String,

    #[serde(default = "default_deploy_mode")]
    pub deploy_mode: String,

    /// Intervalo entre consultas de status, em milissegundos.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Tempo limite de cada consulta ao ResourceManager.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Atraso base em milissegundos para backoff exponencial.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Teto do atraso de backoff.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Tentativas de envio do pedido de kill antes de desistir.
    #[serde(default = "default_terminate_attempts")]
    pub terminate_attempts: u32,

    /// Quantidade de linhas de log mantidas por sessão.
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,

    /// Idade mínima, em segundos, de uma sessão terminal removida pelo `gc`.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Regex aplicada ao log para reconhecer um kill feito fora do serviço.
    #[serde(default = "default_kill_message_pattern")]
    pub kill_message_pattern: String,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".batchkeeper")
}

fn default_resource_manager_url() -> String {
    "http://localhost:8088".to_string()
}

fn default_spark_submit() -> PathBuf {
    PathBuf::from("spark-submit")
}

fn default_spark_master() -> String {
    "yarn".to_string()
}

fn default_deploy_mode() -> String {
    "cluster".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_poll_timeout_ms() -> u64 {
    10_000
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_terminate_attempts() -> u32 {
    5
}

fn default_log_tail_lines() -> usize {
    100
}

// Sete dias.
fn default_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_kill_message_pattern() -> String {
    "(?i)killed by user".to_string()
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            resource_manager_url: default_resource_manager_url(),
            spark_submit: default_spark_submit(),
            spark_master: default_spark_master(),
            deploy_mode: default_deploy_mode(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            terminate_attempts: default_terminate_attempts(),
            log_tail_lines: default_log_tail_lines(),
            retention_secs: default_retention_secs(),
            kill_message_pattern: default_kill_message_pattern(),
        }
    }
}

impl BatchConfig {
    /// Carrega a configuração de `batchkeeper.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Carrega a configuração de um caminho explícito.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<BatchConfig>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração.
        if let Ok(url) = std::env::var(RM_URL_ENV)
            && !url.is_empty()
        {
            config.resource_manager_url = url;
        }

        Ok(config)
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(self.poll_interval_ms),
            timeout: Duration::from_millis(self.poll_timeout_ms),
            backoff: Backoff {
                base_delay_ms: self.base_delay_ms,
                max_delay_ms: self.max_delay_ms,
            },
            terminate_attempts: self.terminate_attempts,
            log_tail_lines: self.log_tail_lines,
        }
    }

    pub fn registry_settings(&self) -> Result<RegistrySettings> {
        let kill_pattern = regex::Regex::new(&self.kill_message_pattern)
            .with_context(|| format!("invalid kill_message_pattern {:?}", self.kill_message_pattern))?;
        Ok(RegistrySettings {
            poll: self.poll_settings(),
            kill_pattern: Some(kill_pattern),
        })
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = BatchConfig::default();
        assert_eq!(config.resource_manager_url, "http://localhost:8088");
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 60_000);
        assert_eq!(config.log_tail_lines, 100);
        assert_eq!(config.state_dir, PathBuf::from(".batchkeeper"));
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            resource_manager_url = "http://rm.internal:8088"
            poll_interval_ms = 250
            spark_submit = "/opt/spark/bin/spark-submit"
        "#;
        let config: BatchConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.resource_manager_url, "http://rm.internal:8088");
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.spark_submit, PathBuf::from("/opt/spark/bin/spark-submit"));
        assert_eq!(config.poll_timeout_ms, 10_000);
        assert_eq!(config.deploy_mode, "cluster");
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "log_tail_lines = 20\nterminate_attempts = 2\n").unwrap();
        let config = BatchConfig::load_from(&path).unwrap();
        assert_eq!(config.log_tail_lines, 20);
        assert_eq!(config.terminate_attempts, 2);
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = BatchConfig::load_from(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.poll_timeout_ms, 10_000);
    }

    #[test]
    fn invalid_toml_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "poll_interval_ms = \"soon\"").unwrap();
        assert!(BatchConfig::load_from(&path).is_err());
    }

    #[test]
    fn poll_settings_from_config() {
        let config = BatchConfig {
            poll_interval_ms: 200,
            base_delay_ms: 50,
            max_delay_ms: 400,
            ..Default::default()
        };
        let poll = config.poll_settings();
        assert_eq!(poll.interval, Duration::from_millis(200));
        assert_eq!(poll.backoff.delay_for_attempt(1), Duration::from_millis(50));
        assert_eq!(poll.backoff.delay_for_attempt(10), Duration::from_millis(400));
    }

    #[test]
    fn invalid_kill_pattern_is_rejected() {
        let config = BatchConfig {
            kill_message_pattern: "(unclosed".into(),
            ..Default::default()
        };
        assert!(config.registry_settings().is_err());
    }
}
