//! Interface de linha de comando do batchkeeper baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (submit, list, status,
//! log, delete, watch, gc) e flags globais (--config, --verbose).

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};

use crate::state_machine::{LaunchTarget, SessionId, SubmissionSpec};

/// batchkeeper: gerenciador de sessões batch do Spark sobre YARN.
#[derive(Debug, Parser)]
#[command(name = "batchkeeper", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: batchkeeper.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submete um novo job e cria a sessão correspondente.
    Submit(SubmitArgs),

    /// Lista as sessões existentes.
    List,

    /// Mostra o estado de uma sessão.
    Status { id: SessionId },

    /// Mostra as últimas linhas de log de uma sessão.
    Log { id: SessionId },

    /// Remove uma sessão, encerrando a aplicação se ainda estiver ativa.
    Delete { id: SessionId },

    /// Acompanha todas as sessões ativas até terminarem (ou Ctrl-C).
    Watch,

    /// Remove sessões terminadas há mais tempo que `retention_secs`.
    Gc,
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    /// Jar da aplicação (use --py para scripts Python).
    #[arg(required_unless_present = "py")]
    pub jar: Option<String>,

    /// Classe principal do jar.
    #[arg(long = "class", required_unless_present = "py")]
    pub main_class: Option<String>,

    /// Script PySpark a executar em vez de um jar.
    #[arg(long, conflicts_with_all = ["jar", "main_class"])]
    pub py: Option<String>,

    /// Dependências Python adicionais, separadas por vírgula.
    #[arg(long = "py-files", value_delimiter = ',', requires = "py")]
    pub py_files: Vec<String>,

    /// Nome da aplicação no YARN.
    #[arg(long)]
    pub name: Option<String>,

    /// Propriedade Spark no formato chave=valor (pode repetir).
    #[arg(long = "conf", value_parser = parse_key_value)]
    pub conf: Vec<(String, String)>,

    /// Variável de ambiente no formato chave=valor (pode repetir).
    #[arg(long = "env", value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,

    /// Retorna assim que a aplicação for submetida, sem esperar o fim.
    #[arg(long, default_value_t = false)]
    pub detach: bool,

    /// Argumentos repassados à aplicação, após `--`.
    #[arg(last = true)]
    pub args: Vec<String>,
}

impl SubmitArgs {
    /// Converte os argumentos da linha de comando em um [`SubmissionSpec`].
    pub fn to_spec(&self) -> Result<SubmissionSpec> {
        let target = match (&self.py, &self.jar, &self.main_class) {
            (Some(script), None, None) => LaunchTarget::PySpark {
                script: script.clone(),
                py_files: self.py_files.clone(),
            },
            (None, Some(jar), Some(main_class)) => LaunchTarget::Jar {
                jar: jar.clone(),
                main_class: main_class.clone(),
            },
            (None, Some(_), None) => bail!("--class is required when submitting a jar"),
            _ => bail!("submit either a jar with --class or a script with --py"),
        };

        let mut spec = SubmissionSpec::new(target);
        spec.args = self.args.clone();
        spec.name = self.name.clone();
        spec.conf = self.conf.iter().cloned().collect();
        spec.env = self.env.iter().cloned().collect();
        Ok(spec)
    }
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}
