//! Tipos de erro do adaptador de status do ResourceManager.
//!
//! Todos os erros de [`AdapterError`] são transitórios do ponto de vista da
//! sessão: o monitor os registra e tenta de novo com backoff, sem alterar o
//! estado da sessão.

use thiserror::Error;

/// Erros que podem ocorrer ao consultar o ResourceManager.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// O ResourceManager respondeu com um status HTTP inesperado (ex.: 500, 503).
    #[error("resource manager returned status {status}: {message}")]
    Api { status: u16, message: String },

    /// A consulta não terminou dentro do tempo limite configurado.
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    /// Falha de rede subjacente (DNS, conexão recusada, corpo inválido).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}
