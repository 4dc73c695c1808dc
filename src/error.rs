use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

/// Falhas do diretório de estado persistente.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("erro de E/S em {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("timeout de {waited_ms}ms aguardando lock em {path}")]
    LockTimeout { path: PathBuf, waited_ms: u64 },
}

impl StateError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Falhas ao reportar tags para a API remota.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("credenciais indisponíveis: {0}")]
    Credentials(String),
    #[error("falha de transporte: {0}")]
    Transport(String),
    #[error("status inesperado da API: {0}")]
    UnexpectedStatus(u16),
}

/// Resultado de uma operação de melhor esforço.
///
/// Nunca é propagado: quem recebe decide apenas se loga.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BestEffort {
    Done,
    Failed(String),
}

impl BestEffort {
    pub fn from_result<T, E: std::fmt::Display>(result: Result<T, E>) -> Self {
        match result {
            Ok(_) => Self::Done,
            Err(e) => Self::Failed(e.to_string()),
        }
    }

    /// Loga a falha (se houver) e devolve se a operação foi concluída.
    pub fn log(self, context: &str) -> bool {
        match self {
            Self::Done => true,
            Self::Failed(reason) => {
                warn!("[MELHOR ESFORÇO] {} falhou: {}", context, reason);
                false
            }
        }
    }
}
