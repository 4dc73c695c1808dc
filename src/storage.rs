//! storage.rs — Estado persistente entre invocações do dispatcher
//!
//! Cada chave é um arquivo pequeno em `state_dir`. Todo ciclo
//! leitura-modificação-escrita acontece dentro de um [`StateGuard`], que segura
//! um `flock` exclusivo no arquivo `.lock` do diretório.

use crate::error::StateError;
use crate::types::ConnectivityState;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

const LOCK_FILE: &str = ".lock";
const LOCK_POLL: Duration = Duration::from_millis(50);

/// Chaves conhecidas do diretório de estado.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKey {
    LastConnectionState,
    LastConnectionDrop,
    LastInterfaceDown,
}

impl StateKey {
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::LastConnectionState => "last_connection_state",
            Self::LastConnectionDrop => "last_connection_drop",
            Self::LastInterfaceDown => "last_if_down",
        }
    }
}

/// Diretório de estado que sobrevive a reboot.
#[derive(Debug, Clone)]
pub struct Storage {
    dir: PathBuf,
    lock_timeout: Duration,
}

impl Storage {
    pub fn new(dir: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            lock_timeout,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Abre o escopo exclusivo. Espera no máximo `lock_timeout`.
    pub async fn lock(&self) -> Result<StateGuard, StateError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StateError::io(&self.dir, e))?;

        let lock_path = self.dir.join(LOCK_FILE);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| StateError::io(&lock_path, e))?;

        let deadline = Instant::now() + self.lock_timeout;
        loop {
            // SAFETY: o descritor pertence a `file`, que vive até o fim do guard.
            let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if ret == 0 {
                debug!("[ESTADO] Lock adquirido em {}", lock_path.display());
                return Ok(StateGuard {
                    dir: self.dir.clone(),
                    lock: file,
                });
            }

            if Instant::now() >= deadline {
                return Err(StateError::LockTimeout {
                    path: lock_path,
                    waited_ms: self.lock_timeout.as_millis() as u64,
                });
            }
            sleep(LOCK_POLL).await;
        }
    }
}

/// Acesso exclusivo ao estado. O lock é liberado no drop.
#[derive(Debug)]
pub struct StateGuard {
    dir: PathBuf,
    lock: std::fs::File,
}

impl Drop for StateGuard {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.lock.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

impl StateGuard {
    fn path(&self, key: StateKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Lê o valor cru de uma chave. Arquivo ausente vira `None`; conteúdo que
    /// não é UTF-8 é descartado como inconsistente.
    pub async fn read(&self, key: StateKey) -> Result<Option<String>, StateError> {
        let path = self.path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::io(path, e)),
        };
        match String::from_utf8(bytes) {
            Ok(content) => Ok(Some(content.trim().to_string())),
            Err(e) => {
                warn!(
                    "[ESTADO] {} não é UTF-8 ({}), descartando.",
                    key.file_name(),
                    e
                );
                self.remove(key).await?;
                Ok(None)
            }
        }
    }

    /// Grava de forma atômica (arquivo temporário + fsync + rename).
    pub async fn write(&self, key: StateKey, value: &str) -> Result<(), StateError> {
        let path = self.path(key);
        let tmp = self.dir.join(format!("{}.tmp", key.file_name()));

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| StateError::io(&tmp, e))?;
        file.write_all(value.as_bytes())
            .await
            .map_err(|e| StateError::io(&tmp, e))?;
        file.sync_all().await.map_err(|e| StateError::io(&tmp, e))?;
        drop(file);

        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StateError::io(&path, e))
    }

    /// Remove a chave. Remover algo ausente não é erro.
    pub async fn remove(&self, key: StateKey) -> Result<(), StateError> {
        let path = self.path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::io(path, e)),
        }
    }

    /// Lê um timestamp (epoch em segundos). Conteúdo inválido é tratado como
    /// ausente e o arquivo é removido.
    pub async fn read_timestamp(&self, key: StateKey) -> Result<Option<i64>, StateError> {
        let Some(raw) = self.read(key).await? else {
            return Ok(None);
        };
        match raw.parse::<i64>() {
            Ok(ts) => Ok(Some(ts)),
            Err(_) => {
                warn!(
                    "[ESTADO] Marcador {} inconsistente ({:?}), descartando.",
                    key.file_name(),
                    raw
                );
                self.remove(key).await?;
                Ok(None)
            }
        }
    }

    pub async fn write_timestamp(&self, key: StateKey, ts: i64) -> Result<(), StateError> {
        self.write(key, &ts.to_string()).await
    }

    pub async fn connection_state(&self) -> Result<Option<ConnectivityState>, StateError> {
        Ok(self
            .read(StateKey::LastConnectionState)
            .await?
            .map(|raw| ConnectivityState::parse(&raw)))
    }

    pub async fn set_connection_state(&self, state: &ConnectivityState) -> Result<(), StateError> {
        self.write(StateKey::LastConnectionState, state.as_str()).await
    }
}
