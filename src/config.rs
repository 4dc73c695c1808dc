use config as config_crate;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Caminho padrão do arquivo de configuração (extensão resolvida pelo crate `config`).
pub const DEFAULT_CONFIG_PATH: &str = "/etc/monitoramento-quedas/config";

/// Configuração operacional do sistema.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Diretório que sobrevive a reboot, onde ficam os marcadores.
    pub state_dir: PathBuf,
    /// Interface observada para eventos up/down.
    pub watched_interface: String,
    /// Duração mínima (segundos) de uma queda para ser reportada.
    pub con_lost_min_len: u64,
    /// Espera máxima pelo lock do diretório de estado.
    pub lock_timeout_ms: u64,
    pub tags: TagNames,
    pub api: ApiConfig,
    pub diagnostics: DiagnosticsConfig,
}

/// Nomes das tags gravadas no registro do dispositivo.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TagNames {
    pub con_lost: String,
    pub if_down: String,
    pub if_up: String,
    pub powerline: String,
}

/// Parâmetros de acesso à API de tags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// JSON do dispositivo com `apiEndpoint`, `deviceApiKey` e `deviceId`.
    pub credentials_file: PathBuf,
    /// Timeout por tentativa, em segundos.
    pub timeout_secs: u64,
    /// Retentativas automáticas no transporte.
    pub retries: u32,
    /// Espera fixa entre tentativas.
    pub retry_delay_ms: u64,
}

/// Coleta de diagnóstico durante a queda (variante estendida).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub enabled: bool,
    pub root_dir: PathBuf,
    /// Imagem de container com tcpdump e a ferramenta de PLC.
    pub image: String,
    /// Executável do runtime de containers.
    pub runtime: String,
    /// Limite da captura de pacotes, em segundos.
    pub capture_secs: u64,
    /// Limite da sonda de powerline, em segundos.
    pub probe_secs: u64,
    pub capture_interface: String,
    /// Comando da sonda de powerline executado dentro do container.
    pub probe_command: Vec<String>,
    pub lease_file: PathBuf,
    pub capture_name: String,
    pub probe_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/mnt/data/monitoramento-quedas"),
            watched_interface: "wlan0".to_string(),
            con_lost_min_len: 60,
            lock_timeout_ms: 60_000,
            tags: TagNames::default(),
            api: ApiConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

impl Default for TagNames {
    fn default() -> Self {
        Self {
            con_lost: "connectivity_lost".to_string(),
            if_down: "interface_down".to_string(),
            if_up: "interface_up".to_string(),
            powerline: "powerline_adapter".to_string(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            credentials_file: PathBuf::from("/mnt/boot/config.json"),
            timeout_secs: 5,
            retries: 3,
            retry_delay_ms: 1_000,
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            root_dir: PathBuf::from("/mnt/data/diagnostics"),
            image: "nicolaka/netshoot:latest".to_string(),
            runtime: "balena-engine".to_string(),
            capture_secs: 900,
            probe_secs: 60,
            capture_interface: "any".to_string(),
            probe_command: vec!["plcstat".to_string(), "-t".to_string()],
            lease_file: PathBuf::from("/var/lib/NetworkManager/internal.lease"),
            capture_name: "outage-pcap".to_string(),
            probe_name: "outage-plc".to_string(),
        }
    }
}

impl Config {
    /// Carrega de `MONITOR_CONFIG` (ou do caminho padrão) + variáveis `MONITOR__*`.
    pub fn load() -> anyhow::Result<Self> {
        let path =
            std::env::var("MONITOR_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> anyhow::Result<Self> {
        let settings = config_crate::Config::builder()
            .add_source(config_crate::File::with_name(path).required(false))
            .add_source(
                config_crate::Environment::with_prefix("MONITOR")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate().map_err(anyhow::Error::msg)?;
        Ok(config)
    }

    /// Validação dos campos que não podem ficar vazios ou zerados.
    pub fn validate(&self) -> Result<(), String> {
        if self.state_dir.as_os_str().is_empty() {
            return Err("state_dir não pode ser vazio".into());
        }
        if self.watched_interface.trim().is_empty() {
            return Err("watched_interface não pode ser vazio".into());
        }
        if self.api.timeout_secs == 0 {
            return Err("api.timeout_secs deve ser maior que zero".into());
        }
        for (name, value) in [
            ("tags.con_lost", &self.tags.con_lost),
            ("tags.if_down", &self.tags.if_down),
            ("tags.if_up", &self.tags.if_up),
            ("tags.powerline", &self.tags.powerline),
        ] {
            if value.trim().is_empty() {
                return Err(format!("{} não pode ser vazio", name));
            }
        }
        if self.diagnostics.enabled {
            if self.diagnostics.capture_secs == 0 {
                return Err("diagnostics.capture_secs deve ser maior que zero".into());
            }
            if self.diagnostics.image.trim().is_empty() {
                return Err("diagnostics.image não pode ser vazio".into());
            }
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}
