//! reporter.rs — Upsert idempotente de tags na API de gerenciamento
//!
//! A API não oferece upsert: tenta-se o POST e, em `409 Conflict`, faz-se o
//! PATCH filtrado por chave e dispositivo.

use crate::config::ApiConfig;
use crate::error::{BestEffort, ReportError};
use crate::types::{DeviceTag, TagOutcome, TagValue};
use serde::Deserialize;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use reqwest::Url;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

const STATUS_CREATED: u16 = 201;
const STATUS_CONFLICT: u16 = 409;

/// Endpoint e credenciais vigentes no momento da chamada.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCredentials {
    pub api_url: String,
    pub api_key: String,
    pub device_id: i64,
}

/// Colaborador que resolve credenciais imediatamente antes de cada chamada.
pub trait CredentialSource {
    fn resolve(&self) -> Result<ApiCredentials, ReportError>;
}

/// Lê o `config.json` do dispositivo, com sobrescrita por ambiente
/// (`MONITOR_API_URL`, `MONITOR_API_KEY`, `MONITOR_DEVICE_ID`).
#[derive(Debug, Clone)]
pub struct DeviceConfigFile {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceConfigJson {
    api_endpoint: Option<String>,
    device_api_key: Option<String>,
    device_id: Option<i64>,
}

impl DeviceConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialSource for DeviceConfigFile {
    fn resolve(&self) -> Result<ApiCredentials, ReportError> {
        let from_file = match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str::<DeviceConfigJson>(&raw).map_err(|e| {
                ReportError::Credentials(format!("{} inválido: {}", self.path.display(), e))
            })?,
            Err(e) => {
                debug!(
                    "[CREDENCIAIS] {} indisponível ({}), usando apenas ambiente.",
                    self.path.display(),
                    e
                );
                DeviceConfigJson {
                    api_endpoint: None,
                    device_api_key: None,
                    device_id: None,
                }
            }
        };

        let api_url = std::env::var("MONITOR_API_URL")
            .ok()
            .or(from_file.api_endpoint)
            .ok_or_else(|| ReportError::Credentials("endpoint da API ausente".into()))?;
        let api_key = std::env::var("MONITOR_API_KEY")
            .ok()
            .or(from_file.device_api_key)
            .ok_or_else(|| ReportError::Credentials("chave da API ausente".into()))?;
        let device_id = match std::env::var("MONITOR_DEVICE_ID") {
            Ok(raw) => Some(raw.trim().parse::<i64>().map_err(|_| {
                ReportError::Credentials(format!("MONITOR_DEVICE_ID inválido: {:?}", raw))
            })?),
            Err(_) => from_file.device_id,
        }
        .ok_or_else(|| ReportError::Credentials("id do dispositivo ausente".into()))?;

        Ok(ApiCredentials {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            device_id,
        })
    }
}

/// Transporte HTTP dos dois pedidos do protocolo. Devolve o status recebido.
pub trait TagTransport {
    fn create(
        &self,
        creds: &ApiCredentials,
        tag: &DeviceTag,
    ) -> impl Future<Output = Result<u16, ReportError>>;

    fn update(
        &self,
        creds: &ApiCredentials,
        tag_key: &str,
        value: &TagValue,
    ) -> impl Future<Output = Result<u16, ReportError>>;
}

/// Política de retentativa do transporte.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(api: &ApiConfig) -> Self {
        Self {
            timeout: Duration::from_secs(api.timeout_secs),
            retries: api.retries,
            delay: Duration::from_millis(api.retry_delay_ms),
        }
    }

    /// Teto de uma chamada inteira: `timeout × retries` (ao menos um timeout).
    pub fn budget(&self) -> Duration {
        self.timeout.saturating_mul(self.retries.max(1))
    }
}

/// Status que valem nova tentativa (mesmo critério do `curl --retry`).
pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

/// `{api_url}/v6/device_tag`.
fn device_tag_url(creds: &ApiCredentials) -> Result<Url, ReportError> {
    Url::parse(&format!("{}/v6/device_tag", creds.api_url)).map_err(|e| {
        ReportError::Credentials(format!("endpoint inválido {:?}: {}", creds.api_url, e))
    })
}

/// URL do PATCH com `$filter` OData codificado na query.
fn patch_url(creds: &ApiCredentials, tag_key: &str) -> Result<Url, ReportError> {
    let mut url = device_tag_url(creds)?;
    let filter = format!(
        "(tag_key eq '{}') and (device eq {})",
        tag_key.replace('\'', "''"),
        creds.device_id
    );
    url.query_pairs_mut().append_pair("$filter", &filter);
    Ok(url)
}

/// Transporte real via `reqwest`, com timeout por tentativa.
pub struct HttpTransport {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl HttpTransport {
    pub fn new(policy: RetryPolicy) -> Result<Self, ReportError> {
        let client = reqwest::Client::builder()
            .timeout(policy.timeout)
            .build()
            .map_err(|e| ReportError::Transport(e.to_string()))?;
        Ok(Self::with_client(client, policy))
    }

    pub fn with_client(client: reqwest::Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    /// Repete o pedido dentro do orçamento da política; estourado o orçamento,
    /// a tentativa em curso é abandonada.
    async fn send_with_retry(
        &self,
        label: &str,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<u16, ReportError> {
        let budget = self.policy.budget();
        match timeout(budget, self.attempts(label, build)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("[HTTP] {} excedeu {:?}, desistindo.", label, budget);
                Err(ReportError::Transport(format!(
                    "{} sem resposta em {:?}",
                    label, budget
                )))
            }
        }
    }

    async fn attempts(
        &self,
        label: &str,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<u16, ReportError> {
        let attempts = self.policy.retries + 1;
        let mut last_error = ReportError::Transport("nenhuma tentativa realizada".into());

        for attempt in 0..attempts {
            debug!("[HTTP] {} (tentativa {}/{})", label, attempt + 1, attempts);

            match build().send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if !is_retryable_status(status) {
                        return Ok(status);
                    }
                    warn!("[HTTP] {} retornou {}, tentando novamente...", label, status);
                    last_error = ReportError::UnexpectedStatus(status);
                }
                Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                    warn!("[HTTP] {} falhou: {}, tentando novamente...", label, e);
                    last_error = ReportError::Transport(e.to_string());
                }
                Err(e) => return Err(ReportError::Transport(e.to_string())),
            }

            if attempt + 1 < attempts {
                sleep(self.policy.delay).await;
            }
        }

        match last_error {
            ReportError::UnexpectedStatus(status) => Ok(status),
            other => Err(other),
        }
    }
}

impl TagTransport for HttpTransport {
    async fn create(&self, creds: &ApiCredentials, tag: &DeviceTag) -> Result<u16, ReportError> {
        let url = device_tag_url(creds)?;
        self.send_with_retry("POST device_tag", || {
            self.client
                .post(url.clone())
                .bearer_auth(&creds.api_key)
                .json(tag)
        })
        .await
    }

    async fn update(
        &self,
        creds: &ApiCredentials,
        tag_key: &str,
        value: &TagValue,
    ) -> Result<u16, ReportError> {
        let url = patch_url(creds, tag_key)?;
        self.send_with_retry("PATCH device_tag", || {
            self.client
                .patch(url.clone())
                .bearer_auth(&creds.api_key)
                .json(value)
        })
        .await
    }
}

/// Destino das tags, visto pela máquina de estados.
pub trait TagSink {
    fn set_tag(
        &self,
        key: &str,
        value: &str,
    ) -> impl Future<Output = Result<TagOutcome, ReportError>>;
}

/// Cria ou atualiza tags do dispositivo.
pub struct TagReporter<T, C> {
    transport: T,
    credentials: C,
}

impl<T: TagTransport, C: CredentialSource> TagReporter<T, C> {
    pub fn new(transport: T, credentials: C) -> Self {
        Self {
            transport,
            credentials,
        }
    }
}

impl<T: TagTransport, C: CredentialSource> TagSink for TagReporter<T, C> {
    async fn set_tag(&self, key: &str, value: &str) -> Result<TagOutcome, ReportError> {
        let creds = self.credentials.resolve().inspect_err(|e| {
            error!("[TAG {}] Sem credenciais: {}", key, e);
        })?;

        let tag = DeviceTag {
            device: creds.device_id,
            tag_key: key.to_string(),
            value: value.to_string(),
        };

        let status = self.transport.create(&creds, &tag).await.inspect_err(|e| {
            error!("[TAG {}] Falha ao criar: {}", key, e);
        })?;

        match status {
            STATUS_CREATED => {
                info!("[TAG {}] Criada com valor {:?}.", key, value);
                Ok(TagOutcome::Created)
            }
            STATUS_CONFLICT => {
                debug!("[TAG {}] Já existe, atualizando.", key);
                let patch = self
                    .transport
                    .update(
                        &creds,
                        key,
                        &TagValue {
                            value: value.to_string(),
                        },
                    )
                    .await;
                if let Ok(status) = &patch {
                    info!(
                        "[TAG {}] Atualizada com valor {:?} (status {}).",
                        key, value, status
                    );
                }
                BestEffort::from_result(patch).log(&format!("PATCH da tag {}", key));
                Ok(TagOutcome::Updated)
            }
            other => {
                error!("[TAG {}] API respondeu status inesperado {}.", key, other);
                Err(ReportError::UnexpectedStatus(other))
            }
        }
    }
}
