use serde::Serialize;
use std::fmt;

/// Estado de conectividade informado pelo gerenciador de rede (NetworkManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityState {
    Full,
    None,
    Limited,
    /// Valor não reconhecido, mantido cru para persistência e log.
    Other(String),
}

impl ConnectivityState {
    /// Interpreta o valor cru de `CONNECTIVITY_STATE` (sem diferenciar maiúsculas).
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.to_ascii_uppercase().as_str() {
            "FULL" => Self::Full,
            "NONE" => Self::None,
            "LIMITED" => Self::Limited,
            _ => Self::Other(trimmed.to_string()),
        }
    }

    /// Representação gravada em `last_connection_state`.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Full => "FULL",
            Self::None => "NONE",
            Self::Limited => "LIMITED",
            Self::Other(raw) => raw,
        }
    }

    pub fn link(&self) -> Link {
        match self {
            Self::Full => Link::Connected,
            Self::None | Self::Limited => Link::Disconnected,
            Self::Other(_) => Link::Unexpected,
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classificação grossa usada pela máquina de estados.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Connected,
    Disconnected,
    Unexpected,
}

/// Tipo de evento de interface recebido do dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceEvent {
    Up,
    Down,
}

/// Intervalo fechado de queda (conectividade ou interface).
///
/// Derivado no momento da recuperação, nunca persistido.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutageReport {
    pub start: i64,
    pub end: i64,
    pub duration_seconds: i64,
    /// Diretório de diagnóstico associado, quando a variante estendida está ativa.
    pub diagnostics_dir: Option<String>,
}

impl OutageReport {
    pub fn new(start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            duration_seconds: end - start,
            diagnostics_dir: None,
        }
    }

    /// Valor enviado como tag: `"{start} - {end} ({duration} seconds)"`.
    pub fn tag_value(&self) -> String {
        format!(
            "{} - {} ({} seconds)",
            self.start, self.end, self.duration_seconds
        )
    }
}

/// Resultado bem-sucedido do upsert de tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagOutcome {
    Created,
    Updated,
}

/// Corpo do POST em `/v6/device_tag`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceTag {
    pub device: i64,
    pub tag_key: String,
    pub value: String,
}

/// Corpo do PATCH em `/v6/device_tag`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagValue {
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_network_manager_spellings() {
        assert_eq!(ConnectivityState::parse("FULL"), ConnectivityState::Full);
        assert_eq!(ConnectivityState::parse("full\n"), ConnectivityState::Full);
        assert_eq!(ConnectivityState::parse("NONE"), ConnectivityState::None);
        assert_eq!(ConnectivityState::parse("Limited"), ConnectivityState::Limited);
        assert_eq!(
            ConnectivityState::parse("PORTAL"),
            ConnectivityState::Other("PORTAL".to_string())
        );
    }

    #[test]
    fn none_and_limited_are_both_disconnected() {
        assert_eq!(ConnectivityState::None.link(), Link::Disconnected);
        assert_eq!(ConnectivityState::Limited.link(), Link::Disconnected);
        assert_eq!(ConnectivityState::Full.link(), Link::Connected);
        assert_eq!(
            ConnectivityState::Other("UNKNOWN".into()).link(),
            Link::Unexpected
        );
    }

    #[test]
    fn other_keeps_raw_value() {
        let state = ConnectivityState::parse("  portal ");
        assert_eq!(state.as_str(), "portal");
    }

    #[test]
    fn report_formats_tag_value() {
        let report = OutageReport::new(100, 200);
        assert_eq!(report.duration_seconds, 100);
        assert_eq!(report.tag_value(), "100 - 200 (100 seconds)");
    }
}
