use crate::types::{ConnectivityState, InterfaceEvent};
use clap::Parser;

pub const CONNECTIVITY_ACTION: &str = "connectivity-change";

/// Argumentos posicionais do dispatcher do NetworkManager.
#[derive(Debug, Parser)]
#[command(name = "monitoramento_quedas", version, about = "Detecta e reporta quedas de conectividade")]
pub struct Cli {
    /// Interface do evento (vazia em eventos globais).
    pub interface: String,
    /// Ação: connectivity-change, up, down, ...
    pub action: String,
}

/// Evento já filtrado, pronto para o componente certo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connectivity(ConnectivityState),
    Interface { name: String, kind: InterfaceEvent },
    Ignored(String),
}

/// Decide o destino de uma notificação.
pub fn classify(
    interface: &str,
    action: &str,
    connectivity_state: Option<&str>,
    watched_interface: &str,
) -> Event {
    match action {
        CONNECTIVITY_ACTION => match connectivity_state {
            Some(raw) if !raw.trim().is_empty() => {
                Event::Connectivity(ConnectivityState::parse(raw))
            }
            _ => Event::Ignored(format!(
                "{} sem CONNECTIVITY_STATE",
                CONNECTIVITY_ACTION
            )),
        },
        "up" | "down" if interface != watched_interface => {
            Event::Ignored(format!("interface {} não observada", interface))
        }
        "up" => Event::Interface {
            name: interface.to_string(),
            kind: InterfaceEvent::Up,
        },
        "down" => Event::Interface {
            name: interface.to_string(),
            kind: InterfaceEvent::Down,
        },
        other => Event::Ignored(format!("ação {:?} não tratada", other)),
    }
}
