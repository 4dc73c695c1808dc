use crate::config::TagNames;
use crate::error::{BestEffort, StateError};
use crate::reporter::TagSink;
use crate::storage::{StateKey, Storage};
use crate::types::{InterfaceEvent, OutageReport};
use tracing::{info, warn};

/// Acompanha up/down da interface observada (variante básica).
///
/// Diferente do detector de conectividade, não há duração mínima: todo par
/// down/up com marcador é reportado.
pub struct InterfaceWatcher<'a, S> {
    storage: &'a Storage,
    sink: &'a S,
    tags: &'a TagNames,
}

impl<'a, S: TagSink> InterfaceWatcher<'a, S> {
    pub fn new(storage: &'a Storage, sink: &'a S, tags: &'a TagNames) -> Self {
        Self {
            storage,
            sink,
            tags,
        }
    }

    /// Atualiza o marcador sob lock e só reporta depois de liberá-lo.
    pub async fn handle_event(
        &self,
        name: &str,
        event: InterfaceEvent,
        now: i64,
    ) -> Result<(), StateError> {
        match event {
            InterfaceEvent::Down => {
                let persisted = {
                    let state = self.storage.lock().await?;
                    state
                        .write_timestamp(StateKey::LastInterfaceDown, now)
                        .await
                };
                info!("[INTERFACE {}] Caiu em {}.", name, now);
                BestEffort::from_result(
                    self.sink
                        .set_tag(&self.tags.if_down, &now.to_string())
                        .await,
                )
                .log(&format!("report da tag {}", self.tags.if_down));
                persisted
            }
            InterfaceEvent::Up => {
                let (down, removed) = {
                    let state = self.storage.lock().await?;
                    let down = match state.read_timestamp(StateKey::LastInterfaceDown).await {
                        Ok(down) => down,
                        Err(e) => {
                            warn!("[INTERFACE {}] Marcador ilegível ({}), descartando.", name, e);
                            None
                        }
                    };
                    (down, state.remove(StateKey::LastInterfaceDown).await)
                };

                match down {
                    Some(down) => {
                        let report = OutageReport::new(down, now);
                        info!("[INTERFACE {}] Voltou: {}.", name, report.tag_value());
                        BestEffort::from_result(
                            self.sink
                                .set_tag(&self.tags.if_up, &report.tag_value())
                                .await,
                        )
                        .log(&format!("report da tag {}", self.tags.if_up));
                    }
                    None => warn!(
                        "[INTERFACE {}] Subiu sem registro de queda anterior.",
                        name
                    ),
                }
                removed
            }
        }
    }
}
