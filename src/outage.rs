use crate::config::TagNames;
use crate::diagnostics::DiagnosticsTrigger;
use crate::error::{BestEffort, StateError};
use crate::reporter::TagSink;
use crate::storage::{StateGuard, StateKey, Storage};
use crate::types::{ConnectivityState, Link, OutageReport};
use tracing::{debug, info, warn};

/// Decisão tomada para um par (anterior, recebido).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Primeira notificação: só grava o estado.
    Seed,
    /// Connected -> Disconnected.
    Open,
    /// Disconnected -> Connected.
    Close,
    /// Mesma classe dos dois lados.
    Steady,
    /// Algum dos lados é um estado não reconhecido.
    Unexpected,
}

pub fn transition(
    previous: Option<&ConnectivityState>,
    incoming: &ConnectivityState,
) -> Transition {
    let Some(previous) = previous else {
        return Transition::Seed;
    };
    match (previous.link(), incoming.link()) {
        (Link::Connected, Link::Disconnected) => Transition::Open,
        (Link::Disconnected, Link::Connected) => Transition::Close,
        (Link::Unexpected, _) | (_, Link::Unexpected) => Transition::Unexpected,
        _ => Transition::Steady,
    }
}

/// Detecta início/fim de quedas de conectividade a partir do estado persistido.
///
/// Nenhum estado fica em memória entre chamadas: cada `handle` lê o diretório
/// de estado sob lock, atualiza marcador e estado recebido e só então, já sem
/// o lock, dispara diagnóstico e report.
pub struct OutageDetector<'a, S, D> {
    storage: &'a Storage,
    sink: &'a S,
    diagnostics: &'a D,
    tags: &'a TagNames,
    min_len: i64,
}

impl<'a, S: TagSink, D: DiagnosticsTrigger> OutageDetector<'a, S, D> {
    pub fn new(
        storage: &'a Storage,
        sink: &'a S,
        diagnostics: &'a D,
        tags: &'a TagNames,
        min_len: u64,
    ) -> Self {
        Self {
            storage,
            sink,
            diagnostics,
            tags,
            min_len: i64::try_from(min_len).unwrap_or(i64::MAX),
        }
    }

    pub async fn handle(
        &self,
        incoming: ConnectivityState,
        now: i64,
    ) -> Result<Transition, StateError> {
        let (step, previous_link, drop_start, stored) = {
            let state = self.storage.lock().await?;
            let previous = match state.connection_state().await {
                Ok(previous) => previous,
                Err(e) => {
                    warn!(
                        "[CONECTIVIDADE] Estado anterior ilegível ({}), tratando como ausente.",
                        e
                    );
                    None
                }
            };
            let step = transition(previous.as_ref(), &incoming);

            let mut drop_start = None;
            let acted = match step {
                Transition::Seed => {
                    info!("[CONECTIVIDADE] Primeiro estado observado: {}", incoming);
                    Ok(())
                }
                Transition::Steady => {
                    debug!("[CONECTIVIDADE] Sem mudança relevante ({}).", incoming);
                    Ok(())
                }
                Transition::Unexpected => {
                    warn!(
                        "[CONECTIVIDADE] Transição inesperada {} -> {}, ignorando.",
                        previous.as_ref().map(|p| p.as_str()).unwrap_or("?"),
                        incoming
                    );
                    Ok(())
                }
                Transition::Open => Self::mark_open(&state, now).await,
                Transition::Close => {
                    let (start, removed) = Self::take_marker(&state).await;
                    drop_start = start;
                    removed
                }
            };

            let persisted = state.set_connection_state(&incoming).await;
            (
                step,
                previous.map(|p| p.link()),
                drop_start,
                acted.and(persisted),
            )
        };

        // Lock liberado: daqui em diante só efeitos colaterais e rede.
        match step {
            Transition::Open if stored.is_ok() => self.diagnostics.outage_opened(now),
            Transition::Close => self.close(drop_start, now).await,
            _ => {}
        }

        if incoming.link() == Link::Connected && previous_link != Some(Link::Connected) {
            self.diagnostics.prepare();
        }

        stored.map(|_| step)
    }

    async fn mark_open(state: &StateGuard, now: i64) -> Result<(), StateError> {
        match state.read_timestamp(StateKey::LastConnectionDrop).await {
            Ok(Some(existing)) => warn!(
                "[CONECTIVIDADE] Queda já aberta desde {}, substituindo por {}.",
                existing, now
            ),
            Ok(None) => {}
            Err(e) => warn!(
                "[CONECTIVIDADE] Marcador de queda ilegível ({}), substituindo.",
                e
            ),
        }
        state
            .write_timestamp(StateKey::LastConnectionDrop, now)
            .await?;
        info!("[CONECTIVIDADE] Conectividade perdida em {}.", now);
        Ok(())
    }

    /// Lê e apaga o marcador de queda. A remoção acontece mesmo se a leitura falhar.
    async fn take_marker(state: &StateGuard) -> (Option<i64>, Result<(), StateError>) {
        let start = match state.read_timestamp(StateKey::LastConnectionDrop).await {
            Ok(start) => start,
            Err(e) => {
                warn!("[CONECTIVIDADE] Marcador de queda ilegível ({}), descartando.", e);
                None
            }
        };
        (start, state.remove(StateKey::LastConnectionDrop).await)
    }

    async fn close(&self, start: Option<i64>, now: i64) {
        let report = start.map(|start| OutageReport::new(start, now));
        let summary = self.diagnostics.outage_closed(report.as_ref());

        match report {
            None => warn!(
                "[CONECTIVIDADE] Conectividade restaurada, mas a queda nunca foi vista (fixed but never seen broken)."
            ),
            Some(mut report) => {
                report.diagnostics_dir = summary.as_ref().map(|s| s.dir.display().to_string());
                if report.duration_seconds >= self.min_len {
                    info!(
                        "[CONECTIVIDADE] Queda encerrada: {} (diagnóstico: {:?}).",
                        report.tag_value(),
                        report.diagnostics_dir
                    );
                    BestEffort::from_result(
                        self.sink
                            .set_tag(&self.tags.con_lost, &report.tag_value())
                            .await,
                    )
                    .log(&format!("report da tag {}", self.tags.con_lost));
                } else {
                    info!(
                        "[CONECTIVIDADE] Queda de {}s abaixo do mínimo de {}s, descartada.",
                        report.duration_seconds, self.min_len
                    );
                }
            }
        }

        if summary.is_some_and(|s| s.powerline_detected) {
            BestEffort::from_result(self.sink.set_tag(&self.tags.powerline, "true").await)
                .log(&format!("report da tag {}", self.tags.powerline));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{DiagnosticsSummary, NoDiagnostics};
    use crate::reporter::testing::RecordingSink;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    use crate::types::ConnectivityState::{Full, Limited, None as Offline};

    fn storage(temp: &TempDir) -> Storage {
        Storage::new(temp.path(), Duration::from_millis(200))
    }

    fn marker(temp: &TempDir) -> PathBuf {
        temp.path().join("last_connection_drop")
    }

    async fn recorded_state(storage: &Storage) -> Option<ConnectivityState> {
        storage
            .lock()
            .await
            .unwrap()
            .connection_state()
            .await
            .unwrap()
    }

    #[test]
    fn transition_table() {
        let other = ConnectivityState::Other("PORTAL".into());
        assert_eq!(transition(None, &Full), Transition::Seed);
        assert_eq!(transition(Some(&Full), &Offline), Transition::Open);
        assert_eq!(transition(Some(&Full), &Limited), Transition::Open);
        assert_eq!(transition(Some(&Limited), &Full), Transition::Close);
        assert_eq!(transition(Some(&Offline), &Limited), Transition::Steady);
        assert_eq!(transition(Some(&Full), &Full), Transition::Steady);
        assert_eq!(transition(Some(&Full), &other), Transition::Unexpected);
        assert_eq!(transition(Some(&other), &Full), Transition::Unexpected);
    }

    #[tokio::test]
    async fn record_always_matches_incoming() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        let sink = RecordingSink::default();
        let tags = TagNames::default();
        let detector = OutageDetector::new(&storage, &sink, &NoDiagnostics, &tags, 60);

        let sequence = [
            Full,
            Full,
            Offline,
            Limited,
            ConnectivityState::Other("UNKNOWN".into()),
            Full,
            Offline,
            Full,
        ];
        for (i, state) in sequence.into_iter().enumerate() {
            detector.handle(state.clone(), i as i64 * 10).await.unwrap();
            assert_eq!(recorded_state(&storage).await, Some(state));
        }
    }

    #[tokio::test]
    async fn first_notification_only_seeds() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        let sink = RecordingSink::default();
        let tags = TagNames::default();
        let detector = OutageDetector::new(&storage, &sink, &NoDiagnostics, &tags, 60);

        let step = detector.handle(Offline, 10).await.unwrap();

        assert_eq!(step, Transition::Seed);
        assert!(!marker(&temp).exists());
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn short_outage_is_discarded_but_marker_cleared() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        let sink = RecordingSink::default();
        let tags = TagNames::default();
        let detector = OutageDetector::new(&storage, &sink, &NoDiagnostics, &tags, 60);

        detector.handle(Full, 0).await.unwrap();
        detector.handle(Offline, 100).await.unwrap();
        assert_eq!(std::fs::read_to_string(marker(&temp)).unwrap(), "100");

        detector.handle(Full, 159).await.unwrap();

        assert!(sink.calls().is_empty());
        assert!(!marker(&temp).exists());
    }

    #[tokio::test]
    async fn long_outage_is_reported_once() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        let sink = RecordingSink::default();
        let tags = TagNames::default();
        let detector = OutageDetector::new(&storage, &sink, &NoDiagnostics, &tags, 60);

        detector.handle(Full, 0).await.unwrap();
        assert_eq!(detector.handle(Limited, 100).await.unwrap(), Transition::Open);
        assert_eq!(detector.handle(Full, 200).await.unwrap(), Transition::Close);

        let calls = sink.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "connectivity_lost");
        assert!(calls[0].1.contains("100 - 200 (100 seconds)"));
        assert!(!marker(&temp).exists());
    }

    #[tokio::test]
    async fn recovery_without_marker_reports_nothing() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        let sink = RecordingSink::default();
        let tags = TagNames::default();
        let detector = OutageDetector::new(&storage, &sink, &NoDiagnostics, &tags, 0);

        detector.handle(Offline, 0).await.unwrap();
        assert!(!marker(&temp).exists());

        assert_eq!(detector.handle(Full, 500).await.unwrap(), Transition::Close);

        assert!(sink.calls().is_empty());
        assert!(!marker(&temp).exists());
        assert_eq!(recorded_state(&storage).await, Some(Full));
    }

    #[tokio::test]
    async fn repeated_state_never_reports() {
        for state in [Full, Offline, Limited] {
            let temp = TempDir::new().unwrap();
            let storage = storage(&temp);
            let sink = RecordingSink::default();
            let tags = TagNames::default();
            let detector = OutageDetector::new(&storage, &sink, &NoDiagnostics, &tags, 0);

            for t in 0..5 {
                let step = detector.handle(state.clone(), t).await.unwrap();
                assert!(matches!(step, Transition::Seed | Transition::Steady));
            }
            assert!(sink.calls().is_empty());
            assert!(!marker(&temp).exists());
        }
    }

    #[tokio::test]
    async fn failed_report_still_clears_marker() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        let sink = RecordingSink::failing();
        let tags = TagNames::default();
        let detector = OutageDetector::new(&storage, &sink, &NoDiagnostics, &tags, 60);

        detector.handle(Full, 0).await.unwrap();
        detector.handle(Offline, 100).await.unwrap();
        detector.handle(Full, 400).await.unwrap();

        assert_eq!(sink.calls().len(), 1);
        assert!(!marker(&temp).exists());
    }

    #[tokio::test]
    async fn unexpected_state_does_not_touch_marker() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        let sink = RecordingSink::default();
        let tags = TagNames::default();
        let detector = OutageDetector::new(&storage, &sink, &NoDiagnostics, &tags, 0);

        detector.handle(Full, 0).await.unwrap();
        detector.handle(Offline, 10).await.unwrap();
        let step = detector
            .handle(ConnectivityState::Other("PORTAL".into()), 20)
            .await
            .unwrap();

        assert_eq!(step, Transition::Unexpected);
        assert!(marker(&temp).exists());
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn undecodable_marker_does_not_block_detection() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        let sink = RecordingSink::default();
        let tags = TagNames::default();
        let detector = OutageDetector::new(&storage, &sink, &NoDiagnostics, &tags, 60);

        detector.handle(Full, 0).await.unwrap();
        detector.handle(Offline, 100).await.unwrap();
        std::fs::write(marker(&temp), [0xff, 0xfe]).unwrap();

        assert_eq!(detector.handle(Full, 400).await.unwrap(), Transition::Close);
        assert!(sink.calls().is_empty());
        assert!(!marker(&temp).exists());

        detector.handle(Offline, 500).await.unwrap();
        detector.handle(Full, 900).await.unwrap();
        assert_eq!(
            sink.calls(),
            vec![(
                "connectivity_lost".to_string(),
                "500 - 900 (400 seconds)".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn undecodable_record_is_replaced_by_incoming() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        let sink = RecordingSink::default();
        let tags = TagNames::default();
        let detector = OutageDetector::new(&storage, &sink, &NoDiagnostics, &tags, 60);
        std::fs::write(temp.path().join("last_connection_state"), [0xff]).unwrap();

        assert_eq!(detector.handle(Full, 0).await.unwrap(), Transition::Seed);
        assert_eq!(
            std::fs::read_to_string(temp.path().join("last_connection_state")).unwrap(),
            "FULL"
        );
        assert_eq!(detector.handle(Offline, 10).await.unwrap(), Transition::Open);
        assert_eq!(std::fs::read_to_string(marker(&temp)).unwrap(), "10");
    }

    /// Sink lento: o report demora mais do que a espera pelo lock.
    #[derive(Default)]
    struct SlowSink {
        calls: Mutex<Vec<(String, String)>>,
    }

    impl TagSink for SlowSink {
        async fn set_tag(
            &self,
            key: &str,
            value: &str,
        ) -> Result<crate::types::TagOutcome, crate::error::ReportError> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.calls
                .lock()
                .unwrap()
                .push((key.to_string(), value.to_string()));
            Ok(crate::types::TagOutcome::Created)
        }
    }

    #[tokio::test]
    async fn slow_report_does_not_hold_the_lock() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        let sink = SlowSink::default();
        let tags = TagNames::default();
        let detector = OutageDetector::new(&storage, &sink, &NoDiagnostics, &tags, 60);

        detector.handle(Full, 0).await.unwrap();
        detector.handle(Offline, 100).await.unwrap();

        let (recovered, dropped_again) = tokio::join!(detector.handle(Full, 200), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            detector.handle(Offline, 201).await
        });

        assert_eq!(recovered.unwrap(), Transition::Close);
        assert_eq!(dropped_again.unwrap(), Transition::Open);
        assert_eq!(recorded_state(&storage).await, Some(Offline));
        assert_eq!(std::fs::read_to_string(marker(&temp)).unwrap(), "201");
        assert_eq!(
            *sink.calls.lock().unwrap(),
            vec![(
                "connectivity_lost".to_string(),
                "100 - 200 (100 seconds)".to_string()
            )]
        );
    }

    #[derive(Default)]
    struct RecordingDiagnostics {
        events: Mutex<Vec<String>>,
        powerline: bool,
    }

    impl DiagnosticsTrigger for RecordingDiagnostics {
        fn prepare(&self) {
            self.events.lock().unwrap().push("prepare".into());
        }

        fn outage_opened(&self, start: i64) {
            self.events.lock().unwrap().push(format!("open {}", start));
        }

        fn outage_closed(&self, report: Option<&OutageReport>) -> Option<DiagnosticsSummary> {
            self.events.lock().unwrap().push(format!(
                "close {:?}",
                report.map(|r| r.duration_seconds)
            ));
            Some(DiagnosticsSummary {
                dir: PathBuf::from("/diag/outage"),
                powerline_detected: self.powerline,
            })
        }
    }

    #[tokio::test]
    async fn diagnostics_follow_the_outage() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        let sink = RecordingSink::default();
        let tags = TagNames::default();
        let diagnostics = RecordingDiagnostics {
            powerline: true,
            ..Default::default()
        };
        let detector = OutageDetector::new(&storage, &sink, &diagnostics, &tags, 60);

        detector.handle(Full, 0).await.unwrap();
        detector.handle(Offline, 100).await.unwrap();
        detector.handle(Offline, 150).await.unwrap();
        detector.handle(Full, 130).await.unwrap();

        assert_eq!(
            *diagnostics.events.lock().unwrap(),
            vec!["prepare", "open 100", "close Some(30)", "prepare"]
        );
        // Queda curta descartada, mas o powerline ainda é sinalizado.
        assert_eq!(
            sink.calls(),
            vec![("powerline_adapter".to_string(), "true".to_string())]
        );
    }
}
