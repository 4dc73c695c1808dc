//! diagnostics.rs — Coleta de diagnóstico durante a queda (variante estendida)
//!
//! Tudo aqui é melhor esforço: nenhum passo bloqueia, repete ou interrompe a
//! máquina de estados. Comandos externos são disparados como processos
//! destacados através de um [`TaskRunner`].

use crate::config::DiagnosticsConfig;
use crate::error::BestEffort;
use crate::types::OutageReport;
use chrono::DateTime;
use std::fs::File;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

const LATEST_LINK: &str = "latest";
const PROBE_OUTPUT: &str = "plc_probe.txt";
const DURATION_FILE: &str = "outage_duration.txt";
const LEASE_COPY: &str = "dhcp.lease";

/// Momento em que um snapshot é tirado.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Outage,
    Recovery,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Outage => "outage",
            Self::Recovery => "recovery",
        }
    }
}

/// Tipo de snapshot do sistema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Snapshot {
    SystemLog,
    NetworkLog,
    Routes,
    Addresses,
}

impl Snapshot {
    const ALL: [Snapshot; 4] = [
        Snapshot::SystemLog,
        Snapshot::NetworkLog,
        Snapshot::Routes,
        Snapshot::Addresses,
    ];

    fn file_stem(&self) -> &'static str {
        match self {
            Self::SystemLog => "journal",
            Self::NetworkLog => "networkmanager",
            Self::Routes => "routes",
            Self::Addresses => "addresses",
        }
    }
}

/// Trabalho de diagnóstico despachado sem espera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticTask {
    PullImage,
    Snapshot { kind: Snapshot, output: PathBuf },
    PowerlineProbe { output: PathBuf },
    StartCapture { dir: PathBuf },
    StopCapture,
}

/// Executor de tarefas de diagnóstico.
pub trait TaskRunner {
    fn run(&self, task: DiagnosticTask) -> BestEffort;
}

/// Resultado anexado ao relatório de recuperação.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticsSummary {
    pub dir: PathBuf,
    pub powerline_detected: bool,
}

/// Ganchos que o detector chama nas transições.
pub trait DiagnosticsTrigger {
    /// Conectividade voltou (ou foi vista pela primeira vez): pode baixar a imagem.
    fn prepare(&self);
    fn outage_opened(&self, start: i64);
    fn outage_closed(&self, report: Option<&OutageReport>) -> Option<DiagnosticsSummary>;
}

/// Variante básica: sem coleta.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDiagnostics;

impl DiagnosticsTrigger for NoDiagnostics {
    fn prepare(&self) {}

    fn outage_opened(&self, _start: i64) {}

    fn outage_closed(&self, _report: Option<&OutageReport>) -> Option<DiagnosticsSummary> {
        None
    }
}

pub struct Diagnostics<R> {
    config: DiagnosticsConfig,
    runner: R,
}

impl<R: TaskRunner> Diagnostics<R> {
    pub fn new(config: DiagnosticsConfig, runner: R) -> Self {
        Self { config, runner }
    }

    fn latest(&self) -> PathBuf {
        self.config.root_dir.join(LATEST_LINK)
    }

    fn outage_dir(&self, start: i64) -> PathBuf {
        let name = match DateTime::from_timestamp(start, 0) {
            Some(ts) => format!("outage-{}", ts.format("%Y%m%d-%H%M%S")),
            None => format!("outage-{}", start),
        };
        self.config.root_dir.join(name)
    }

    /// Troca o link `latest` de forma atômica (link temporário + rename).
    fn point_latest(&self, target: &Path) -> std::io::Result<()> {
        let tmp = self.config.root_dir.join(format!("{}.tmp", LATEST_LINK));
        let _ = std::fs::remove_file(&tmp);
        std::os::unix::fs::symlink(target, &tmp)?;
        std::fs::rename(&tmp, self.latest())
    }

    fn snapshots(&self, dir: &Path, phase: Phase) {
        for kind in Snapshot::ALL {
            let output = dir.join(format!("{}_{}.log", kind.file_stem(), phase.as_str()));
            self.runner
                .run(DiagnosticTask::Snapshot { kind, output })
                .log(&format!("snapshot {}", kind.file_stem()));
        }
    }
}

impl<R: TaskRunner> DiagnosticsTrigger for Diagnostics<R> {
    fn prepare(&self) {
        self.runner
            .run(DiagnosticTask::PullImage)
            .log(&format!("pull da imagem {}", self.config.image));
    }

    fn outage_opened(&self, start: i64) {
        let dir = self.outage_dir(start);
        if !BestEffort::from_result(std::fs::create_dir_all(&dir))
            .log(&format!("criação de {}", dir.display()))
        {
            return;
        }
        info!("[DIAGNOSTICO] Coletando em {}", dir.display());

        BestEffort::from_result(self.point_latest(&dir)).log("atualização do link latest");
        self.snapshots(&dir, Phase::Outage);
        BestEffort::from_result(std::fs::copy(
            &self.config.lease_file,
            dir.join(LEASE_COPY),
        ))
        .log(&format!("cópia de {}", self.config.lease_file.display()));

        self.runner
            .run(DiagnosticTask::PowerlineProbe {
                output: dir.join(PROBE_OUTPUT),
            })
            .log("sonda de powerline");
        self.runner
            .run(DiagnosticTask::StartCapture { dir })
            .log("início da captura de pacotes");
    }

    fn outage_closed(&self, report: Option<&OutageReport>) -> Option<DiagnosticsSummary> {
        self.runner
            .run(DiagnosticTask::StopCapture)
            .log("parada da captura de pacotes");

        // Sem marcador, `latest` aponta para uma queda anterior.
        let Some(report) = report else {
            debug!("[DIAGNOSTICO] Recuperação sem queda aberta, nada a anexar.");
            return None;
        };

        let dir = match std::fs::read_link(self.latest()) {
            Ok(dir) => dir,
            Err(e) => {
                warn!(
                    "[DIAGNOSTICO] Sem diretório latest em {}: {}",
                    self.config.root_dir.display(),
                    e
                );
                return None;
            }
        };

        self.snapshots(&dir, Phase::Recovery);
        BestEffort::from_result(std::fs::write(
            dir.join(DURATION_FILE),
            format!("{}\n", report.tag_value()),
        ))
        .log("registro da duração");

        let powerline_detected = std::fs::read_to_string(dir.join(PROBE_OUTPUT))
            .map(|out| !out.trim().is_empty())
            .unwrap_or(false);
        info!(
            "[DIAGNOSTICO] Coleta encerrada em {} (powerline: {}).",
            dir.display(),
            powerline_detected
        );

        Some(DiagnosticsSummary {
            dir,
            powerline_detected,
        })
    }
}

/// Executa tarefas como processos destacados, em grupo próprio, que
/// sobrevivem ao fim da invocação.
pub struct ProcessRunner {
    config: DiagnosticsConfig,
}

impl ProcessRunner {
    pub fn new(config: DiagnosticsConfig) -> Self {
        Self { config }
    }

    /// Remove um container anterior com o mesmo nome e inicia um novo.
    fn replace_container(&self, name: &str, args: Vec<String>) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(r#"rt="$1"; name="$2"; shift 2; "$rt" rm -f "$name" >/dev/null 2>&1; exec "$rt" run --rm --name "$name" "$@""#)
            .arg("sh")
            .arg(&self.config.runtime)
            .arg(name)
            .args(args);
        cmd
    }

    pub fn command(&self, task: &DiagnosticTask) -> Command {
        let cfg = &self.config;
        match task {
            DiagnosticTask::PullImage => {
                let mut cmd = Command::new(&cfg.runtime);
                cmd.arg("pull").arg(&cfg.image);
                cmd
            }
            DiagnosticTask::Snapshot { kind, .. } => match kind {
                Snapshot::SystemLog => {
                    let mut cmd = Command::new("journalctl");
                    cmd.args(["--no-pager", "-b", "-n", "5000"]);
                    cmd
                }
                Snapshot::NetworkLog => {
                    let mut cmd = Command::new("journalctl");
                    cmd.args(["--no-pager", "-b", "-u", "NetworkManager", "-n", "2000"]);
                    cmd
                }
                Snapshot::Routes => {
                    let mut cmd = Command::new("ip");
                    cmd.args(["route", "show", "table", "all"]);
                    cmd
                }
                Snapshot::Addresses => {
                    let mut cmd = Command::new("ip");
                    cmd.args(["addr", "show"]);
                    cmd
                }
            },
            DiagnosticTask::PowerlineProbe { .. } => {
                let mut args = vec![
                    "--network".to_string(),
                    "host".to_string(),
                    cfg.image.clone(),
                    "timeout".to_string(),
                    cfg.probe_secs.to_string(),
                ];
                args.extend(cfg.probe_command.iter().cloned());
                self.replace_container(&cfg.probe_name, args)
            }
            DiagnosticTask::StartCapture { dir } => {
                let args = vec![
                    "--network".to_string(),
                    "host".to_string(),
                    "-v".to_string(),
                    format!("{}:/capture", dir.display()),
                    cfg.image.clone(),
                    "timeout".to_string(),
                    cfg.capture_secs.to_string(),
                    "tcpdump".to_string(),
                    "-i".to_string(),
                    cfg.capture_interface.clone(),
                    "-w".to_string(),
                    "/capture/outage.pcap".to_string(),
                ];
                self.replace_container(&cfg.capture_name, args)
            }
            DiagnosticTask::StopCapture => {
                let mut cmd = Command::new(&cfg.runtime);
                cmd.arg("stop").arg(&cfg.capture_name);
                cmd
            }
        }
    }

    fn output_for(task: &DiagnosticTask) -> Option<&Path> {
        match task {
            DiagnosticTask::Snapshot { output, .. } | DiagnosticTask::PowerlineProbe { output } => {
                Some(output.as_path())
            }
            _ => None,
        }
    }
}

impl TaskRunner for ProcessRunner {
    fn run(&self, task: DiagnosticTask) -> BestEffort {
        let stdout = match Self::output_for(&task) {
            Some(path) => match File::create(path) {
                Ok(file) => Stdio::from(file),
                Err(e) => return BestEffort::Failed(format!("{}: {}", path.display(), e)),
            },
            None => Stdio::null(),
        };

        let mut cmd = self.command(&task);
        cmd.stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::null())
            .process_group(0);

        // O filho não é aguardado: segue vivo após o fim da invocação.
        BestEffort::from_result(cmd.spawn())
    }
}
