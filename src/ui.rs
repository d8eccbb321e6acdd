//! Interface de terminal do batchkeeper: spinners e saída colorida.
//!
//! Usa `indicatif` para o spinner que acompanha uma sessão e `console` para
//! colorir os estados. As funções de formatação devolvem `String` para que
//! possam ser testadas sem terminal.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::state_machine::{LaunchTarget, Session, SessionState};

/// Indicador visual de progresso enquanto uma sessão não termina.
pub struct SessionProgress {
    pb: ProgressBar,
    id: u64,
}

impl SessionProgress {
    /// Inicia o spinner para a sessão `id`.
    pub fn start(id: u64) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("session {id}: {}", SessionState::Starting));
        pb.enable_steady_tick(Duration::from_millis(100));
        Self { pb, id }
    }

    /// Atualiza a mensagem do spinner para refletir o estado atual.
    pub fn update_state(&self, state: SessionState) {
        self.pb
            .set_message(format!("session {}: {}", self.id, paint_state(state)));
    }

    /// Finaliza o spinner e exibe o resultado da sessão.
    pub fn complete(&self, session: &Session) {
        self.pb.finish_and_clear();
        let (mark, style) = match session.state {
            SessionState::Success => ("✓", Style::new().green().bold()),
            _ => ("✗", Style::new().red().bold()),
        };
        println!(
            "  {} Session {} finished: {}",
            style.apply_to(mark),
            session.id,
            paint_state(session.state)
        );
    }

    /// Encerra o spinner sem resultado (por exemplo, após Ctrl-C).
    pub fn abandon(&self, note: &str) {
        self.pb.finish_and_clear();
        println!("  {} {note}", Style::new().yellow().apply_to("↻"));
    }
}

fn state_style(state: SessionState) -> Style {
    match state {
        SessionState::Success => Style::new().green().bold(),
        SessionState::Dead | SessionState::Error => Style::new().red().bold(),
        SessionState::Killed => Style::new().red(),
        SessionState::Starting | SessionState::Running => Style::new().yellow(),
    }
}

pub fn paint_state(state: SessionState) -> String {
    state_style(state).apply_to(state).to_string()
}

fn describe_target(target: &LaunchTarget) -> String {
    match target {
        LaunchTarget::Jar { jar, main_class } => format!("{main_class} ({jar})"),
        LaunchTarget::PySpark { script, .. } => script.clone(),
    }
}

/// Uma linha por sessão: id, estado, aplicação e alvo.
pub fn session_row(session: &Session) -> String {
    format!(
        "{:>6}  {:<8}  {:<32}  {}",
        session.id,
        session.state.to_string(),
        session.app_id.as_deref().unwrap_or("-"),
        session
            .spec
            .name
            .clone()
            .unwrap_or_else(|| describe_target(&session.spec.target)),
    )
}

pub fn print_sessions(sessions: &[Session]) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }
    let header = Style::new().bold();
    println!(
        "{}",
        header.apply_to(format!("{:>6}  {:<8}  {:<32}  {}", "ID", "STATE", "APPLICATION", "JOB"))
    );
    for session in sessions {
        println!("{}", session_row(session));
    }
}

/// Detalhes de uma sessão, campo a campo.
pub fn session_details(session: &Session) -> String {
    let history = session
        .state_history
        .iter()
        .chain(std::iter::once(&session.state))
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" → ");
    let mut out = vec![
        format!("Session:     {}", session.id),
        format!("State:       {}", paint_state(session.state)),
        format!("History:     {history}"),
        format!("Job:         {}", describe_target(&session.spec.target)),
        format!("Tag:         {}", session.app_tag),
        format!(
            "Application: {}",
            session.app_id.as_deref().unwrap_or("(not yet known)")
        ),
    ];
    if let Some(url) = &session.tracking_url {
        out.push(format!("Tracking:    {url}"));
    }
    if let Some(url) = &session.driver_log_url {
        out.push(format!("Driver log:  {url}"));
    }
    out.push(format!("Created:     {}", session.created_at.to_rfc3339()));
    if let Some(ended) = session.ended_at {
        out.push(format!("Ended:       {}", ended.to_rfc3339()));
    }
    if session.deleted {
        out.push("Deleted:     yes".to_string());
    }
    out.join("\n")
}

pub fn print_session(session: &Session) {
    println!("{}", session_details(session));
}

pub fn print_log(lines: &[String]) {
    if lines.is_empty() {
        println!("{}", Style::new().dim().apply_to("(no log lines)"));
        return;
    }
    for line in lines {
        println!("{line}");
    }
}
