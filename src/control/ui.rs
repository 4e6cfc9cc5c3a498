use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::io::stdout;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, unbounded};
use crossterm::ExecutableCommand;
use crossterm::event::{self, Event as CEvent, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, Wrap};

use crate::client::GainClient;
use crate::discovery::ApplicationRoster;
use crate::error::ClientError;
use crate::store::{DEFAULT_GAIN, clamp_gain};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const NUDGE_STEP: f32 = 0.05;

type Poll = Result<HashMap<String, f32>, ClientError>;

/// One line of the application table.
#[derive(Clone, Debug, PartialEq)]
struct AppRow {
    app_id: String,
    gain: f32,
    configured: bool,
    running: bool,
}

#[derive(Default)]
struct AppState {
    rows: Vec<AppRow>,
    connected: bool,
    selected: usize,
    mode: Mode,
    message: Option<String>,
    last_update: Option<Instant>,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    #[default]
    Normal,
    GainInput,
}

struct GainEditor {
    buffer: String,
}

/// Merge configured gains and running candidates into sorted rows.
fn build_rows(gains: &HashMap<String, f32>, candidates: &[String]) -> Vec<AppRow> {
    let mut merged: BTreeMap<&str, AppRow> = BTreeMap::new();
    for (app_id, gain) in gains {
        merged.insert(
            app_id.as_str(),
            AppRow {
                app_id: app_id.clone(),
                gain: *gain,
                configured: true,
                running: false,
            },
        );
    }
    for app_id in candidates {
        merged
            .entry(app_id.as_str())
            .or_insert_with(|| AppRow {
                app_id: app_id.clone(),
                gain: DEFAULT_GAIN,
                configured: false,
                running: false,
            })
            .running = true;
    }
    merged.into_values().collect()
}

fn nudge(gain: f32, delta: f32) -> f32 {
    // Round to the step so repeated nudges land on clean values.
    clamp_gain(((gain + delta) / NUDGE_STEP).round() * NUDGE_STEP)
}

/// Run the interactive gain console until the user quits.
pub fn run(client: GainClient, roster: ApplicationRoster) -> Result<(), Box<dyn Error>> {
    setup_terminal()?;
    let result = run_loop(&client, &roster);
    restore_terminal()?;
    result
}

fn run_loop(client: &GainClient, roster: &ApplicationRoster) -> Result<(), Box<dyn Error>> {
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let (poll_tx, poll_rx) = unbounded::<Poll>();
    let poller = client.clone();
    std::thread::Builder::new()
        .name("gain-console-poll".into())
        .spawn(move || {
            loop {
                if poll_tx.send(poller.all_gains()).is_err() {
                    break;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        })?;

    let mut app = AppState::default();
    let mut gain_editor: Option<GainEditor> = None;

    loop {
        terminal.draw(|frame| draw(frame, &app, gain_editor.as_ref()))?;

        if let Some(poll) = try_recv_latest(&poll_rx) {
            match poll {
                Ok(gains) => {
                    app.rows = build_rows(&gains, &roster.candidates());
                    app.connected = true;
                    app.last_update = Some(Instant::now());
                }
                Err(err) => {
                    app.connected = false;
                    app.message = Some(format!("Service unavailable: {err}"));
                }
            }
            app.selected = app.selected.min(app.rows.len().saturating_sub(1));
        }

        if event::poll(Duration::from_millis(10))? {
            if let CEvent::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press && handle_key(&mut app, &mut gain_editor, client, key) {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn setup_terminal() -> Result<(), Box<dyn Error>> {
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    Ok(())
}

fn restore_terminal() -> Result<(), Box<dyn Error>> {
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;
    Ok(())
}

fn try_recv_latest<T>(rx: &Receiver<T>) -> Option<T> {
    let mut last = None;
    while let Ok(value) = rx.try_recv() {
        last = Some(value);
    }
    last
}

fn apply(app: &mut AppState, client: &GainClient, app_id: &str, gain: f32) {
    app.message = Some(match client.set_gain(app_id, gain) {
        Ok(()) => {
            if let Some(row) = app.rows.iter_mut().find(|row| row.app_id == app_id) {
                row.gain = gain;
                row.configured = true;
            }
            format!("{app_id} gain set to {gain:.2}")
        }
        Err(err) => format!("Could not set {app_id}: {err}"),
    });
}

/// Returns true when the console should exit.
fn handle_key(
    app: &mut AppState,
    gain_editor: &mut Option<GainEditor>,
    client: &GainClient,
    key: KeyEvent,
) -> bool {
    match app.mode {
        Mode::Normal => match key.code {
            KeyCode::Char('q') => return true,
            KeyCode::Up => {
                app.selected = app.selected.saturating_sub(1);
            }
            KeyCode::Down => {
                if app.selected + 1 < app.rows.len() {
                    app.selected += 1;
                }
            }
            KeyCode::Char(c @ ('+' | '=' | '-')) => {
                if let Some(row) = current_row(app) {
                    let delta = if c == '-' { -NUDGE_STEP } else { NUDGE_STEP };
                    apply(app, client, &row.app_id, nudge(row.gain, delta));
                }
            }
            KeyCode::Char('r') => {
                if let Some(row) = current_row(app) {
                    app.message = Some(match client.remove_gain(&row.app_id) {
                        Ok(()) => format!("{} reset to default", row.app_id),
                        Err(err) => format!("Could not reset {}: {err}", row.app_id),
                    });
                }
            }
            KeyCode::Char('g') => {
                if let Some(row) = current_row(app) {
                    gain_editor.replace(GainEditor {
                        buffer: format!("{:.2}", row.gain),
                    });
                    app.mode = Mode::GainInput;
                }
            }
            _ => {}
        },
        Mode::GainInput => match key.code {
            KeyCode::Esc => {
                gain_editor.take();
                app.mode = Mode::Normal;
            }
            KeyCode::Enter => {
                if let (Some(editor), Some(row)) = (gain_editor.take(), current_row(app)) {
                    match editor.buffer.trim().parse::<f32>() {
                        Ok(value) => apply(app, client, &row.app_id, value),
                        Err(_) => app.message = Some(format!("'{}' is not a number", editor.buffer)),
                    }
                }
                app.mode = Mode::Normal;
            }
            KeyCode::Backspace => {
                if let Some(editor) = gain_editor.as_mut() {
                    editor.buffer.pop();
                }
            }
            KeyCode::Char(c) => {
                if let Some(editor) = gain_editor.as_mut() {
                    if c.is_ascii_digit() || c == '.' {
                        editor.buffer.push(c);
                    }
                }
            }
            _ => {}
        },
    }
    false
}

fn current_row(app: &AppState) -> Option<AppRow> {
    app.rows.get(app.selected).cloned()
}

fn draw(frame: &mut ratatui::Frame<'_>, app: &AppState, gain_editor: Option<&GainEditor>) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(4),
        ])
        .split(frame.size());

    draw_header(frame, chunks[0], app);
    draw_apps(frame, chunks[1], app);
    draw_footer(frame, chunks[2], app);

    if let Some(editor) = gain_editor {
        let area = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(0), Constraint::Length(3)])
            .split(frame.size())[1];

        let block = Block::default()
            .title("Set gain 0.00 to 1.00 (Enter applies, Esc cancels)")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Yellow));

        let paragraph = Paragraph::new(editor.buffer.clone())
            .block(block)
            .wrap(Wrap { trim: false });

        frame.render_widget(Clear, area);
        frame.render_widget(paragraph, area);
    }
}

fn draw_header(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default()
        .title("Per-Application Gain")
        .borders(Borders::ALL);

    let content = if app.connected {
        let configured = app.rows.iter().filter(|row| row.configured).count();
        let running = app.rows.iter().filter(|row| row.running).count();
        Paragraph::new(format!(
            "Service: connected    Configured: {configured}    Running: {running}"
        ))
    } else {
        Paragraph::new(Line::from(vec![Span::styled(
            "Service unreachable",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )]))
    };

    frame.render_widget(content.block(block), area);
}

fn gain_bar(gain: f32, width: usize) -> String {
    let filled = (gain * width as f32).round() as usize;
    format!("{}{}", "#".repeat(filled), ".".repeat(width.saturating_sub(filled)))
}

fn draw_apps(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default().title("Applications").borders(Borders::ALL);

    let header = Row::new(vec![
        Cell::from(""),
        Cell::from("Application"),
        Cell::from("Gain"),
        Cell::from("Level"),
        Cell::from("Running"),
    ])
    .style(
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    );

    let rows = app.rows.iter().enumerate().map(|(idx, row)| {
        let indicator = if idx == app.selected { ">" } else { "" };
        let gain = if row.configured {
            format!("{:.2}", row.gain)
        } else {
            format!("{:.2} (default)", row.gain)
        };
        let mut line = Row::new(vec![
            Cell::from(indicator.to_string()),
            Cell::from(row.app_id.clone()),
            Cell::from(gain),
            Cell::from(gain_bar(row.gain, 20)),
            Cell::from(if row.running { "Yes" } else { "No" }),
        ]);
        if idx == app.selected {
            line = line.style(Style::default().fg(Color::Yellow));
        }
        line
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(2),
            Constraint::Min(24),
            Constraint::Length(16),
            Constraint::Length(22),
            Constraint::Length(8),
        ],
    )
    .header(header)
    .block(block)
    .column_spacing(2);

    frame.render_widget(table, area);
}

fn draw_footer(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let info = "Up/Down: Select  •  g: Set gain  •  +/-: Nudge  •  r: Reset  •  q: Quit";
    let mut lines = vec![Line::from(info)];
    if let Some(message) = &app.message {
        lines.push(Line::from(Span::styled(
            message.clone(),
            Style::default().fg(Color::Green),
        )));
    }
    if let Some(updated) = app.last_update {
        let ago = updated.elapsed().as_secs_f32();
        lines.push(Line::from(Span::styled(
            format!("Last update {:.1}s ago", ago),
            Style::default().fg(Color::DarkGray),
        )));
    }

    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Help"))
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, area);
}
