//! Terminal dashboard for the buzzer server

use crate::metrics::{truncate_id, LogLevel, Metrics, ServerStatus};
use crate::network::{self, RoomOverview, Server};
use buzzer_core::round::RoundStatus;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use parking_lot::RwLock;
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, List, ListItem, Paragraph, Row, Table},
    Frame, Terminal,
};
use std::io::stdout;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

const TICK: Duration = Duration::from_millis(100);

/// Run the dashboard
pub async fn run(metrics: Arc<RwLock<Metrics>>) -> Result<(), Box<dyn std::error::Error>> {
    enable_raw_mode()?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = ratatui::backend::CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Bind and serve in the background; the room panel fills in once bound
    let (server_tx, mut server_rx) = oneshot::channel::<Arc<Server>>();
    let metrics_for_network = Arc::clone(&metrics);
    tokio::spawn(async move {
        let result = match network::start(Arc::clone(&metrics_for_network)).await {
            Ok((server, listener)) => {
                let _ = server_tx.send(Arc::clone(&server));
                server.serve(listener).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            let mut m = metrics_for_network.write();
            m.status = ServerStatus::Error;
            m.log(LogLevel::Error, format!("Server error: {}", e));
        }
    });

    let mut server: Option<Arc<Server>> = None;
    loop {
        if server.is_none() {
            server = server_rx.try_recv().ok();
        }
        let rooms = server.as_ref().map(|s| s.room_overview()).unwrap_or_default();

        terminal.draw(|f| draw(f, &metrics.read(), &rooms))?;

        if event::poll(TICK)? {
            if let Event::Key(key) = event::read()? {
                let quit = key.kind == KeyEventKind::Press
                    && match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => true,
                        KeyCode::Char('c') => key.modifiers.contains(KeyModifiers::CONTROL),
                        _ => false,
                    };
                if quit {
                    break;
                }
            }
        }
    }

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    Ok(())
}

fn draw(f: &mut Frame, m: &Metrics, rooms: &[RoomOverview]) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),  // Header
            Constraint::Length(5),  // Counters
            Constraint::Length(10), // Rooms and verdicts
            Constraint::Min(6),     // Activity
            Constraint::Length(1),  // Footer
        ])
        .split(f.area());

    draw_header(f, rows[0], m);
    draw_counters(f, rows[1], m);

    let middle = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
        .split(rows[2]);
    draw_rooms(f, middle[0], rooms);
    draw_verdicts(f, middle[1], m);

    draw_activity(f, rows[3], m);

    let footer = Paragraph::new(Line::from(vec![
        Span::styled(" Q ", Style::default().fg(Color::Black).bg(Color::White)),
        Span::raw(" Quit"),
    ]));
    f.render_widget(footer, rows[4]);
}

fn draw_header(f: &mut Frame, area: Rect, m: &Metrics) {
    let (status, color) = match m.status {
        ServerStatus::Starting => ("STARTING", Color::Yellow),
        ServerStatus::Running => ("RUNNING", Color::Green),
        ServerStatus::Error => ("ERROR", Color::Red),
    };
    let addr = if m.bind_addr.is_empty() { "..." } else { m.bind_addr.as_str() };

    let line = Line::from(vec![
        Span::styled("Buzzer Server", Style::default().add_modifier(Modifier::BOLD)),
        Span::raw("  │  "),
        Span::styled(status, Style::default().fg(color)),
        Span::raw("  │  "),
        Span::styled(addr, Style::default().fg(Color::Cyan)),
        Span::raw("  │  up "),
        Span::styled(m.uptime(), Style::default().fg(Color::Cyan)),
    ]);
    f.render_widget(
        Paragraph::new(line).block(Block::default().borders(Borders::ALL)),
        area,
    );
}

fn counter(label: &str, value: impl ToString, color: Color) -> Line<'static> {
    Line::from(vec![
        Span::raw(format!("{:<10}", label)),
        Span::styled(value.to_string(), Style::default().fg(color).add_modifier(Modifier::BOLD)),
    ])
}

fn draw_counters(f: &mut Frame, area: Rect, m: &Metrics) {
    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Ratio(1, 3), Constraint::Ratio(1, 3), Constraint::Ratio(1, 3)])
        .split(area);

    let clients = Paragraph::new(vec![
        counter("online", m.connected_clients, Color::Green),
        counter("peak", m.peak_connections, Color::Magenta),
        counter("total", m.total_connections, Color::White),
    ])
    .block(Block::default().borders(Borders::ALL).title(" Clients "));

    let buzzes = Paragraph::new(vec![
        counter("accepted", m.buzzes_accepted, Color::Green),
        counter("rejected", m.total_rejections(), Color::Yellow),
        counter("late", m.rejections.get("already_won").copied().unwrap_or(0), Color::Yellow),
    ])
    .block(Block::default().borders(Borders::ALL).title(" Buzzes "));

    let verdicts = Paragraph::new(vec![
        counter("rooms", m.open_rooms, Color::Cyan),
        counter("verdicts", m.verdicts, Color::Green),
        counter("random", m.random_tiebreaks, Color::Magenta),
    ])
    .block(Block::default().borders(Borders::ALL).title(" Arbitration "));

    f.render_widget(clients, cols[0]);
    f.render_widget(buzzes, cols[1]);
    f.render_widget(verdicts, cols[2]);
}

fn room_row(room: &RoomOverview) -> Row<'static> {
    let round = &room.round;
    let (status, color) = match round.status {
        RoundStatus::NoWinner => ("open", Color::Green),
        RoundStatus::Collecting => ("collecting", Color::Yellow),
        RoundStatus::WinnerPendingJudgment => ("judging", Color::Magenta),
    };
    let winner = round.winner_id.as_deref().map(truncate_id).unwrap_or_else(|| "-".into());
    let mut flags = Vec::new();
    if round.paused {
        flags.push("paused");
    }
    if round.judgment_locked {
        flags.push("locked");
    }

    Row::new(vec![
        Cell::from(truncate_id(&room.room_id)),
        Cell::from(room.connections.to_string()),
        Cell::from(status).style(Style::default().fg(color)),
        Cell::from(winner),
        Cell::from(round.buzzed_players.len().to_string()),
        Cell::from(flags.join(",")).style(Style::default().fg(Color::Yellow)),
    ])
}

fn draw_rooms(f: &mut Frame, area: Rect, rooms: &[RoomOverview]) {
    let header = Row::new(["Room", "Conns", "Round", "Winner", "Buzzed", ""])
        .style(Style::default().fg(Color::DarkGray));
    let widths = [
        Constraint::Length(14),
        Constraint::Length(6),
        Constraint::Length(11),
        Constraint::Length(14),
        Constraint::Length(7),
        Constraint::Min(6),
    ];
    let table = Table::new(rooms.iter().map(room_row), widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(format!(" Rooms ({}) ", rooms.len())));
    f.render_widget(table, area);
}

fn draw_verdicts(f: &mut Frame, area: Rect, m: &Metrics) {
    let items: Vec<ListItem> = m
        .recent_verdicts
        .iter()
        .rev()
        .map(|v| {
            let mut spans = vec![
                Span::styled(v.winner.clone(), Style::default().fg(Color::Green).add_modifier(Modifier::BOLD)),
                Span::raw(format!(" in {} ({}/{}ms)", v.room_id, v.candidates, v.window_ms)),
            ];
            if v.random_tiebreak {
                spans.push(Span::styled(" rnd", Style::default().fg(Color::Magenta)));
            }
            ListItem::new(Line::from(spans))
        })
        .collect();

    f.render_widget(
        List::new(items).block(Block::default().borders(Borders::ALL).title(" Verdicts ")),
        area,
    );
}

fn level_color(level: LogLevel) -> Color {
    match level {
        LogLevel::Info => Color::Blue,
        LogLevel::Warning => Color::Yellow,
        LogLevel::Error => Color::Red,
        LogLevel::Connection => Color::Green,
        LogLevel::Buzz => Color::Magenta,
    }
}

/// Newest entries first, as many as fit
fn draw_activity(f: &mut Frame, area: Rect, m: &Metrics) {
    let visible = area.height.saturating_sub(2) as usize;
    let items: Vec<ListItem> = m
        .logs
        .iter()
        .rev()
        .take(visible)
        .map(|entry| {
            ListItem::new(Line::from(vec![
                Span::styled(entry.timestamp.format("%H:%M:%S ").to_string(), Style::default().fg(Color::DarkGray)),
                Span::styled(
                    format!("{:<5} ", entry.level.as_str()),
                    Style::default().fg(level_color(entry.level)),
                ),
                Span::raw(entry.message.clone()),
            ]))
        })
        .collect();

    let title = format!(" Activity ({} logged) ", m.total_logged);
    f.render_widget(
        List::new(items).block(Block::default().borders(Borders::ALL).title(title)),
        area,
    );
}
