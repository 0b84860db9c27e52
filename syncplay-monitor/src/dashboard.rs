//! Terminal dashboard for a sync session

use crate::metrics::{LogLevel, Metrics};
use crate::player::{seek_target, SimulatedPlayer};
use crate::session::{self, Connection};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use parking_lot::RwLock;
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph, Scrollbar, ScrollbarOrientation, ScrollbarState},
    Frame, Terminal,
};
use std::io::stdout;
use std::sync::Arc;
use std::time::Duration;
use syncplay_core::service::GroupState;
use syncplay_core::session::SyncMethod;
use syncplay_core::{Phase, SessionHandle};

/// Step for the seek keys
const SEEK_STEP_MS: f64 = 10_000.0;

/// Drift below which the playback panel shows green
const IN_SYNC_MS: f64 = 100.0;

/// Dashboard state for scrolling etc.
struct DashboardState {
    /// Log scroll position (0 = most recent at bottom)
    log_scroll: usize,
    /// Whether auto-scroll is enabled (follows new logs)
    auto_scroll: bool,
    /// Log length at the previous frame
    seen_logs: usize,
}

/// Run the dashboard
pub async fn run(connection: Connection, metrics: Arc<RwLock<Metrics>>) -> Result<(), Box<dyn std::error::Error>> {
    let handle = connection.handle.clone();
    let player = Arc::clone(&connection.player);

    // Keep the metrics in step with the session in the background
    let metrics_for_session = Arc::clone(&metrics);
    tokio::spawn(session::run_with_dashboard(connection, metrics_for_session));

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = ratatui::backend::CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut state = DashboardState {
        log_scroll: 0,
        auto_scroll: true,
        seen_logs: 0,
    };

    let tick_rate = Duration::from_millis(100);
    let mut should_quit = false;

    while !should_quit {
        {
            let log_count = metrics.read().logs.len();
            if log_count != state.seen_logs && state.auto_scroll {
                state.log_scroll = 0;
            }
            state.seen_logs = log_count;
        }

        terminal.draw(|f| draw(f, &metrics, &player, &state))?;

        // crossterm polling blocks; keep it off the runtime workers
        let key = tokio::task::block_in_place(|| -> std::io::Result<Option<event::KeyEvent>> {
            if event::poll(tick_rate)? {
                if let Event::Key(key) = event::read()? {
                    return Ok(Some(key));
                }
            }
            Ok(None)
        })?;

        let Some(key) = key else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        let log_count = metrics.read().logs.len();
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => should_quit = true,
            KeyCode::Char('c') if key.modifiers.contains(event::KeyModifiers::CONTROL) => should_quit = true,
            // Scroll up (older logs)
            KeyCode::Up | KeyCode::Char('k') => {
                if log_count > 0 {
                    state.log_scroll = (state.log_scroll + 1).min(log_count.saturating_sub(1));
                    state.auto_scroll = false;
                }
            }
            // Scroll down (newer logs)
            KeyCode::Down | KeyCode::Char('j') => {
                state.log_scroll = state.log_scroll.saturating_sub(1);
                if state.log_scroll == 0 {
                    state.auto_scroll = true;
                }
            }
            KeyCode::PageUp => {
                if log_count > 0 {
                    state.log_scroll = (state.log_scroll + 10).min(log_count.saturating_sub(1));
                    state.auto_scroll = false;
                }
            }
            KeyCode::PageDown => {
                state.log_scroll = state.log_scroll.saturating_sub(10);
                if state.log_scroll == 0 {
                    state.auto_scroll = true;
                }
            }
            KeyCode::Home => {
                if log_count > 0 {
                    state.log_scroll = log_count.saturating_sub(1);
                    state.auto_scroll = false;
                }
            }
            KeyCode::End => {
                state.log_scroll = 0;
                state.auto_scroll = true;
            }
            KeyCode::Char('a') => {
                state.auto_scroll = !state.auto_scroll;
                if state.auto_scroll {
                    state.log_scroll = 0;
                }
            }
            code => group_key(code, &handle, &player, &metrics),
        }
    }

    handle.shutdown();

    // Cleanup
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    Ok(())
}

/// Keys that act on the group
fn group_key(code: KeyCode, handle: &SessionHandle, player: &SimulatedPlayer, metrics: &RwLock<Metrics>) {
    let (group_state, following) = {
        let m = metrics.read();
        (m.group_state, m.following)
    };

    let (label, result) = match code {
        KeyCode::Char(' ') if group_state == Some(GroupState::Playing) => ("Pause", handle.pause()),
        KeyCode::Char(' ') => ("Unpause", handle.unpause()),
        KeyCode::Left => ("Seek back", handle.seek(seek_target(player.position_ms(), -SEEK_STEP_MS))),
        KeyCode::Right => ("Seek forward", handle.seek(seek_target(player.position_ms(), SEEK_STEP_MS))),
        KeyCode::Char('n') => ("Next item", handle.next_item()),
        KeyCode::Char('p') => ("Previous item", handle.previous_item()),
        KeyCode::Char('r') => ("Clock refresh", handle.refresh_clock()),
        KeyCode::Char('f') if following => ("Halt", handle.halt_group_playback()),
        KeyCode::Char('f') => ("Resume", handle.resume_group_playback()),
        _ => return,
    };

    let mut m = metrics.write();
    match result {
        Ok(()) => m.log(LogLevel::Info, format!("{} requested", label)),
        Err(e) => m.log(LogLevel::Error, format!("{} failed: {}", label, e)),
    }
}

/// Draw the dashboard
fn draw(f: &mut Frame, metrics: &Arc<RwLock<Metrics>>, player: &SimulatedPlayer, state: &DashboardState) {
    let m = metrics.read();

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Length(7), // Stats
            Constraint::Min(10),   // Logs
            Constraint::Length(1), // Footer
        ])
        .split(f.area());

    draw_header(f, chunks[0], &m);
    draw_stats(f, chunks[1], &m, player);
    draw_logs(f, chunks[2], &m, state);
    draw_footer(f, chunks[3], state);
}

fn draw_header(f: &mut Frame, area: Rect, m: &Metrics) {
    let phase_style = match m.phase {
        Phase::Disabled => Style::default().fg(Color::DarkGray),
        Phase::Enabling => Style::default().fg(Color::Yellow),
        Phase::Ready if m.following => Style::default().fg(Color::Green),
        Phase::Ready => Style::default().fg(Color::Magenta),
    };

    let phase_text = match m.phase {
        Phase::Ready if !m.following => "HALTED",
        Phase::Disabled => "DISABLED",
        Phase::Enabling => "ENABLING",
        Phase::Ready => "SYNCING",
    };

    let title = vec![Line::from(vec![
        Span::styled("SyncPlay Monitor", Style::default().add_modifier(Modifier::BOLD)),
        Span::raw("  │  Status: "),
        Span::styled(phase_text, phase_style),
        Span::raw("  │  Server: "),
        Span::styled(m.server.as_str(), Style::default().fg(Color::Cyan)),
        Span::raw("  │  Uptime: "),
        Span::styled(m.uptime(), Style::default().fg(Color::Cyan)),
    ])];

    let header = Paragraph::new(title).block(Block::default().borders(Borders::ALL).title(" Dashboard "));

    f.render_widget(header, area);
}

fn draw_stats(f: &mut Frame, area: Rect, m: &Metrics, player: &SimulatedPlayer) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(30),
            Constraint::Percentage(35),
            Constraint::Percentage(35),
        ])
        .split(area);

    // Clock
    let clock_info = vec![
        Line::from(vec![
            Span::raw("Offset: "),
            Span::styled(format!("{:+.1} ms", m.offset_ms), Style::default().fg(Color::Yellow)),
        ]),
        Line::from(vec![
            Span::raw("Ping: "),
            Span::styled(format!("{:.1} ms", m.ping_ms), Style::default().fg(Color::Cyan)),
        ]),
        Line::from(vec![
            Span::raw("Samples: "),
            Span::styled(m.clock_samples.to_string(), Style::default().fg(Color::White)),
        ]),
    ];
    let clock_block = Paragraph::new(clock_info).block(Block::default().borders(Borders::ALL).title(" Clock "));
    f.render_widget(clock_block, chunks[0]);

    // Playback
    let drift_color = if m.playback_diff_ms.abs() < IN_SYNC_MS {
        Color::Green
    } else {
        Color::Red
    };
    let method = match m.sync_method {
        SyncMethod::None => "in sync".to_string(),
        other => other.to_string(),
    };
    let playback_info = vec![
        Line::from(vec![
            Span::raw("Position: "),
            Span::styled(format_position(m.position_ms), Style::default().fg(Color::Cyan)),
            Span::raw(format!("  x{:.2}", player.rate())),
        ]),
        Line::from(vec![
            Span::raw("Drift: "),
            Span::styled(
                format!("{:+.0} ms", m.playback_diff_ms),
                Style::default().fg(drift_color).add_modifier(Modifier::BOLD),
            ),
            Span::raw(format!("  peak {:.0} ms", m.peak_diff_ms)),
        ]),
        Line::from(vec![
            Span::raw("Method: "),
            Span::styled(method, Style::default().fg(Color::Magenta)),
            Span::raw(format!("  ({} fixes)", m.corrections)),
        ]),
    ];
    let playback_block =
        Paragraph::new(playback_info).block(Block::default().borders(Borders::ALL).title(" Playback "));
    f.render_widget(playback_block, chunks[1]);

    // Group
    let state_text = m.group_state.map(|s| s.as_str()).unwrap_or("-");
    let playing = player.current_title().unwrap_or_else(|| "nothing".to_string());
    let group_info = vec![
        Line::from(vec![
            Span::raw("Group: "),
            Span::styled(
                m.group_name.clone().unwrap_or_else(|| "none".to_string()),
                Style::default().fg(Color::Yellow),
            ),
            Span::raw(format!("  rev {}", m.revision.map_or("-".to_string(), |r| r.to_string()))),
        ]),
        Line::from(vec![
            Span::raw("State: "),
            Span::styled(state_text, Style::default().fg(Color::Green)),
            Span::raw(format!("  {} members", m.participants.len())),
        ]),
        Line::from(vec![
            Span::raw("Queue: "),
            Span::styled(format!("{} items", m.queue_len), Style::default().fg(Color::White)),
            Span::raw(format!("  {}", playing)),
        ]),
    ];
    let group_block = Paragraph::new(group_info).block(Block::default().borders(Borders::ALL).title(" Group "));
    f.render_widget(group_block, chunks[2]);
}

fn draw_logs(f: &mut Frame, area: Rect, m: &Metrics, state: &DashboardState) {
    let visible_height = area.height.saturating_sub(2) as usize;
    let total_logs = m.logs.len();

    let log_items: Vec<ListItem> = m
        .logs
        .iter()
        .rev()
        .skip(state.log_scroll)
        .take(visible_height)
        .map(|entry| {
            let level_style = match entry.level {
                LogLevel::Info => Style::default().fg(Color::Blue),
                LogLevel::Warning => Style::default().fg(Color::Yellow),
                LogLevel::Error => Style::default().fg(Color::Red),
                LogLevel::Group => Style::default().fg(Color::Green),
                LogLevel::Sync => Style::default().fg(Color::Magenta),
            };

            let time = entry.timestamp.format("%H:%M:%S").to_string();

            ListItem::new(Line::from(vec![
                Span::styled(format!("{} ", time), Style::default().fg(Color::DarkGray)),
                Span::styled(format!("[{}] ", entry.level.as_str()), level_style),
                Span::raw(entry.message.as_str()),
            ]))
        })
        .collect();

    let scroll_indicator = if state.auto_scroll {
        " [AUTO] ".to_string()
    } else if total_logs > 0 {
        format!(" [{}/{}] ", total_logs - state.log_scroll, total_logs)
    } else {
        String::new()
    };

    let logs = List::new(log_items).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" Activity Log{}", scroll_indicator)),
    );

    f.render_widget(logs, area);

    if total_logs > visible_height {
        let scrollbar = Scrollbar::new(ScrollbarOrientation::VerticalRight)
            .begin_symbol(Some("↑"))
            .end_symbol(Some("↓"));

        let mut scrollbar_state =
            ScrollbarState::new(total_logs).position(total_logs.saturating_sub(state.log_scroll + visible_height));

        f.render_stateful_widget(
            scrollbar,
            area.inner(ratatui::layout::Margin {
                vertical: 1,
                horizontal: 0,
            }),
            &mut scrollbar_state,
        );
    }
}

fn draw_footer(f: &mut Frame, area: Rect, state: &DashboardState) {
    let auto_text = if state.auto_scroll { "ON " } else { "OFF" };
    let auto_color = if state.auto_scroll { Color::Green } else { Color::Yellow };
    let key = Style::default().fg(Color::Black).bg(Color::White);

    let footer = Paragraph::new(Line::from(vec![
        Span::styled(" Q ", key),
        Span::raw(" Quit  "),
        Span::styled(" Space ", key),
        Span::raw(" Play/Pause  "),
        Span::styled(" ←→ ", key),
        Span::raw(" Seek  "),
        Span::styled(" N/P ", key),
        Span::raw(" Item  "),
        Span::styled(" F ", key),
        Span::raw(" Follow  "),
        Span::styled(" R ", key),
        Span::raw(" Clock  "),
        Span::styled(" ↑↓ ", key),
        Span::raw(" Scroll  "),
        Span::styled(" A ", key),
        Span::raw(" Auto-scroll: "),
        Span::styled(auto_text, Style::default().fg(auto_color)),
    ]));

    f.render_widget(footer, area);
}

/// `m:ss` or `h:mm:ss`
fn format_position(position_ms: f64) -> String {
    let secs = (position_ms.max(0.0) / 1000.0) as u64;
    if secs < 3600 {
        format!("{}:{:02}", secs / 60, secs % 60)
    } else {
        format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_position() {
        assert_eq!(format_position(0.0), "0:00");
        assert_eq!(format_position(75_400.0), "1:15");
        assert_eq!(format_position(3_723_000.0), "1:02:03");
        assert_eq!(format_position(-50.0), "0:00");
    }
}
