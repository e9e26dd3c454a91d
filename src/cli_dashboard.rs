//! Overview (task counts per status and tasks in flight)
//! Queue (next pending tasks)
//! Failures (most recent failed tasks with their error)

use std::{
  io,
  sync::Arc,
  thread,
  time::{Duration, Instant},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use crossterm::{
  event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyCode},
  execute,
  terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use tui::{
  backend::{Backend, CrosstermBackend},
  layout::{Constraint, Direction, Layout, Rect},
  style::{Color, Modifier, Style},
  text::{Span, Spans},
  widgets::{Block, Borders, List, ListItem, Paragraph, Tabs},
  Terminal,
};
use tokio::runtime::Runtime;
use uuid::Uuid;
use imgq::{
  config::Config,
  database::setup_database,
  models::{Task, TaskStatus},
  store::{PgStore, StoreError, TaskStore},
};

const QUEUE_ROWS: usize = 10;
const FAILURE_ROWS: usize = 20;

struct TaskInfo {
  id: String,
  source: String,
  price: f64,
  updated_at: String,
}

impl From<&Task> for TaskInfo {
  fn from(task: &Task) -> Self {
    Self {
      id: task.id.to_string(),
      source: task.source_reference.clone(),
      price: task.price.as_decimal(),
      updated_at: task.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
    }
  }
}

struct FailureEntry {
  id: String,
  timestamp: String,
  message: String,
}

#[derive(Clone, Copy)]
enum DashboardTab {
  Overview,
  Queue,
  Failures,
}

struct App {
  current_tab: DashboardTab,
  counts: Vec<(TaskStatus, u64)>,
  processing: Vec<TaskInfo>,
  queued_tasks: Vec<TaskInfo>,
  failures: Vec<FailureEntry>,
  last_error: Option<String>,
}

impl App {
  fn new() -> Self {
    Self {
      current_tab: DashboardTab::Overview,
      counts: vec![],
      processing: vec![],
      queued_tasks: vec![],
      failures: vec![],
      last_error: None,
    }
  }

  fn next_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Overview => DashboardTab::Queue,
      DashboardTab::Queue => DashboardTab::Failures,
      DashboardTab::Failures => DashboardTab::Overview,
    }
  }

  fn previous_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Overview => DashboardTab::Failures,
      DashboardTab::Queue => DashboardTab::Overview,
      DashboardTab::Failures => DashboardTab::Queue,
    }
  }
}

async fn fetch_state(store: &PgStore) -> Result<App, StoreError> {
  let mut app = App::new();
  app.counts = store.count_by_status().await?;
  app.processing = store
    .list_by_status(TaskStatus::Processing, QUEUE_ROWS)
    .await?
    .iter()
    .map(TaskInfo::from)
    .collect();
  app.queued_tasks = store
    .list_by_status(TaskStatus::Pending, QUEUE_ROWS)
    .await?
    .iter()
    .map(TaskInfo::from)
    .collect();

  let failure_rows: Vec<(Uuid, DateTime<Utc>, Option<String>)> = sqlx::query_as(
    "SELECT id, updated_at, error_detail FROM tasks WHERE status = 'failed' ORDER BY updated_at DESC LIMIT $1",
  )
    .bind(FAILURE_ROWS as i64)
    .fetch_all(store.pool())
    .await?;
  app.failures = failure_rows
    .into_iter()
    .map(|(id, updated_at, error_detail)| FailureEntry {
      id: id.to_string(),
      timestamp: updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
      message: error_detail.unwrap_or_else(|| "N/A".into()),
    })
    .collect();

  Ok(app)
}

fn main() -> Result<()> {
  let config = Config::from_env().context("Failed to load configuration")?;
  let database_url = config.require_database_url("the dashboard")?;
  let rt = Runtime::new()?;
  let pool = rt
    .block_on(setup_database(database_url))
    .context("Failed to set up database")?;
  let store = Arc::new(PgStore::new(pool));

  enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
  let backend = CrosstermBackend::new(stdout);
  let mut terminal = Terminal::new(backend)?;

  let (tx, rx) = std::sync::mpsc::channel::<App>();

  {
    let store = store.clone();
    thread::spawn(move || {
      let rt_bg = match Runtime::new() {
        Ok(rt_bg) => rt_bg,
        Err(_) => return,
      };
      loop {
        let app_state = rt_bg.block_on(fetch_state(&store)).unwrap_or_else(|e| {
          let mut app = App::new();
          app.last_error = Some(e.to_string());
          app
        });
        if tx.send(app_state).is_err() {
          break;
        }
        thread::sleep(Duration::from_secs(2));
      }
    });
  }

  let mut app = App::new();
  let tick_rate = Duration::from_millis(500);
  let mut last_tick = Instant::now();

  loop {
    if let Ok(new_state) = rx.try_recv() {
      let tab = app.current_tab;
      app = new_state;
      app.current_tab = tab;
    }
    terminal.draw(|f| ui(f, &app))?;

    let timeout = tick_rate
      .checked_sub(last_tick.elapsed())
      .unwrap_or_else(|| Duration::from_secs(0));
    if event::poll(timeout)? {
      if let CEvent::Key(key) = event::read()? {
        match key.code {
          KeyCode::Char('q') => break,
          KeyCode::Right => app.next_tab(),
          KeyCode::Left => app.previous_tab(),
          _ => {}
        }
      }
    }
    if last_tick.elapsed() >= tick_rate {
      last_tick = Instant::now();
    }
  }

  disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
  terminal.show_cursor()?;
  Ok(())
}

fn ui<B: Backend>(f: &mut tui::Frame<B>, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([
      Constraint::Length(3),
      Constraint::Min(0),
      Constraint::Length(3),
    ].as_ref())
    .split(f.size());

  let tab_titles = vec!["Overview", "Queue", "Failures"];
  let tabs = Tabs::new(
    tab_titles
      .iter()
      .map(|t| Spans::from(Span::styled(*t, Style::default().fg(Color::Yellow))))
      .collect(),
  )
    .block(Block::default().borders(Borders::ALL).title("Image Tasks"))
    .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
    .select(match app.current_tab {
      DashboardTab::Overview => 0,
      DashboardTab::Queue => 1,
      DashboardTab::Failures => 2,
    });
  f.render_widget(tabs, chunks[0]);

  match app.current_tab {
    DashboardTab::Overview => render_overview(f, app, chunks[1]),
    DashboardTab::Queue => render_queue(f, app, chunks[1]),
    DashboardTab::Failures => render_failures(f, app, chunks[1]),
  }

  let footer_text = match &app.last_error {
    Some(e) => format!("Store error: {} | ←/→: Switch Tabs | q: Quit", e),
    None => "←/→: Switch Tabs | q: Quit".to_string(),
  };
  let footer = Paragraph::new(footer_text)
    .style(Style::default().fg(Color::White))
    .block(Block::default().borders(Borders::ALL));
  f.render_widget(footer, chunks[2]);
}

fn status_color(status: TaskStatus) -> Color {
  match status {
    TaskStatus::Pending => Color::Yellow,
    TaskStatus::Processing => Color::Cyan,
    TaskStatus::Completed => Color::Green,
    TaskStatus::Failed => Color::Red,
  }
}

fn task_line(t: &TaskInfo) -> ListItem<'_> {
  ListItem::new(Spans::from(vec![
    Span::styled(format!("{} ", t.id), Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
    Span::raw(format!("{} | ${:.2} | updated {}", t.source, t.price, t.updated_at)),
  ]))
}

fn render_overview<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let chunks = Layout::default()
    .direction(Direction::Horizontal)
    .constraints([Constraint::Percentage(30), Constraint::Percentage(70)].as_ref())
    .split(area);

  let count_items: Vec<ListItem> = app.counts.iter().map(|(status, count)| {
    ListItem::new(Spans::from(vec![
      Span::styled(format!("{:<12}", status.as_str()), Style::default().fg(status_color(*status))),
      Span::raw(count.to_string()),
    ]))
  }).collect();
  let counts_list = List::new(count_items)
    .block(Block::default().borders(Borders::ALL).title("Tasks by Status"));
  f.render_widget(counts_list, chunks[0]);

  let active: Vec<ListItem> = if app.processing.is_empty() {
    vec![ListItem::new(Spans::from(Span::raw("No tasks processing")))]
  } else {
    app.processing.iter().map(task_line).collect()
  };
  let tasks_list = List::new(active)
    .block(Block::default().borders(Borders::ALL).title("Processing"));
  f.render_widget(tasks_list, chunks[1]);
}

fn render_queue<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let task_items: Vec<ListItem> = app.queued_tasks.iter().map(task_line).collect();
  let header = format!("Next {} Pending Tasks", QUEUE_ROWS);
  let tasks_list = List::new(task_items)
    .block(Block::default().borders(Borders::ALL).title(header));
  f.render_widget(tasks_list, area);
}

fn render_failures<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let items: Vec<ListItem> = app.failures.iter().map(|l| {
    ListItem::new(Spans::from(vec![
      Span::styled(&l.timestamp, Style::default().fg(Color::Green)),
      Span::raw(" - "),
      Span::styled(&l.id, Style::default().fg(Color::Yellow)),
      Span::raw(" - "),
      Span::styled(&l.message, Style::default().fg(Color::Red)),
    ]))
  }).collect();
  let list = List::new(items)
    .block(Block::default().borders(Borders::ALL).title("Recent Failures"));
  f.render_widget(list, area);
}
