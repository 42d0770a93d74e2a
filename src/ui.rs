use crossbeam_channel::{Receiver, Sender};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    Frame, Terminal,
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Bar, BarChart, BarGroup, Block, Borders, Gauge, Paragraph},
};
use std::{
    io::{self, Stdout},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crate::peripherals::{Display, HostIndicators, IndicatorLevels, LatchSensor};
use crate::ring::RingBuffer;
use crate::spectrum::SpectrumAnalyzer;
use crate::task::{StopSignal, TaskHandle};
use crate::types::{MAX_LEVEL, NUM_BANDS, NowPlaying, SpectrumBands};

const FRAME_INTERVAL: Duration = Duration::from_millis(15);

const SCROLL_START_DELAY: Duration = Duration::from_secs(2);
const SCROLL_STEP: Duration = Duration::from_millis(150);
const SCROLL_RESET_DELAY: Duration = Duration::from_secs(2);

pub enum DisplayEvent {
    Active(bool),
    Status(String),
    Goodbye,
}

/// Everything the display task needs from the rest of the device.
pub struct DisplayInputs {
    pub ring: Arc<RingBuffer>,
    pub analysis_interval: Duration,
    pub now_playing: Receiver<NowPlaying>,
    pub sensor: LatchSensor,
    pub indicators: HostIndicators,
    pub network_up: Arc<AtomicBool>,
    pub sample_rate: u32,
}

/// Side-scrolling state for a line wider than the screen.
pub struct Marquee {
    offset: usize,
    started: Instant,
    last_step: Instant,
    completed_at: Option<Instant>,
}

impl Marquee {
    pub fn new(now: Instant) -> Marquee {
        Marquee {
            offset: 0,
            started: now,
            last_step: now,
            completed_at: None,
        }
    }

    pub fn reset(&mut self, now: Instant) {
        *self = Marquee::new(now);
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn tick(&mut self, now: Instant, text_len: usize, visible: usize) -> usize {
        if text_len <= visible {
            self.offset = 0;
            self.completed_at = None;
            return 0;
        }

        let max_offset = text_len - visible;
        let waited = now.saturating_duration_since(self.started) > SCROLL_START_DELAY;
        if waited && now.saturating_duration_since(self.last_step) > SCROLL_STEP {
            self.last_step = now;
            if self.offset < max_offset {
                self.offset += 1;
                self.completed_at = None;
            } else {
                let completed = *self.completed_at.get_or_insert(now);
                if now.saturating_duration_since(completed) > SCROLL_RESET_DELAY {
                    self.offset = 0;
                    self.completed_at = None;
                    self.started = now;
                }
            }
        }
        self.offset
    }
}

pub struct App {
    pub active: bool,
    pub goodbye: bool,
    pub bands: SpectrumBands,
    pub now_playing: NowPlaying,
    pub marquee: Marquee,
    pub status: Option<String>,
    pub fill: f64,
    pub network_up: bool,
    pub indicators: IndicatorLevels,
    pub sample_rate: u32,
}

impl App {
    pub fn new(sample_rate: u32, now: Instant) -> App {
        App {
            active: true,
            goodbye: false,
            bands: SpectrumBands::default(),
            now_playing: NowPlaying::default(),
            marquee: Marquee::new(now),
            status: None,
            fill: 0.0,
            network_up: true,
            indicators: IndicatorLevels::default(),
            sample_rate,
        }
    }

    pub fn update_now_playing(&mut self, song: NowPlaying, now: Instant) {
        if song != self.now_playing {
            self.now_playing = song;
            self.marquee.reset(now);
        }
    }

    pub fn apply(&mut self, event: DisplayEvent) {
        match event {
            DisplayEvent::Active(active) => self.active = active,
            DisplayEvent::Status(message) => self.status = Some(message),
            DisplayEvent::Goodbye => self.goodbye = true,
        }
    }
}

/// Handle the lifecycle uses to drive the display task.
pub struct DisplayHandle {
    events: Sender<DisplayEvent>,
    task: TaskHandle,
}

impl DisplayHandle {
    fn send(&self, event: DisplayEvent) {
        let _ = self.events.try_send(event);
    }
}

impl Display for DisplayHandle {
    fn set_active(&mut self, active: bool) {
        self.send(DisplayEvent::Active(active));
    }

    fn show_status(&mut self, message: &str) {
        self.send(DisplayEvent::Status(message.to_string()));
    }

    fn show_goodbye(&mut self) {
        self.send(DisplayEvent::Goodbye);
    }

    fn power_off(&mut self) {
        self.task.terminate();
    }
}

pub type TerminalType = Terminal<CrosstermBackend<Stdout>>;

pub fn init_terminal() -> Result<TerminalType, anyhow::Error> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let terminal = Terminal::new(backend)?;
    Ok(terminal)
}

pub fn restore_terminal() -> Result<(), anyhow::Error> {
    disable_raw_mode()?;
    execute!(io::stdout(), LeaveAlternateScreen)?;
    Ok(())
}

/// Starts the terminal display on an initialized terminal. The terminal is
/// restored when the display is powered off.
pub fn spawn_tui(
    mut terminal: TerminalType,
    inputs: DisplayInputs,
) -> Result<DisplayHandle, anyhow::Error> {
    let (tx, rx) = crossbeam_channel::bounded(32);

    let spawned = TaskHandle::spawn("display", move |stop| {
        if let Err(e) = run_tui(&mut terminal, inputs, rx, &stop) {
            log::error!("display failed: {}", e);
        }
        if let Err(e) = restore_terminal() {
            log::warn!("could not restore terminal: {}", e);
        }
    });
    let task = match spawned {
        Ok(task) => task,
        Err(e) => {
            // the terminal was already switched to raw mode by the caller
            let _ = restore_terminal();
            return Err(e.into());
        }
    };

    Ok(DisplayHandle { events: tx, task })
}

fn refresh(app: &mut App, analyzer: &mut SpectrumAnalyzer, inputs: &DisplayInputs, now: Instant) {
    // an inactive display no longer touches the buffer
    if app.active {
        if analyzer.update(&inputs.ring, now) {
            app.bands = analyzer.bands();
        }
        while let Ok(song) = inputs.now_playing.try_recv() {
            app.update_now_playing(song, now);
        }
        app.fill = inputs.ring.available_to_read() as f64 / inputs.ring.capacity() as f64;
    }
    app.network_up = inputs.network_up.load(Ordering::Relaxed);
    app.indicators = inputs.indicators.levels();
}

fn run_tui(
    terminal: &mut TerminalType,
    inputs: DisplayInputs,
    events: Receiver<DisplayEvent>,
    stop: &StopSignal,
) -> Result<(), anyhow::Error> {
    let mut analyzer = SpectrumAnalyzer::new(inputs.analysis_interval);
    let mut app = App::new(inputs.sample_rate, Instant::now());

    loop {
        let now = Instant::now();
        while let Ok(event) = events.try_recv() {
            app.apply(event);
        }
        refresh(&mut app, &mut analyzer, &inputs, now);

        let visible = terminal.size()?.width.saturating_sub(4) as usize;
        if app.active {
            let len = app.now_playing.line().chars().count();
            app.marquee.tick(now, len, visible);
        }

        handle_events(&inputs.sensor)?;
        terminal.draw(|f| draw_ui(f, &app))?;

        if stop.sleep(FRAME_INTERVAL) {
            return Ok(());
        }
    }
}

/// Display used without a terminal: keeps the analyzer running and logs
/// what the screen would show.
pub fn spawn_headless(inputs: DisplayInputs) -> std::io::Result<DisplayHandle> {
    let (tx, rx) = crossbeam_channel::bounded(32);

    let task = TaskHandle::spawn("display", move |stop| {
        let mut analyzer = SpectrumAnalyzer::new(inputs.analysis_interval);
        let mut app = App::new(inputs.sample_rate, Instant::now());
        let mut last_log = Instant::now();

        loop {
            let now = Instant::now();
            while let Ok(event) = rx.try_recv() {
                match &event {
                    DisplayEvent::Goodbye => log::info!("display: Goodnight!"),
                    DisplayEvent::Active(false) => log::info!("display updates stopped"),
                    _ => {}
                }
                app.apply(event);
            }

            let previous = app.now_playing.clone();
            refresh(&mut app, &mut analyzer, &inputs, now);
            if app.now_playing != previous {
                log::info!("display: {}", app.now_playing.line());
            }
            if app.active && now.duration_since(last_log) >= Duration::from_secs(1) {
                last_log = now;
                log::debug!(
                    "spectrum [{}] buffer {:.0}%",
                    band_sparkline(&app.bands),
                    app.fill * 100.0
                );
            }

            if stop.sleep(FRAME_INTERVAL) {
                break;
            }
        }
    })?;

    Ok(DisplayHandle { events: tx, task })
}

fn band_sparkline(bands: &SpectrumBands) -> String {
    const TICKS: [char; 7] = [' ', '▁', '▂', '▃', '▅', '▆', '█'];
    bands
        .levels()
        .iter()
        .map(|&l| TICKS[(l as usize * (TICKS.len() - 1)) / MAX_LEVEL as usize])
        .collect()
}

pub fn handle_events(sensor: &LatchSensor) -> Result<(), anyhow::Error> {
    if event::poll(Duration::from_millis(0))? {
        if let Event::Key(key) = event::read()? {
            if key.kind == KeyEventKind::Press {
                match key.code {
                    KeyCode::Char('q') | KeyCode::Char('s') | KeyCode::Esc => {
                        sensor.assert();
                    }
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        sensor.assert();
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

fn create_color_gradient(position: f32) -> Color {
    let pos = position.clamp(0.0, 1.0);

    if pos < 0.33 {
        let t = pos / 0.33;
        let r = (64.0 + (128.0 - 64.0) * t) as u8;
        let g = (224.0 + (160.0 - 224.0) * t) as u8;
        let b = (208.0 + (128.0 - 208.0) * t) as u8;
        Color::Rgb(r, g, b)
    } else if pos < 0.66 {
        let t = (pos - 0.33) / 0.33;
        let r = (128.0 + (64.0 - 128.0) * t) as u8;
        let g = (160.0 + (224.0 - 160.0) * t) as u8;
        let b = (128.0 + (224.0 - 128.0) * t) as u8;
        Color::Rgb(r, g, b)
    } else {
        let t = (pos - 0.66) / 0.34;
        let r = (64.0 + (128.0 - 64.0) * t) as u8;
        let g = (224.0 + (96.0 - 224.0) * t) as u8;
        let b = (224.0 + (160.0 - 224.0) * t) as u8;
        Color::Rgb(r, g, b)
    }
}

fn border_style() -> Style {
    Style::default().fg(Color::Rgb(96, 160, 192))
}

pub fn draw_ui(f: &mut Frame, app: &App) {
    let size = f.area();

    if size.width < 40 || size.height < 16 {
        let error_msg = Paragraph::new("Terminal too small!\nMinimum: 40x16")
            .style(Style::default().fg(Color::Red))
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL));
        f.render_widget(error_msg, size);
        return;
    }

    if app.goodbye {
        draw_goodbye(f, size, app);
        return;
    }

    let main_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Title
            Constraint::Min(8),    // EQ spectrum
            Constraint::Length(3), // Now playing
            Constraint::Length(4), // Buffer + indicators
        ])
        .split(size);

    draw_title(f, main_layout[0], app);
    draw_eq_spectrum(f, main_layout[1], app);
    draw_now_playing(f, main_layout[2], app);
    draw_status_bar(f, main_layout[3], app);
}

fn draw_title(f: &mut Frame, area: Rect, app: &App) {
    let network = if app.network_up {
        Span::styled("online", Style::default().fg(Color::Rgb(128, 224, 208)))
    } else {
        Span::styled("No WiFi", Style::default().fg(Color::Red))
    };
    let title = Paragraph::new(Line::from(vec![
        Span::styled(
            "STREAMER  ",
            Style::default()
                .fg(Color::Rgb(128, 224, 208))
                .add_modifier(Modifier::BOLD),
        ),
        network,
    ]))
    .alignment(Alignment::Center)
    .block(Block::default().borders(Borders::ALL).border_style(border_style()));
    f.render_widget(title, area);
}

fn draw_eq_spectrum(f: &mut Frame, area: Rect, app: &App) {
    let eq_block = Block::default()
        .title(format!(" Spectrum ({} Hz) ", app.sample_rate))
        .borders(Borders::ALL)
        .border_style(border_style());

    let inner = eq_block.inner(area);
    f.render_widget(eq_block, area);

    let bars: Vec<Bar> = app
        .bands
        .levels()
        .iter()
        .map(|&level| {
            let position = level as f32 / MAX_LEVEL as f32;
            Bar::default()
                .value(level as u64)
                .text_value(String::new())
                .style(Style::default().fg(create_color_gradient(position)))
        })
        .collect();

    let gap = if inner.width as usize >= NUM_BANDS * 3 { 1 } else { 0 };
    let width = ((inner.width as usize / NUM_BANDS).saturating_sub(gap)).max(1) as u16;

    let barchart = BarChart::default()
        .data(BarGroup::default().bars(&bars))
        .max(MAX_LEVEL as u64)
        .bar_width(width)
        .bar_gap(gap as u16);

    f.render_widget(barchart, inner);
}

fn draw_now_playing(f: &mut Frame, area: Rect, app: &App) {
    let block = Block::default()
        .title(" Now Playing ")
        .borders(Borders::ALL)
        .border_style(border_style());

    let text = Paragraph::new(app.now_playing.line())
        .style(Style::default().fg(Color::White))
        .scroll((0, app.marquee.offset() as u16))
        .block(block);
    f.render_widget(text, area);
}

fn draw_status_bar(f: &mut Frame, area: Rect, app: &App) {
    let block = Block::default().borders(Borders::ALL).border_style(border_style());
    let inner = block.inner(area);
    f.render_widget(block, area);

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1), Constraint::Length(1)])
        .split(inner);

    let gauge = Gauge::default()
        .gauge_style(Style::default().fg(create_color_gradient(app.fill as f32)))
        .ratio(app.fill.clamp(0.0, 1.0))
        .label(format!("buffer {:.0}%", app.fill * 100.0));
    f.render_widget(gauge, rows[0]);

    let led = |on: bool| {
        if on {
            Span::styled("●", Style::default().fg(Color::Rgb(255, 255, 0)))
        } else {
            Span::styled("○", Style::default().fg(Color::Rgb(128, 128, 128)))
        }
    };
    let label = Style::default().fg(Color::Rgb(128, 160, 192));
    let key = Style::default()
        .fg(Color::Rgb(255, 255, 0))
        .add_modifier(Modifier::BOLD);

    let mut spans = vec![
        Span::styled("sleep ", label),
        led(app.indicators.state),
        Span::styled("  stream ", label),
        led(app.indicators.stream),
        Span::styled("  |  ", label),
        Span::styled("S", key),
        Span::styled("/", label),
        Span::styled("Q", key),
        Span::styled(" to sleep", Style::default().fg(Color::White)),
    ];
    if let Some(status) = &app.status {
        spans.push(Span::styled("  |  ", label));
        spans.push(Span::styled(status.clone(), Style::default().fg(Color::White)));
    }

    f.render_widget(Paragraph::new(Line::from(spans)).alignment(Alignment::Center), rows[1]);
}

fn draw_goodbye(f: &mut Frame, area: Rect, app: &App) {
    let mut lines = vec![
        Line::from(Span::styled(
            "STREAMER",
            Style::default()
                .fg(Color::Rgb(128, 224, 208))
                .add_modifier(Modifier::BOLD),
        )),
        Line::from(""),
        Line::from("Goodnight!"),
    ];
    if let Some(status) = &app.status {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(
            status.clone(),
            Style::default().fg(Color::Rgb(160, 160, 160)),
        )));
    }

    let block = Block::default().borders(Borders::ALL).border_style(border_style());
    let inner = block.inner(area);
    f.render_widget(block, area);

    let top = inner.height.saturating_sub(lines.len() as u16) / 2;
    let centered = Rect {
        y: inner.y + top,
        height: inner.height - top,
        ..inner
    };
    f.render_widget(Paragraph::new(lines).alignment(Alignment::Center), centered);
}
