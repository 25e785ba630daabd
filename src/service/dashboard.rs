//! Dashboard: HTTP query interface, live event stream and SVG chart.
//!
//! Two threads:
//! - **Render loop:** redraws the SVG chart (history tail + latest forecast) into an
//!   in-memory cache whenever new readings or forecasts were counted since the last tick.
//! - **Web server:** socket2 listener, one thread per connection. Connection threads are
//!   joined when the server stops; event streams poll the stop flag between events.
//!
//! Routes: `/`, `/data/latest`, `/data/history`, `/forecast/latest`, `/metrics.json`,
//! `/dashboard.svg`, `/events` (Server-Sent Events: `sensor_update` / `forecast_update`).

use std::{
    io::{self, BufRead, BufReader, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Sender};
use log::{debug, error, info, warn};
use plotters::{coord::Shift, drawing::DrawingAreaErrorKind, prelude::*};
use serde_json::{Value, json};
use socket2::{Domain, SockAddr, Socket, Type};
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::forecast::engine::{ForecastBatch, ForecastRecord};
use crate::ingest::reading::{Feature, Reading};
use crate::publish::{
    router::{LATEST_FORECAST_KEY, LATEST_READING_KEY},
    sinks::{HistoryLog, LatestStore, LiveEvent, SubscriberHub},
};
use crate::utils::metrics::{SharedMetrics, lock_metrics};

const RENDER_TICK_MS: u64 = 1_000;
const ACCEPT_POLL_MS: u64 = 50;
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_POLL_MS: u64 = 100;
/// Comment line sent on idle event streams so dead clients are noticed.
const EVENT_HEARTBEAT: Duration = Duration::from_secs(15);
/// Readings drawn on the chart (most recent).
const CHART_POINTS: usize = 144;

/// What the dashboard reads from; all of it is shared with the sink worker.
#[derive(Clone)]
pub struct DashboardContext {
    pub latest: Arc<dyn LatestStore>,
    pub history: Arc<dyn HistoryLog>,
    pub hub: SubscriberHub,
    pub metrics: SharedMetrics,
}

pub struct DashboardHandle {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    stop_render: Sender<()>,
    render: Option<JoinHandle<()>>,
    web: Option<JoinHandle<()>>,
}

impl DashboardHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops both threads and waits for open connections, event streams included.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        let _ = self.stop_render.send(());
        for handle in [self.render.take(), self.web.take()].into_iter().flatten() {
            let _ = handle.join();
        }
    }
}

impl Drop for DashboardHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Binds `addr` (port 0 picks a free port) and starts the render loop and web server.
pub fn start_dashboard(addr: SocketAddr, ctx: DashboardContext) -> io::Result<DashboardHandle> {
    let listener = bind_listener(addr)?;
    let addr = listener.local_addr()?;

    let running = Arc::new(AtomicBool::new(true));
    let svg_cache = Arc::new(RwLock::new(String::new()));
    let (stop_tx, stop_rx) = channel::bounded::<()>(1);

    let render = {
        let ctx = ctx.clone();
        let svg_cache = svg_cache.clone();
        thread::Builder::new()
            .name("dashboard-render".into())
            .spawn(move || {
                let ticker = channel::tick(Duration::from_millis(RENDER_TICK_MS));
                let mut last_seen = None;
                loop {
                    let stop = channel::select! {
                        recv(stop_rx) -> _ => true,
                        recv(ticker) -> _ => false,
                    };
                    if stop {
                        break;
                    }
                    let seen = {
                        let m = lock_metrics(&ctx.metrics);
                        (m.readings_accepted, m.forecasts_emitted)
                    };
                    if last_seen == Some(seen) {
                        continue;
                    }
                    last_seen = Some(seen);
                    let svg = render_svg(&ctx);
                    if let Ok(mut w) = svg_cache.write() {
                        *w = svg;
                    }
                }
                debug!("render loop exiting");
            })?
    };

    let web = {
        let running = running.clone();
        thread::Builder::new()
            .name("dashboard-web".into())
            .spawn(move || serve(listener, ctx, svg_cache, running))?
    };

    info!("Dashboard available at http://{}", addr);
    Ok(DashboardHandle {
        addr,
        running,
        stop_render: stop_tx,
        render: Some(render),
        web: Some(web),
    })
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(128)?;
    let listener: TcpListener = socket.into();
    // Polled accept so the server notices `stop`.
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn serve(
    listener: TcpListener,
    ctx: DashboardContext,
    svg_cache: Arc<RwLock<String>>,
    running: Arc<AtomicBool>,
) {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    while running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _)) => {
                let ctx = ctx.clone();
                let svg_cache = svg_cache.clone();
                let running = running.clone();
                connections.retain(|h| !h.is_finished());
                connections.push(thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, &ctx, &svg_cache, &running) {
                        debug!("dashboard connection ended: {}", e);
                    }
                }));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(ACCEPT_POLL_MS));
            }
            Err(e) => error!("Accept error: {}", e),
        }
    }
    info!(
        "Web server exiting accept loop, waiting for {} connections",
        connections.len()
    );
    for handle in connections {
        let _ = handle.join();
    }
}

fn handle_connection(
    mut stream: TcpStream,
    ctx: &DashboardContext,
    svg_cache: &RwLock<String>,
    running: &AtomicBool,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(REQUEST_READ_TIMEOUT))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    // Drain headers; unread input would turn the close into a reset.
    let mut header = String::new();
    while reader.read_line(&mut header)? > 0 && !header.trim_end().is_empty() {
        header.clear();
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("").split('?').next().unwrap_or("");

    if method == "GET" && path == "/events" {
        return stream_events(stream, ctx.hub.subscribe(), running);
    }
    let response = if method == "GET" {
        route(path, ctx, svg_cache)
    } else {
        Response::text("405 Method Not Allowed", "only GET is supported")
    };
    stream.write_all(&response.into_bytes())?;
    stream.flush()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: &'static str,
    pub content_type: &'static str,
    pub body: String,
}

impl Response {
    fn json(value: &Value) -> Self {
        Self {
            status: "200 OK",
            content_type: "application/json",
            body: value.to_string(),
        }
    }

    fn text(status: &'static str, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: body.to_string(),
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.status,
            self.content_type,
            self.body.len(),
            self.body
        )
        .into_bytes()
    }
}

/// Request-response routes. `/events` is handled separately since it never completes.
pub fn route(path: &str, ctx: &DashboardContext, svg_cache: &RwLock<String>) -> Response {
    match path {
        "/" => Response::json(&json!({
            "message": "weather forecast service running",
            "routes": ["/data/latest", "/data/history", "/forecast/latest",
                       "/metrics.json", "/dashboard.svg", "/events"],
        })),
        "/data/latest" => latest_or_empty(ctx, LATEST_READING_KEY),
        "/forecast/latest" => latest_or_empty(ctx, LATEST_FORECAST_KEY),
        "/data/history" => match ctx.history.all() {
            Ok(readings) => match serde_json::to_value(readings) {
                Ok(v) => Response::json(&v),
                Err(e) => Response::text("500 Internal Server Error", &e.to_string()),
            },
            Err(e) => Response::text("503 Service Unavailable", &e.to_string()),
        },
        "/metrics.json" => {
            let snap = lock_metrics(&ctx.metrics).snapshot();
            match serde_json::to_value(snap) {
                Ok(v) => Response::json(&v),
                Err(e) => Response::text("500 Internal Server Error", &e.to_string()),
            }
        }
        "/dashboard.svg" => {
            let svg = svg_cache.read().map(|s| s.clone()).unwrap_or_default();
            if svg.is_empty() {
                Response::text("503 Service Unavailable", "Dashboard not ready")
            } else {
                Response {
                    status: "200 OK",
                    content_type: "image/svg+xml",
                    body: svg,
                }
            }
        }
        _ => Response::text("404 Not Found", "not found"),
    }
}

/// Latest value for `key`, or `{}` when nothing was written yet.
fn latest_or_empty(ctx: &DashboardContext, key: &str) -> Response {
    match ctx.latest.read(key) {
        Ok(Some(v)) => Response::json(&v),
        Ok(None) => Response::json(&json!({})),
        Err(e) => {
            warn!("latest store read failed for `{}`: {}", key, e);
            Response::text("503 Service Unavailable", &e.to_string())
        }
    }
}

fn stream_events(
    mut stream: TcpStream,
    mut rx: broadcast::Receiver<LiveEvent>,
    running: &AtomicBool,
) -> io::Result<()> {
    stream.write_all(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: keep-alive\r\n\r\n",
    )?;
    stream.flush()?;

    let mut idle = Duration::ZERO;
    while running.load(Ordering::Relaxed) {
        match rx.try_recv() {
            Ok(event) => {
                idle = Duration::ZERO;
                let data = match event.data_json() {
                    Ok(d) => d,
                    Err(e) => {
                        warn!("live event not serializable: {}", e);
                        continue;
                    }
                };
                write!(stream, "event: {}\ndata: {}\n\n", event.name(), data)?;
                stream.flush()?;
            }
            Err(TryRecvError::Empty) => {
                thread::sleep(Duration::from_millis(EVENT_POLL_MS));
                idle += Duration::from_millis(EVENT_POLL_MS);
                if idle >= EVENT_HEARTBEAT {
                    idle = Duration::ZERO;
                    stream.write_all(b": keep-alive\n\n")?;
                    stream.flush()?;
                }
            }
            Err(TryRecvError::Lagged(n)) => debug!("event stream lagged, {} events skipped", n),
            Err(TryRecvError::Closed) => break,
        }
    }
    Ok(())
}

// ============================================================================
// SVG chart
// ============================================================================

/// 2x2 grid, one panel per feature: recent readings as a line, forecast as points.
/// X axis is minutes relative to the newest reading.
pub fn render_svg(ctx: &DashboardContext) -> String {
    let tail = ctx.history.tail(CHART_POINTS).unwrap_or_default();
    let forecast: Option<ForecastBatch> = ctx
        .latest
        .read(LATEST_FORECAST_KEY)
        .ok()
        .flatten()
        .and_then(|v| serde_json::from_value(v).ok());

    let mut svg = String::new();
    {
        let root = SVGBackend::with_string(&mut svg, (1280, 800)).into_drawing_area();
        root.fill(&WHITE).ok();
        let areas = root.split_evenly((2, 2));
        let panels = [
            (Feature::Temperature, "Temperature (°C)"),
            (Feature::Humidity, "Humidity (%)"),
            (Feature::AirPressure, "Air pressure (mbar)"),
            (Feature::WindSpeed, "Wind speed (m/s)"),
        ];
        for (area, (feature, title)) in areas.iter().zip(panels) {
            if let Err(e) = plot_panel(area, title, feature, &tail, forecast.as_ref()) {
                debug!("panel `{}` not drawn: {:?}", title, e);
            }
        }
        root.present().ok();
    }
    svg
}

fn plot_panel(
    area: &DrawingArea<SVGBackend, Shift>,
    title: &str,
    feature: Feature,
    readings: &[Reading],
    forecast: Option<&ForecastBatch>,
) -> Result<(), DrawingAreaErrorKind<io::Error>> {
    let origin = readings.last().map(|r| r.timestamp).unwrap_or_else(Utc::now);
    let minutes = |ts: DateTime<Utc>| (ts - origin).num_seconds() as f64 / 60.0;

    let observed: Vec<(f64, f64)> = readings
        .iter()
        .map(|r| (minutes(r.timestamp), r.value(feature)))
        .collect();
    let predicted: Vec<(f64, f64)> = forecast
        .map(|b| {
            b.predictions
                .iter()
                .map(|p| (minutes(p.forecast_timestamp), forecast_value(p, feature)))
                .collect()
        })
        .unwrap_or_default();

    let all = observed.iter().chain(predicted.iter());
    let (min_x, max_x, min_y, max_y) = all.fold(
        (-60.0f64, 240.0f64, f64::INFINITY, f64::NEG_INFINITY),
        |(x0, x1, y0, y1), &(x, y)| (x0.min(x), x1.max(x), y0.min(y), y1.max(y)),
    );
    let (min_y, max_y) = if min_y.is_finite() {
        let pad = ((max_y - min_y) * 0.1).max(0.5);
        (min_y - pad, max_y + pad)
    } else {
        (0.0, 1.0)
    };

    let mut chart = ChartBuilder::on(area)
        .caption(title, ("sans-serif", 18))
        .margin(10)
        .x_label_area_size(25)
        .y_label_area_size(50)
        .build_cartesian_2d(min_x..max_x, min_y..max_y)?;
    chart
        .configure_mesh()
        .disable_mesh()
        .x_desc("minutes from latest reading")
        .draw()?;
    chart.draw_series(LineSeries::new(observed, &BLUE))?;
    chart.draw_series(
        predicted
            .into_iter()
            .map(|(x, y)| Circle::new((x, y), 4, RED.filled())),
    )?;
    Ok(())
}

fn forecast_value(record: &ForecastRecord, feature: Feature) -> f64 {
    match feature {
        Feature::Temperature => record.temperature,
        Feature::Humidity => record.humidity,
        Feature::AirPressure => record.air_pressure,
        Feature::WindSpeed => record.wind_speed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::{
        router::{Effect, PublicationRouter},
        sinks::{LiveBroadcast, MemoryHistoryLog, MemoryLatestStore},
    };
    use crate::utils::metrics::shared;
    use chrono::{TimeZone, Timelike};
    use std::io::Read;

    fn ctx() -> DashboardContext {
        DashboardContext {
            latest: Arc::new(MemoryLatestStore::new()),
            history: Arc::new(MemoryHistoryLog::new(100)),
            hub: SubscriberHub::new(),
            metrics: shared(),
        }
    }

    fn reading(minute: u32) -> Reading {
        Reading {
            timestamp: Utc.with_ymd_and_hms(2025, 3, 18, 10, minute, 0).unwrap(),
            temperature: 20.0,
            humidity: 60.0,
            air_pressure: 1012.0,
            wind_speed: 3.0,
        }
    }

    fn store(ctx: &DashboardContext, r: &Reading) {
        let value = serde_json::to_value(r).unwrap();
        ctx.latest.write(LATEST_READING_KEY, value).unwrap();
        ctx.history.append(r).unwrap();
    }

    #[test]
    fn latest_is_empty_object_before_any_reading() {
        let resp = route("/data/latest", &ctx(), &RwLock::new(String::new()));
        assert_eq!(resp.status, "200 OK");
        assert_eq!(resp.body, "{}");
    }

    #[test]
    fn latest_is_flat_reading() {
        let ctx = ctx();
        store(&ctx, &reading(0));
        let resp = route("/data/latest", &ctx, &RwLock::new(String::new()));
        let v: Value = serde_json::from_str(&resp.body).unwrap();
        assert_eq!(v["temperature"], 20.0);
        assert_eq!(v["timestamp"], "2025-03-18T10:00:00Z");
    }

    #[test]
    fn history_is_in_acceptance_order() {
        let ctx = ctx();
        for m in [10, 0, 20] {
            store(&ctx, &reading(m));
        }
        let resp = route("/data/history", &ctx, &RwLock::new(String::new()));
        let v: Vec<Reading> = serde_json::from_str(&resp.body).unwrap();
        let minutes: Vec<u32> = v.iter().map(|r| r.timestamp.minute()).collect();
        assert_eq!(minutes, vec![10, 0, 20]);
    }

    #[test]
    fn unknown_path_is_404_and_svg_waits_for_render() {
        let cache = RwLock::new(String::new());
        assert_eq!(route("/nope", &ctx(), &cache).status, "404 Not Found");
        assert_eq!(route("/dashboard.svg", &ctx(), &cache).status, "503 Service Unavailable");
    }

    #[test]
    fn metrics_route_serves_snapshot() {
        let ctx = ctx();
        lock_metrics(&ctx.metrics).readings_accepted = 5;
        let resp = route("/metrics.json", &ctx, &RwLock::new(String::new()));
        let v: Value = serde_json::from_str(&resp.body).unwrap();
        assert_eq!(v["readings_accepted"], 5);
    }

    #[test]
    fn chart_renders_with_history_and_forecast() {
        let ctx = ctx();
        for m in 0..30 {
            store(&ctx, &reading(m));
        }
        let base = reading(29).timestamp;
        let records = (1..=4)
            .map(|h| ForecastRecord {
                forecast_timestamp: base + chrono::Duration::hours(h),
                temperature: 21.0,
                humidity: 58.0,
                air_pressure: 1011.0,
                wind_speed: 3.5,
            })
            .collect();
        for effect in PublicationRouter::new("forecast/predictions").on_forecast(records) {
            if let Effect::SetLatest { key, value } = effect {
                ctx.latest.write(key, value).unwrap();
            }
        }
        let svg = render_svg(&ctx);
        assert!(svg.contains("<svg"));
        assert!(svg.contains("Temperature"));
    }

    #[test]
    fn serves_over_tcp_and_streams_events() {
        let ctx = ctx();
        let handle = start_dashboard("127.0.0.1:0".parse().unwrap(), ctx.clone()).unwrap();
        let addr = handle.local_addr();

        let mut conn = TcpStream::connect(addr).unwrap();
        conn.write_all(b"GET /data/latest HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
        let mut body = String::new();
        conn.read_to_string(&mut body).unwrap();
        assert!(body.starts_with("HTTP/1.1 200 OK"));
        assert!(body.ends_with("{}"));

        let events = TcpStream::connect(addr).unwrap();
        let mut writer = events.try_clone().unwrap();
        writer.write_all(b"GET /events HTTP/1.1\r\n\r\n").unwrap();
        let mut reader = BufReader::new(events);
        let mut line = String::new();
        // Status line and headers first; the subscription exists once they are sent.
        while reader.read_line(&mut line).unwrap() > 0 && line != "\r\n" {
            line.clear();
        }
        ctx.hub.broadcast(&LiveEvent::SensorUpdate(reading(0))).unwrap();
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "event: sensor_update\n");

        drop(reader);
        drop(writer);
        handle.stop();
    }

    #[test]
    fn stop_closes_idle_event_streams() {
        let ctx = ctx();
        let handle = start_dashboard("127.0.0.1:0".parse().unwrap(), ctx.clone()).unwrap();

        let events = TcpStream::connect(handle.local_addr()).unwrap();
        events.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut writer = events.try_clone().unwrap();
        writer.write_all(b"GET /events HTTP/1.1\r\n\r\n").unwrap();
        let mut reader = BufReader::new(events);
        let mut line = String::new();
        while reader.read_line(&mut line).unwrap() > 0 && line != "\r\n" {
            line.clear();
        }
        assert_eq!(ctx.hub.subscriber_count(), 1);

        handle.stop();

        line.clear();
        assert_eq!(reader.read_line(&mut line).unwrap(), 0);
        assert_eq!(ctx.hub.subscriber_count(), 0);
    }
}
