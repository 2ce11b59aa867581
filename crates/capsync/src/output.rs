//! Terminal rendering for device status, command reports and port lists.

use std::io::{self, IsTerminal};

use chrono::Local;
use owo_colors::OwoColorize;
use tabled::{Table, Tabled, settings::Style};

use capsync_core::{
    ConnectionState, DeviceId, DeviceStatus, SensorAck, SessionReport, WifiState,
};
use capsync_link::PortSummary;

use crate::cli::ColorMode;

// ── Color helpers ────────────────────────────────────────────────────

/// Determine whether color output should be enabled.
pub fn should_color(mode: ColorMode) -> bool {
    match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => io::stdout().is_terminal() && std::env::var("NO_COLOR").is_err(),
    }
}

fn paint_connection(state: ConnectionState, color: bool) -> String {
    let text = state.to_string();
    if !color {
        return text;
    }
    match state {
        ConnectionState::Ready => text.green().to_string(),
        ConnectionState::Recording => text.bright_green().bold().to_string(),
        ConnectionState::Open | ConnectionState::Provisioning => text.yellow().to_string(),
        ConnectionState::Failed => text.red().bold().to_string(),
        ConnectionState::Closed => text.dimmed().to_string(),
    }
}

fn paint_wifi(state: Option<WifiState>, color: bool) -> String {
    let Some(state) = state else {
        return "-".into();
    };
    let text = state.to_string();
    if !color {
        return text;
    }
    match state {
        WifiState::Connected => text.green().to_string(),
        WifiState::Disconnected => text.red().to_string(),
        _ => text.yellow().to_string(),
    }
}

// ── Tables ───────────────────────────────────────────────────────────

/// Render rows as a rounded table.
pub fn render_table<R: Tabled>(rows: &[R]) -> String {
    Table::new(rows).with(Style::rounded()).to_string()
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "Device")]
    device: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "WiFi")]
    wifi: String,
    #[tabled(rename = "Network")]
    network: String,
    #[tabled(rename = "Echo")]
    echo: String,
    #[tabled(rename = "Message")]
    message: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl StatusRow {
    fn new(id: &DeviceId, status: &DeviceStatus, color: bool) -> Self {
        let message = status
            .last_error
            .as_deref()
            .or(status.last_message.as_deref())
            .unwrap_or_default()
            .to_owned();
        Self {
            device: id.to_string(),
            kind: status.kind.to_string(),
            state: paint_connection(status.connection, color),
            wifi: paint_wifi(status.wifi, color),
            network: status.assigned_network.clone().unwrap_or_else(|| "-".into()),
            echo: status
                .last_command_echo
                .map_or_else(|| "-".into(), |e| e.to_string()),
            message,
            updated: status
                .updated_at
                .with_timezone(&Local)
                .format("%H:%M:%S")
                .to_string(),
        }
    }
}

/// Device status table followed by the current network claims.
pub fn render_status(
    devices: &[(DeviceId, DeviceStatus)],
    claims: &[(String, DeviceId)],
    color: bool,
) -> String {
    if devices.is_empty() {
        return "No devices.".into();
    }
    let rows: Vec<StatusRow> = devices
        .iter()
        .map(|(id, status)| StatusRow::new(id, status, color))
        .collect();
    let mut out = render_table(&rows);
    if !claims.is_empty() {
        out.push_str("\nClaimed networks:");
        for (network, device) in claims {
            out.push_str(&format!("\n  {network} -> {device}"));
        }
    }
    out
}

#[derive(Tabled)]
struct PortRow {
    #[tabled(rename = "Port")]
    name: String,
    #[tabled(rename = "Type")]
    kind: String,
}

pub fn render_ports(ports: &[PortSummary]) -> String {
    if ports.is_empty() {
        return "No serial ports found.".into();
    }
    let rows: Vec<PortRow> = ports
        .iter()
        .map(|p| PortRow {
            name: p.name.clone(),
            kind: p.kind.clone(),
        })
        .collect();
    render_table(&rows)
}

// ── Command reports ──────────────────────────────────────────────────

/// Summary line plus one line per device that needs attention.
pub fn render_report(report: &SessionReport, color: bool) -> String {
    let failed = report.failures();
    let mut summary = format!(
        "{}: {} acknowledged, {} skipped, {} failed",
        report.command,
        report.acknowledged.len(),
        report.skipped.len(),
        failed
    );
    if color {
        summary = if failed == 0 {
            summary.green().bold().to_string()
        } else {
            summary.red().bold().to_string()
        };
    }

    let mut lines = vec![summary];

    for (device, err) in report.serial.failures() {
        lines.push(format!("  {device}: {err}"));
    }
    for device in report.serial.delivered() {
        if !report.acknowledged.contains(&device) {
            lines.push(format!("  {device}: no echo"));
        }
    }
    for device in &report.skipped {
        lines.push(format!("  {device}: skipped, not ready"));
    }
    for sensor in &report.sensors {
        match &sensor.result {
            Ok(SensorAck::Recording { capture }) => {
                lines.push(format!("  {}: capturing to {}", sensor.id, capture.display()));
            }
            Ok(SensorAck::Stopped { frames }) => {
                lines.push(format!("  {}: stopped after {frames} frame(s)", sensor.id));
            }
            Err(err) => lines.push(format!("  {}: {err}", sensor.id)),
        }
    }
    lines.join("\n")
}
