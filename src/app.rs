//! Call window: egui/eframe application.
//!
//! # Architecture
//!
//! [`CallApp`] is the top-level [`eframe::App`].  It never touches the call
//! machinery directly:
//!
//! * `status`: [`SharedStatus`] written by the call controller, cloned
//!   once per frame for rendering.
//! * `command_tx`: sends [`CallCommand`]s to the controller task.
//!
//! # Layout
//!
//! | Row | Content |
//! |-----|---------|
//! | Title bar | state icon, draggable title, close / minimise |
//! | Identity | connection state, own peer id (copyable) |
//! | Call | remote peer id field, Call / Hang up, Mute |
//! | Footer | last error, frame counters |
//!
//! Auth, device and lost-connection failures open a modal alert that stays
//! until dismissed.

use std::time::Duration;

use eframe::egui;
use tokio::sync::mpsc;

use crate::call::{lock_status, CallCommand, CallState, CallStatus, SharedStatus};
use crate::config::AppConfig;

// ---------------------------------------------------------------------------
// CallApp
// ---------------------------------------------------------------------------

pub struct CallApp {
    status: SharedStatus,
    command_tx: mpsc::Sender<CallCommand>,
    /// Contents of the remote peer id field.
    remote_input: String,
    show_stats: bool,
    config: AppConfig,
}

impl CallApp {
    pub fn new(status: SharedStatus, command_tx: mpsc::Sender<CallCommand>, config: AppConfig) -> Self {
        Self {
            status,
            command_tx,
            remote_input: String::new(),
            show_stats: false,
            config,
        }
    }

    fn send(&self, command: CallCommand) {
        if let Err(e) = self.command_tx.try_send(command) {
            log::warn!("ui: dropped command: {e}");
        }
    }

    // ── Title bar ────────────────────────────────────────────────────────

    fn draw_title_bar(&mut self, ui: &mut egui::Ui, ctx: &egui::Context, status: &CallStatus) {
        ui.horizontal(|ui| {
            ui.label(egui::RichText::new(state_icon(status.call)).color(state_color(status.call)));

            let title = ui.label(
                egui::RichText::new("Voice Call")
                    .color(egui::Color32::from_rgb(200, 200, 200))
                    .size(13.0),
            );
            if title.is_pointer_button_down_on() {
                if let Some(outer_rect) = ctx.input(|i| i.viewport().outer_rect) {
                    let delta = ctx.input(|i| i.pointer.delta());
                    ctx.send_viewport_cmd(egui::ViewportCommand::OuterPosition(
                        outer_rect.min + delta,
                    ));
                }
            }

            ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                if title_button(ui, "x", egui::Color32::from_rgb(200, 100, 100)) {
                    ctx.send_viewport_cmd(egui::ViewportCommand::Close);
                }
                if title_button(ui, "-", egui::Color32::from_rgb(150, 150, 150)) {
                    ctx.send_viewport_cmd(egui::ViewportCommand::Minimized(true));
                }
                if title_button(ui, "=", egui::Color32::from_rgb(150, 150, 150)) {
                    self.show_stats = !self.show_stats;
                }
            });
        });
    }

    // ── Panels ───────────────────────────────────────────────────────────

    fn draw_identity(&self, ui: &mut egui::Ui, status: &CallStatus) {
        ui.horizontal(|ui| {
            let color = if status.connection.is_open() {
                egui::Color32::from_rgb(80, 200, 120)
            } else {
                egui::Color32::from_rgb(255, 136, 68)
            };
            ui.label(egui::RichText::new(status.connection.label()).color(color).size(12.0));

            if !status.connection.is_open() && status.call == CallState::Idle {
                if ui.small_button("Reconnect").clicked() {
                    self.send(CallCommand::Connect);
                }
            }
        });

        ui.horizontal(|ui| {
            ui.label(
                egui::RichText::new("Your id:")
                    .color(egui::Color32::from_rgb(140, 140, 140))
                    .size(11.0),
            );
            let id = ui.add(
                egui::Label::new(
                    egui::RichText::new(status.local_peer.as_str())
                        .monospace()
                        .size(11.0),
                )
                .sense(egui::Sense::click()),
            );
            if id.on_hover_text("Click to copy").clicked() {
                ui.ctx().copy_text(status.local_peer.clone());
            }
        });
    }

    fn draw_call_controls(&mut self, ui: &mut egui::Ui, status: &CallStatus) {
        ui.add_space(4.0);
        let idle = status.call == CallState::Idle;

        let edited = ui
            .horizontal(|ui| {
                ui.add_enabled(
                    idle,
                    egui::TextEdit::singleline(&mut self.remote_input)
                        .hint_text("Peer id to call")
                        .desired_width(200.0),
                )
                .changed()
            })
            .inner;
        if edited {
            self.send(CallCommand::SetRemotePeer(self.remote_input.clone()));
        }

        ui.add_space(4.0);
        ui.horizontal(|ui| {
            if idle {
                let enabled = call_enabled(status, &self.remote_input);
                if ui.add_enabled(enabled, egui::Button::new("Call")).clicked() {
                    self.send(CallCommand::SetRemotePeer(self.remote_input.clone()));
                    self.send(CallCommand::StartCall);
                }
            } else if ui.button("Hang up").clicked() {
                self.send(CallCommand::Disconnect);
            }

            let mute_label = if status.muted { "Unmute" } else { "Mute" };
            let mute = ui.add(egui::Button::new(mute_label).selected(status.muted));
            let mute = if self.config.hotkey.enabled {
                mute.on_hover_text(format!("Hotkey: {}", self.config.hotkey.mute_key))
            } else {
                mute
            };
            if mute.clicked() {
                self.send(CallCommand::ToggleMute);
            }
        });

        ui.add_space(2.0);
        let line = match (&status.remote_peer, status.call) {
            (Some(peer), CallState::Starting) => format!("Calling {peer}…"),
            (Some(peer), CallState::InCall) => format!("In call with {peer}"),
            _ => status.call.label().to_string(),
        };
        ui.label(
            egui::RichText::new(line)
                .color(state_color(status.call))
                .size(12.0),
        );

        if let Some(err) = &status.last_error {
            ui.label(
                egui::RichText::new(err.as_str())
                    .color(egui::Color32::from_rgb(255, 136, 68))
                    .size(10.0),
            );
        }
    }

    fn draw_stats(&self, ui: &mut egui::Ui, status: &CallStatus) {
        let c = &status.counters;
        let rows = [
            ("captured", c.frames_produced),
            ("sent", c.frames_sent),
            ("muted", c.frames_muted),
            ("received", c.frames_decoded),
            ("undecodable", c.frames_dropped),
            ("from peer track", c.track_frames),
        ];
        ui.add_space(4.0);
        egui::Grid::new("frame-counters").num_columns(2).show(ui, |ui| {
            for (name, value) in rows {
                ui.label(
                    egui::RichText::new(name)
                        .color(egui::Color32::from_rgb(140, 140, 140))
                        .size(11.0),
                );
                ui.label(egui::RichText::new(value.to_string()).size(11.0));
                ui.end_row();
            }
        });
    }

    fn draw_alert(&self, ctx: &egui::Context, status: &CallStatus) {
        let Some(alert) = &status.alert else {
            return;
        };
        egui::Window::new(alert.title())
            .collapsible(false)
            .resizable(false)
            .anchor(egui::Align2::CENTER_CENTER, egui::vec2(0.0, 0.0))
            .show(ctx, |ui| {
                ui.label(alert.message.as_str());
                ui.add_space(6.0);
                if ui.button("OK").clicked() {
                    lock_status(&self.status).alert = None;
                }
            });
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// The Call button is live only when idle, connected and given a peer id.
fn call_enabled(status: &CallStatus, remote_input: &str) -> bool {
    status.can_start_call() && !remote_input.trim().is_empty()
}

fn title_button(ui: &mut egui::Ui, text: &str, color: egui::Color32) -> bool {
    ui.add(egui::Button::new(egui::RichText::new(text).color(color).size(12.0)).frame(false))
        .clicked()
}

fn state_icon(state: CallState) -> &'static str {
    match state {
        CallState::Idle => "  ",
        CallState::Starting => ". ",
        CallState::InCall => "* ",
        CallState::Disconnecting => "~ ",
    }
}

fn state_color(state: CallState) -> egui::Color32 {
    match state {
        CallState::Idle => egui::Color32::from_rgb(120, 120, 120),
        CallState::Starting | CallState::Disconnecting => egui::Color32::from_rgb(68, 136, 255),
        CallState::InCall => egui::Color32::from_rgb(80, 200, 120),
    }
}

// ---------------------------------------------------------------------------
// eframe::App impl
// ---------------------------------------------------------------------------

impl eframe::App for CallApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        // Snapshot so the lock is not held while drawing.
        let status = lock_status(&self.status).clone();

        // The controller updates status from another thread.
        ctx.request_repaint_after(Duration::from_millis(250));

        let frame = egui::Frame::new()
            .fill(egui::Color32::from_rgba_premultiplied(30, 30, 30, 235))
            .corner_radius(egui::CornerRadius::same(8))
            .inner_margin(egui::Margin::same(8));

        egui::CentralPanel::default().frame(frame).show(ctx, |ui| {
            self.draw_title_bar(ui, ctx, &status);
            ui.separator();
            self.draw_identity(ui, &status);
            ui.separator();
            self.draw_call_controls(ui, &status);
            if self.show_stats {
                ui.separator();
                self.draw_stats(ui, &status);
            }
        });

        self.draw_alert(ctx, &status);
    }

    fn on_exit(&mut self, _gl: Option<&eframe::glow::Context>) {
        log::info!("ui: window closing, hanging up");
        self.send(CallCommand::Disconnect);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
