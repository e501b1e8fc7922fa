//! JSON control protocol: request parsing and response building.
//!
//! A request is a `{"watcher": [...]}` object whose elements each carry a
//! `cmd` string and parallel arrays. Scheduling commands hop to the RT
//! thread through the command pipe; monitoring, control and value writes
//! apply directly on the shared cells (word-sized relaxed stores, benign to
//! read mid-tick). A malformed element is skipped with a log line and the
//! rest of the request continues.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::hub::WatchHub;
use crate::logwriter::BinaryLogger;
use crate::pipe::{RtCommand, ToRtMsg};
use crate::var::VarShared;

/// Top-level control request.
#[derive(Deserialize)]
struct ControlRequest {
    #[serde(default)]
    watcher: Vec<CommandElement>,
}

/// One command element with its parallel arrays.
///
/// `timestamps` and `durations` may be shorter than `watchers`; missing
/// entries default to 0, meaning "now" for a start and "never" for a
/// duration. All numbers arrive as JSON numbers and are narrowed on apply.
#[derive(Deserialize)]
struct CommandElement {
    cmd: String,
    #[serde(default)]
    watchers: Vec<String>,
    #[serde(default)]
    periods: Vec<f64>,
    #[serde(default)]
    timestamps: Vec<f64>,
    #[serde(default)]
    durations: Vec<f64>,
    #[serde(default)]
    values: Vec<f64>,
    #[serde(default)]
    masks: Vec<f64>,
}

impl CommandElement {
    fn timestamp(&self, n: usize) -> u64 {
        self.timestamps.get(n).copied().unwrap_or(0.0) as u64
    }

    fn duration(&self, n: usize) -> u64 {
        self.durations.get(n).copied().unwrap_or(0.0) as u64
    }
}

/// One entry of the list response.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WatcherEntry {
    name: String,
    watched: bool,
    controlled: bool,
    logged: bool,
    monitor: u32,
    log_file_name: String,
    value: f64,
    value_input: f64,
    #[serde(rename = "type")]
    kind: &'static str,
    timestamp_mode: u8,
}

impl WatcherEntry {
    fn from_shared(shared: &VarShared) -> Self {
        Self {
            name: shared.name().to_string(),
            watched: shared.is_watched(),
            controlled: shared.is_controlled(),
            logged: shared.is_logged(),
            monitor: shared.monitor_period(),
            log_file_name: shared.log_file_name(),
            value: shared.value_f64(),
            value_input: shared.local_value_f64(),
            kind: shared.kind().code(),
            timestamp_mode: shared.mode().as_u8(),
        }
    }
}

/// Body of the list response, wrapped under the top-level `"watcher"` key.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListBody {
    watchers: Vec<WatcherEntry>,
    sample_rate: f32,
    timestamp: u64,
}

/// Parses and applies one control request.
pub(crate) fn handle_request(hub: &WatchHub, text: &str) {
    let request: ControlRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            log::warn!("[Control] unparseable request: {e}");
            return;
        }
    };

    for element in &request.watcher {
        match element.cmd.as_str() {
            "list" => send_list(hub),
            "watch" | "unwatch" | "log" | "unlog" => schedule(hub, element),
            "monitor" => apply_monitor(hub, element),
            "control" => apply_control(hub, element, true),
            "uncontrol" => apply_control(hub, element, false),
            "set" => apply_set(hub, element, false),
            "setMask" => apply_set(hub, element, true),
            other => log::warn!("[Control] unhandled command '{other}'"),
        }
    }
}

fn send_list(hub: &WatchHub) {
    let watchers = hub
        .snapshot()
        .iter()
        .filter(|shared| shared.is_alive())
        .map(|shared| WatcherEntry::from_shared(shared))
        .collect();
    let body = ListBody {
        watchers,
        sample_rate: hub.sample_rate(),
        timestamp: hub.clock(),
    };
    match serde_json::to_value(&body) {
        Ok(body) => hub.transport().send_control(json!({ "watcher": body })),
        Err(e) => log::error!("[Control] serializing list response: {e}"),
    }
}

/// Builds and publishes one batch of scheduling commands.
fn schedule(hub: &WatchHub, element: &CommandElement) {
    let mut batch = Vec::with_capacity(element.watchers.len());

    for (n, name) in element.watchers.iter().enumerate() {
        let Some((handle, shared)) = hub.find(name) else {
            log::warn!("[Control] {}: unknown variable '{name}'", element.cmd);
            continue;
        };
        let start = element.timestamp(n);
        let duration = element.duration(n);

        let cmd = match element.cmd.as_str() {
            "watch" => RtCommand::StartWatching { start, duration },
            "unwatch" => RtCommand::StopWatching { end: start },
            "log" => {
                if shared.is_logged() {
                    // Already in a streaming log state; the command is
                    // ignored rather than restarted.
                    continue;
                }
                // A stale writer from an armed-but-unopened session is
                // superseded by the new file.
                if let Some(old) = shared.take_logger() {
                    if let Err(e) = old.close() {
                        log::error!("[Control] closing stale log for '{name}': {e}");
                    }
                }
                match BinaryLogger::create(
                    hub.log_dir(),
                    name,
                    shared.kind(),
                    hub.manager_id(),
                ) {
                    Ok(logger) => {
                        shared.set_logger(Arc::clone(&logger));
                        RtCommand::StartLogging {
                            start,
                            duration,
                            logger,
                        }
                    }
                    Err(e) => {
                        log::error!("[Control] opening log for '{name}' failed: {e}");
                        continue;
                    }
                }
            }
            "unlog" => RtCommand::StopLogging { end: start },
            _ => unreachable!("schedule() only sees scheduling commands"),
        };
        batch.push(ToRtMsg { handle, cmd });
    }

    hub.commands().publish(batch);
}

fn apply_monitor(hub: &WatchHub, element: &CommandElement) {
    for (n, name) in element.watchers.iter().enumerate() {
        let Some((_, shared)) = hub.find(name) else {
            log::warn!("[Control] monitor: unknown variable '{name}'");
            continue;
        };
        let Some(period) = element.periods.get(n) else {
            log::error!(
                "[Control] monitor with not enough periods: {} instead of {}",
                element.periods.len(),
                element.watchers.len()
            );
            break;
        };
        shared.set_monitor_period(*period as u32);
    }
}

fn apply_control(hub: &WatchHub, element: &CommandElement, controlled: bool) {
    for name in &element.watchers {
        let Some((_, shared)) = hub.find(name) else {
            log::warn!("[Control] {}: unknown variable '{name}'", element.cmd);
            continue;
        };
        if controlled {
            shared.start_controlling();
        } else {
            shared.stop_controlling();
        }
    }
}

fn apply_set(hub: &WatchHub, element: &CommandElement, masked: bool) {
    // Mismatched arrays invalidate this element only; the rest of the
    // request continues.
    if element.watchers.len() != element.values.len() {
        log::error!(
            "[Control] {}: incompatible sizes of watchers ({}) and values ({})",
            element.cmd,
            element.watchers.len(),
            element.values.len()
        );
        return;
    }

    for (n, name) in element.watchers.iter().enumerate() {
        let Some((_, shared)) = hub.find(name) else {
            log::warn!("[Control] {}: unknown variable '{name}'", element.cmd);
            continue;
        };
        let value = element.values[n];
        if masked {
            let Some(mask) = element.masks.get(n) else {
                log::error!("[Control] setMask with not enough masks");
                break;
            };
            if let Err(e) = shared.set_remote_masked(value, *mask as u32) {
                log::warn!("[Control] setMask on '{name}': {e}");
            }
        } else {
            shared.set_remote(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingTransport;
    use crate::value::TimestampMode;
    use crate::var::Watched;
    use crate::watcher::{Watcher, WatcherConfig};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn rig() -> (Watcher, Arc<crate::hub::WatchHub>, Arc<RecordingTransport>, TempDir) {
        let dir = TempDir::new().unwrap();
        let (mut watcher, hub) = Watcher::new(WatcherConfig {
            log_dir: dir.path().to_path_buf(),
            ..WatcherConfig::default()
        });
        let transport = Arc::new(RecordingTransport::connected());
        watcher.bind_transport(transport.clone());
        (watcher, hub, transport, dir)
    }

    #[test]
    fn list_reports_the_full_registry_snapshot() {
        let (mut watcher, hub, transport, _dir) = rig();
        let _a: Watched<f32> = watcher.register("osc", TimestampMode::Block).unwrap();
        let b: Watched<u32> = watcher.register("count", TimestampMode::Sample).unwrap();
        b.shared().set_monitor_period(5);
        watcher.tick(77);

        hub.handle_control(r#"{"watcher":[{"cmd":"list"}]}"#);

        let controls = transport.controls.lock();
        let body = &controls[0]["watcher"];
        assert_eq!(body["sampleRate"], 44100.0);
        assert_eq!(body["timestamp"], 77);

        let watchers = body["watchers"].as_array().unwrap();
        assert_eq!(watchers.len(), 2);
        assert_eq!(watchers[0]["name"], "osc");
        assert_eq!(watchers[0]["type"], "f");
        assert_eq!(watchers[0]["timestampMode"], 0);
        assert_eq!(watchers[0]["watched"], false);
        assert_eq!(watchers[0]["logFileName"], "");
        assert_eq!(watchers[1]["name"], "count");
        assert_eq!(watchers[1]["type"], "j");
        assert_eq!(watchers[1]["timestampMode"], 1);
        assert_eq!(watchers[1]["monitor"], 5);

        hub.shutdown();
    }

    #[test]
    fn unknown_variables_are_skipped_not_fatal() {
        let (mut watcher, hub, transport, _dir) = rig();
        let mut v: Watched<f32> = watcher.register("real", TimestampMode::Block).unwrap();

        hub.handle_control(
            r#"{"watcher":[{"cmd":"watch","watchers":["ghost","real"],"timestamps":[0,0]}]}"#,
        );
        watcher.tick(0);
        v.set(&mut watcher, 1.0);

        // The element continued past the unknown name and armed 'real'
        assert!(v.shared().is_watched());
        assert!(transport.controls.lock().is_empty());

        hub.shutdown();
    }

    #[test]
    fn monitor_with_short_periods_aborts_the_element() {
        let (mut watcher, hub, _transport, _dir) = rig();
        let a: Watched<f32> = watcher.register("a", TimestampMode::Block).unwrap();
        let b: Watched<f32> = watcher.register("b", TimestampMode::Block).unwrap();

        hub.handle_control(
            r#"{"watcher":[{"cmd":"monitor","watchers":["a","b"],"periods":[4]}]}"#,
        );

        assert_eq!(a.shared().monitor_period(), 4);
        // The element aborted before reaching 'b'
        assert_eq!(b.shared().monitor_period(), 0);

        hub.shutdown();
    }

    #[test]
    fn set_with_mismatched_sizes_skips_the_element() {
        let (mut watcher, hub, _transport, _dir) = rig();
        let v: Watched<i32> = watcher.register("v", TimestampMode::Block).unwrap();
        v.shared().set_local_control(false);

        hub.handle_control(
            r#"{"watcher":[
                {"cmd":"set","watchers":["v"],"values":[1,2]},
                {"cmd":"set","watchers":["v"],"values":[9]}
            ]}"#,
        );

        // First element was malformed and skipped; the second applied
        assert_eq!(v.shared().value_f64(), 9.0);

        hub.shutdown();
    }

    #[test]
    fn set_mask_applies_only_to_integer_kinds() {
        let (mut watcher, hub, _transport, _dir) = rig();
        let i: Watched<u32> = watcher.register("i", TimestampMode::Block).unwrap();
        let f: Watched<f32> = watcher.register("f", TimestampMode::Block).unwrap();
        i.shared().set_local_control(false);
        f.shared().set_local_control(false);
        i.shared().set_remote(0xf0 as f64);

        hub.handle_control(
            r#"{"watcher":[{"cmd":"setMask","watchers":["i","f"],"values":[10,1.5],"masks":[15,15]}]}"#,
        );

        assert_eq!(i.shared().value_f64(), 0xfa as f64);
        // Float variable rejected, value untouched
        assert_eq!(f.shared().value_f64(), 0.0);

        hub.shutdown();
    }

    #[test]
    fn log_command_creates_the_file_before_the_rt_hop() {
        let (mut watcher, hub, _transport, dir) = rig();
        let mut v: Watched<f64> = watcher.register("trace", TimestampMode::Block).unwrap();

        hub.handle_control(
            r#"{"watcher":[{"cmd":"log","watchers":["trace"],"timestamps":[0],"durations":[0]}]}"#,
        );

        // File and header exist before any tick drained the command
        let bytes = std::fs::read(dir.path().join("trace.bin"));
        assert!(bytes.is_ok());
        assert_eq!(v.shared().log_file_name(), "trace.bin");

        // Once the window is open, a second log command is ignored
        watcher.tick(0);
        v.set(&mut watcher, 1.0);
        assert!(v.shared().is_logged());
        hub.handle_control(
            r#"{"watcher":[{"cmd":"log","watchers":["trace"],"timestamps":[0],"durations":[0]}]}"#,
        );
        assert!(!dir.path().join("trace_0001.bin").exists());

        hub.shutdown();
    }

    #[test]
    fn malformed_json_is_dropped() {
        let (_watcher, hub, transport, _dir) = rig();
        hub.handle_control("{not json");
        assert!(transport.controls.lock().is_empty());
        hub.shutdown();
    }
}
