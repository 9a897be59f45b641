//! # Outbound actions.
//!
//! Every instruction the server sends to the browser is one [`Action`] variant.
//! On the wire an action is its `name()` and a JSON array `arg()`; the payload
//! (rendered HTML for door patches) travels separately.
//!
//! | Action              | arg                         |
//! |---------------------|-----------------------------|
//! | `location_reload`   | `[]`                        |
//! | `location_replace`  | `[url, origin]`             |
//! | `location_assign`   | `[url, origin]`             |
//! | `scroll`            | `[selector, smooth]`        |
//! | `emit`              | `[name, arg, door_id]`      |
//! | `dyna_set`          | `[id, value]`               |
//! | `dyna_remove`       | `[id]`                      |
//! | `set_path`          | `[path, replace]`           |
//! | `door_replace`      | `[id]`                      |
//! | `door_update`       | `[id]`                      |
//! | `indicate`          | `[duration_ms, indicate]`   |
//! | `report_hook`       | `[hook_id]`                 |
//! | `touch`             | `[]`                        |
//! | `test`              | `[arg]`                     |

use std::time::Duration;

use serde_json::{Value, json};

/// Instruction for the browser.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Reloads the page.
    LocationReload,
    /// Replaces the current history entry with `url`.
    LocationReplace { url: String, origin: bool },
    /// Navigates to `url`.
    LocationAssign { url: String, origin: bool },
    /// Scrolls the first element matching `selector` into view.
    Scroll { selector: String, smooth: bool },
    /// Dispatches a custom event from the element of `door_id`.
    Emit { name: String, arg: Value, door_id: u64 },
    /// Sets a dynamic attribute value.
    DynaSet { id: u64, value: String },
    /// Removes a dynamic attribute.
    DynaRemove { id: u64 },
    /// Rewrites the location without navigating.
    SetPath { path: String, replace: bool },
    /// Replaces the element of door `id` with the payload.
    DoorReplace { id: u64 },
    /// Replaces the children of door `id` with the payload.
    DoorUpdate { id: u64 },
    /// Applies loading indication for `duration`. `indicate` is opaque to the server.
    Indicate { duration: Duration, indicate: Value },
    /// Tells the browser that tracked hook request `hook_id` was processed.
    ReportHook { hook_id: u64 },
    /// No-op that provokes a report.
    Touch,
    /// Diagnostic action with an arbitrary argument.
    Test { arg: Value },
}

impl Action {
    /// Wire name.
    ///
    /// # Example
    /// ```
    /// use doorframe::Action;
    ///
    /// assert_eq!(Action::DoorUpdate { id: 3 }.name(), "door_update");
    /// assert_eq!(Action::DoorUpdate { id: 3 }.arg(), serde_json::json!([3]));
    /// ```
    pub fn name(&self) -> &'static str {
        match self {
            Action::LocationReload => "location_reload",
            Action::LocationReplace { .. } => "location_replace",
            Action::LocationAssign { .. } => "location_assign",
            Action::Scroll { .. } => "scroll",
            Action::Emit { .. } => "emit",
            Action::DynaSet { .. } => "dyna_set",
            Action::DynaRemove { .. } => "dyna_remove",
            Action::SetPath { .. } => "set_path",
            Action::DoorReplace { .. } => "door_replace",
            Action::DoorUpdate { .. } => "door_update",
            Action::Indicate { .. } => "indicate",
            Action::ReportHook { .. } => "report_hook",
            Action::Touch => "touch",
            Action::Test { .. } => "test",
        }
    }

    /// Wire argument, always a JSON array.
    pub fn arg(&self) -> Value {
        match self {
            Action::LocationReload | Action::Touch => json!([]),
            Action::LocationReplace { url, origin } | Action::LocationAssign { url, origin } => {
                json!([url, origin])
            }
            Action::Scroll { selector, smooth } => json!([selector, smooth]),
            Action::Emit { name, arg, door_id } => json!([name, arg, door_id]),
            Action::DynaSet { id, value } => json!([id, value]),
            Action::DynaRemove { id } => json!([id]),
            Action::SetPath { path, replace } => json!([path, replace]),
            Action::DoorReplace { id } | Action::DoorUpdate { id } => json!([id]),
            Action::Indicate { duration, indicate } => {
                let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
                json!([ms, indicate])
            }
            Action::ReportHook { hook_id } => json!([hook_id]),
            Action::Test { arg } => json!([arg]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args() {
        let cases = [
            (Action::LocationReload, "location_reload", json!([])),
            (
                Action::LocationAssign {
                    url: "/a".into(),
                    origin: true,
                },
                "location_assign",
                json!(["/a", true]),
            ),
            (
                Action::Emit {
                    name: "saved".into(),
                    arg: json!({"ok": 1}),
                    door_id: 9,
                },
                "emit",
                json!(["saved", {"ok": 1}, 9]),
            ),
            (
                Action::Indicate {
                    duration: Duration::from_millis(1500),
                    indicate: json!(["spin"]),
                },
                "indicate",
                json!([1500, ["spin"]]),
            ),
            (Action::ReportHook { hook_id: 4 }, "report_hook", json!([4])),
            (Action::Touch, "touch", json!([])),
        ];
        for (action, name, arg) in cases {
            assert_eq!(action.name(), name);
            assert_eq!(action.arg(), arg);
        }
    }
}
