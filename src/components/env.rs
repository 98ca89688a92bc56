use serde::Serialize;
use serde_json::{json, Value};

use super::Remote;
use crate::mode::Call;

/// Persistent key/value settings stored on the robot.
///
/// Every call resolves before returning, whatever the connection's mode.
pub struct Env {
    remote: Remote,
}

impl Env {
    pub(crate) fn new(remote: Remote) -> Self {
        Self { remote }
    }

    /// Value of `name`, `Value::Null` if unset.
    pub fn get(&self, name: &str) -> Call<Value> {
        self.remote.query("get_env", json!([name])).sync()
    }

    pub fn set<T: Serialize>(&self, name: &str, value: T) -> Call<()> {
        let transport = self.remote.transport.clone();
        let name = name.to_string();
        let value = serde_json::to_value(value);
        Call::sync_command(&self.remote.adapter, async move {
            let value = value?;
            transport
                .unary_call("set_env", json!([name, value]))
                .await
                .map(|_| ())
        })
    }

    pub fn remove(&self, name: &str) -> Call<()> {
        self.remote.command("del_env", json!([name])).sync()
    }

    /// Persist the current settings across reboots.
    pub fn save(&self) -> Call<()> {
        self.remote.command("save_env", json!([])).sync()
    }
}
