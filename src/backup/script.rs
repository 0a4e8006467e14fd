//! Destination settings produced by external configuration scripts.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::process::Command;

use crate::error::AppError;
use crate::models::backup::BackupSettings;

/// Resolve destination settings, running the configured script if there is one.
///
/// The script's stdout must be a JSON object, which is merged over the static settings. A
/// timeout or a non-zero exit code fails with `ScriptFailure`.
#[tracing::instrument(level = "debug", skip(settings))]
pub async fn get_backup_configuration_from_script<T>(settings: Option<T>) -> Result<Option<T>>
where
    T: BackupSettings + Serialize + DeserializeOwned,
{
    let settings = match settings {
        Some(settings) => settings,
        None => return Ok(None),
    };
    let script = match settings.script() {
        Some(script) if !settings.disabled() && !script.exec.is_empty() => script.clone(),
        _ => return Ok(Some(settings)),
    };
    let command_line = format!("{} {}", script.exec, script.arguments.join(" "));
    let timeout = Duration::from_millis(script.timeout_in_ms);

    let child = Command::new(&script.exec)
        .args(&script.arguments)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| {
            AppError::ScriptFailure(format!(
                "Unable to get backup configuration by executing {}. Failed to start process: {}",
                command_line, err
            ))
        })?;
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output.with_context(|| format!("error reading output of {}", command_line))?,
        Err(_) => {
            return Err(AppError::ScriptFailure(format!(
                "Unable to get backup configuration by executing {}, waited for {}ms but the process didn't exit.",
                command_line, script.timeout_in_ms
            ))
            .into())
        }
    };
    if !output.status.success() {
        let code = output.status.code().map(|code| code.to_string()).unwrap_or_else(|| "unknown".into());
        return Err(AppError::ScriptFailure(format!(
            "Unable to get backup configuration by executing {}, the exit code was {}. Stderr: {}",
            command_line,
            code,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
        .into());
    }

    let overrides: serde_json::Value = serde_json::from_slice(&output.stdout).map_err(|err| {
        AppError::ScriptFailure(format!("the output of {} is not valid JSON: {}", command_line, err))
    })?;
    let overrides = match overrides {
        serde_json::Value::Object(overrides) => overrides,
        _ => {
            return Err(AppError::ScriptFailure(format!("the output of {} must be a JSON object", command_line)).into());
        }
    };
    let mut merged = match serde_json::to_value(&settings).context("error serializing backup settings")? {
        serde_json::Value::Object(merged) => merged,
        _ => serde_json::Map::new(),
    };
    merged.extend(overrides);
    let resolved = serde_json::from_value(serde_json::Value::Object(merged))
        .map_err(|err| AppError::ScriptFailure(format!("the output of {} is not valid settings: {}", command_line, err)))?;
    tracing::debug!(command = %command_line, "resolved backup settings from script");
    Ok(Some(resolved))
}
