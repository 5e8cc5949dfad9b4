use serde_yaml_ng::Value;

use crate::{ProviderError, Result};

fn invalid(message: impl Into<String>) -> ProviderError {
    ProviderError::InvalidPlaybook(message.into())
}

fn non_empty_sequence(value: Option<&Value>) -> bool {
    value
        .and_then(Value::as_sequence)
        .is_some_and(|items| !items.is_empty())
}

/// Check the structural shape of a playbook without running it.
///
/// A playbook must be a non-empty list of plays; each play must be a mapping that names a
/// `hosts` target and has at least one entry under `tasks` or `roles`.
pub fn validate_playbook(yaml: &str) -> Result<()> {
    let document: Value =
        serde_yaml_ng::from_str(yaml).map_err(|e| invalid(format!("YAML parse error: {}", e)))?;

    let plays = document
        .as_sequence()
        .ok_or_else(|| invalid("playbook must be a list of plays"))?;
    if plays.is_empty() {
        return Err(invalid("playbook contains no plays"));
    }

    for (index, play) in plays.iter().enumerate() {
        let number = index + 1;
        if play.as_mapping().is_none() {
            return Err(invalid(format!("play {} is not a mapping", number)));
        }

        let hosts_named = match play.get("hosts") {
            Some(Value::String(hosts)) => !hosts.trim().is_empty(),
            Some(Value::Sequence(hosts)) => !hosts.is_empty(),
            _ => false,
        };
        if !hosts_named {
            return Err(invalid(format!("play {} has no 'hosts'", number)));
        }

        if !non_empty_sequence(play.get("tasks")) && !non_empty_sequence(play.get("roles")) {
            return Err(invalid(format!(
                "play {} has no 'tasks' or 'roles'",
                number
            )));
        }
    }

    Ok(())
}
