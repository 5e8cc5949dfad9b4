use lab_core::{run_captured, CommandSpec};
use tracing::{debug, warn};

use crate::{DeploymentLogSink, LogCategory, ProviderError, Result};

/// Run an external command off the async runtime and record it as one log record.
///
/// The record holds the full command line and the combined output verbatim. A non-zero exit
/// becomes `CommandFailed` carrying that same output. Returns the output on success.
pub(crate) async fn run_logged(
    spec: CommandSpec,
    lab_id: &str,
    category: LogCategory,
    log: &dyn DeploymentLogSink,
) -> Result<String> {
    let command_line = spec.command_line();
    debug!(lab_id, command = %command_line, "Invoking external tool");

    let result = tokio::task::spawn_blocking(move || run_captured(&spec)).await?;

    match result {
        Ok(output) => {
            log.append(
                lab_id,
                category,
                &format!("Command: {}\n{}", output.command_line, output.output),
            )
            .await?;

            if output.success() {
                Ok(output.output)
            } else {
                warn!(lab_id, command = %command_line, exit_code = ?output.exit_code, "External tool failed");
                Err(ProviderError::CommandFailed {
                    command: output.command_line,
                    exit_code: output.exit_code,
                    output: output.output,
                })
            }
        }
        Err(e) => {
            let err = ProviderError::from(e);
            warn!(lab_id, command = %command_line, error = %err, "External tool did not complete");
            log.append(
                lab_id,
                category,
                &format!("Command: {}\nERROR: {}", command_line, err),
            )
            .await?;
            Err(err)
        }
    }
}
