//! Built-in recovery action kinds: `log` and `command`.

use std::sync::Arc;

use anyhow::Context;
use tokio::process::Command;
use tracing::{info, warn};

use vigil_core::config::KindSpec;
use vigil_core::MetaValue;
use vigil_recovery::{ActionContext, ActionHandler, ActionRegistry};

/// Register every built-in action kind.
pub fn register(registry: &mut ActionRegistry) {
    registry.register("log", log_action);
    registry.register("command", command_action);
}

/// Log `message` with the execution context. Always succeeds.
fn log_action(spec: &KindSpec) -> anyhow::Result<Arc<dyn ActionHandler>> {
    let message = spec
        .str_param("message")
        .unwrap_or("recovery action invoked")
        .to_string();

    Ok(Arc::new(move |ctx: ActionContext| {
        info!(
            rule = %ctx.rule,
            execution = %ctx.execution_id,
            trigger = %ctx.trigger,
            metadata = ?ctx.metadata,
            "{message}"
        );
        async { Ok::<_, anyhow::Error>(true) }
    }))
}

/// Run `program` with `args`. A non-zero exit fails the step.
///
/// The child is killed if the orchestrator abandons the call.
fn command_action(spec: &KindSpec) -> anyhow::Result<Arc<dyn ActionHandler>> {
    let program = spec
        .str_param("program")
        .context("command action requires `program`")?
        .to_string();
    let args = match spec.params.get("args") {
        None => Vec::new(),
        Some(value) => value
            .as_array()
            .context("`args` must be an array")?
            .iter()
            .map(|v| v.as_str().map(str::to_string).context("`args` must be strings"))
            .collect::<anyhow::Result<Vec<_>>>()?,
    };

    Ok(Arc::new(move |ctx: ActionContext| {
        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .env("VIGIL_RULE", &ctx.rule)
            .env("VIGIL_EXECUTION_ID", &ctx.execution_id)
            .env("VIGIL_TRIGGER", ctx.trigger.to_string())
            .kill_on_drop(true);
        if let Some(MetaValue::Text(check)) = ctx.metadata.get("check") {
            cmd.env("VIGIL_CHECK", check);
        }
        run(cmd, program.clone(), ctx.rule)
    }))
}

async fn run(mut cmd: Command, program: String, rule: String) -> anyhow::Result<bool> {
    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to spawn {program}"))?;
    if output.status.success() {
        info!(%rule, %program, "command succeeded");
        return Ok(true);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    warn!(%rule, %program, status = %output.status, "command failed");
    anyhow::bail!("{program} exited with {}: {}", output.status, stderr.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::watch;
    use tokio::time::Instant;
    use vigil_core::{Metadata, TriggerCondition};

    fn ctx() -> ActionContext {
        let (_tx, rx) = watch::channel(false);
        ActionContext::new(
            "restart",
            "exec-1",
            "command",
            TriggerCondition::Manual,
            Metadata::new(),
            Instant::now() + Duration::from_secs(5),
            rx,
        )
    }

    #[tokio::test]
    async fn log_action_succeeds() {
        let handler = log_action(&KindSpec::new("log").with_param("message", "hello")).unwrap();
        assert!(handler.run(ctx()).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_action_reports_exit_status() {
        let ok = command_action(&KindSpec::new("command").with_param("program", "true")).unwrap();
        assert!(ok.run(ctx()).await.unwrap());

        let failing =
            command_action(&KindSpec::new("command").with_param("program", "false")).unwrap();
        let err = failing.run(ctx()).await.unwrap_err();
        assert!(err.to_string().contains("false exited"), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_action_passes_args_and_context() {
        let spec = KindSpec::new("command").with_param("program", "sh").with_param(
            "args",
            toml::Value::Array(vec![
                "-c".into(),
                r#"test "$VIGIL_RULE" = restart && test "$1" = x"#.into(),
                "sh".into(),
                "x".into(),
            ]),
        );
        let handler = command_action(&spec).unwrap();
        assert!(handler.run(ctx()).await.unwrap());
    }

    #[test]
    fn command_action_validates_params() {
        assert!(command_action(&KindSpec::new("command")).is_err());
        let bad = KindSpec::new("command")
            .with_param("program", "echo")
            .with_param("args", 3i64);
        assert!(command_action(&bad).is_err());
    }

    #[test]
    fn registers_builtin_kinds() {
        let mut registry = ActionRegistry::new();
        register(&mut registry);
        assert_eq!(registry.kinds(), vec!["command".to_string(), "log".to_string()]);
    }
}
