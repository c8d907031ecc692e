use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::errors::UtcpError;
use crate::providers::{CliProvider, Provider, ProviderType};
use crate::tools::{Tool, UtcpManual};
use crate::transports::stream::StreamResult;
use crate::transports::ClientTransport;

const COMMAND_DEADLINE: Duration = Duration::from_secs(30);

/// Driver for local command-line providers. Discovery runs the configured
/// command and scans its output for a manual; calls re-run the command with
/// the arguments flattened into `--flag` style options.
pub struct CliTransport;

impl CliTransport {
    pub fn new() -> Self {
        Self
    }

    fn expect_cli<'a>(prov: &'a Provider) -> Result<&'a CliProvider> {
        match prov {
            Provider::Cli(p) => Ok(p),
            other => Err(UtcpError::mismatch(ProviderType::Cli, other.provider_type())),
        }
    }

    fn split_command(prov: &CliProvider) -> Result<(String, Vec<String>)> {
        let mut parts = prov
            .command_name
            .split_whitespace()
            .map(|s| s.to_string())
            .collect::<Vec<_>>();
        if parts.is_empty() {
            return Err(UtcpError::Config("CLI provider has an empty command".to_string()).into());
        }
        let program = parts.remove(0);
        Ok((program, parts))
    }

    async fn execute(
        prov: &CliProvider,
        program: &str,
        args: &[String],
    ) -> Result<(String, String, i32)> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(env) = &prov.env_vars {
            for (k, v) in env {
                cmd.env(k, v);
            }
        }
        if let Some(dir) = &prov.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| UtcpError::Io(format!("failed to spawn '{program}': {e}")))?;
        let output = tokio::time::timeout(COMMAND_DEADLINE, child.wait_with_output())
            .await
            .map_err(|_| {
                UtcpError::Cancelled(format!(
                    "command '{program}' exceeded the {}s deadline",
                    COMMAND_DEADLINE.as_secs()
                ))
            })??;

        Ok((
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
            output.status.code().unwrap_or(1),
        ))
    }

    /// Flatten a JSON argument mapping into CLI options. Keys are sorted so
    /// repeated invocations are byte-identical.
    pub fn format_arguments(args: &HashMap<String, Value>) -> Vec<String> {
        let mut keys: Vec<_> = args.keys().collect();
        keys.sort();

        let mut out = Vec::new();
        for key in keys {
            match &args[key] {
                Value::Bool(true) => out.push(format!("--{key}")),
                Value::Bool(false) => {}
                Value::Array(items) => {
                    for item in items {
                        out.push(format!("--{key}"));
                        out.push(scalar(item));
                    }
                }
                value => {
                    out.push(format!("--{key}"));
                    out.push(scalar(value));
                }
            }
        }
        out
    }

    /// Extract tools from possibly noisy discovery output: the whole output
    /// as a manual first, then line-by-line for embedded manuals or single
    /// tool records mixed into log lines.
    fn extract_tools(output: &str) -> Vec<Tool> {
        if let Ok(doc) = serde_json::from_str::<Value>(output) {
            if let Some(manual) = UtcpManual::from_document(&doc) {
                return manual.tools;
            }
        }

        let mut tools = Vec::new();
        for line in output.lines() {
            let line = line.trim();
            if !(line.starts_with('{') && line.ends_with('}')) {
                continue;
            }
            let Ok(doc) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            if let Some(manual) = UtcpManual::from_document(&doc) {
                tools.extend(manual.tools);
            } else if doc.get("name").is_some() && doc.get("description").is_some() {
                if let Ok(tool) = serde_json::from_value::<Tool>(doc) {
                    tools.push(tool);
                }
            }
        }
        tools
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

#[async_trait]
impl ClientTransport for CliTransport {
    async fn register_tool_provider(&self, prov: &Provider) -> Result<Vec<Tool>> {
        let cli_prov = Self::expect_cli(prov)?;
        let (program, base_args) = Self::split_command(cli_prov)?;

        let (stdout, stderr, exit_code) = Self::execute(cli_prov, &program, &base_args).await?;
        let output = if exit_code == 0 { stdout } else { stderr };
        if output.trim().is_empty() {
            return Ok(Vec::new());
        }

        let tools = Self::extract_tools(&output);
        debug!(provider = %cli_prov.name, tools = tools.len(), "cli discovery");
        Ok(tools)
    }

    async fn deregister_tool_provider(&self, prov: &Provider) -> Result<()> {
        Self::expect_cli(prov)?;
        Ok(())
    }

    async fn call_tool(
        &self,
        _tool_name: &str,
        args: HashMap<String, Value>,
        prov: &Provider,
        _last_event_id: Option<&str>,
    ) -> Result<Value> {
        let cli_prov = Self::expect_cli(prov)?;
        let (program, mut cmd_args) = Self::split_command(cli_prov)?;
        cmd_args.extend(Self::format_arguments(&args));

        let (stdout, stderr, exit_code) = Self::execute(cli_prov, &program, &cmd_args).await?;
        if exit_code != 0 {
            return Err(UtcpError::Io(format!(
                "command '{program}' exited with {exit_code}: {}",
                stderr.trim()
            ))
            .into());
        }

        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(Value::String(String::new()));
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => Ok(value),
            Err(_) => Ok(Value::String(trimmed.to_string())),
        }
    }

    async fn call_tool_stream(
        &self,
        _tool_name: &str,
        _args: HashMap<String, Value>,
        prov: &Provider,
    ) -> Result<Box<dyn StreamResult>> {
        Self::expect_cli(prov)?;
        Err(UtcpError::Unsupported("CLI transport does not stream".to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_script(dir: &TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        write!(file, "{body}").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn format_arguments_flattens_flags_lists_and_scalars() {
        let mut args = HashMap::new();
        args.insert("flag".to_string(), json!(true));
        args.insert("k".to_string(), json!("v"));
        args.insert("xs".to_string(), json!([1, 2]));

        assert_eq!(
            CliTransport::format_arguments(&args),
            vec!["--flag", "--k", "v", "--xs", "1", "--xs", "2"]
        );
    }

    #[test]
    fn false_booleans_are_omitted() {
        let mut args = HashMap::new();
        args.insert("quiet".to_string(), json!(false));
        args.insert("n".to_string(), json!(3));
        assert_eq!(CliTransport::format_arguments(&args), vec!["--n", "3"]);
    }

    #[test]
    fn extract_tools_parses_full_manual() {
        let output = json!({
            "version": "1.0",
            "tools": [{ "name": "echo", "description": "Echo" }]
        })
        .to_string();
        let tools = CliTransport::extract_tools(&output);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
    }

    #[test]
    fn extract_tools_scans_past_log_noise() {
        let output = r#"starting up...
[info] loading plugins
{"tools":[{"name":"scan","description":"Scan"}]}
{"name":"solo","description":"Standalone tool"}
{"level":"warn","msg":"not a tool"}
done
"#;
        let tools = CliTransport::extract_tools(output);
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["scan", "solo"]);
    }

    #[tokio::test]
    async fn register_runs_discovery_command() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            &dir,
            "discover.sh",
            r#"echo 'booting'
echo '{"tools":[{"name":"greet","description":"Greets"}]}'
"#,
        );

        let prov = Provider::Cli(CliProvider::new("cli".into(), script));
        let tools = CliTransport::new().register_tool_provider(&prov).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "greet");
    }

    #[tokio::test]
    async fn call_passes_flattened_flags_and_decodes_json() {
        let dir = TempDir::new().unwrap();
        // Echo the received argv back as a JSON string array.
        let script = write_script(
            &dir,
            "args.sh",
            r#"printf '['
first=1
for a in "$@"; do
  if [ $first -eq 1 ]; then first=0; else printf ','; fi
  printf '"%s"' "$a"
done
printf ']'
"#,
        );

        let mut args = HashMap::new();
        args.insert("flag".to_string(), json!(true));
        args.insert("name".to_string(), json!("World"));

        let prov = Provider::Cli(CliProvider::new("cli".into(), script));
        let value = CliTransport::new()
            .call_tool("cli.run", args, &prov, None)
            .await
            .unwrap();
        assert_eq!(value, json!(["--flag", "--name", "World"]));
    }

    #[tokio::test]
    async fn non_json_output_is_returned_trimmed() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "plain.sh", "echo '  plain text output  '\n");

        let prov = Provider::Cli(CliProvider::new("cli".into(), script));
        let value = CliTransport::new()
            .call_tool("cli.run", HashMap::new(), &prov, None)
            .await
            .unwrap();
        assert_eq!(value, json!("plain text output"));
    }

    #[tokio::test]
    async fn env_vars_and_working_dir_are_applied() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "env.sh", "printf '{\"env\":\"%s\",\"pwd\":\"%s\"}' \"$DEMO_VAR\" \"$PWD\"\n");

        let mut cli = CliProvider::new("cli".into(), script);
        cli.env_vars = Some(HashMap::from([(
            "DEMO_VAR".to_string(),
            "demo-value".to_string(),
        )]));
        cli.working_dir = Some(dir.path().to_str().unwrap().to_string());

        let value = CliTransport::new()
            .call_tool("cli.env", HashMap::new(), &Provider::Cli(cli), None)
            .await
            .unwrap();
        assert_eq!(value["env"], "demo-value");
        assert_eq!(
            std::fs::canonicalize(value["pwd"].as_str().unwrap()).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }

    #[tokio::test]
    async fn failing_command_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "fail.sh", "echo 'went wrong' >&2\nexit 3\n");

        let prov = Provider::Cli(CliProvider::new("cli".into(), script));
        let err = CliTransport::new()
            .call_tool("cli.fail", HashMap::new(), &prov, None)
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exited with 3"));
        assert!(msg.contains("went wrong"));
    }

    #[tokio::test]
    async fn stream_and_wrong_variant_are_typed_errors() {
        let transport = CliTransport::new();
        let prov = Provider::Cli(CliProvider::new("cli".into(), "true".into()));
        let err = transport
            .call_tool_stream("cli.x", HashMap::new(), &prov)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UtcpError>(),
            Some(UtcpError::Unsupported(_))
        ));

        let wrong = Provider::Text(crate::providers::TextProvider::new("t".into()));
        let err = transport.register_tool_provider(&wrong).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UtcpError>(),
            Some(UtcpError::TransportMismatch { .. })
        ));
    }
}
