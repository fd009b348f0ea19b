mod bridge;
mod catalog;
mod channels;
mod config;

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bridge::invoker::{resolve_command_name, resolve_executable_path};
use bridge::{ToolBridge, ToolHandler};
use catalog::ToolCatalog;
use channels::{normalize_channel_action, ChannelOutbound, LoopbackChannel};
use config::Config;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Run OpenClaw catalog tools through a local CLI")]
struct Cli {
    /// Path to TOML config file.
    #[arg(
        long,
        global = true,
        env = "OPENCLAW_BRIDGE_CONFIG",
        default_value = "openclaw-bridge.toml"
    )]
    config: PathBuf,

    /// Override the bridged executable.
    #[arg(long, global = true, env = "OPENCLAW_BRIDGE_BIN")]
    command: Option<String>,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "OPENCLAW_BRIDGE_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    subcommand: CliCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Inspect and invoke bridged tools.
    Tools(ToolsArgs),
    /// Exercise the outbound channel path.
    Message(MessageArgs),
    /// Run non-interactive diagnostics.
    Doctor(DoctorArgs),
}

#[derive(Debug, Clone, Args)]
struct ToolsArgs {
    #[command(subcommand)]
    command: ToolsSubcommand,
}

#[derive(Debug, Clone, Subcommand)]
enum ToolsSubcommand {
    /// List tools from the configured catalog.
    List(ToolsListArgs),
    /// Invoke one tool through the bridge.
    Call(ToolsCallArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct ToolsListArgs {
    /// Emit output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args)]
struct ToolsCallArgs {
    /// Tool name as listed in the catalog.
    name: String,
    /// JSON object with the tool parameters.
    #[arg(long, default_value = "{}")]
    args: String,
    /// Override the per-call timeout (0 disables it).
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,
    /// Optional call id; auto-generated when omitted.
    #[arg(long = "call-id")]
    call_id: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct MessageArgs {
    #[command(subcommand)]
    command: MessageSubcommand,
}

#[derive(Debug, Clone, Subcommand)]
enum MessageSubcommand {
    /// Send an outbound message through the loopback channel.
    Send(MessageSendArgs),
}

#[derive(Debug, Clone, Args)]
struct MessageSendArgs {
    /// Delivery target (for example a channel id or @user).
    #[arg(long)]
    to: String,
    /// Optional text body.
    #[arg(long)]
    message: Option<String>,
    /// Optional media URL.
    #[arg(long = "media-url")]
    media_url: Option<String>,
    /// Optional message id to reply to; wins over --thread-id.
    #[arg(long = "reply-to")]
    reply_to: Option<String>,
    /// Optional thread id for threaded providers.
    #[arg(long = "thread-id")]
    thread_id: Option<String>,
    /// Optional channel tag (default: webchat).
    #[arg(long)]
    channel: Option<String>,
    /// Emit output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args, Default)]
struct DoctorArgs {
    /// Emit doctor output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorReport {
    ok: bool,
    checks: Vec<DoctorCheck>,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    status: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    match cli.subcommand.clone() {
        CliCommand::Tools(ToolsArgs {
            command: ToolsSubcommand::List(args),
        }) => run_tools_list(&cli, args),
        CliCommand::Tools(ToolsArgs {
            command: ToolsSubcommand::Call(args),
        }) => run_tools_call(&cli, args).await,
        CliCommand::Message(MessageArgs {
            command: MessageSubcommand::Send(args),
        }) => run_message_send(args).await,
        CliCommand::Doctor(args) => run_doctor(&cli, args),
    }
}

fn load_config(cli: &Cli, timeout_ms: Option<u64>) -> Result<Config> {
    let mut cfg = Config::load(&cli.config)?;
    cfg.apply_cli_overrides(cli.command.as_deref(), timeout_ms);
    cfg.validate()?;
    Ok(cfg)
}

fn run_tools_list(cli: &Cli, args: ToolsListArgs) -> Result<()> {
    let cfg = load_config(cli, None)?;
    let catalog = ToolCatalog::new();
    let tools = catalog
        .load_tools(&cfg.catalog.path)
        .ok_or_else(|| anyhow!("no usable tool catalog at {}", cfg.catalog.path.display()))?;
    let handlers = ToolBridge::new(&cfg.bridge).handlers(&tools);

    if args.json {
        let rows = handlers
            .iter()
            .map(|handler| {
                json!({
                    "name": handler.name(),
                    "label": handler.label(),
                    "description": handler.description(),
                    "parameters": handler.parameters(),
                })
            })
            .collect::<Vec<_>>();
        print_json_value(&json!({ "count": rows.len(), "tools": rows }));
        return Ok(());
    }

    println!("tools: {}", handlers.len());
    for handler in handlers {
        if handler.description().is_empty() {
            println!("{} ({})", handler.name(), handler.label());
        } else {
            println!(
                "{} ({}): {}",
                handler.name(),
                handler.label(),
                handler.description()
            );
        }
    }
    Ok(())
}

async fn run_tools_call(cli: &Cli, args: ToolsCallArgs) -> Result<()> {
    let cfg = load_config(cli, args.timeout_ms)?;
    let params: Value = serde_json::from_str(&args.args)
        .with_context(|| format!("--args is not valid JSON: {}", args.args))?;
    let catalog = ToolCatalog::new();
    let tools = catalog
        .load_tools(&cfg.catalog.path)
        .ok_or_else(|| anyhow!("no usable tool catalog at {}", cfg.catalog.path.display()))?;
    let handler = ToolBridge::new(&cfg.bridge)
        .handler(&tools, &args.name)
        .ok_or_else(|| anyhow!("tool `{}` is not in the catalog", args.name))?;

    let call_id = args
        .call_id
        .unwrap_or_else(|| format!("cli-call-{}", now_ms()));
    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("received ctrl-c, cancelling tool call");
                cancel.cancel();
            }
        })
    };
    let result = handler.execute(&call_id, params, Some(cancel)).await;
    ctrl_c.abort();

    print_json_value(&result.to_value());
    if result.is_error() {
        return Err(anyhow!("tool `{}` failed", args.name));
    }
    Ok(())
}

async fn run_message_send(args: MessageSendArgs) -> Result<()> {
    let channel = LoopbackChannel::new(args.channel.as_deref());
    let mut payload = json!({
        "action": "send",
        "to": args.to,
    });
    if let Some(message) = args.message {
        payload["message"] = json!(message);
    }
    if let Some(media_url) = args.media_url {
        payload["mediaUrl"] = json!(media_url);
    }
    if let Some(reply_to) = args.reply_to {
        payload["replyTo"] = json!(reply_to);
    }
    if let Some(thread_id) = args.thread_id {
        payload["threadId"] = json!(thread_id);
    }
    let action = normalize_channel_action(&payload)
        .ok_or_else(|| anyhow!("message send requires a non-empty --to"))?;
    let capabilities = channel.capabilities();
    if payload.get("threadId").is_some() && !capabilities.supports_threads {
        warn!("{} does not support threads, sending unthreaded", capabilities.name);
    }
    let receipt = channel.dispatch(action).await?;
    let delivered = channel.delivered().await;

    if args.json {
        print_json_value(&json!({
            "channel": capabilities,
            "receipt": receipt,
            "delivered": delivered,
        }));
    } else {
        let message_id = receipt
            .get("messageId")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let thread_link = delivered
            .last()
            .and_then(|entry| entry.thread_link.as_deref())
            .unwrap_or("none");
        println!(
            "message sent: channel={} message_id={message_id} thread_link={thread_link} chunks={}",
            channel.channel_tag(),
            delivered.len()
        );
    }
    Ok(())
}

fn run_doctor(cli: &Cli, args: DoctorArgs) -> Result<()> {
    let config_result = load_config(cli, None).map_err(|err| format!("{err:#}"));
    let catalog = ToolCatalog::new();
    let tool_count = config_result
        .as_ref()
        .ok()
        .and_then(|cfg| catalog.load_tools(&cfg.catalog.path))
        .map(|tools| tools.len());
    let executable = config_result
        .as_ref()
        .ok()
        .and_then(|cfg| resolve_executable_path(&resolve_command_name(&cfg.bridge.command)));
    let report = build_doctor_report(config_result, &cli.config, tool_count, executable);
    print_doctor_report(&report, args.json);
    if report.ok {
        return Ok(());
    }
    Err(anyhow!("doctor reported blocking issues"))
}

fn build_doctor_report(
    config_result: std::result::Result<Config, String>,
    config_path: &Path,
    tool_count: Option<usize>,
    executable: Option<PathBuf>,
) -> DoctorReport {
    let mut checks = Vec::new();

    let cfg = match config_result {
        Ok(cfg) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "pass".to_owned(),
                message: format!("loaded {}", config_path.display()),
                detail: None,
            });
            cfg
        }
        Err(err) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "fail".to_owned(),
                message: format!("failed to load {}", config_path.display()),
                detail: Some(err),
            });
            return DoctorReport { ok: false, checks };
        }
    };

    checks.push(DoctorCheck {
        id: "catalog.load".to_owned(),
        status: if tool_count.is_some() { "pass" } else { "warn" }.to_owned(),
        message: match tool_count {
            Some(count) => format!("{count} tools in {}", cfg.catalog.path.display()),
            None => format!("no usable catalog at {}", cfg.catalog.path.display()),
        },
        detail: None,
    });

    let command = resolve_command_name(&cfg.bridge.command);
    checks.push(DoctorCheck {
        id: "bridge.command".to_owned(),
        status: if executable.is_some() { "pass" } else { "fail" }.to_owned(),
        message: match executable.as_ref() {
            Some(path) => format!("{command} resolved to {}", path.display()),
            None => format!("{command} not found on PATH"),
        },
        detail: Some(match cfg.bridge.timeout_ms {
            0 => "timeout disabled".to_owned(),
            ms => format!("timeout {ms}ms"),
        }),
    });

    let ok = checks.iter().all(|check| check.status != "fail");
    DoctorReport { ok, checks }
}

fn print_doctor_report(report: &DoctorReport, json_output: bool) {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(report)
                .unwrap_or_else(|_| "{\"ok\":false,\"checks\":[]}".to_owned())
        );
        return;
    }

    println!("doctor: {}", if report.ok { "ok" } else { "issues" });
    for check in &report.checks {
        let detail = check
            .detail
            .as_deref()
            .map(|value| format!(" ({value})"))
            .unwrap_or_default();
        println!(
            "[{}] {}: {}{}",
            check.status.to_uppercase(),
            check.id,
            check.message,
            detail
        );
    }
}

fn print_json_value(value: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn init_logging(filter: &str) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_tools_call_with_args_and_timeout() {
        let cli = Cli::parse_from([
            "openclaw-tool-bridge",
            "tools",
            "call",
            "read_thread",
            "--args",
            "{\"id\":\"T1\"}",
            "--timeout-ms",
            "500",
        ]);
        match cli.subcommand {
            CliCommand::Tools(ToolsArgs {
                command: ToolsSubcommand::Call(args),
            }) => {
                assert_eq!(args.name, "read_thread");
                assert_eq!(args.args, "{\"id\":\"T1\"}");
                assert_eq!(args.timeout_ms, Some(500));
            }
            _ => panic!("expected tools call command"),
        }
    }

    #[test]
    fn cli_parses_message_send_with_reply_and_thread() {
        let cli = Cli::parse_from([
            "openclaw-tool-bridge",
            "message",
            "send",
            "--to",
            "C1",
            "--message",
            "hi",
            "--reply-to",
            "R",
            "--thread-id",
            "T",
            "--json",
        ]);
        match cli.subcommand {
            CliCommand::Message(MessageArgs {
                command: MessageSubcommand::Send(args),
            }) => {
                assert_eq!(args.to, "C1");
                assert_eq!(args.reply_to.as_deref(), Some("R"));
                assert_eq!(args.thread_id.as_deref(), Some("T"));
                assert!(args.json);
            }
            _ => panic!("expected message send command"),
        }
    }

    #[test]
    fn cli_global_command_override_applies_to_subcommands() {
        let cli = Cli::parse_from([
            "openclaw-tool-bridge",
            "doctor",
            "--command",
            "/opt/mcporter",
            "--json",
        ]);
        assert_eq!(cli.command.as_deref(), Some("/opt/mcporter"));
        assert!(matches!(cli.subcommand, CliCommand::Doctor(DoctorArgs { json: true })));
    }

    #[test]
    fn doctor_report_marks_config_load_failure_as_blocking() {
        let report = build_doctor_report(
            Err("invalid config".to_owned()),
            Path::new("openclaw-bridge.toml"),
            None,
            None,
        );
        assert!(!report.ok);
        assert!(report
            .checks
            .iter()
            .any(|check| check.id == "config.load" && check.status == "fail"));
    }

    #[test]
    fn doctor_report_fails_when_command_is_missing_and_warns_on_catalog() {
        let report = build_doctor_report(
            Ok(Config::default()),
            Path::new("openclaw-bridge.toml"),
            None,
            None,
        );
        assert!(!report.ok);
        assert!(report
            .checks
            .iter()
            .any(|check| check.id == "catalog.load" && check.status == "warn"));
        assert!(report
            .checks
            .iter()
            .any(|check| check.id == "bridge.command" && check.status == "fail"));
    }

    #[test]
    fn doctor_report_passes_with_catalog_and_command() {
        let report = build_doctor_report(
            Ok(Config::default()),
            Path::new("openclaw-bridge.toml"),
            Some(3),
            Some(PathBuf::from("/usr/local/bin/mcporter")),
        );
        assert!(report.ok);
        assert!(report
            .checks
            .iter()
            .all(|check| check.status == "pass"));
    }
}
