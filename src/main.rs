use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

use agentflow::agent_core::{
    AppConfig, ConversationController, FunctionTool, InMemoryConfigStore, SessionEvent,
    SubmitOutcome, ToolRegistry, TurnResult,
};
use agentflow::inference::config::{build_dispatcher, find_config_path};
use agentflow::inference::{Message, Sender, ToolSchema};

const SESSION_ID: &str = "cli";

/// Send one message to a configured agent and stream the answer.
#[derive(Parser, Debug)]
#[command(name = "agentflow", version, about)]
struct Cli {
    /// Config file (defaults to AGENTFLOW_CONFIG, then agentflow.yaml upward from cwd)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Agent instance id from the `agents:` section
    #[arg(short, long, default_value = "default")]
    agent: String,

    /// Write rotated log files here instead of stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Message text
    #[arg(required = true, trailing_var_arg = true)]
    message: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    agentflow::init_tracing(cli.log_dir.as_deref()).context("failed to initialize logging")?;

    let config_path = match cli.config {
        Some(path) => path,
        None => find_config_path(&std::env::current_dir()?)?,
    };
    let app = AppConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let dispatcher = Arc::new(build_dispatcher(&app.providers)?);
    let store = Arc::new(InMemoryConfigStore::from_app_config(&app));
    let registry = ToolRegistry::new().with_tool(Arc::new(current_time_tool()));
    let controller = Arc::new(ConversationController::new(store, dispatcher, Arc::new(registry)));

    controller.create_session(SESSION_ID, &cli.agent)?;
    let mut events = controller.subscribe();

    let text = cli.message.join(" ");
    let handle = match controller.submit(SESSION_ID, &text, None) {
        SubmitOutcome::Accepted(handle) => handle,
        SubmitOutcome::Rejected(reason) => bail!("message rejected: {reason:?}"),
    };

    let mut printer = Printer::default();
    let turn = handle.wait();
    tokio::pin!(turn);
    let result = loop {
        tokio::select! {
            result = &mut turn => break Some(result),
            event = events.recv() => match event {
                Ok(event) => printer.handle(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break None,
            },
        }
    };
    let result = match result {
        Some(result) => result,
        None => turn.await,
    };
    while let Ok(event) = events.try_recv() {
        printer.handle(&event);
    }
    printer.end_line();

    match result {
        TurnResult::Completed => Ok(()),
        TurnResult::Failed(e) => Err(e.into()),
        TurnResult::Cancelled => bail!("turn cancelled"),
    }
}

/// Built-in tool so tool-use agents have something to call.
fn current_time_tool() -> FunctionTool {
    let schema = ToolSchema {
        name: "current_time".into(),
        description: "Current local date and time in RFC 3339 format".into(),
        parameters: json!({ "type": "object", "properties": {} }),
    };
    FunctionTool::new(schema, |_| async {
        Ok(json!({ "now": chrono::Local::now().to_rfc3339() }))
    })
}

/// Renders session events: answer text to stdout, everything else to stderr.
#[derive(Default)]
struct Printer {
    draft_id: Option<String>,
    printed: usize,
}

impl Printer {
    fn handle(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::DraftUpdated { draft, .. } => self.write_delta(draft),
            SessionEvent::MessageAppended { message, .. } => match message.sender {
                Sender::Agent if message.is_error => {
                    self.end_line();
                    eprintln!("{}", message.text);
                }
                Sender::Agent => {
                    self.write_delta(message);
                    for call in message.tool_calls.iter().flatten() {
                        self.end_line();
                        eprintln!("→ {}({})", call.name, call.arguments);
                    }
                }
                Sender::ToolResult => {
                    self.end_line();
                    if let Some(payload) = &message.tool_result {
                        let mark = if payload.is_error { "✗" } else { "✓" };
                        eprintln!("{mark} {}: {}", payload.tool_name, payload.result);
                    }
                }
                Sender::User => {}
            },
            SessionEvent::HistoryCompacted { .. } => {
                self.end_line();
                eprintln!("(earlier conversation summarized)");
            }
            SessionEvent::StateChanged { .. } | SessionEvent::MessageUpdated { .. } => {}
        }
    }

    fn write_delta(&mut self, message: &Message) {
        if self.draft_id.as_deref() != Some(message.id.as_str()) {
            self.end_line();
            self.draft_id = Some(message.id.clone());
        }
        if let Some(delta) = message.text.get(self.printed..) {
            print!("{delta}");
            let _ = std::io::stdout().flush();
            self.printed = message.text.len();
        }
    }

    fn end_line(&mut self) {
        if self.printed > 0 {
            println!();
        }
        self.printed = 0;
        self.draft_id = None;
    }
}
