use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use studyrun_client::{
    ChannelEvent, ClientConfig, ComponentTarget, ResultData, RunUrls, SessionDeps, StudySession,
};
use studyrun_protocol::MemberId;
use tokio::time::Instant;

use crate::console::ConsoleUx;

#[derive(Debug, Parser)]
#[command(
    name = "studyrun",
    about = "Take part in a study run without a browser",
    version
)]
pub struct Cli {
    /// URL the component was started with (…/publix/<runId>/<componentId>/start)
    #[arg(long, env = "STUDYRUN_URL")]
    pub url: String,

    /// Do not warn before leaving the component
    #[arg(long)]
    pub no_unload_warning: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the run metadata loaded from initData.
    Info,

    /// Send result data for this component.
    Submit {
        /// JSON value or plain text
        data: String,
        /// Append instead of replacing earlier result data
        #[arg(long)]
        append: bool,
    },

    /// Upload a result file.
    Upload {
        file: PathBuf,
        /// Name on the server (defaults to the file name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Read or change the batch session data.
    Batch {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Join a group, optionally message it, and print its traffic.
    Group {
        /// Broadcast this message after joining
        #[arg(long)]
        message: Option<String>,
        /// Send the message only to this member
        #[arg(long, requires = "message")]
        to: Option<String>,
        /// Close the group to new members
        #[arg(long)]
        fix: bool,
        /// How long to listen before leaving
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
        /// Stay a member when done instead of leaving the group
        #[arg(long)]
        stay: bool,
    },

    /// Start another component: next, last, pos:<n>, id:<n>, uuid:<u> or a title.
    Next {
        target: String,
        #[arg(long)]
        result: Option<String>,
        #[arg(long)]
        message: Option<String>,
    },

    /// Finish the study.
    End {
        #[arg(long)]
        failed: bool,
        #[arg(long)]
        result: Option<String>,
        #[arg(long)]
        message: Option<String>,
        /// Go here instead of the server's end page
        #[arg(long)]
        redirect: Option<String>,
    },

    /// Abort the study; result data is deleted on the server.
    Abort {
        #[arg(long)]
        message: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum SessionAction {
    Show,
    /// Set a top-level field to a JSON value
    Set { name: String, value: String },
    /// Remove the value at a JSON pointer
    Remove { path: String },
    Clear,
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = ClientConfig::from_env();
    if cli.no_unload_warning {
        config.before_unload_warning = false;
    }
    let urls = RunUrls::from_component_url(&cli.url)?;
    let deps = SessionDeps::live(Arc::new(ConsoleUx))?;
    let session = StudySession::new(config, urls, deps)?;
    session.init().await.context("loading the component failed")?;

    match cli.command {
        Command::Info => print_info(&session),
        Command::Submit { data, append } => {
            if append {
                session.append_result_data(parse_data(&data)).await?;
            } else {
                session.submit_result_data(parse_data(&data)).await?;
            }
            Ok(())
        }
        Command::Upload { file, name } => {
            let name = match name {
                Some(name) => name,
                None => file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| anyhow!("{} has no file name", file.display()))?,
            };
            let bytes = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            session.upload_result_file(&name, bytes).await?;
            Ok(())
        }
        Command::Batch { action } => batch(&session, action).await,
        Command::Group {
            message,
            to,
            fix,
            wait_secs,
            stay,
        } => group(&session, message, to, fix, Duration::from_secs(wait_secs), stay).await,
        Command::Next {
            target,
            result,
            message,
        } => {
            session
                .start_component(
                    parse_target(&target)?,
                    result.as_deref().map(parse_data),
                    message.as_deref(),
                )
                .await?;
            Ok(())
        }
        Command::End {
            failed,
            result,
            message,
            redirect,
        } => {
            let result = result.as_deref().map(parse_data);
            match redirect {
                Some(url) => {
                    session
                        .end_study_and_redirect(&url, result, !failed, message.as_deref())
                        .await?
                }
                None => session.end_study(result, !failed, message.as_deref()).await?,
            }
            Ok(())
        }
        Command::Abort { message } => {
            session.abort_study(message.as_deref()).await?;
            Ok(())
        }
    }
}

fn print_info(session: &StudySession) -> anyhow::Result<()> {
    let init = session.init_data()?;
    let info = json!({
        "runId": session.urls().run_id(),
        "studyResultId": init.study_result_id,
        "componentResultId": init.component_result_id,
        "study": init.study_properties,
        "batch": init.batch_properties,
        "component": init.component_properties,
        "componentPosition": session.component_position()?,
        "components": init.component_list,
        "studySessionData": session.study_session_data(),
        "batchSessionData": session.batch_session().get_all(),
    });
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

async fn batch(session: &StudySession, action: SessionAction) -> anyhow::Result<()> {
    let store = session.batch_session();
    match action {
        SessionAction::Show => {}
        SessionAction::Set { name, value } => store.set(&name, parse_value(&value)).await?,
        SessionAction::Remove { path } => store.remove(&path).await?,
        SessionAction::Clear => store.clear().await?,
    }
    println!("{}", serde_json::to_string_pretty(&store.get_all())?);
    Ok(())
}

async fn group(
    session: &StudySession,
    message: Option<String>,
    to: Option<String>,
    fix: bool,
    wait: Duration,
    stay: bool,
) -> anyhow::Result<()> {
    let mut events = session.group_channel().subscribe();
    session.join_group().await?;
    let membership = session.group_membership();
    eprintln!(
        "  joined group {} as member {}",
        membership.group_id.map(|id| id.to_string()).unwrap_or_default(),
        membership.member_id.map(|id| id.to_string()).unwrap_or_default(),
    );

    if fix {
        session.set_group_fixed().await?;
    }
    if let Some(message) = message {
        let msg = parse_value(&message);
        match to {
            Some(member) => session.send_group_msg_to(MemberId::new(member), msg).await?,
            None => session.send_group_msg(msg).await?,
        }
    }

    let deadline = Instant::now() + wait;
    while let Ok(event) = tokio::time::timeout_at(deadline, events.recv()).await {
        match event {
            Ok(ChannelEvent::Message { msg }) => println!("{msg}"),
            Ok(ChannelEvent::Closed) => break,
            Ok(other) => eprintln!("  {other:?}"),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                eprintln!("  ({missed} events missed)")
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }

    if !stay && session.group_membership().is_joined() {
        session.leave_group().await?;
    }
    Ok(())
}

/// JSON if it parses, otherwise the raw string
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_data(raw: &str) -> ResultData {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => ResultData::Json(value),
        _ => ResultData::Text(raw.to_string()),
    }
}

fn parse_target(raw: &str) -> anyhow::Result<ComponentTarget> {
    let target = match raw.split_once(':') {
        Some(("pos", n)) => ComponentTarget::Position(n.parse().context("bad position")?),
        Some(("id", n)) => ComponentTarget::Id(n.parse().context("bad component id")?),
        Some(("uuid", uuid)) => ComponentTarget::Uuid(uuid.to_string()),
        Some(("title", title)) => ComponentTarget::Title(title.to_string()),
        _ => match raw {
            "next" => ComponentTarget::Next,
            "last" => ComponentTarget::Last,
            title => ComponentTarget::Title(title.to_string()),
        },
    };
    Ok(target)
}
