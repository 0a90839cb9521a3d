//! Command line surface: argument model and the three run modes.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info};

use crate::core::config::{load_portal_config, AppConfig, ConfigOverrides};
use crate::core::logging::init_logging;
use crate::core::types::{AssistantVariant, OutputFormat, QaRecord};
use crate::features::portal::PortalClient;
use crate::tools::batch::{read_questions, run_batch};
use crate::tools::export::save_results;

#[derive(Parser, Debug)]
#[command(name = "portal-chat", version, about = "Chat with the campus AI assistants from the terminal")]
#[command(group(
    ArgGroup::new("mode")
        .required(true)
        .args(["interactive", "question", "file"])
))]
pub struct CliArgs {
    /// SSO username (or PORTAL_USERNAME)
    #[arg(short, long)]
    pub username: Option<String>,

    /// SSO password (or PORTAL_PASSWORD)
    #[arg(short, long)]
    pub password: Option<String>,

    /// Assistant to talk to
    #[arg(short = 't', long = "type", value_enum)]
    pub variant: Option<AssistantVariant>,

    /// Read questions from stdin until `exit`
    #[arg(short, long)]
    pub interactive: bool,

    /// Ask one question and print the answer
    #[arg(short, long)]
    pub question: Option<String>,

    /// Ask every question of a .txt, .csv or .json file
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Where to save results
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Txt)]
    pub format: OutputFormat,

    #[arg(long)]
    pub headless: bool,

    /// Verbose logging
    #[arg(long)]
    pub debug: bool,

    /// Config file (default: portal-chat.json lookup)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Seconds between batch questions
    #[arg(long)]
    pub delay: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Interactive,
    Single(String),
    Batch(PathBuf),
}

impl CliArgs {
    pub fn mode(&self) -> Mode {
        if let Some(q) = &self.question {
            Mode::Single(q.clone())
        } else if let Some(f) = &self.file {
            Mode::Batch(f.clone())
        } else {
            Mode::Interactive
        }
    }

    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            username: self.username.clone(),
            password: self.password.clone(),
            variant: self.variant,
            headless: self.headless,
            debug: self.debug,
            batch_delay_secs: self.delay,
        }
    }
}

/// Entry point used by `main`.
pub async fn run(args: CliArgs) -> ExitCode {
    let config = match load_portal_config(args.config.as_deref())
        .and_then(|file| AppConfig::resolve(file, args.overrides()))
    {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("❌ {}", e);
            return ExitCode::FAILURE;
        }
    };

    let _guard = match init_logging(&config.log) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("❌ logging: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    if !config.credentials.is_complete() {
        error!("❌ username and password are required (-u/-p, config file or PORTAL_USERNAME/PORTAL_PASSWORD)");
        return ExitCode::FAILURE;
    }

    match run_mode(&args, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_mode(args: &CliArgs, config: Arc<AppConfig>) -> Result<ExitCode> {
    let mode = args.mode();
    // Read the batch file before paying for a login.
    let questions = match &mode {
        Mode::Batch(path) => Some(
            read_questions(path).with_context(|| format!("cannot read {}", path.display()))?,
        ),
        _ => None,
    };

    let batch_delay = config.batch_delay;
    let mut client = PortalClient::open(config)
        .await
        .context("could not open a chat session")?;

    let (records, code) = match mode {
        Mode::Single(question) => {
            let (record, ok) = match client.chat(&question).await {
                Ok(answer) => {
                    println!("{}", answer);
                    (QaRecord::answered(question, answer), true)
                }
                Err(e) => {
                    error!("❌ {}", e);
                    (QaRecord::failed(question, &e), false)
                }
            };
            let code = if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE };
            (vec![record], code)
        }
        Mode::Batch(_) => {
            let questions = questions.unwrap_or_default();
            let records = run_batch(&mut client, &questions, batch_delay).await;
            (records, ExitCode::SUCCESS)
        }
        Mode::Interactive => (interactive(&mut client).await?, ExitCode::SUCCESS),
    };

    let save = args.output.is_some() || matches!(args.mode(), Mode::Batch(_));
    if save && !records.is_empty() {
        match save_results(&records, args.output.as_deref(), args.format) {
            Ok(path) => println!("💾 results saved to {}", path.display()),
            Err(e) => error!("❌ results not saved: {}", e),
        }
    }

    client.close().await;
    Ok(code)
}

async fn interactive(client: &mut PortalClient) -> Result<Vec<QaRecord>> {
    let mut records = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    println!("Type your question. `clear` starts over, `exit` or `quit` leaves.");

    loop {
        stdout.write_all(b"\nYou: ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "exit" | "quit" => break,
            "clear" => {
                client.clear_conversation();
                println!("(conversation cleared)");
                continue;
            }
            _ => {}
        }

        match client.chat(line).await {
            Ok(answer) => {
                println!("\nAssistant: {}", answer);
                records.push(QaRecord::answered(line, answer));
            }
            Err(e) => {
                println!("\n❌ {}", e);
                records.push(QaRecord::failed(line, &e));
            }
        }
    }
    info!("interactive session ended after {} questions", records.len());
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_mode_is_required() {
        assert!(CliArgs::try_parse_from(["portal-chat"]).is_err());
        assert!(CliArgs::try_parse_from(["portal-chat", "-i", "-q", "hi"]).is_err());
        let args = CliArgs::try_parse_from(["portal-chat", "-q", "hi", "-t", "tongyi"]).unwrap();
        assert_eq!(args.mode(), Mode::Single("hi".into()));
        assert_eq!(args.variant, Some(AssistantVariant::Tongyi));
        assert_eq!(args.format, OutputFormat::Txt);
    }

    #[test]
    fn batch_flags_reach_overrides() {
        let args = CliArgs::try_parse_from([
            "portal-chat", "-f", "qs.csv", "--format", "csv", "--delay", "5", "--headless", "-u", "u1",
        ])
        .unwrap();
        assert_eq!(args.mode(), Mode::Batch(PathBuf::from("qs.csv")));
        let o = args.overrides();
        assert_eq!(o.batch_delay_secs, Some(5));
        assert!(o.headless);
        assert_eq!(o.username.as_deref(), Some("u1"));
        assert_eq!(args.format, OutputFormat::Csv);
    }
}
