use anyhow::{anyhow, bail, Context, Result};
use chat_sentinel::config::{default_data_dir, Settings};
use chat_sentinel::ipc::topics;
use chat_sentinel::session::{AuthStep, Dialog, Participant};
use chat_sentinel::worker::{self, WorkerOptions};
use chat_sentinel::{Broker, FileBroker, IpcGateway, IpcResponse, MessageStore};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "sentinel")]
#[command(about = "Chat Sentinel - 监视聊天账号并对重要消息告警")]
#[command(version)]
struct Cli {
    /// 数据目录（默认 ~/.config/chat-sentinel，或 SENTINEL_DATA_DIR）
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 运行 Worker（Session Owner + 流消费 + 告警）
    Run {
        /// 只打印告警，不实际发送
        #[arg(long)]
        dry_run: bool,
    },
    /// 提交认证步骤（phone / code / password）
    Auth {
        /// 步骤类型
        kind: String,
        /// 步骤内容，省略时从标准输入读取
        value: Option<String>,
        /// 等待结果的秒数
        #[arg(long, default_value = "60")]
        timeout: u64,
    },
    /// 查看授权与连接状态
    Status {
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
    /// 列出会话
    Dialogs {
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
    /// 列出群组成员
    Participants {
        /// 会话 ID
        chat_id: i64,
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
    /// 为消息打标签（如 up / down）
    Feedback {
        chat_id: i64,
        msg_id: i64,
        label: String,
    },
    /// 触发规则重载
    Reload,
    /// 查看最近评分的消息
    Recent {
        /// 显示最近 N 条
        #[arg(long, short, default_value = "20")]
        limit: usize,
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // 通过 RUST_LOG 控制日志级别，例如: RUST_LOG=debug sentinel run
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("chat_sentinel=info,sentinel=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    let data_dir = cli
        .data_dir
        .or_else(|| std::env::var_os("SENTINEL_DATA_DIR").map(PathBuf::from))
        .unwrap_or_else(default_data_dir);
    let settings = Settings::load(&data_dir)?;

    match cli.command {
        Commands::Run { dry_run } => {
            let cancel = CancellationToken::new();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    worker::shutdown_signal().await;
                    info!("Shutting down");
                    cancel.cancel();
                });
            }
            worker::run(settings, WorkerOptions { dry_run }, cancel).await?;
        }
        Commands::Auth {
            kind,
            value,
            timeout,
        } => {
            let value = match value {
                Some(value) => value,
                None => read_line(&format!("{}: ", kind))?,
            };
            let step = AuthStep::parse(&kind, value)
                .ok_or_else(|| anyhow!("unknown auth step '{}', expected phone/code/password", kind))?;
            let response = gateway(&settings)?
                .request(
                    topics::AUTH,
                    serde_json::to_value(&step)?,
                    Duration::from_secs(timeout.max(1)),
                )
                .await
                .context("worker did not answer the auth request")?;
            let data = expect_ok(response)?;
            match data["state"].as_str() {
                Some("authorized") => println!(
                    "✅ 已授权: {}",
                    data["account"].as_str().unwrap_or("unknown")
                ),
                Some("code_required") => println!("请提交验证码: sentinel auth code <CODE>"),
                Some("password_required") => println!("请提交两步验证密码: sentinel auth password"),
                _ => println!("{}", data),
            }
        }
        Commands::Status { json } => {
            let ipc = gateway(&settings)?;
            match ipc.read_status()? {
                Some(status) if json => println!("{}", serde_json::to_string_pretty(&status)?),
                Some(status) => {
                    println!("状态: {}", status.state.as_str());
                    if let Some(account) = &status.account {
                        println!("账号: {}", account);
                    }
                    if let Some(err) = &status.last_error {
                        println!("最近错误: {}", err);
                    }
                    println!(
                        "更新时间: {}",
                        status.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
                    );
                }
                None => println!("Worker 尚未上报状态"),
            }
        }
        Commands::Dialogs { json } => {
            let response = gateway(&settings)?
                .request(topics::DIALOGS, json!({}), REQUEST_TIMEOUT)
                .await?;
            let dialogs: Vec<Dialog> = serde_json::from_value(expect_ok(response)?)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&dialogs)?);
            } else {
                println!("共 {} 个会话:\n", dialogs.len());
                for d in dialogs {
                    println!("  {} | {} | {} | 未读 {}", d.chat_id, d.kind, d.title, d.unread);
                }
            }
        }
        Commands::Participants { chat_id, json } => {
            let response = gateway(&settings)?
                .request(topics::PARTICIPANTS, json!({ "chat_id": chat_id }), REQUEST_TIMEOUT)
                .await?;
            let participants: Vec<Participant> = serde_json::from_value(expect_ok(response)?)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&participants)?);
            } else {
                println!("共 {} 个成员:\n", participants.len());
                for p in participants {
                    println!(
                        "  {} | {} | {}",
                        p.user_id,
                        p.display_name,
                        p.username.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Commands::Feedback {
            chat_id,
            msg_id,
            label,
        } => {
            let response = gateway(&settings)?
                .request(
                    topics::FEEDBACK,
                    json!({ "chat_id": chat_id, "msg_id": msg_id, "label": label }),
                    REQUEST_TIMEOUT,
                )
                .await?;
            expect_ok(response)?;
            println!("已记录反馈 {}:{} -> {}", chat_id, msg_id, label);
        }
        Commands::Reload => {
            let marker = settings.reload_marker_path();
            std::fs::create_dir_all(&settings.data_dir)?;
            std::fs::write(&marker, chrono::Utc::now().to_rfc3339())
                .with_context(|| format!("cannot write {}", marker.display()))?;
            println!("已请求重载，Worker 将在下一次轮询时加载 {}", settings.rules_path().display());
        }
        Commands::Recent { limit, json } => {
            let store = MessageStore::load_snapshot(settings.store_path())?;
            let records = store.recent(limit);
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("暂无消息记录");
            } else {
                for r in records {
                    let flag = if r.alerted {
                        "✓"
                    } else if r.rate_limited {
                        "⏸"
                    } else {
                        " "
                    };
                    let preview: String = r.text.chars().take(60).collect();
                    println!(
                        "{} [{:>5.2}] {} {} | {}",
                        flag,
                        r.score,
                        r.received_at.format("%m-%d %H:%M"),
                        r.channel_label(),
                        preview.replace('\n', " ")
                    );
                }
            }
        }
    }

    Ok(())
}

fn gateway(settings: &Settings) -> Result<IpcGateway> {
    let broker: Arc<dyn Broker> = Arc::new(
        FileBroker::open(settings.broker_dir()).context("cannot open broker state")?,
    );
    Ok(IpcGateway::new(broker, &settings.ipc))
}

fn expect_ok(response: IpcResponse) -> Result<serde_json::Value> {
    if !response.ok {
        bail!(
            "request failed: {}",
            response.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    Ok(response.data)
}

fn read_line(prompt: &str) -> Result<String> {
    eprint!("{}", prompt);
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let line = line.trim().to_string();
    if line.is_empty() {
        bail!("empty input");
    }
    Ok(line)
}
