//! macemu: Mac OS 9 emulator supervisor.
//!
//! `macemu serve` owns the emulator process and exposes the HTTP API. The
//! lifecycle verbs (`start`, `stop`, `pause`, ...) talk to that server, so
//! there is only ever one supervisor. `config`, `args`, `disks` and `isos`
//! work on the local files directly.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use serde_json::Value;

use macemu::context::SupervisorContext;
use macemu::logging;
use macemu::paths::MacemuPaths;
use macemu::settings::Settings;
use macemu::web::{self, ApiReply};

/// Mac OS 9 emulator supervisor
#[derive(Parser, Debug)]
#[command(name = "macemu", version, about = "Mac OS 9 emulator supervisor")]
struct Args {
    /// Base URL of a running `macemu serve`
    #[arg(long, global = true, default_value = "http://127.0.0.1:8080")]
    api: String,

    /// Log at info level on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the supervisor and its web API
    Serve {
        /// Listen address (overrides settings.toml)
        #[arg(long)]
        bind: Option<String>,
        /// Launch the emulator right away
        #[arg(long)]
        autostart: bool,
    },
    /// Launch the emulator
    Start,
    /// Quit the emulator (forced kill if it ignores quit)
    Stop,
    /// Hard-reset the guest
    Reset,
    /// Freeze the guest CPU
    Pause,
    /// Continue a paused guest
    Resume,
    /// Stop, then start with the saved configuration
    Restart,
    /// Show emulator and configuration status
    Status,
    /// Capture the guest screen to latest.png
    Screenshot,
    /// Show or edit qemu.conf
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Print the emulator command line the current configuration produces
    #[command(name = "args")]
    ShowArgs,
    /// List disk images
    Disks,
    /// List CD-ROM images
    Isos,
    /// Print the effective settings.toml
    Settings,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Show,
    /// Apply KEY=VALUE edits, e.g. `macemu config set RAM_MB=768 BOOT_DEVICE=c`
    Set {
        #[arg(required = true)]
        assignments: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };
    let paths = MacemuPaths::resolve();
    let _log_guard = logging::init(paths.as_ref().map(|p| p.logs.as_path()), args.verbose);

    match run(args, paths).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("macemu: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args, paths: Option<MacemuPaths>) -> Result<()> {
    let api = Api::new(&args.api);

    match args.command {
        Command::Start => api.post("/api/start").await,
        Command::Stop => api.post("/api/control/stop").await,
        Command::Reset => api.post("/api/control/reset").await,
        Command::Pause => api.post("/api/control/pause").await,
        Command::Resume => api.post("/api/control/resume").await,
        Command::Restart => api.post("/api/restart").await,
        Command::Screenshot => api.post("/api/screenshot").await,
        Command::Status => api.status().await,
        local => {
            let paths = paths.context("cannot resolve directories: set MACEMU_HOME or HOME")?;
            let settings = Settings::load(&paths.settings_file())?;
            run_local(local, paths, settings).await
        }
    }
}

async fn run_local(command: Command, paths: MacemuPaths, settings: Settings) -> Result<()> {
    match command {
        Command::Serve { bind, autostart } => {
            paths.ensure().context("creating directories")?;
            let bind = bind.unwrap_or_else(|| settings.web.bind.clone());
            let autostart = autostart || settings.web.autostart;

            let ctx = Arc::new(SupervisorContext::new(paths, settings));
            ctx.start_restart_policy();
            if autostart {
                match ctx.start_instance().await {
                    Ok(handle) => tracing::info!(generation = handle.generation, "autostarted emulator"),
                    Err(e) => tracing::error!(error = %e, "autostart failed"),
                }
            }
            web::serve(ctx, &bind).await
        }
        Command::Config { action } => {
            let ctx = SupervisorContext::new(paths, settings);
            match action {
                ConfigAction::Show => {
                    let loaded = ctx.store.load();
                    for w in &loaded.warnings {
                        eprintln!("warning: {w}");
                    }
                    print!("{}", loaded.config.to_file_contents());
                }
                ConfigAction::Set { assignments } => {
                    let mut config = ctx.store.load().config;
                    for assignment in &assignments {
                        let Some((key, value)) = assignment.split_once('=') else {
                            bail!("expected KEY=VALUE, got {assignment:?}");
                        };
                        config.set(key.trim(), value.trim())?;
                    }
                    ctx.store.update(&config)?;
                    println!("saved {}", ctx.store.path().display());
                }
            }
            Ok(())
        }
        Command::ShowArgs => {
            let ctx = SupervisorContext::new(paths, settings);
            let (command, _) = ctx.build_command()?;
            println!("{}", command.display());
            Ok(())
        }
        Command::Disks => {
            let ctx = SupervisorContext::new(paths, settings);
            for disk in ctx.images.list_disks().await? {
                println!(
                    "{:<32} {:>10} {:>10}",
                    disk.name,
                    disk.actual_size_human,
                    disk.virtual_size_human.as_deref().unwrap_or("?")
                );
            }
            Ok(())
        }
        Command::Isos => {
            let ctx = SupervisorContext::new(paths, settings);
            for iso in ctx.images.list_isos()? {
                println!("{:<40} {:>10}", iso.name, iso.size_human);
            }
            Ok(())
        }
        Command::Settings => {
            print!("{}", settings.to_toml());
            Ok(())
        }
        remote => bail!("{remote:?} is handled by the server"),
    }
}

// ---------------------------------------------------------------------------
// API client
// ---------------------------------------------------------------------------

struct Api {
    base: String,
    client: reqwest::Client,
}

impl Api {
    fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// POST an action and print its output; fails when the server reports
    /// `success: false`.
    async fn post(&self, path: &str) -> Result<()> {
        let url = format!("{}{path}", self.base);
        let reply: ApiReply = self
            .client
            .post(&url)
            .send()
            .await
            .with_context(|| format!("is `macemu serve` running? ({url})"))?
            .json()
            .await
            .context("unexpected reply from server")?;

        if !reply.success {
            bail!("{}", reply.error.unwrap_or_else(|| "request failed".to_string()));
        }
        if let Some(output) = reply.output {
            println!("{}", output.trim_end());
        }
        Ok(())
    }

    async fn status(&self) -> Result<()> {
        let url = format!("{}/api/status", self.base);
        let status: Value = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("is `macemu serve` running? ({url})"))?
            .error_for_status()?
            .json()
            .await?;

        let instance = &status["instance"];
        if status["running"].as_bool() == Some(true) {
            println!(
                "Emulator is {} (PID {}, instance {})",
                instance["state"].as_str().unwrap_or("running"),
                status["pid"],
                instance["generation"]
            );
        } else if instance.is_null() {
            println!("Emulator is not running");
        } else {
            println!(
                "Emulator is not running (instance {} {})",
                instance["generation"],
                instance["state"].as_str().unwrap_or("stopped")
            );
        }

        let config = &status["config"];
        println!(
            "RAM {} MB, boot {}, {}x{}, VNC :{}",
            config["memory_mb"],
            config["boot_device"].as_str().unwrap_or("?"),
            config["screen_width"],
            config["screen_height"],
            config["display_index"]
        );
        if status["config_changed"].as_bool() == Some(true) {
            println!("Saved configuration differs from the running instance; restart to apply");
        }
        if let Some(warnings) = status["config_warnings"].as_array() {
            for w in warnings.iter().filter_map(Value::as_str) {
                println!("warning: {w}");
            }
        }
        Ok(())
    }
}
