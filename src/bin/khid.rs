//! KHID command line client
//!
//! Runs one AS terminal operation per invocation and prints the result as
//! JSON lines on stdout. Logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use khid::json_output::{output, output_event};
use khid::{
    pack_threads, Config, ProgramText, RobotController, SnapshotFilter, StatusPoller,
    SyntaxPolicy, ThreadMask,
};

const DEFAULT_CONFIG: &str = "config/default_config.yaml";

#[derive(Parser)]
#[command(name = "khid")]
#[command(about = "Kawasaki AS terminal driver - status, upload and program control")]
#[command(version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Controller address, overrides the configuration
    #[arg(long, global = true)]
    host: Option<String>,

    /// Controller port (23 for a robot, 9105 for K-ROSET)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Debug logging, including every frame sent and received
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show PC thread status
    Status {
        /// Threads to query, e.g. 1,3
        #[arg(long, value_delimiter = ',')]
        threads: Option<Vec<u8>>,
    },
    /// Show RCP status
    RcpStatus,
    /// Show controller switches and active error
    RobotState,
    /// List programs stored on the controller
    Programs,
    /// Upload an AS program file
    Upload {
        file: String,
        /// Program name when the file has no .PROGRAM header
        #[arg(long)]
        name: Option<String>,
        /// Abort the upload on the first syntax error
        #[arg(long)]
        strict: bool,
    },
    /// Delete a program that is not loaded anywhere
    Delete { name: String },
    /// Run a program in a PC thread
    PcExec { name: String, thread: u8 },
    /// Abort PC threads, e.g. 1,2
    PcAbort {
        #[arg(value_delimiter = ',')]
        threads: Vec<u8>,
    },
    /// End PC threads after their current cycle
    PcEnd {
        #[arg(value_delimiter = ',')]
        threads: Vec<u8>,
    },
    /// Unload programs from PC threads
    PcKill {
        #[arg(value_delimiter = ',')]
        threads: Vec<u8>,
    },
    /// Run a program as the robot control program
    RcpExec {
        name: String,
        /// Wait until the program stops
        #[arg(long)]
        wait: bool,
    },
    /// Abort the robot control program
    RcpAbort,
    /// Unload the robot control program
    RcpKill,
    /// Hold the robot control program
    Hold,
    /// Continue a held robot control program
    Continue {
        #[arg(long)]
        wait: bool,
    },
    /// Clear the controller error state
    Ereset,
    /// Turn a system switch on or off
    Switch {
        name: String,
        /// Turn the switch off instead of on
        #[arg(long)]
        off: bool,
    },
    /// Poll status until interrupted
    Watch {
        /// Print only snapshots that differ from the previous one
        #[arg(long)]
        changes: bool,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Status { .. } => "status",
            Commands::RcpStatus => "rcp-status",
            Commands::RobotState => "robot-state",
            Commands::Programs => "programs",
            Commands::Upload { .. } => "upload",
            Commands::Delete { .. } => "delete",
            Commands::PcExec { .. } => "pc-exec",
            Commands::PcAbort { .. } => "pc-abort",
            Commands::PcEnd { .. } => "pc-end",
            Commands::PcKill { .. } => "pc-kill",
            Commands::RcpExec { .. } => "rcp-exec",
            Commands::RcpAbort => "rcp-abort",
            Commands::RcpKill => "rcp-kill",
            Commands::Hold => "hold",
            Commands::Continue { .. } => "continue",
            Commands::Ereset => "ereset",
            Commands::Switch { .. } => "switch",
            Commands::Watch { .. } => "watch",
        }
    }
}

impl Args {
    fn get_config_path(&self) -> Option<String> {
        self.config
            .clone()
            .or_else(|| std::env::var("DEFAULT_CONFIG_PATH").ok())
    }

    fn load_config(&self) -> Result<Config> {
        let mut config = match self.get_config_path() {
            Some(path) => Config::load_from_path(&path)
                .with_context(|| format!("Failed to load config from {}", path))?,
            None if Path::new(DEFAULT_CONFIG).exists() => Config::load_from_path(DEFAULT_CONFIG)
                .with_context(|| format!("Failed to load config from {}", DEFAULT_CONFIG))?,
            None => {
                debug!("No config file, using defaults");
                Config::for_host("127.0.0.1", khid::protocol::KROSET_PORT)
            }
        };

        if let Some(host) = &self.host {
            config.robot.host = host.clone();
        }
        if let Some(port) = self.port {
            config.robot.port = Some(port);
        }
        if let Commands::Upload { strict: true, .. } = self.command {
            config.upload.syntax_errors = Some(SyntaxPolicy::Strict);
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let config = args.load_config()?;
    info!("Robot: {}:{}", config.robot.host, config.robot.port());

    let name = args.command.name();
    let result = match RobotController::connect(config).await {
        Ok(robot) => {
            let result = run(&robot, &args.command).await;
            if let Err(e) = robot.shutdown().await {
                debug!("Shutdown: {}", e);
            }
            result
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            output::command_completed(name);
            Ok(())
        }
        Err(e) => {
            output::command_failed(name, &e);
            Err(e).with_context(|| format!("{} failed", name))
        }
    }
}

async fn run(robot: &RobotController, command: &Commands) -> khid::Result<()> {
    match command {
        Commands::Status { threads } => {
            let mask = match threads {
                Some(threads) => pack_threads(threads)?,
                None => ThreadMask::from_threads(&robot.config().polling.threads())?,
            };
            output::data("pc_status", robot.pc_status(mask).await?);
        }
        Commands::RcpStatus => output::data("rcp_status", robot.rcp_status().await?),
        Commands::RobotState => output::data("robot_state", robot.robot_state().await?),
        Commands::Programs => output::data("programs", robot.list_programs().await?),
        Commands::Upload { file, name, .. } => {
            let text = std::fs::read_to_string(file)?;
            let program = match name {
                Some(name) => ProgramText::new(name, &text)?,
                None => ProgramText::parse(&text)?,
            };
            let outcome = robot.upload_program(&program).await?;
            output::upload(program.name(), &outcome);
        }
        Commands::Delete { name } => robot.delete_program(name).await?,
        Commands::PcExec { name, thread } => robot.pc_execute(name, *thread).await?,
        Commands::PcAbort { threads } => robot.pc_abort(pack_threads(threads)?).await?,
        Commands::PcEnd { threads } => robot.pc_end(pack_threads(threads)?).await?,
        Commands::PcKill { threads } => robot.pc_kill(pack_threads(threads)?).await?,
        Commands::RcpExec { name, wait } => {
            output::data("rcp_outcome", robot.rcp_execute(name, *wait).await?)
        }
        Commands::RcpAbort => robot.rcp_abort().await?,
        Commands::RcpKill => robot.kill_rcp().await?,
        Commands::Hold => robot.rcp_hold().await?,
        Commands::Continue { wait } => {
            output::data("rcp_outcome", robot.rcp_continue(*wait).await?)
        }
        Commands::Ereset => robot.ereset().await?,
        Commands::Switch { name, off } => robot.set_switch(name, !off).await?,
        Commands::Watch { changes } => watch(robot.config(), *changes).await?,
    }
    Ok(())
}

async fn watch(config: &Config, changes: bool) -> khid::Result<()> {
    let mut poller = StatusPoller::start(config).await?;
    let mut filter = SnapshotFilter::new(changes);
    info!("Watching controller status, Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            snapshot = poller.next_snapshot() => match snapshot {
                Some(snapshot) => {
                    if filter.should_output(&snapshot) {
                        output_event(&snapshot);
                    }
                }
                None => break,
            }
        }
    }
    poller.stop().await
}
