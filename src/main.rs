use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use dbgadapter::{ClientConfig, DebugClient, InterruptEvent};

/// Command-line client for a remote debug agent
#[derive(Parser, Debug)]
#[command(name = "remdbg")]
#[command(version)]
#[command(about = "Command-line client for a remote debug agent", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Target host (overrides the configuration file)
    #[arg(long)]
    host: Option<String>,
    /// Target port (overrides the configuration file)
    #[arg(long)]
    port: Option<u16>,
    /// More logging; repeat for protocol traces
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the debug agent version
    Version,
    /// Show the extended firmware version (0 when absent)
    FwVersion,
    /// List the threads of a process
    Threads {
        pid: i32,
    },
    /// Dump the general registers of one thread
    Regs {
        pid: i32,
        lwpid: u32,
    },
    /// Attach and print interrupts until Ctrl-C
    Watch {
        pid: i32,
    },
    /// Show a notification on the target screen
    Notify {
        text: String,
        /// Notification kind
        #[arg(long, default_value_t = 222)]
        kind: i32,
    },
    /// Show the kernel base address
    KernelBase,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    if let Err(e) = simple_logger::SimpleLogger::new().with_level(level).init() {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    if let Err(e) = run(cli).await {
        log::error!("{}", e);
        process::exit(1);
    }
}

fn load_config(cli: &Cli) -> dbgadapter::Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    Ok(config)
}

async fn run(cli: Cli) -> dbgadapter::Result<()> {
    let config = load_config(&cli)?;
    let client: DebugClient = DebugClient::new(config);
    client.connect().await?;

    let result = run_command(&client, cli.command).await;
    if let Err(e) = client.disconnect().await {
        log::warn!("Disconnect failed: {}", e);
    }
    result
}

async fn run_command(client: &DebugClient, command: Commands) -> dbgadapter::Result<()> {
    match command {
        Commands::Version => {
            println!("{}", client.debugger_version().await?);
        }
        Commands::FwVersion => {
            println!("{}", client.ext_fw_version().await);
        }
        Commands::Threads { pid } => {
            let (handler, _events) = dbgadapter::channel_handler();
            client.attach(pid, handler).await?;
            let listed = list_threads(client).await;
            client.detach().await?;
            listed?;
        }
        Commands::Regs { pid, lwpid } => {
            let (handler, _events) = dbgadapter::channel_handler();
            client.attach(pid, handler).await?;
            let fetched = client.get_registers(lwpid).await;
            client.detach().await?;
            println!("{:#X?}", fetched?);
        }
        Commands::Watch { pid } => {
            let mut events = client.attach_with_channel(pid).await?;
            log::info!("Watching pid {}, press Ctrl-C to detach", pid);
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Some(event) => print_interrupt(&event),
                        None => break,
                    },
                }
            }
            client.detach().await?;
        }
        Commands::Notify { text, kind } => {
            client.notify(kind, &text).await?;
        }
        Commands::KernelBase => {
            println!("0x{:016X}", client.kernel_base().await?);
        }
    }
    Ok(())
}

async fn list_threads(client: &DebugClient) -> dbgadapter::Result<()> {
    for lwpid in client.list_threads().await? {
        let info = client.thread_info(lwpid).await?;
        println!("{:>8}  prio {:>4}  {}", lwpid, info.priority, info.name);
    }
    Ok(())
}

fn print_interrupt(event: &InterruptEvent) {
    println!(
        "lwpid {} ({}) status 0x{:X} rip 0x{:016X} rsp 0x{:016X}",
        event.lwpid, event.thread_name, event.status, event.registers.rip, event.registers.rsp
    );
}
