use anyhow::{Context, Result};
use avctl::client::RemoteClient;
use avctl::config::Settings;
use avctl::device::serial::list_devices;
use avctl::device::{self, Choice, Connection, DeviceError, DeviceKind};
use avctl::protocol::CommandRequest;
use avctl::server::CommandServer;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "avctl")]
#[command(about = "Control AV projectors and receivers over a serial line")]
#[command(version = "0.1.0")]
struct Cli {
    /// Config file (default: ~/.config/avctl/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Attached device, overrides the config file
    #[arg(long, global = true, value_enum)]
    device: Option<DeviceKind>,

    /// Serial device to use instead of probing every port
    #[arg(long, global = true)]
    serial: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe serial devices for the connected device and exit
    Probe {
        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Run one command on the device ("help" lists commands)
    Exec {
        command: String,

        /// Leave out or pass "help" to list accepted arguments
        argument: Option<String>,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Keep running as a network service
    Server {
        /// UDP port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Detach from the terminal and run in the background
        #[arg(long)]
        detach: bool,
    },

    /// Send one command to a running server
    Remote {
        command: String,

        argument: Option<String>,

        /// Server host (default: broadcast on the local network)
        #[arg(long)]
        host: Option<String>,

        /// Server UDP port
        #[arg(long)]
        port: Option<u16>,
    },

    /// List serial devices
    Devices,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum OutputFormat {
    Text,
    Json,
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load(),
    };

    if let Some(device) = cli.device {
        settings.device = device;
    }
    if let Some(serial) = &cli.serial {
        settings.serial_device = Some(serial.clone());
    }
    Ok(settings)
}

/// Find the configured device, probing every serial port unless one is set
fn connect(settings: &Settings) -> Result<Connection, DeviceError> {
    let config = settings.serial_config().map_err(DeviceError::OpenFailed)?;
    let candidates = match &settings.serial_device {
        Some(path) => vec![path.clone()],
        None => list_devices(),
    };
    log::debug!("probing {} serial device(s)", candidates.len());
    device::connect(settings.device, &config, &candidates)
}

fn print_choices(title: &str, choices: &[Choice], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            let width = choices.iter().map(|c| c.name.len()).max().unwrap_or(0);
            println!("{}", title);
            println!();
            for choice in choices {
                println!("\t{:<width$} ... {}", choice.name, choice.description, width = width);
            }
            println!();
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(choices)?),
    }
    Ok(())
}

fn print_usage(kind: DeviceKind, format: OutputFormat) -> Result<()> {
    print_choices("possible commands are:", kind.commands(), format)?;
    if matches!(format, OutputFormat::Text) {
        println!("return codes:");
        println!();
        println!("\t0 ... ok");
        for (code, meaning) in device::EXIT_CODES {
            println!("\t{} ... {}", code, meaning);
        }
        println!();
    }
    Ok(())
}

fn report_error(error: &DeviceError, format: OutputFormat) -> Result<ExitCode> {
    match format {
        OutputFormat::Text => println!("{}!", error),
        OutputFormat::Json => {
            let json = serde_json::json!({
                "error": error.to_string(),
                "code": error.exit_code(),
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
    }
    if let Some(source) = std::error::Error::source(error) {
        log::debug!("{}", source);
    }
    Ok(ExitCode::from(error.exit_code()))
}

fn probe(settings: &Settings, format: OutputFormat) -> Result<ExitCode> {
    let connection = match connect(settings) {
        Ok(connection) => connection,
        Err(e) => return report_error(&e, format),
    };

    match format {
        OutputFormat::Text => println!(
            "found {} on {}",
            connection.device.name(),
            connection.path.display()
        ),
        OutputFormat::Json => {
            let json = serde_json::json!({
                "device": connection.device.name(),
                "path": connection.path,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn exec(
    settings: &Settings,
    command: &str,
    argument: Option<&str>,
    format: OutputFormat,
) -> Result<ExitCode> {
    let kind = settings.device;
    if command == "help" {
        print_usage(kind, format)?;
        return Ok(ExitCode::SUCCESS);
    }
    if let Some(choices) = kind.arguments(command)
        && matches!(argument, None | Some("help"))
    {
        print_choices(
            &format!("possible {} arguments are:", command),
            choices,
            format,
        )?;
        return Ok(ExitCode::SUCCESS);
    }

    let mut connection = match connect(settings) {
        Ok(connection) => connection,
        Err(e) => return report_error(&e, format),
    };

    let argument = argument.unwrap_or("");
    match connection.device.execute(command, argument) {
        Ok(response) => {
            match format {
                OutputFormat::Text => println!("{}", response),
                OutputFormat::Json => {
                    let json = serde_json::json!({
                        "command": command,
                        "argument": argument,
                        "response": response,
                    });
                    println!("{}", serde_json::to_string_pretty(&json)?);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => report_error(&e, format),
    }
}

fn serve(settings: &Settings, port: u16, detach: bool) -> Result<ExitCode> {
    let connection = match connect(settings) {
        Ok(connection) => connection,
        Err(e) => return report_error(&e, OutputFormat::Text),
    };
    log::info!(
        "serving {} on {}",
        connection.device.name(),
        connection.path.display()
    );

    // Fork before any runtime threads exist
    if detach {
        nix::unistd::daemon(false, false).context("Failed to detach from terminal")?;
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(async {
        let server = CommandServer::start(connection.device, port)?;
        server.run().await
    })?;
    Ok(ExitCode::SUCCESS)
}

fn run(cli: Cli) -> Result<ExitCode> {
    let settings = load_settings(&cli)?;

    match cli.command {
        Commands::Probe { format } => probe(&settings, format),

        Commands::Exec {
            command,
            argument,
            format,
        } => exec(&settings, &command, argument.as_deref(), format),

        Commands::Server { port, detach } => {
            serve(&settings, port.unwrap_or(settings.port), detach)
        }

        Commands::Remote {
            command,
            argument,
            host,
            port,
        } => {
            let client = RemoteClient::new(
                host.or_else(|| settings.host.clone()),
                port.unwrap_or(settings.port),
            );
            let request = CommandRequest::new(command, argument);
            client.send(&request)?;
            log::info!("sent \"{}\" to {}", request, client.target());
            Ok(ExitCode::SUCCESS)
        }

        Commands::Devices => {
            let devices = list_devices();
            if devices.is_empty() {
                println!("No serial devices found");
            }
            for path in devices {
                println!("{}", path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
