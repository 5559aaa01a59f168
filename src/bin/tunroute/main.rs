use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use ipnetwork::IpNetwork;
use tunroute::config::{self, CONFIG_FILE, Config, Overrides, Verbosity};
use tunroute::family::AddressFamily;

#[cfg(target_os = "linux")]
mod service;

#[derive(Args, Debug)]
pub struct UpArgs {
    #[clap(long)]
    pub config_dir: PathBuf,
    /// Tunnel interface, overrides the config file.
    #[clap(long)]
    pub interface: Option<String>,
    #[arg(long = "family", value_enum)]
    pub families: Vec<AddressFamily>,
    /// Destination routed outside the tunnel, e.g. the VPN server endpoint. May be repeated.
    #[arg(long = "exception")]
    pub exceptions: Vec<IpNetwork>,
    #[clap(long)]
    pub verbosity: Option<u8>,
}

impl UpArgs {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            interface: self.interface.clone(),
            families: self.families.clone(),
            exceptions: self.exceptions.clone(),
            verbosity: self.verbosity,
        }
    }
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    #[clap(long, default_value = "tun0")]
    pub interface: String,
    /// Defaults to both families.
    #[arg(long = "family", value_enum)]
    pub families: Vec<AddressFamily>,
}

#[derive(Args, Debug)]
pub struct InitConfigArgs {
    #[clap(long)]
    pub config_dir: PathBuf,
    /// Replace an existing config file.
    #[clap(long)]
    pub force: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Route all traffic through the tunnel interface until interrupted.
    Up(UpArgs),
    /// Print tunnel addresses and default routes without changing anything.
    Show(ShowArgs),
    InitConfig(InitConfigArgs),
}

#[derive(Parser)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Up(args) => run_up(args),
        Command::Show(args) => run_show(args),
        Command::InitConfig(args) => init_config(args),
    }
}

fn init_config(args: InitConfigArgs) -> anyhow::Result<()> {
    tunroute::logging::init(Verbosity::default().0)?;
    let path = args.config_dir.join(CONFIG_FILE);
    if path.exists() && !args.force {
        anyhow::bail!("{} already exists, pass --force to replace it", path.display());
    }
    config::save(&args.config_dir, &Config::default())?;
    println!("{}", path.display());
    Ok(())
}

#[cfg(target_os = "linux")]
fn run_up(args: UpArgs) -> anyhow::Result<()> {
    service::up(args)
}

#[cfg(target_os = "linux")]
fn run_show(args: ShowArgs) -> anyhow::Result<()> {
    service::show(args)
}

#[cfg(not(target_os = "linux"))]
fn run_up(_args: UpArgs) -> anyhow::Result<()> {
    anyhow::bail!("unsupported OS");
}

#[cfg(not(target_os = "linux"))]
fn run_show(_args: ShowArgs) -> anyhow::Result<()> {
    anyhow::bail!("unsupported OS");
}
