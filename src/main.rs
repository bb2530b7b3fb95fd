use std::path::PathBuf;
use std::sync::Arc;

use build_time::build_time_local;
use clap::Subcommand;
use clap::{Args, Parser};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::client::ArrayClient;
use crate::config::DriverConfig;
use crate::driver::{BlockDeviceVolume, BlockDriver};
use crate::iscsi::IscsiSession;
use crate::rest::K2RestTransport;
use crate::runner::{CommandRunner, HostCommandRunner};

pub mod capacity;
pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod iscsi;
pub mod records;
pub mod rest;
pub mod runner;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(
        long,
        env = "K2_AGENT_CONFIG",
        default_value = config::DEFAULT_AGENT_CONFIG,
        help = "Path to the agent configuration file"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new volume for a dataset
    Create(CreateArgs),
    /// Attach a volume to a node
    Attach(AttachArgs),
    /// Detach a volume from the host it is mapped to
    Detach(VolumeArgs),
    /// Destroy a volume and its volume group
    Destroy(VolumeArgs),
    /// List all volumes with their attachment state
    List,
    /// Print the local device path of an attached volume
    DevicePath(VolumeArgs),
    /// Print this node's identity
    InstanceId,
    /// Print the minimum allocatable volume size in bytes
    AllocationUnit,
}

#[derive(Args)]
struct CreateArgs {
    dataset_id: Uuid,
    size_bytes: u64,
}

#[derive(Args)]
struct AttachArgs {
    blockdevice_id: String,

    #[clap(
        long,
        env = "NODE_NAME",
        help = "The node to attach to, defaults to this node's hostname"
    )]
    node: Option<String>,
}

#[derive(Args)]
struct VolumeArgs {
    blockdevice_id: String,
}

fn print_volume(volume: &BlockDeviceVolume) {
    println!(
        "{} dataset={} size={} attached_to={}",
        volume.blockdevice_id,
        volume.dataset_id,
        volume.size,
        volume.attached_to.as_deref().unwrap_or("-")
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!(
        "Running {} v{} built at {}",
        config::DRIVER_NAME,
        config::VERSION,
        build_time_local!()
    );

    let cli = Cli::parse();
    let config = DriverConfig::load(&cli.config)?;

    let transport = Arc::new(K2RestTransport::connect(&config)?);
    let client = Arc::new(ArrayClient::new(transport, config.retries()));
    let runner: Arc<dyn CommandRunner> = Arc::new(HostCommandRunner);
    let iscsi = IscsiSession::new(runner.clone());
    let driver = BlockDriver::new(&config, client, iscsi, runner)?;

    match cli.command {
        Command::Create(args) => {
            let volume = driver.create_volume(args.dataset_id, args.size_bytes).await?;
            print_volume(&volume);
        }
        Command::Attach(args) => {
            let node = match args.node {
                Some(node) => node,
                None => driver.compute_instance_id()?,
            };
            let volume = driver.attach_volume(&args.blockdevice_id, &node).await?;
            print_volume(&volume);
        }
        Command::Detach(args) => {
            driver.detach_volume(&args.blockdevice_id).await?;
            println!("Detached {}", args.blockdevice_id);
        }
        Command::Destroy(args) => {
            driver.destroy_volume(&args.blockdevice_id).await?;
            println!("Destroyed {}", args.blockdevice_id);
        }
        Command::List => {
            for volume in driver.list_volumes().await? {
                print_volume(&volume);
            }
        }
        Command::DevicePath(args) => {
            match driver.get_device_path(&args.blockdevice_id).await? {
                Some(path) => println!("{}", path.display()),
                None => println!("(not discovered yet)"),
            }
        }
        Command::InstanceId => {
            println!("{}", driver.compute_instance_id()?);
        }
        Command::AllocationUnit => {
            println!("{}", driver.allocation_unit());
        }
    }

    Ok(())
}
