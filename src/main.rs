use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;

use cloudbox::config::{Environment, PollPolicy};
use cloudbox::machine::Machine;
use cloudbox::provider::http::HttpProvider;
use cloudbox::remote::guard::RemoteTask;
use cloudbox::remote::SshExecutor;
use cloudbox::role::RoleDescriptor;

#[derive(Parser)]
#[command(name = "cloudbox", about = "Role-based cloud instance lifecycle manager")]
struct Cli {
    /// Control-plane API base URL; falls back to CLOUDBOX_API_URL
    #[arg(long)]
    api_url: Option<String>,

    /// YAML file holding the list of role descriptors
    #[arg(long, default_value = "roles.yaml")]
    roles: PathBuf,

    /// Role to operate on, e.g. "cluster-leader"
    #[arg(long)]
    role: String,

    /// Environment file; falls back to CLOUDBOX_REGION / CLOUDBOX_ZONE /
    /// CLOUDBOX_NAMESPACE
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Provider key pair for new instances
    #[arg(long, default_value = "default")]
    key_name: String,

    /// SSH private key; the agent is used when omitted
    #[arg(long)]
    ssh_key: Option<String>,

    /// Which instance of the role to act on when several exist, oldest
    /// first (see `list`)
    #[arg(long)]
    ordinal: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch a new instance for the role and wait until it is reachable
    Create,
    /// List the role's instances, oldest first
    List,
    /// Start a stopped instance
    Start,
    /// Stop a running instance
    Stop,
    /// Stop, then start, waiting for full readiness
    Reboot,
    /// Terminate the instance
    Terminate {
        /// Return as soon as termination is requested
        #[arg(long)]
        no_wait: bool,
    },
    /// Snapshot the stopped instance into an image
    Image,
    /// List images taken of the role, oldest first
    Images,
    /// Ensure a named volume exists; optionally attach it
    Volume {
        name: String,
        #[arg(long, default_value_t = 100)]
        size_gb: u32,
        /// Device to attach the volume at, e.g. /dev/sdf
        #[arg(long)]
        attach: Option<String>,
    },
    /// Run a command on the instance
    Run { command: String },
    /// Print the instance's ssh destination (user@host)
    Ssh,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cloudbox=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    let env = match &cli.env_file {
        Some(path) => Environment::from_file(path)
            .with_context(|| format!("loading environment from {}", path.display()))?,
        None => Environment::from_env().context("loading environment from CLOUDBOX_* variables")?,
    };
    let role = load_role(&cli.roles, &cli.role)?;

    let api_url = match cli.api_url.clone() {
        Some(url) => url,
        None => std::env::var("CLOUDBOX_API_URL")
            .context("control-plane URL missing: pass --api-url or set CLOUDBOX_API_URL")?,
    };
    let provider = Arc::new(HttpProvider::new(api_url));
    let executor = Arc::new(SshExecutor::new(
        cli.ssh_key.clone(),
        22,
        Duration::from_secs(5),
    ));

    let mut machine = Machine::new(
        role,
        env,
        provider,
        executor,
        PollPolicy::default(),
        &cli.key_name,
    );

    match cli.command {
        Command::Create => {
            machine.create().await?;
            println!(
                "{} ready at {}",
                machine.instance_id().unwrap_or("?"),
                machine.host_name().unwrap_or("?")
            );
        }
        Command::List => {
            for (ordinal, instance) in machine.list().await?.iter().enumerate() {
                println!(
                    "{ordinal}\t{}\t{}\t{}\t{}",
                    instance.id,
                    instance.state,
                    instance.public_host.as_deref().unwrap_or("-"),
                    instance.launched_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        Command::Start => {
            machine.adopt(cli.ordinal, false).await?;
            machine.start().await?;
            println!("started, ready at {}", machine.host_name().unwrap_or("?"));
        }
        Command::Stop => {
            machine.adopt(cli.ordinal, false).await?;
            machine.stop().await?;
            println!("stopped");
        }
        Command::Reboot => {
            machine.adopt(cli.ordinal, false).await?;
            machine.reboot().await?;
            println!("rebooted, ready at {}", machine.host_name().unwrap_or("?"));
        }
        Command::Terminate { no_wait } => {
            machine.adopt(cli.ordinal, false).await?;
            machine.terminate(!no_wait).await?;
            println!("terminated");
        }
        Command::Image => {
            machine.adopt(cli.ordinal, false).await?;
            let image_id = machine.create_image().await?;
            println!("{image_id}");
        }
        Command::Images => {
            for image in machine.list_images().await? {
                println!("{}\t{}\t{}", image.id, image.state, image.name);
            }
        }
        Command::Volume {
            name,
            size_gb,
            attach,
        } => {
            let volume = machine.ensure_volume(&name, size_gb).await?;
            println!("{}", volume.id);
            if let Some(device) = attach {
                machine.adopt(cli.ordinal, false).await?;
                machine.attach_volume(&volume, &device).await?;
                println!("attached at {device}");
            }
        }
        Command::Run { command } => {
            machine.adopt(cli.ordinal, false).await?;
            let output = machine.run_remote(&RemoteTask::direct(command)).await?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
        }
        Command::Ssh => {
            machine.adopt(cli.ordinal, false).await?;
            println!("{}", machine.ssh_destination()?);
        }
    }
    Ok(())
}

/// Look a role up by name in the roles file.
fn load_role(path: &PathBuf, name: &str) -> Result<RoleDescriptor> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading roles from {}", path.display()))?;
    let mut roles: Vec<RoleDescriptor> =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    match roles.iter().position(|r| r.name == name) {
        Some(i) => Ok(roles.swap_remove(i)),
        None => {
            let known: Vec<&str> = roles.iter().map(|r| r.name.as_str()).collect();
            bail!("unknown role '{name}', roles file defines: {}", known.join(", "))
        }
    }
}
