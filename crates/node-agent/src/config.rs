use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::backend::SysfsVfioManager;
use crate::cdi::CdiSpecWriter;
use crate::checkpoint::FileCheckpointStore;
use crate::lock::FileLock;
use crate::prepare::ServiceConfig;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(flatten)]
    pub agent: AgentArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Prepare the devices of a claim from a JSON request file
    Prepare(PrepareArgs),
    /// Release the devices of a prepared claim
    Unprepare(UnprepareArgs),
    /// Print the checkpoint document
    #[command(name = "show-checkpoint")]
    ShowCheckpoint,
}

#[derive(Args, Clone, Debug)]
pub struct AgentArgs {
    #[arg(
        long,
        global = true,
        env = "NODE_AGENT_CHECKPOINT_PATH",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/var/lib/node-agent/checkpoint.json",
        help = "Path of the checkpoint document"
    )]
    pub checkpoint_path: PathBuf,

    #[arg(
        long,
        global = true,
        env = "NODE_AGENT_LOCK_PATH",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/var/lib/node-agent/pu.lock",
        help = "Lock file serializing prepare/unprepare on this node"
    )]
    pub lock_path: PathBuf,

    #[arg(
        long,
        global = true,
        default_value = "100",
        help = "Interval between attempts to take the node lock, in milliseconds"
    )]
    pub lock_poll_interval_ms: u64,

    #[arg(
        long,
        global = true,
        env = "NODE_AGENT_CDI_ROOT",
        value_hint = clap::ValueHint::DirPath,
        default_value = "/var/run/cdi",
        help = "Directory the CDI specs are written to"
    )]
    pub cdi_root: PathBuf,

    #[arg(
        long,
        global = true,
        env = "NODE_AGENT_CDI_KIND",
        default_value = "nvidia.com/gpu",
        help = "CDI vendor/class of the generated devices"
    )]
    pub cdi_kind: String,

    #[arg(
        long,
        global = true,
        value_hint = clap::ValueHint::DirPath,
        default_value = "/sys",
        help = "Root of the sysfs tree used for VFIO binding"
    )]
    pub sysfs_root: PathBuf,

    #[arg(
        long,
        global = true,
        env = "NODE_AGENT_ENABLE_VFIO",
        help = "Enable VFIO passthrough through sysfs",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub enable_vfio: bool,

    #[arg(
        long,
        global = true,
        env = utils::logging::LOG_PATH_ENV_VAR,
        value_hint = clap::ValueHint::FilePath,
        help = "Also write logs to this file, rotated daily"
    )]
    pub log_path: Option<PathBuf>,
}

impl AgentArgs {
    /// Builds the service collaborators from the command line.
    pub fn service_config(&self) -> ServiceConfig {
        let config = ServiceConfig::new(
            Arc::new(FileCheckpointStore::new(&self.checkpoint_path)),
            Arc::new(FileLock::new(
                &self.lock_path,
                Duration::from_millis(self.lock_poll_interval_ms),
            )),
            Arc::new(CdiSpecWriter::new(&self.cdi_root, &self.cdi_kind)),
        );
        if self.enable_vfio {
            config.with_vfio(Arc::new(SysfsVfioManager::new(&self.sysfs_root)))
        } else {
            config
        }
    }
}

#[derive(Args, Clone, Debug)]
pub struct PrepareArgs {
    #[arg(long, help = "Claim UID; overrides the one in the request file")]
    pub claim_id: Option<String>,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "JSON file holding the prepare request"
    )]
    pub request: PathBuf,

    #[arg(long, help = "Request exclusive VFIO passthrough")]
    pub vfio: bool,
}

#[derive(Args, Clone, Debug)]
pub struct UnprepareArgs {
    #[arg(long, help = "Claim UID")]
    pub claim_id: String,
}
