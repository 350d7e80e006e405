use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use topology::RESERVATION_NAMESPACE;
use utils::version;

use crate::export::ExportConfig;

#[derive(Parser, Debug, Clone)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[arg(
        long,
        env = "TOPOLOGY_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Path of the node topology YAML file, e.g. /etc/fake-gpu/topology.yml"
    )]
    pub topology_file: PathBuf,

    #[arg(
        long,
        env = "EXPORT_ROOT",
        value_hint = clap::ValueHint::DirPath,
        default_value = ".",
        help = "Directory the runai/proc tree is exported to"
    )]
    pub export_root: PathBuf,

    #[arg(
        long,
        env = "RESERVATION_NAMESPACE",
        default_value = RESERVATION_NAMESPACE,
        help = "Only GPUs allocated from this namespace are exported"
    )]
    pub reservation_namespace: String,

    #[arg(
        long,
        env = "RESYNC_INTERVAL_SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Seconds between re-reads of the topology file, each re-read samples utilization again"
    )]
    pub resync_interval_secs: u64,
}

impl Cli {
    pub fn export_config(&self) -> ExportConfig {
        ExportConfig {
            root: self.export_root.clone(),
            reservation_namespace: self.reservation_namespace.clone(),
        }
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }
}
