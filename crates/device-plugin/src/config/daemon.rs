use std::path::PathBuf;

use clap::Parser;

use crate::platform::k8s::constants;

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "GPUSHARE_MPS",
        help = "Enable or disable MPS",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub mps: bool,

    #[arg(
        long,
        env = "GPUSHARE_HEALTH_CHECK",
        help = "Enable or disable health check",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub health_check: bool,

    #[arg(
        long,
        env = "GPUSHARE_MEMORY_UNIT",
        default_value = "MiB",
        help = "Unit of the GPU memory slices, supports 'GiB' and 'MiB'"
    )]
    pub memory_unit: String,

    #[arg(
        long,
        env = "GPUSHARE_DEVICE_PLUGIN_PATH",
        value_hint = clap::ValueHint::DirPath,
        default_value = constants::DEVICE_PLUGIN_PATH,
        help = "Kubelet device plugin directory, holds kubelet.sock and the plugin socket"
    )]
    pub device_plugin_path: PathBuf,

    #[arg(
        long,
        env = "GPUSHARE_DUMP_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = constants::DUMP_DIR,
        help = "Directory for diagnostic dumps written on SIGQUIT"
    )]
    pub dump_dir: PathBuf,

    #[arg(
        long,
        env = "GPUSHARE_LOG_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = "/var/log",
        help = "Directory for the rolling log file"
    )]
    pub log_dir: PathBuf,

    #[arg(
        long,
        default_value = "5",
        help = "Seconds to wait before retrying a failed plugin restart"
    )]
    pub restart_interval_secs: u64,
}
