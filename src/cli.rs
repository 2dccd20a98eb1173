use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "mcpvm", about = "Disposable RHEL test VMs on libvirt, UTM, or vfkit")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create, start, and provision a new VM
    Setup {
        /// OS version, e.g. 9.5
        #[arg(long)]
        version: String,

        /// Ansible playbook to run once the VM is reachable
        #[arg(long)]
        playbook: Option<PathBuf>,

        /// VM name (generated when omitted)
        name: Option<String>,
    },

    /// List VMs and their state
    List {
        /// Print names only
        #[arg(long)]
        name_only: bool,
    },

    /// Start a stopped VM
    Start { name: String },

    /// Stop a running VM (graceful, then forced)
    Stop { name: String },

    /// Delete a VM and all of its artifacts
    Delete { name: String },
}
