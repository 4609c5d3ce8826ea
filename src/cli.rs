use clap::{Parser, Subcommand, ValueEnum};
use resume_dl::TaskStatus;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Started,
    Paused,
    Finished,
    Failed,
}

impl From<StatusArg> for TaskStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Started => TaskStatus::Started,
            StatusArg::Paused => TaskStatus::Paused,
            StatusArg::Finished => TaskStatus::Finished,
            StatusArg::Failed => TaskStatus::Failed,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "resume-dl")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Task state file
    #[arg(long, env = "RESUME_DL_STATE", default_value = "./.download_state.json")]
    pub state_file: PathBuf,

    /// Destinations under this directory are checked against internal storage
    #[arg(long)]
    pub internal_dir: Option<PathBuf>,

    /// HTTP proxy (e.g., http://127.0.0.1:7890)
    #[arg(long)]
    pub proxy: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download or resume one or more urls
    Get {
        #[arg(required = true)]
        urls: Vec<String>,

        /// Output directory
        #[arg(short, long, default_value = "./my_downloads")]
        dir: PathBuf,

        /// File name (single url only; default: last url path segment)
        #[arg(short, long)]
        name: Option<String>,

        /// Rename to the server's Content-Disposition filename when done
        #[arg(long)]
        rename: bool,

        /// Title stored with the task
        #[arg(long)]
        title: Option<String>,

        /// Description stored with the task
        #[arg(long)]
        description: Option<String>,

        /// Discard any previous progress and start from zero
        #[arg(short, long)]
        force: bool,
    },

    /// List all known tasks
    List,

    /// Show one task by url or id
    Show { target: String },

    /// Cancel a task, deleting its file and record
    Cancel { url: String },

    /// Delete a task record, keeping the file
    Forget { url: String },

    /// Overwrite the persisted status of a task
    SetStatus {
        url: String,
        #[arg(value_enum)]
        status: StatusArg,
    },
}
