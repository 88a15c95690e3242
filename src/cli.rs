use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Directory holding config.yaml and, by default, all data
    #[clap(long, default_value = ".")]
    pub base_path: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register a video and process it right away
    Ingest {
        /// Path to the video file
        video: PathBuf,
    },

    /// Register a video and leave it for the daemon
    Enqueue {
        /// Path to the video file
        video: PathBuf,
    },

    /// Process queued videos until interrupted
    Daemon {},

    /// List frames similar to a stored frame
    Similar {
        /// Frame id
        frame_id: String,

        /// Maximum number of frames to list
        #[clap(short, long, default_value = "10")]
        limit: usize,
    },

    /// Print the stored frames of a video as JSON
    Frames {
        /// Video id
        video_id: String,
    },

    /// Write one image per detected scene cut
    Keyframes {
        /// Path to the video file
        video: PathBuf,

        /// Output directory
        out_dir: PathBuf,
    },
}
