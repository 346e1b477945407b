//! # Stereo Capture
//!
//! Runs a capture rig described by a configuration file until a camera closes or the frame limit
//! is reached.
//!
//! ```shell
//! RUST_LOG=debug stereo_capture res/stereo_capture.toml
//! ```
//!
//! The exit status is 0 if at least one pair was processed.

use std::env;
use std::process;

use log::error;

use stereo_camstream::config::StereoConfig;
use stereo_camstream::Result;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();

    let path = match args.get(1).map(|s| s.as_str()) {
        Some("-h") | Some("--help") => {
            print_help();
            return;
        }
        Some(path) => path,
        None => {
            print_help();
            process::exit(2);
        }
    };

    match run(path) {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("{}: {}", path, e);
            process::exit(1);
        }
    }
}

fn run(path: &str) -> Result<i32> {
    let config = StereoConfig::load_file(path)?;

    let mut driver = config.build_pipeline()?;
    let summary = driver.run()?;

    if let Some(reason) = &summary.failure {
        error!("Capture ended early: {}", reason);
    }

    Ok(summary.exit_code())
}

fn print_help() {
    eprintln!("Usage: stereo_capture <config>");
    eprintln!();
    eprintln!("The config is a TOML, JSON or YAML file, see res/stereo_capture.toml");
}
