//! Cinder Demo Viewer
//!
//! Draws a grid of cubes through GPU frustum culling and an indirect-count
//! draw. Cube textures stream in on background threads and appear as they
//! finish uploading.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p cinder-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--grid <N>`: Cubes per side of the grid (default: 16)
//! - `--textures <N>`: Streamed textures, at most 64 (default: 8)
//! - `--no-vsync`: Present without waiting for vertical blank
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;
mod scene;

use cinder_app::{run_app, AppConfig};
use cinder_render::MAX_MATERIAL_TEXTURES;

use crate::app::Viewer;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;
const TARGET_FPS: u32 = 240;

/// Command line options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ViewerOptions {
    pub grid: u32,
    pub textures: u32,
    pub vsync: bool,
}

impl Default for ViewerOptions {
    fn default() -> Self {
        Self {
            grid: 16,
            textures: 8,
            vsync: true,
        }
    }
}

impl ViewerOptions {
    /// Parse options from command line arguments (without the program name).
    pub fn parse(args: &[String]) -> Result<Self, String> {
        let mut options = Self::default();
        let mut args = args.iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--grid" => options.grid = number(args.next(), "--grid")?.max(1),
                "--textures" => {
                    let textures = number(args.next(), "--textures")?;
                    if textures > MAX_MATERIAL_TEXTURES {
                        return Err(format!(
                            "--textures must be at most {MAX_MATERIAL_TEXTURES}, got {textures}"
                        ));
                    }
                    options.textures = textures;
                }
                "--no-vsync" => options.vsync = false,
                other => return Err(format!("Unknown argument: {other}")),
            }
        }
        Ok(options)
    }

    /// Parse from the process arguments.
    pub fn from_args() -> Result<Self, String> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        Self::parse(&args)
    }
}

fn number(value: Option<&String>, flag: &str) -> Result<u32, String> {
    let value = value.ok_or_else(|| format!("{flag} requires a value"))?;
    value
        .parse()
        .map_err(|_| format!("{flag} expects a number, got {value}"))
}

fn main() -> anyhow::Result<()> {
    // Check for help flag before starting the app
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let options = ViewerOptions::from_args().map_err(anyhow::Error::msg)?;
    run_app::<Viewer>(
        AppConfig::new("Cinder - Indirect Draw Demo")
            .with_size(WIDTH, HEIGHT)
            .with_target_fps(TARGET_FPS)
            .with_vsync(options.vsync)
            .with_gpu_culling_required(true),
    )
}

fn print_help() {
    eprintln!(
        "Cinder Demo Viewer

USAGE:
    cargo run -p cinder-viewer -- [OPTIONS]

OPTIONS:
    --grid <N>              Cubes per side of the grid (default: 16)
    --textures <N>          Streamed textures, at most {MAX_MATERIAL_TEXTURES} (default: 8)
    --no-vsync              Present without waiting for vertical blank
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn no_arguments_gives_defaults() {
        assert_eq!(ViewerOptions::parse(&[]), Ok(ViewerOptions::default()));
    }

    #[test]
    fn parses_every_flag() {
        let options =
            ViewerOptions::parse(&args(&["--grid", "4", "--textures", "2", "--no-vsync"])).unwrap();
        assert_eq!(
            options,
            ViewerOptions {
                grid: 4,
                textures: 2,
                vsync: false
            }
        );
    }

    #[test]
    fn rejects_too_many_textures() {
        assert!(ViewerOptions::parse(&args(&["--textures", "65"])).is_err());
    }

    #[test]
    fn rejects_missing_and_bad_values() {
        assert!(ViewerOptions::parse(&args(&["--grid"])).is_err());
        assert!(ViewerOptions::parse(&args(&["--grid", "many"])).is_err());
        assert!(ViewerOptions::parse(&args(&["--bogus"])).is_err());
    }
}
