//! Stemloop Render - plays a looper session offline into a WAV file, or live
//! on the default output device
//!
//! ```text
//! stemloop-render <session.yaml> <out.wav>
//! stemloop-render --play <session.yaml>
//! ```
//!
//! Set `RUST_LOG=debug` to follow the scheduler's decisions.

mod render;
mod session;
mod wav;

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

use stemloop_core::config::parse_config_file;

use render::{play_session, render_session};
use session::Session;

const USAGE: &str = "usage: stemloop-render <session.yaml> <out.wav> | stemloop-render --play <session.yaml>";

#[derive(Debug, PartialEq)]
enum Mode {
    Render { session: PathBuf, output: PathBuf },
    Play { session: PathBuf },
}

fn parse_args(args: &[String]) -> Result<Mode> {
    match args {
        [flag, session] if flag == "--play" => Ok(Mode::Play {
            session: PathBuf::from(session),
        }),
        [session, output] if !session.starts_with("--") => Ok(Mode::Render {
            session: PathBuf::from(session),
            output: PathBuf::from(output),
        }),
        _ => bail!(USAGE),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_args(&args)? {
        Mode::Render { session, output } => {
            log::info!("stemloop-render: {:?} -> {:?}", session, output);
            let parsed: Session = parse_config_file(&session)?;
            let rendered = render_session(&parsed, base_dir(&session))?;
            wav::write_wav(&output, &rendered.frames, rendered.sample_rate)?;
            log::info!("Wrote {:?}", output);
        }
        Mode::Play { session } => {
            log::info!("stemloop-render: playing {:?}", session);
            let parsed: Session = parse_config_file(&session)?;
            play_session(&parsed, base_dir(&session))?;
        }
    }
    Ok(())
}

fn base_dir(session: &Path) -> &Path {
    session.parent().unwrap_or_else(|| Path::new("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_render_args() {
        assert_eq!(
            parse_args(&args(&["set.yaml", "out.wav"])).unwrap(),
            Mode::Render {
                session: PathBuf::from("set.yaml"),
                output: PathBuf::from("out.wav"),
            }
        );
    }

    #[test]
    fn test_parse_play_args() {
        assert_eq!(
            parse_args(&args(&["--play", "set.yaml"])).unwrap(),
            Mode::Play {
                session: PathBuf::from("set.yaml"),
            }
        );
    }

    #[test]
    fn test_bad_args_show_usage() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["set.yaml"])).is_err());
        assert!(parse_args(&args(&["--loud", "set.yaml"])).is_err());
        assert!(parse_args(&args(&["--play", "set.yaml", "out.wav"])).is_err());
    }
}
