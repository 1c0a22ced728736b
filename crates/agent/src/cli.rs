use anyhow::Context;
use camrelay_protocol::RelayConfig;
use std::path::PathBuf;
use std::str::FromStr;

pub(crate) const HELP: &str = "\
camrelay-agent - stream a local camera to a WebRTC peer

USAGE:
    camrelay-agent [OPTIONS]

OPTIONS:
    --config <PATH>              TOML config file [default: built-in defaults]
    --signaling-url <URL>        Signaling WebSocket URL (ws:// or wss://)
    --tls-cert <PATH>            TLS certificate to pin for wss:// signaling
    --device <NAME>              Camera name substring, \"auto\" or \"test\"
    --width <PIXELS>             Capture width [default: 640]
    --height <PIXELS>            Capture height [default: 480]
    --framerate <FPS>            Minimum capture framerate [default: 30]
    --bitrate <KBPS>             Video bitrate [default: 240]
    --encoder <NAME>             Force encoder (nvh264enc, vah264enc, x264enc)
    -V, --version                Print version and exit
    -h, --help                   Print this help and exit";

/// Command line overrides. `None` keeps the config file value.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Args {
    pub config: Option<PathBuf>,
    pub signaling_url: Option<String>,
    pub tls_cert: Option<String>,
    pub device: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub framerate: Option<u32>,
    pub bitrate: Option<u32>,
    pub encoder: Option<String>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum Command {
    Run(Args),
    Help,
    Version,
}

impl Args {
    /// Overlay the command line onto a loaded config.
    pub fn apply(&self, config: &mut RelayConfig) {
        if let Some(url) = &self.signaling_url {
            config.signaling.url = url.clone();
        }
        if let Some(cert) = &self.tls_cert {
            config.signaling.tls_cert = Some(cert.clone());
        }
        if let Some(device) = &self.device {
            config.capture.device = device.clone();
        }
        if let Some(width) = self.width {
            config.capture.width = width;
        }
        if let Some(height) = self.height {
            config.capture.height = height;
        }
        if let Some(framerate) = self.framerate {
            config.capture.framerate = framerate;
        }
        if let Some(bitrate) = self.bitrate {
            config.encoder.bitrate = bitrate;
        }
        if let Some(encoder) = &self.encoder {
            config.encoder.encoder = Some(encoder.clone());
        }
    }
}

pub(crate) fn parse_args() -> anyhow::Result<Command> {
    parse_args_from(std::env::args().skip(1))
}

pub(crate) fn parse_args_from(
    args: impl IntoIterator<Item = impl Into<String>>,
) -> anyhow::Result<Command> {
    let mut args = args.into_iter().map(Into::into);
    let mut parsed = Args::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-V" | "--version" => return Ok(Command::Version),
            "-h" | "--help" => return Ok(Command::Help),
            "--config" => {
                parsed.config = Some(PathBuf::from(value(&mut args, "--config")?));
            }
            "--signaling-url" => {
                parsed.signaling_url = Some(value(&mut args, "--signaling-url")?);
            }
            "--tls-cert" => {
                parsed.tls_cert = Some(value(&mut args, "--tls-cert")?);
            }
            "--device" => {
                parsed.device = Some(value(&mut args, "--device")?);
            }
            "--width" => parsed.width = Some(number(&mut args, "--width")?),
            "--height" => parsed.height = Some(number(&mut args, "--height")?),
            "--framerate" => parsed.framerate = Some(number(&mut args, "--framerate")?),
            "--bitrate" => parsed.bitrate = Some(number(&mut args, "--bitrate")?),
            "--encoder" => {
                parsed.encoder = Some(value(&mut args, "--encoder")?);
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
    }

    Ok(Command::Run(parsed))
}

fn value(args: &mut impl Iterator<Item = String>, flag: &str) -> anyhow::Result<String> {
    args.next()
        .with_context(|| format!("Missing {flag} value"))
}

fn number<T>(args: &mut impl Iterator<Item = String>, flag: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value(args, flag)?
        .parse()
        .with_context(|| format!("Invalid {flag} value"))
}
