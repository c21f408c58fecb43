//! Tracing configuration and initialization.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{
    EnvFilter,
    fmt::format::FmtSpan,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

struct FgConfig {
    no_spin: bool,
}

impl FgConfig {
    fn is_ugly(&self) -> bool {
        self.no_spin
    }

    pub fn pretty() -> Self {
        Self { no_spin: false }
    }

    pub fn ugly() -> Self {
        Self { no_spin: true }
    }
}

enum TrcMode {
    Foreground(FgConfig),
    /// Detached: plain lines, no color, no spinners.
    Daemon,
}

pub struct Trc {
    mode: TrcMode,
    env_filter: EnvFilter,
}

fn env_filter() -> Result<EnvFilter, tracing_subscriber::filter::FromEnvError> {
    EnvFilter::try_from_env("TIERFS_LOG").or_else(|_| EnvFilter::try_from_default_env())
}

impl Default for Trc {
    fn default() -> Self {
        match env_filter() {
            Ok(env_filter) => Self {
                // An explicit filter means someone is debugging; give them plain output.
                mode: TrcMode::Foreground(FgConfig::ugly()),
                env_filter,
            },
            Err(_) => Self {
                mode: TrcMode::Foreground(FgConfig::pretty()),
                env_filter: EnvFilter::new("info"),
            },
        }
    }
}

impl Trc {
    /// Logging for a detached daemon whose stdio points at a log file.
    pub fn daemon() -> Self {
        Self {
            mode: TrcMode::Daemon,
            env_filter: env_filter().unwrap_or_else(|_| EnvFilter::new("info")),
        }
    }

    pub fn init(self) -> Result<(), TryInitError> {
        match &self.mode {
            TrcMode::Daemon => self.init_daemon_mode(),
            TrcMode::Foreground(fg_config) => {
                if fg_config.is_ugly() {
                    self.init_ugly_mode()
                } else {
                    self.init_pretty_mode()
                }
            }
        }
    }

    fn init_ugly_mode(self) -> Result<(), TryInitError> {
        // "Ugly mode" is the plain, verbose, rust logging mode.
        tracing_subscriber::fmt()
            .with_env_filter(self.env_filter)
            .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
            .finish()
            .try_init()
    }

    fn init_daemon_mode(self) -> Result<(), TryInitError> {
        tracing_subscriber::fmt()
            .with_env_filter(self.env_filter)
            .with_ansi(false)
            .finish()
            .try_init()
    }

    fn init_pretty_mode(self) -> Result<(), TryInitError> {
        // "Pretty mode" is the compact, colorful mode with progress spinners for long spans.
        let indicatif_layer = IndicatifLayer::new();
        tracing_subscriber::registry()
            .with(self.env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(indicatif_layer.get_stderr_writer())
                    .with_target(false)
                    .without_time()
                    .compact(),
            )
            .with(indicatif_layer)
            .try_init()?;

        Ok(())
    }
}
