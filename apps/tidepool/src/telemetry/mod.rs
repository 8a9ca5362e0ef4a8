//! Process-wide diagnostics for the `tidepool` binary and test harnesses.
//! Library code only emits `tracing` events; installing a subscriber is left
//! to whoever owns the process.

pub mod logging {
    use std::fmt;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;

    use clap::ValueEnum;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    /// Full `EnvFilter` override; wins over everything else.
    pub const FILTER_ENV: &str = "TIDEPOOL_LOG_FILTER";
    /// Comma-separated areas (`transport`, `signaling`, ...) that get the
    /// requested level while the rest of tidepool stays at `warn`.
    pub const AREAS_ENV: &str = "TIDEPOOL_LOG_AREAS";
    /// Set to lift the cap on the WebRTC and HTTP stacks at debug and trace.
    pub const TRACE_DEPS_ENV: &str = "TIDEPOOL_TRACE_DEPS";

    /// Areas tidepool logs under, as `tidepool::<area>` targets.
    pub const AREAS: &[&str] = &[
        "transport",
        "signaling",
        "negotiation",
        "connection",
        "link",
        "peer",
        "cli",
    ];

    /// The media stack is chatty well below info: every STUN binding, SCTP
    /// chunk and DTLS record.
    const RTC_STACK: &[&str] = &[
        "webrtc",
        "webrtc_ice",
        "webrtc_sctp",
        "webrtc_dtls",
        "webrtc_mdns",
        "webrtc_srtp",
    ];

    const HTTP_STACK: &[&str] = &["hyper", "reqwest", "rustls", "tungstenite", "tokio_tungstenite"];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        fn as_str(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        /// Append to this file instead of writing to stderr.
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to install subscriber: {0}")]
        Install(String),
    }

    /// Filter directives for one run, rendered into an `EnvFilter` string.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Directives {
        level: LogLevel,
        areas: Vec<String>,
        cap_deps: bool,
    }

    impl Directives {
        pub fn new(level: LogLevel) -> Self {
            Self {
                level,
                areas: Vec::new(),
                cap_deps: level >= LogLevel::Debug,
            }
        }

        /// Limit the requested level to these areas. Unknown names are
        /// skipped.
        pub fn areas<'a>(mut self, areas: impl IntoIterator<Item = &'a str>) -> Self {
            self.areas = areas
                .into_iter()
                .map(str::trim)
                .filter(|area| AREAS.contains(area))
                .map(str::to_string)
                .collect();
            self
        }

        pub fn uncapped_deps(mut self) -> Self {
            self.cap_deps = false;
            self
        }

        pub fn caps_deps(&self) -> bool {
            self.cap_deps
        }
    }

    impl fmt::Display for Directives {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let level = self.level.as_str();
            if self.level <= LogLevel::Info {
                f.write_str(level)?;
            } else if self.areas.is_empty() {
                write!(f, "info,tidepool={level}")?;
            } else {
                f.write_str("info,tidepool=warn")?;
                for area in &self.areas {
                    write!(f, ",tidepool::{area}={level}")?;
                }
            }
            if self.cap_deps {
                for target in RTC_STACK.iter().chain(HTTP_STACK) {
                    write!(f, ",{target}=info")?;
                }
            }
            Ok(())
        }
    }

    fn env_flag(var: &str) -> bool {
        std::env::var(var).is_ok_and(|value| !value.is_empty() && value != "0")
    }

    fn directives_from_env(level: LogLevel) -> Directives {
        let areas = std::env::var(AREAS_ENV).unwrap_or_default();
        let directives = Directives::new(level).areas(areas.split(','));
        if env_flag(TRACE_DEPS_ENV) {
            directives.uncapped_deps()
        } else {
            directives
        }
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Install the global subscriber once; later calls return `Ok` untouched.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let (filter, rendered) = match std::env::var(FILTER_ENV) {
            Ok(custom) => (EnvFilter::new(&custom), custom),
            Err(_) => {
                let directives = directives_from_env(config.level).to_string();
                (EnvFilter::new(&directives), directives)
            }
        };

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let verbose = config.level >= LogLevel::Debug;
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(verbose)
            .with_thread_ids(verbose)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Install(err.to_string()))?;

        let _ = GUARD.set(guard);
        tracing::debug!(target = "tidepool::cli", filter = %rendered, "logging installed");
        Ok(())
    }

}
