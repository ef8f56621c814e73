//! Server command-line options.

use crate::error::ConfigError;

/// How accepted sockets are spread over workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceMode {
    /// Every worker keeps what it accepts
    None,
    /// Hand each socket to the least-loaded worker
    Exact,
}

/// Options for the `flashgate` binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Number of worker threads
    pub workers: usize,
    /// Per-listener connection ceiling
    pub max_connections: Option<u64>,
    /// Ceiling across every listener and worker
    pub global_max_connections: Option<u64>,
    /// Cross-worker balancing
    pub balance: BalanceMode,
}

/// What the command line asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Run(ServerOptions),
    Help,
    Version,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            max_connections: None,
            global_max_connections: None,
            balance: BalanceMode::Exact,
        }
    }
}

impl ServerOptions {
    /// Parses arguments, not including the program name.
    pub fn parse<I>(args: I) -> Result<Invocation, ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut options = ServerOptions::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--host" | "-h" => options.host = value(&arg, args.next())?,
                "--port" | "-p" => options.port = parse_value(&arg, args.next())?,
                "--workers" | "-w" => {
                    let workers: usize = parse_value(&arg, args.next())?;
                    if workers == 0 {
                        return Err(ConfigError::InvalidValue {
                            flag: arg,
                            value: "0".to_string(),
                        });
                    }
                    options.workers = workers;
                }
                "--max-connections" | "-m" => {
                    options.max_connections = Some(parse_value(&arg, args.next())?)
                }
                "--global-max-connections" => {
                    options.global_max_connections = Some(parse_value(&arg, args.next())?)
                }
                "--balance" => {
                    let mode = value(&arg, args.next())?;
                    options.balance = match mode.as_str() {
                        "exact" => BalanceMode::Exact,
                        "none" => BalanceMode::None,
                        _ => {
                            return Err(ConfigError::InvalidValue {
                                flag: arg,
                                value: mode,
                            })
                        }
                    };
                }
                "--help" => return Ok(Invocation::Help),
                "--version" | "-v" => return Ok(Invocation::Version),
                _ => return Err(ConfigError::UnknownArgument(arg)),
            }
        }

        Ok(Invocation::Run(options))
    }

    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn value(flag: &str, next: Option<String>) -> Result<String, ConfigError> {
    next.ok_or_else(|| ConfigError::MissingValue {
        flag: flag.to_string(),
    })
}

fn parse_value<T: std::str::FromStr>(flag: &str, next: Option<String>) -> Result<T, ConfigError> {
    let raw = value(flag, next)?;
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        flag: flag.to_string(),
        value: raw,
    })
}
